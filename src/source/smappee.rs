// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Smappee energy meters.
//!
//! Authentication is an OAuth password grant with the account's client id
//! and secret. Every service location of the account yields three
//! consumption streams, one per aggregation level, plus one stream of power
//! events per known appliance:
//!
//! ```text
//! smappee.<location>.5min
//! smappee.<location>.hourly
//! smappee.<location>.daily
//! smappee.<location>.appliance.<appliance_id>
//! ```
//!
//! Consumption and events are both keyed by epoch milliseconds:
//! ```json
//! {"consumptions": [{"timestamp": 1511935200000, "consumption": 412.0, "solar": 0.0, "alwaysOn": 95.0}]}
//! [{"timestamp": 1511935347000, "activePower": 120.5, "totalPower": 310.0, "applianceId": 4}]
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::http::{check_auth_status, check_status, client};
use super::traits::{AuthError, Credential, FetchError, SourceAdapter};
use crate::record::{NullPolicy, Record, StreamDescriptor};
use crate::window::FetchWindow;

pub const SOURCE_NAME: &str = "smappee";

/// Events returned per request; a full page is followed by another
pub const MAX_EVENTS_PER_REQUEST: usize = 1000;

const CONSUMPTION_FIELDS: [(&str, &str); 3] =
    [("consumption", "consumption"), ("solar", "solar"), ("alwaysOn", "always_on")];
const EVENT_FIELDS: [(&str, &str); 2] = [("activePower", "active_power"), ("totalPower", "total_power")];

/// Consumption aggregation levels offered by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    FiveMinutes,
    Hourly,
    Daily,
}

impl Aggregation {
    pub const ALL: [Aggregation; 3] = [Aggregation::FiveMinutes, Aggregation::Hourly, Aggregation::Daily];

    /// Value of the `aggregation` query parameter
    pub fn code(self) -> u8 {
        match self {
            Aggregation::FiveMinutes => 1,
            Aggregation::Hourly => 2,
            Aggregation::Daily => 3,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Aggregation::FiveMinutes => "5min",
            Aggregation::Hourly => "hourly",
            Aggregation::Daily => "daily",
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|a| u64::from(a.code()) == code)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmappeeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String { "https://app1pub.smappee.net/dev/v1".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }

impl SmappeeConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            password: password.into(),
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationsResponse {
    #[serde(default)]
    service_locations: Vec<Value>,
}

#[derive(Deserialize)]
struct ConsumptionResponse {
    #[serde(default)]
    consumptions: Vec<Value>,
}

pub struct SmappeeAdapter {
    config: SmappeeConfig,
    client: Client,
}

impl SmappeeAdapter {
    pub fn new(config: SmappeeConfig) -> Result<Self, FetchError> {
        let client = client(Duration::from_millis(config.timeout_ms), false)?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn location_info(&self, token: &str, location_id: &str) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(self.url(&format!("/servicelocation/{}/info", location_id)))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn fetch_consumption(
        &self,
        token: &str,
        location_id: &str,
        aggregation: Aggregation,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let (from, to) = millis_bounds(window);
        let response = self
            .client
            .get(self.url(&format!("/servicelocation/{}/consumption", location_id)))
            .bearer_auth(token)
            .query(&[
                ("aggregation", aggregation.code().to_string()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ])
            .send()
            .await?;

        let body: ConsumptionResponse = check_status(response).await?.json().await?;
        Ok(parse_consumptions(&body.consumptions))
    }

    async fn fetch_events(
        &self,
        token: &str,
        location_id: &str,
        appliance_id: &str,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let (mut from, to) = millis_bounds(window);
        let mut records = Vec::new();
        loop {
            let response = self
                .client
                .get(self.url(&format!("/servicelocation/{}/events", location_id)))
                .bearer_auth(token)
                .query(&[
                    ("applianceId", appliance_id.to_string()),
                    ("maxNumber", MAX_EVENTS_PER_REQUEST.to_string()),
                    ("from", from.to_string()),
                    ("to", to.to_string()),
                ])
                .send()
                .await?;

            let events: Vec<Value> = check_status(response).await?.json().await?;
            records.extend(parse_events(&events));
            match next_events_from(&events, from, to) {
                Some(next) => from = next,
                None => break,
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceAdapter for SmappeeAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn null_policy(&self) -> NullPolicy {
        NullPolicy::Omit
    }

    #[instrument(level = "debug", skip(self))]
    async fn authenticate(&self) -> Result<Credential, AuthError> {
        let response = self
            .client
            .post(self.url("/oauth2/token"))
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;

        let token: TokenResponse = check_auth_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AuthError::Protocol(e.to_string()))?;

        Ok(Credential::Bearer(token.access_token))
    }

    #[instrument(level = "debug", skip(self, credential))]
    async fn list_streams(&self, credential: &Credential) -> Result<Vec<StreamDescriptor>, FetchError> {
        let token = credential.bearer()?;
        let response = self
            .client
            .get(self.url("/servicelocation"))
            .bearer_auth(token)
            .send()
            .await?;
        let locations: LocationsResponse = check_status(response).await?.json().await?;

        let mut streams = Vec::new();
        for location in &locations.service_locations {
            let location_id = parse_location_id(location)
                .ok_or_else(|| FetchError::Malformed("service location without serviceLocationId".to_string()))?;
            let info = self.location_info(token, &location_id).await?;
            streams.extend(location_streams(&location_id, &info));
        }
        Ok(streams)
    }

    #[instrument(level = "debug", skip(self, credential, stream), fields(stream_id = %stream.id))]
    async fn fetch(
        &self,
        credential: &Credential,
        stream: &StreamDescriptor,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let token = credential.bearer()?;
        let location_id = stream
            .metadata
            .get("service_location_id")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Malformed(format!("stream {} has no service_location_id", stream.id)))?;

        let records = match stream.metadata.get("appliance_id").and_then(Value::as_str) {
            Some(appliance_id) => self.fetch_events(token, location_id, appliance_id, window).await?,
            None => {
                let aggregation = stream
                    .metadata
                    .get("aggregation")
                    .and_then(Value::as_u64)
                    .and_then(Aggregation::from_code)
                    .ok_or_else(|| FetchError::Malformed(format!("stream {} has no aggregation", stream.id)))?;
                self.fetch_consumption(token, location_id, aggregation, window).await?
            }
        };
        Ok(records.into_iter().filter(|r| window.contains(r.timestamp)).collect())
    }
}

fn parse_location_id(v: &Value) -> Option<String> {
    match v.get("serviceLocationId")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Window bounds as epoch milliseconds; the start is rounded up.
pub fn millis_bounds(window: FetchWindow) -> (i64, i64) {
    let from = window.from.timestamp_millis() + i64::from(window.from.timestamp_subsec_nanos() % 1_000_000 > 0);
    (from, window.to.timestamp_millis())
}

/// The consumption streams and one event stream per appliance of a location.
pub fn location_streams(location_id: &str, info: &Value) -> Vec<StreamDescriptor> {
    let tz = info.get("timezone").and_then(Value::as_str).and_then(|name| match name.parse::<Tz>() {
        Ok(tz) => Some(tz),
        Err(_) => {
            warn!(location_id, timezone = name, "Unknown location timezone, assuming UTC");
            None
        }
    });
    let location_name = info.get("name").cloned().unwrap_or(Value::Null);

    let mut streams: Vec<StreamDescriptor> = Aggregation::ALL
        .into_iter()
        .map(|aggregation| {
            StreamDescriptor::new(format!("{}.{}.{}", SOURCE_NAME, location_id, aggregation.suffix())).with_metadata(
                json!({
                    "service_location_id": location_id,
                    "name": location_name,
                    "aggregation": aggregation.code(),
                    "info": info,
                }),
            )
        })
        .collect();

    for appliance in info.get("appliances").and_then(Value::as_array).into_iter().flatten() {
        let appliance_id = match appliance.get("id") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                debug!(location_id, "Skipping appliance without id");
                continue;
            }
        };
        streams.push(
            StreamDescriptor::new(format!("{}.{}.appliance.{}", SOURCE_NAME, location_id, appliance_id)).with_metadata(
                json!({
                    "service_location_id": location_id,
                    "appliance_id": appliance_id,
                    "name": appliance.get("name").cloned().unwrap_or(Value::Null),
                    "type": appliance.get("type").cloned().unwrap_or(Value::Null),
                }),
            ),
        );
    }

    if let Some(tz) = tz {
        streams = streams.into_iter().map(|s| s.with_timezone(tz)).collect();
    }
    streams
}

fn millis_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.get("timestamp")
        .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)))
        .and_then(DateTime::from_timestamp_millis)
}

fn to_records(items: &[Value], fields: &[(&str, &str)]) -> Vec<Record> {
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let Some(timestamp) = millis_timestamp(item) else {
            debug!(item = %item, "Skipping entry without usable timestamp");
            continue;
        };
        let mut record = Record::new(timestamp);
        for (key, name) in fields {
            record.insert_nullable(*name, item.get(*key).and_then(Value::as_f64), NullPolicy::Omit);
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    records.sort_by_key(|r| r.timestamp);
    records
}

/// Convert `consumptions` entries. Missing values are omitted.
pub fn parse_consumptions(items: &[Value]) -> Vec<Record> {
    to_records(items, &CONSUMPTION_FIELDS)
}

/// Convert appliance events. Events without `totalPower` keep `active_power` only.
pub fn parse_events(items: &[Value]) -> Vec<Record> {
    to_records(items, &EVENT_FIELDS)
}

/// Start of the next events request, or `None` once the window is exhausted.
pub fn next_events_from(events: &[Value], from: i64, to: i64) -> Option<i64> {
    if events.len() < MAX_EVENTS_PER_REQUEST {
        return None;
    }
    let last = events.iter().filter_map(millis_timestamp).max()?.timestamp_millis();
    let next = last.checked_add(1)?;
    (next > from && next < to).then_some(next)
}
