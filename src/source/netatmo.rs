// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Netatmo weather stations.
//!
//! Every station and every module attached to it is its own stream:
//! `netatmo.<station_name>` and `netatmo.<station_name>.<module_name>`, with
//! spaces replaced by underscores. `getmeasure` answers with epoch-second
//! keys mapping to values in the order of the requested data types:
//!
//! ```json
//! {"body": {"1511935347": [21.3, 612, 48]}, "status": "ok"}
//! ```
//!
//! A row with any null is dropped as a whole.
//!
//! One request returns at most 1024 points, so a window is read in pages:
//! a full page is followed by a request starting one second after its last
//! point.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::http::{check_auth_status, check_status, client};
use super::traits::{AuthError, Credential, FetchError, SourceAdapter};
use crate::record::{NullPolicy, Record, StreamDescriptor};
use crate::window::FetchWindow;

pub const SOURCE_NAME: &str = "netatmo";

/// Server-side cap on points per `getmeasure` response
pub const MAX_POINTS_PER_REQUEST: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct NetatmoConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_scale")]
    pub scale: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String { "https://api.netatmo.com".to_string() }
fn default_scale() -> String { "max".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct StationsResponse {
    body: StationsBody,
}

#[derive(Deserialize)]
struct StationsBody {
    #[serde(default)]
    devices: Vec<Value>,
}

#[derive(Deserialize)]
struct MeasureResponse {
    #[serde(default)]
    body: Value,
}

pub struct NetatmoAdapter {
    config: NetatmoConfig,
    client: Client,
}

impl NetatmoAdapter {
    pub fn new(config: NetatmoConfig) -> Result<Self, FetchError> {
        let client = client(Duration::from_millis(config.timeout_ms), false)?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl SourceAdapter for NetatmoAdapter {
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
                ("scope", "read_station"),
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
        let response = self
            .client
            .get(self.url("/api/getstationsdata"))
            .bearer_auth(credential.bearer()?)
            .send()
            .await?;

        let stations: StationsResponse = check_status(response).await?.json().await?;
        parse_stations(&stations.body.devices)
    }

    #[instrument(level = "debug", skip(self, credential, stream), fields(stream_id = %stream.id))]
    async fn fetch(
        &self,
        credential: &Credential,
        stream: &StreamDescriptor,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let device_id = stream
            .metadata
            .get("device_id")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Malformed(format!("stream {} has no device_id", stream.id)))?;
        let data_types = data_types(&stream.metadata);
        if data_types.is_empty() {
            return Ok(Vec::new());
        }

        let (mut begin, end) = epoch_bounds(window);
        let mut records = Vec::new();
        loop {
            let page = self.measure_page(credential, &stream.metadata, device_id, &data_types, begin, end).await?;
            records.extend(parse_measure(&page, &data_types)?);
            match next_page_begin(&page, begin, end) {
                Some(next) => {
                    debug!(stream_id = %stream.id, begin = next, end, "Full getmeasure page, requesting more");
                    begin = next;
                }
                None => break,
            }
        }
        Ok(records.into_iter().filter(|r| window.contains(r.timestamp)).collect())
    }
}

impl NetatmoAdapter {
    async fn measure_page(
        &self,
        credential: &Credential,
        metadata: &Value,
        device_id: &str,
        data_types: &[String],
        begin: i64,
        end: i64,
    ) -> Result<Value, FetchError> {
        let mut query = vec![
            ("device_id", device_id.to_string()),
            ("scale", self.config.scale.clone()),
            ("type", data_types.join(",")),
            ("date_begin", begin.to_string()),
            ("date_end", end.to_string()),
            ("limit", MAX_POINTS_PER_REQUEST.to_string()),
            ("optimize", "false".to_string()),
            ("real_time", "false".to_string()),
        ];
        if let Some(module_id) = metadata.get("module_id").and_then(Value::as_str) {
            query.push(("module_id", module_id.to_string()));
        }

        let response = self
            .client
            .get(self.url("/api/getmeasure"))
            .bearer_auth(credential.bearer()?)
            .query(&query)
            .send()
            .await?;

        let measure: MeasureResponse = check_status(response).await?.json().await?;
        Ok(measure.body)
    }
}

/// Start of the next page after `body` answered a request for `[begin, end]`,
/// or `None` when the window is exhausted.
///
/// Only a full page can have more behind it. The cursor must move forward,
/// which also ends the loop if the server ignores `date_begin`.
pub fn next_page_begin(body: &Value, begin: i64, end: i64) -> Option<i64> {
    let rows = body.as_object()?;
    if rows.len() < MAX_POINTS_PER_REQUEST {
        return None;
    }
    let last = rows.keys().filter_map(|k| k.parse::<i64>().ok()).max()?;
    let next = last.checked_add(1)?;
    (next > begin && next < end).then_some(next)
}

/// Window bounds as whole epoch seconds; the start is rounded up so a
/// sub-second checkpoint never re-requests the stored second.
pub fn epoch_bounds(window: FetchWindow) -> (i64, i64) {
    let begin = window.from.timestamp() + i64::from(window.from.timestamp_subsec_nanos() > 0);
    (begin, window.to.timestamp())
}

fn data_types(metadata: &Value) -> Vec<String> {
    metadata
        .get("data_type")
        .and_then(Value::as_array)
        .map(|types| types.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}

fn stream_name(parts: &[&str]) -> String {
    let mut name = String::from(SOURCE_NAME);
    for part in parts {
        name.push('.');
        name.push_str(part);
    }
    name.replace(' ', "_")
}

/// One stream per station plus one per module.
pub fn parse_stations(devices: &[Value]) -> Result<Vec<StreamDescriptor>, FetchError> {
    let mut streams = Vec::new();
    for device in devices {
        let device_id = device
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Malformed("station without _id".to_string()))?;
        let station_name = device
            .get("station_name")
            .and_then(Value::as_str)
            .unwrap_or(device_id);
        let tz = device
            .pointer("/place/timezone")
            .and_then(Value::as_str)
            .and_then(|name| name.parse::<Tz>().ok());

        let mut station = StreamDescriptor::new(stream_name(&[station_name])).with_metadata(json!({
            "device_id": device_id,
            "station_name": station_name,
            "data_type": device.get("data_type").cloned().unwrap_or_else(|| json!([])),
        }));
        if let Some(tz) = tz {
            station = station.with_timezone(tz);
        }
        streams.push(station);

        for module in device.get("modules").and_then(Value::as_array).into_iter().flatten() {
            let Some(module_id) = module.get("_id").and_then(Value::as_str) else {
                debug!(station = station_name, "Skipping module without _id");
                continue;
            };
            let module_name = module
                .get("module_name")
                .and_then(Value::as_str)
                .unwrap_or(module_id);

            let mut stream = StreamDescriptor::new(stream_name(&[station_name, module_name])).with_metadata(json!({
                "device_id": device_id,
                "module_id": module_id,
                "station_name": station_name,
                "module_name": module_name,
                "data_type": module.get("data_type").cloned().unwrap_or_else(|| json!([])),
            }));
            if let Some(tz) = tz {
                stream = stream.with_timezone(tz);
            }
            streams.push(stream);
        }
    }
    Ok(streams)
}

/// Convert a `getmeasure` body. Rows with a null, a non-numeric value, or the
/// wrong number of values are dropped.
pub fn parse_measure(body: &Value, data_types: &[String]) -> Result<Vec<Record>, FetchError> {
    let rows = match body {
        Value::Object(rows) => rows,
        Value::Array(a) if a.is_empty() => return Ok(Vec::new()),
        Value::Null => return Ok(Vec::new()),
        _ => return Err(FetchError::Malformed("getmeasure body is not an object".to_string())),
    };

    let mut records = Vec::with_capacity(rows.len());
    for (epoch, values) in rows {
        let Some(timestamp) = epoch.parse::<i64>().ok().and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)) else {
            debug!(key = %epoch, "Skipping measure with bad epoch key");
            continue;
        };
        let Some(values) = values.as_array().filter(|v| v.len() == data_types.len()) else {
            continue;
        };
        let Some(numbers) = values.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>() else {
            continue;
        };

        let mut record = Record::new(timestamp);
        for (name, value) in data_types.iter().zip(numbers) {
            record.insert(name.clone(), value);
        }
        records.push(record);
    }
    records.sort_by_key(|r| r.timestamp);
    Ok(records)
}
