// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WirelessTag sensor tags.
//!
//! Sign-in posts the account e-mail and password and leaves a session cookie
//! in the client's cookie store; `IsSignedIn` confirms it took. Each tag of
//! `GetTagList` becomes a stream `wirelesstag.<uuid>`, and data is pulled as
//! a CSV export per tag and window:
//!
//! ```text
//! Date/Time,Temperature (C),Moisture (%),Battery (Volts)
//! 2017-11-29T07:02:27+01:00,14.626259803772,70.1337280273438,2.8763861656189
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::http::{check_auth_status, check_status, client};
use super::traits::{AuthError, Credential, FetchError, SourceAdapter};
use crate::record::{NullPolicy, Record, StreamDescriptor};
use crate::window::FetchWindow;

pub const SOURCE_NAME: &str = "wirelesstag";
const STREAM_PREFIX: &str = "wirelesstag.";

const CSV_FIELDS: [&str; 3] = ["temperature", "moisture", "battery"];

#[derive(Debug, Clone, Deserialize)]
pub struct WirelessTagConfig {
    pub email: String,
    pub password: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String { "https://my.wirelesstag.net".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }

impl WirelessTagConfig {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// ASP.NET script services wrap every result in `{"d": ...}`.
#[derive(Deserialize)]
struct Wrapped<T> {
    d: T,
}

pub struct WirelessTagAdapter {
    config: WirelessTagConfig,
    client: Client,
}

impl WirelessTagAdapter {
    pub fn new(config: WirelessTagConfig) -> Result<Self, FetchError> {
        let client = client(Duration::from_millis(config.timeout_ms), true)?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn is_signed_in(&self) -> Result<bool, reqwest::Error> {
        let response = self
            .client
            .post(self.url("/ethAccount.asmx/IsSignedIn"))
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?;
        let signed: Wrapped<Value> = response.json().await?;
        Ok(matches!(signed.d, Value::Bool(true)) || signed.d.as_str().is_some_and(|s| s.eq_ignore_ascii_case("true")))
    }
}

#[async_trait]
impl SourceAdapter for WirelessTagAdapter {
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
            .post(self.url("/ethAccount.asmx/SignIn"))
            .json(&json!({"email": self.config.email, "password": self.config.password}))
            .send()
            .await?;
        check_auth_status(response).await?;

        if !self.is_signed_in().await.map_err(|e| AuthError::Protocol(e.to_string()))? {
            return Err(AuthError::InvalidCredentials("session not established".to_string()));
        }
        Ok(Credential::Session)
    }

    #[instrument(level = "debug", skip(self, _credential))]
    async fn list_streams(&self, _credential: &Credential) -> Result<Vec<StreamDescriptor>, FetchError> {
        let response = self
            .client
            .post(self.url("/ethClient.asmx/GetTagList"))
            .json(&json!({}))
            .send()
            .await?;

        let tags: Wrapped<Vec<Value>> = check_status(response).await?.json().await?;
        parse_tag_list(tags.d)
    }

    #[instrument(level = "debug", skip(self, _credential, stream), fields(stream_id = %stream.id))]
    async fn fetch(
        &self,
        _credential: &Credential,
        stream: &StreamDescriptor,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let uuid = stream
            .id
            .strip_prefix(STREAM_PREFIX)
            .ok_or_else(|| FetchError::Malformed(format!("not a WirelessTag stream: {}", stream.id)))?;

        let from = window.from.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let to = window.to.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let response = self
            .client
            .get(self.url("/ethDownloadTempCSV.aspx"))
            .query(&[("uuid", uuid), ("fromdate", from.as_str()), ("todate", to.as_str())])
            .send()
            .await?;

        let body = check_status(response).await?.text().await?;
        let records = parse_csv(&body, stream.tz());
        Ok(records.into_iter().filter(|r| window.contains(r.timestamp)).collect())
    }
}

/// Turn the `GetTagList` result into stream descriptors.
pub fn parse_tag_list(tags: Vec<Value>) -> Result<Vec<StreamDescriptor>, FetchError> {
    tags.into_iter()
        .map(|tag| {
            let uuid = tag
                .get("uuid")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::Malformed("tag without uuid".to_string()))?;
            let metadata = json!({
                "uuid": uuid,
                "tag_id": tag.get("slaveId").cloned().unwrap_or(Value::Null),
                "tag_name": tag.get("name").cloned().unwrap_or(Value::Null),
                "tag_type": tag.get("tagType").cloned().unwrap_or(Value::Null),
            });
            Ok(StreamDescriptor::new(format!("{}{}", STREAM_PREFIX, uuid)).with_metadata(metadata))
        })
        .collect()
}

/// Parse the CSV export. Never fails: rows with the wrong column count or an
/// unreadable timestamp or value are skipped. Empty cells are omitted.
pub fn parse_csv(body: &str, tz: Tz) -> Vec<Record> {
    let body = body.trim_start_matches('\u{feff}');
    let mut records = Vec::new();

    for (line_no, line) in body.lines().enumerate().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(',').map(|c| c.trim().trim_matches('"')).collect();
        if cells.len() != CSV_FIELDS.len() + 1 {
            debug!(line = line_no + 1, columns = cells.len(), "Skipping CSV row with wrong column count");
            continue;
        }

        let Some(timestamp) = parse_timestamp(cells[0], tz) else {
            debug!(line = line_no + 1, value = cells[0], "Skipping CSV row with bad timestamp");
            continue;
        };

        let mut values = Vec::with_capacity(CSV_FIELDS.len());
        let mut valid = true;
        for cell in &cells[1..] {
            if cell.is_empty() {
                values.push(None);
            } else if let Ok(v) = cell.parse::<f64>() {
                // "NaN" and "inf" parse as floats but are vendor nulls
                values.push(Some(v).filter(|v| v.is_finite()));
            } else {
                valid = false;
                break;
            }
        }
        if !valid {
            debug!(line = line_no + 1, "Skipping CSV row with unparsable value");
            continue;
        }

        let mut record = Record::new(timestamp);
        for (name, value) in CSV_FIELDS.iter().zip(values) {
            record.insert_nullable(*name, value, NullPolicy::Omit);
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    records
}

/// RFC 3339 with offset, or a naive ISO time interpreted in `tz`.
fn parse_timestamp(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}
