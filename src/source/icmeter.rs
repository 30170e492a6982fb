// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! IC-Meter indoor climate boxes.
//!
//! Authentication is an OAuth password grant returning a bearer token that
//! is passed as the `access_token` query parameter. `boxlocations` lists the
//! boxes of the account; each box becomes one stream `ic-meter.<boxId>`.
//!
//! Measurements arrive as a Google-charts style DataTable:
//! ```json
//! {"cols": [{"id": "realtime", "type": "datetime"}, {"id": "co2", "type": "number"}],
//!  "rows": [{"c": [{"v": "Date(2017,10,29,7,2,27)"}, {"v": 612.0}]}]}
//! ```
//! The datetime is box-local wall-clock time with a zero-based month.
//! Nulls are stored as `0.0`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::http::{check_auth_status, check_status, client};
use super::traits::{AuthError, Credential, FetchError, SourceAdapter};
use crate::record::{NullPolicy, Record, StreamDescriptor};
use crate::window::FetchWindow;

pub const SOURCE_NAME: &str = "ic-meter";
const STREAM_PREFIX: &str = "ic-meter.";

#[derive(Debug, Clone, Deserialize)]
pub struct IcMeterConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String { "https://app.ic-meter.com".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }

impl IcMeterConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
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

pub struct IcMeterAdapter {
    config: IcMeterConfig,
    client: Client,
}

impl IcMeterAdapter {
    pub fn new(config: IcMeterConfig) -> Result<Self, FetchError> {
        let client = client(Duration::from_millis(config.timeout_ms), false)?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl SourceAdapter for IcMeterAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn null_policy(&self) -> NullPolicy {
        NullPolicy::ZeroFill
    }

    #[instrument(level = "debug", skip(self))]
    async fn authenticate(&self) -> Result<Credential, AuthError> {
        let response = self
            .client
            .get(self.url("/icm/oauth/token"))
            .query(&[
                ("client_id", "trusted-client"),
                ("grant_type", "password"),
                ("scope", "read"),
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
        let response = self
            .client
            .get(self.url("/icm/api/boxlocations"))
            .query(&[("access_token", credential.bearer()?)])
            .send()
            .await?;

        let boxes: Vec<Value> = check_status(response).await?.json().await?;
        parse_boxes(boxes)
    }

    #[instrument(level = "debug", skip(self, credential, stream), fields(stream_id = %stream.id))]
    async fn fetch(
        &self,
        credential: &Credential,
        stream: &StreamDescriptor,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let box_id = stream
            .id
            .strip_prefix(STREAM_PREFIX)
            .ok_or_else(|| FetchError::Malformed(format!("not an IC-Meter stream: {}", stream.id)))?;

        let from = window.from.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let to = window.to.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let response = self
            .client
            .get(self.url(&format!("/icm/api/measurements/days/{}", box_id)))
            .query(&[
                ("access_token", credential.bearer()?),
                ("fromDate", from.as_str()),
                ("toDate", to.as_str()),
                ("forecast", "false"),
            ])
            .send()
            .await?;

        let table: Value = check_status(response).await?.json().await?;
        let records = parse_measurements(&table, stream.tz(), self.null_policy())?;
        Ok(records.into_iter().filter(|r| window.contains(r.timestamp)).collect())
    }
}

/// Turn the `boxlocations` payload into stream descriptors.
pub fn parse_boxes(boxes: Vec<Value>) -> Result<Vec<StreamDescriptor>, FetchError> {
    boxes
        .into_iter()
        .map(|b| {
            let box_id = match b.get("boxId") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(FetchError::Malformed("box without boxId".to_string())),
            };

            let mut stream = StreamDescriptor::new(format!("{}{}", STREAM_PREFIX, box_id));
            match b.get("timezone").and_then(Value::as_str) {
                Some(name) => match name.parse::<Tz>() {
                    Ok(tz) => stream = stream.with_timezone(tz),
                    Err(_) => warn!(box_id = %box_id, timezone = name, "Unknown box timezone, assuming UTC"),
                },
                None => debug!(box_id = %box_id, "Box reports no timezone, assuming UTC"),
            }
            if let Some(first) = b.get("fromdate").and_then(millis_field) {
                stream = stream.with_first_measurement(first);
            }
            if let Some(last) = b.get("lastMeasurementDate").and_then(millis_field) {
                stream = stream.with_last_measurement(last);
            }
            Ok(stream.with_metadata(b))
        })
        .collect()
}

fn millis_field(v: &Value) -> Option<DateTime<Utc>> {
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .and_then(DateTime::from_timestamp_millis)
}

/// Convert a DataTable payload to UTC records.
///
/// Rows whose local time does not exist (DST gap) or cannot be parsed are
/// skipped; a payload without `cols`, `rows` or a datetime column is malformed.
pub fn parse_measurements(table: &Value, tz: Tz, policy: NullPolicy) -> Result<Vec<Record>, FetchError> {
    let cols = table
        .get("cols")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Malformed("DataTable without cols".to_string()))?;
    let rows = table
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Malformed("DataTable without rows".to_string()))?;

    let columns: Vec<(&str, &str)> = cols
        .iter()
        .map(|c| {
            (
                c.get("id").and_then(Value::as_str).unwrap_or(""),
                c.get("type").and_then(Value::as_str).unwrap_or(""),
            )
        })
        .collect();

    let time_col = columns
        .iter()
        .position(|(_, kind)| *kind == "datetime")
        .ok_or_else(|| FetchError::Malformed("DataTable without datetime column".to_string()))?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(cells) = row.get("c").and_then(Value::as_array) else {
            continue;
        };

        let raw_time = cells.get(time_col).and_then(|c| c.get("v")).and_then(Value::as_str);
        let Some(timestamp) = raw_time.and_then(parse_table_date).and_then(|t| localize(t, tz)) else {
            debug!(value = ?raw_time, "Skipping row with unusable timestamp");
            continue;
        };

        let mut record = Record::new(timestamp);
        for (i, (id, _)) in columns.iter().enumerate() {
            if i == time_col || id.is_empty() {
                continue;
            }
            let value = cells.get(i).and_then(|c| c.get("v")).and_then(cell_number);
            record.insert_nullable(*id, value, policy);
        }
        records.push(record);
    }
    Ok(records)
}

/// Numeric cell value; `"NaN"` and infinities read as null.
fn cell_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

/// Parse `Date(y,m0,d[,h,mi,s])`; the month is zero-based.
pub fn parse_table_date(raw: &str) -> Option<NaiveDateTime> {
    let inner = raw.trim().strip_prefix("Date(")?.strip_suffix(')')?;
    let parts: Vec<u32> = inner
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.len() < 3 || parts.len() > 6 {
        return None;
    }
    let part = |i: usize| parts.get(i).copied().unwrap_or(0);
    let year = i32::try_from(part(0)).ok()?;
    NaiveDate::from_ymd_opt(year, part(1).checked_add(1)?, part(2))?.and_hms_opt(part(3), part(4), part(5))
}

fn localize(local: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}
