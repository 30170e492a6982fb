// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scripted in-process source shared by the integration test binaries.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use telemetry_sync::{
    AuthError, Credential, FetchError, FetchWindow, NullPolicy, Record, SourceAdapter, StreamDescriptor,
    SyncConfig,
};

pub const SOURCE: &str = "scripted";

/// Seconds since an arbitrary, fixed origin
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// One reading every `step` seconds in `[from, to)`, value = offset in seconds.
pub fn series(from: i64, to: i64, step: i64) -> Vec<Record> {
    (from..to)
        .step_by(step as usize)
        .map(|s| Record::new(ts(s)).with_field("temperature", s as f64))
        .collect()
}

/// Stream with readings between `first` and `last` (inclusive).
pub fn stream(id: &str, first: i64, last: i64) -> StreamDescriptor {
    StreamDescriptor::new(id)
        .with_first_measurement(ts(first))
        .with_last_measurement(ts(last))
        .with_metadata(json!({ "name": id, "room": "lab" }))
}

/// 300 second windows, near-instant retries.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        window_secs: 300,
        retry_delay_ms: 1,
        fetch_attempts: 2,
        store_attempts: 3,
        fetch_timeout_ms: 5_000,
        store_timeout_ms: 5_000,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// HTTP 503, retryable; fails this many attempts then recovers
    Transient(usize),
    /// HTTP 503 on every attempt
    Unavailable,
    /// Rejected credential, never retried
    Unauthorized,
    Panic,
}

/// Source whose streams and failures are set up by the test.
pub struct ScriptedAdapter {
    name: String,
    streams: Vec<StreamDescriptor>,
    data: HashMap<String, Vec<Record>>,
    faults: Mutex<HashMap<(String, DateTime<Utc>), Fault>>,
    auth_error: Option<String>,
    list_error: Option<u16>,
    cancel_after_fetches: Option<(usize, CancellationToken)>,
    fetch_calls: AtomicUsize,
    fetched: Mutex<Vec<(String, FetchWindow)>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            name: SOURCE.to_string(),
            streams: Vec::new(),
            data: HashMap::new(),
            faults: Mutex::new(HashMap::new()),
            auth_error: None,
            list_error: None,
            cancel_after_fetches: None,
            fetch_calls: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_stream(mut self, descriptor: StreamDescriptor, records: Vec<Record>) -> Self {
        self.data.insert(descriptor.id.clone(), records);
        self.streams.push(descriptor);
        self
    }

    /// Fail the window of `stream_id` starting at `from`.
    pub fn with_fault(self, stream_id: &str, from: DateTime<Utc>, fault: Fault) -> Self {
        self.faults.lock().insert((stream_id.to_string(), from), fault);
        self
    }

    pub fn failing_auth(mut self, msg: &str) -> Self {
        self.auth_error = Some(msg.to_string());
        self
    }

    pub fn failing_listing(mut self, status: u16) -> Self {
        self.list_error = Some(status);
        self
    }

    pub fn cancel_after(mut self, fetches: usize, token: CancellationToken) -> Self {
        self.cancel_after_fetches = Some((fetches, token));
        self
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Windows requested for `stream_id`, in call order (retries included).
    pub fn windows_for(&self, stream_id: &str) -> Vec<FetchWindow> {
        self.fetched
            .lock()
            .iter()
            .filter(|(id, _)| id == stream_id)
            .map(|(_, w)| *w)
            .collect()
    }

    fn take_fault(&self, stream_id: &str, from: DateTime<Utc>) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let key = (stream_id.to_string(), from);
        match faults.get(&key).copied() {
            Some(Fault::Transient(0)) => {
                faults.remove(&key);
                None
            }
            Some(Fault::Transient(n)) => {
                faults.insert(key, Fault::Transient(n - 1));
                Some(Fault::Transient(n))
            }
            other => other,
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn null_policy(&self) -> NullPolicy {
        NullPolicy::Omit
    }

    async fn authenticate(&self) -> Result<Credential, AuthError> {
        match &self.auth_error {
            Some(msg) => Err(AuthError::InvalidCredentials(msg.clone())),
            None => Ok(Credential::Bearer("scripted-token".to_string())),
        }
    }

    async fn list_streams(&self, credential: &Credential) -> Result<Vec<StreamDescriptor>, FetchError> {
        credential.bearer()?;
        match self.list_error {
            Some(status) => Err(FetchError::Status { status, body: "listing unavailable".to_string() }),
            None => Ok(self.streams.clone()),
        }
    }

    async fn fetch(
        &self,
        credential: &Credential,
        stream: &StreamDescriptor,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        credential.bearer()?;
        let calls = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.fetched.lock().push((stream.id.clone(), window));

        if let Some((after, token)) = &self.cancel_after_fetches {
            if calls >= *after {
                token.cancel();
            }
        }

        match self.take_fault(&stream.id, window.from) {
            Some(Fault::Transient(_)) | Some(Fault::Unavailable) => {
                return Err(FetchError::Status { status: 503, body: "try later".to_string() })
            }
            Some(Fault::Unauthorized) => return Err(FetchError::Unauthorized),
            Some(Fault::Panic) => panic!("scripted panic in {}", stream.id),
            None => {}
        }

        Ok(self
            .data
            .get(&stream.id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| window.contains(r.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
