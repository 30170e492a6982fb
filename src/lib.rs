// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Telemetry Sync
//!
//! Incremental, windowed synchronization of vendor telemetry APIs into a
//! time-series store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Sync Orchestrator                       │
//! │  • authenticate → list_streams once per source              │
//! │  • streams in parallel (semaphore), isolated failures       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ per stream
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Checkpoint Resolver                       │
//! │  • start = last stored timestamp + store resolution         │
//! │  • empty stream / failed query → fallback start             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Windowed Fetch Loop                        │
//! │  • [from, to) windows, oldest first                         │
//! │  • bounded retry, failed windows recorded and skipped       │
//! │  • each window written before the next is fetched           │
//! └─────────────────────────────────────────────────────────────┘
//!              │ fetch                          │ write
//!              ▼                                ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │     Source Adapters      │   │        Store Writer          │
//! │  IC-Meter, WirelessTag,  │   │  dedup, schema drift check,  │
//! │  Netatmo, Smappee        │   │  idempotent upsert           │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! The store is the only state: there is no checkpoint table, so a run that
//! dies halfway resumes exactly after the last committed window.
//!
//! ## Configuration
//!
//! See [`SyncConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: [`SyncOrchestrator`] and the per-stream fetch loop
//! - [`source`]: the [`SourceAdapter`] trait and vendor adapters
//! - [`storage`]: store traits, SQL and in-memory backends, the batch writer
//! - [`checkpoint`]: resume-point resolution
//! - [`resilience`]: retry policy and request rate limiting

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod source;
pub mod storage;
pub mod window;

pub use checkpoint::{CheckpointOrigin, CheckpointResolver, Resolution};
pub use config::SyncConfig;
pub use coordinator::{
    FailureStage, RunSummary, SourceReport, StreamStatus, SyncError, SyncOrchestrator, WindowFailure,
    WindowedFetchLoop,
};
pub use metrics::LatencyTimer;
pub use record::{dedup_by_timestamp, NullPolicy, Record, StreamDescriptor};
pub use resilience::rate_limit::RateLimiter;
pub use resilience::retry::RetryPolicy;
pub use source::{AuthError, Credential, FetchError, SourceAdapter};
pub use storage::memory::InMemoryStore;
pub use storage::sql::SqlStore;
pub use storage::traits::{MetadataCatalog, StoreError, TimeSeriesStore};
pub use storage::writer::{SchemaDriftWarning, StoreWriter, WriteOutcome};
pub use window::FetchWindow;
