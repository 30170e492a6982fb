// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One-shot sync of every configured vendor account.
//!
//! Demonstrates:
//! 1. Building adapters from credentials in the environment
//! 2. Syncing every stream of every source into one store
//! 3. Printing per-stream summaries
//! 4. Displaying metrics (OTEL-compatible)
//!
//! # Environment
//!
//! Set any of these pairs; sources without credentials are skipped:
//! ```bash
//! export ICMETER_USERNAME=... ICMETER_PASSWORD=...
//! export WIRELESSTAG_EMAIL=... WIRELESSTAG_PASSWORD=...
//! export NETATMO_CLIENT_ID=... NETATMO_CLIENT_SECRET=... NETATMO_USERNAME=... NETATMO_PASSWORD=...
//! export SMAPPEE_CLIENT_ID=... SMAPPEE_CLIENT_SECRET=... SMAPPEE_USERNAME=... SMAPPEE_PASSWORD=...
//! # Optional, defaults to an in-memory store
//! export SYNC_SQL_URL=sqlite://telemetry.db?mode=rwc
//! ```
//!
//! # Run
//!
//! ```bash
//! cargo run --example sync_once
//! ```

use std::env;
use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use telemetry_sync::source::{
    IcMeterAdapter, IcMeterConfig, NetatmoAdapter, NetatmoConfig, SmappeeAdapter, SmappeeConfig, WirelessTagAdapter,
    WirelessTagConfig,
};
use telemetry_sync::{SourceAdapter, SyncConfig, SyncOrchestrator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           telemetry-sync: One-shot Sync                       ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    let adapters = adapters_from_env()?;
    if adapters.is_empty() {
        println!("No vendor credentials found in the environment, nothing to do.");
        return Ok(());
    }

    let config = SyncConfig {
        sql_url: env::var("SYNC_SQL_URL").ok(),
        verbose: true,
        ..Default::default()
    };
    println!("📦 Store: {}", config.sql_url.as_deref().unwrap_or("in-memory"));

    let orchestrator = SyncOrchestrator::from_config(config).await?;

    // Ctrl-C stops every stream at its next window boundary
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let reports = orchestrator.sync_sources(adapters).await;

    println!("\n📋 Results:");
    for report in &reports {
        match &report.result {
            Ok(summaries) => {
                println!("   {} ({} rows)", report.source, report.rows_written());
                for s in summaries {
                    println!(
                        "   │  └─ {:<40} {:>8} rows  {}/{} windows  {}",
                        s.stream_id, s.rows_written, s.windows_succeeded, s.windows_total, s.status
                    );
                    for failure in &s.failures {
                        println!("   │       ✗ {} ({:?}): {}", failure.window, failure.stage, failure.error);
                    }
                }
            }
            Err(e) => println!("   {} ✗ {}", report.source, e),
        }
    }

    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);
    Ok(())
}

fn adapters_from_env() -> Result<Vec<Arc<dyn SourceAdapter>>, Box<dyn std::error::Error>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

    if let (Ok(user), Ok(password)) = (env::var("ICMETER_USERNAME"), env::var("ICMETER_PASSWORD")) {
        adapters.push(Arc::new(IcMeterAdapter::new(IcMeterConfig::new(user, password))?));
    }

    if let (Ok(email), Ok(password)) = (env::var("WIRELESSTAG_EMAIL"), env::var("WIRELESSTAG_PASSWORD")) {
        adapters.push(Arc::new(WirelessTagAdapter::new(WirelessTagConfig::new(email, password))?));
    }

    if let (Ok(client_id), Ok(client_secret), Ok(username), Ok(password)) = (
        env::var("NETATMO_CLIENT_ID"),
        env::var("NETATMO_CLIENT_SECRET"),
        env::var("NETATMO_USERNAME"),
        env::var("NETATMO_PASSWORD"),
    ) {
        adapters.push(Arc::new(NetatmoAdapter::new(NetatmoConfig {
            client_id,
            client_secret,
            username,
            password,
            base_url: "https://api.netatmo.com".to_string(),
            scale: "max".to_string(),
            timeout_ms: 30_000,
        })?));
    }

    if let (Ok(client_id), Ok(client_secret), Ok(username), Ok(password)) = (
        env::var("SMAPPEE_CLIENT_ID"),
        env::var("SMAPPEE_CLIENT_SECRET"),
        env::var("SMAPPEE_USERNAME"),
        env::var("SMAPPEE_PASSWORD"),
    ) {
        adapters.push(Arc::new(SmappeeAdapter::new(SmappeeConfig::new(
            client_id,
            client_secret,
            username,
            password,
        ))?));
    }

    Ok(adapters)
}

/// Dump all captured metrics in OTEL-compatible format
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                histograms.push((name, label_str, count, sum, max));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.0}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (seconds)");
        for (name, labels, count, sum, max) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("   │  └─ {}{} count={} avg={:.3} max={:.3}", name, labels, count, avg, max);
        }
    }

    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
