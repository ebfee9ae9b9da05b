// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic k4-sync usage example.
//!
//! Demonstrates, against the in-process backend (no services required):
//! 1. Wiring a coordinator around stores and a backend
//! 2. Creating an external K4 key through the key manager
//! 3. A full sync: key generation, key mirroring, subscriber encryption
//! 4. Rotating the internal key and rewrapping subscribers
//! 5. Circuit gating while the backend is down
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=k4_sync=debug cargo run --example basic_usage
//! ```

use k4_sync::backend::InMemoryBackend;
use k4_sync::storage::memory::{InMemoryKeyStore, InMemoryRefStore, InMemorySubscriberStore};
use k4_sync::{
    ciphertext_version, labels, K4SyncConfig, KeyRecord, KeyType, SubscriberKeyState, SyncCoordinator,
    SyncMessage, TransactionalKeyStore, TriggerOutcome,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("k4_sync=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║              k4-sync: Basic Usage Example                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Wire the coordinator
    // ─────────────────────────────────────────────────────────────────────────
    let backend = Arc::new(InMemoryBackend::new());
    let store = Arc::new(TransactionalKeyStore::new(
        Arc::new(InMemoryKeyStore::new()),
        Arc::new(InMemoryRefStore::new()),
    ));
    let subscribers = Arc::new(InMemorySubscriberStore::new());
    subscribers.insert("imsi-001010000000001", SubscriberKeyState::cleartext("465b5ce8b199b49faa5f0a2ee238a6bc"));
    subscribers.insert("imsi-001010000000002", SubscriberKeyState::cleartext("0396eb317b6d1c36f19c1c84cd6ffd16"));

    let coordinator = Arc::new(SyncCoordinator::new(
        K4SyncConfig::default(),
        backend.clone(),
        store.clone(),
        subscribers.clone(),
    ));
    let handle = coordinator.clone().spawn();
    println!("📦 Coordinator running (backend: in-memory)");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Operator-provisioned key
    // ─────────────────────────────────────────────────────────────────────────
    let created = coordinator
        .keys()
        .create_key(&KeyRecord::new(1, labels::K4_AES, KeyType::Aes128, "000102030405060708090A0B0C0D0E0F"))
        .await?;
    println!("\n🔑 Created {} → stored value {:?}", created.key(), created.value);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Full sync
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔄 Full sync...");
    if let TriggerOutcome::Completed(report) = coordinator.trigger_sync().await {
        for r in report.our_keys.iter().filter(|r| !r.created.is_empty()) {
            println!("   └─ {}: created serials {:?}", r.label, r.created);
        }
        println!(
            "   └─ users: {} encrypted, {} failed",
            report.users.encrypted, report.users.failed
        );
    }
    print_subscribers(&subscribers);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Rotate and rewrap
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n♻️  Rotating internal key...");
    let outcome = handle.request(SyncMessage::parse("ROTATE_INTERNAL_KEY")).await?;
    println!("   └─ {}", outcome.map(|o| o.to_string()).unwrap_or_default());
    let outcome = handle.request(SyncMessage::parse("SYNC_USERS")).await?;
    println!("   └─ SYNC_USERS: {}", outcome.map(|o| o.to_string()).unwrap_or_default());
    print_subscribers(&subscribers);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Circuit gating
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⛔ Backend goes down...");
    coordinator.circuit().trip("demo outage");
    backend.reset_calls();
    let outcome = coordinator.trigger_sync().await;
    println!("   └─ sync while down: {} ({} backend calls)", outcome, backend.total_calls());
    coordinator.circuit().mark_healthy();

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    handle.shutdown().await;
    println!("   ✅ Done");
    Ok(())
}

fn print_subscribers(subscribers: &InMemorySubscriberStore) {
    for ue in ["imsi-001010000000001", "imsi-001010000000002"] {
        if let Some(state) = subscribers.snapshot(ue) {
            let version = ciphertext_version(&state.permanent_key_value)
                .map(|v| format!("v{v}"))
                .unwrap_or_else(|_| "cleartext".into());
            println!(
                "   └─ {ue}: alg={} sno={} ({version})",
                state.encryption_algorithm, state.key_serial_reference
            );
        }
    }
}

fn dump_metrics(snapshotter: &Snapshotter) {
    println!("\n📊 Metrics:");
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => v.into_inner().to_string(),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("   └─ {}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("{line}");
    }
}
