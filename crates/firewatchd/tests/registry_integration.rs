//! Integration tests for the sensor registry actor.
//!
//! These tests drive the registry only through `spawn_registry()` and the
//! `RegistryHandle` interface.

use std::time::Duration;

use firewatch_core::{ReadingValues, SensorId};
use firewatchd::registry::{
    spawn_registry, spawn_registry_with_capacity, ConnectionId, RegistryError, RemovalReason,
    SensorEvent, MAX_PENDING_ALERTS,
};
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

fn healthy() -> ReadingValues {
    ReadingValues::new(20.0, 80, 2, 300.0)
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<SensorEvent>) -> SensorEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel open")
}

// ============================================================================
// Validation through upsert
// ============================================================================

#[tokio::test]
async fn test_healthy_reading_has_no_errors() {
    let handle = spawn_registry();
    let errors = handle
        .upsert(ConnectionId::next(), SensorId::new("ok"), ReadingValues::new(50.0, 31, 7, 300.0))
        .await
        .unwrap();
    assert!(errors.is_empty());
}

#[tokio::test]
async fn test_hot_reading_flagged_dangerous_only() {
    let handle = spawn_registry();
    let errors = handle
        .upsert(ConnectionId::next(), SensorId::new("hot"), ReadingValues::new(50.1, 80, 2, 300.0))
        .await
        .unwrap();

    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("hot : Temperature is reaching a dangerous level"));
    assert!(!errors.iter().any(|e| e.contains("malfunction")));
}

#[tokio::test]
async fn test_errors_recomputed_on_update() {
    let handle = spawn_registry();
    let owner = ConnectionId::next();
    let id = SensorId::new("flip");

    let first = handle
        .upsert(owner, id.clone(), ReadingValues::new(20.0, 10, 9, 310.0))
        .await
        .unwrap();
    assert_eq!(first.len(), 3);

    let second = handle.upsert(owner, id, healthy()).await.unwrap();
    assert!(second.is_empty());
    assert!(handle.snapshot_all().await[0].errors.is_empty());
}

// ============================================================================
// Delta and snapshot views
// ============================================================================

#[tokio::test]
async fn test_drain_returns_each_change_once() {
    let handle = spawn_registry();
    handle
        .upsert(ConnectionId::next(), SensorId::new("d-1"), healthy())
        .await
        .unwrap();

    let drained = handle.drain_unflushed().await;
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].sensor_id.as_str(), "d-1");
    assert!(handle.drain_unflushed().await.is_empty());
}

#[tokio::test]
async fn test_snapshot_unaffected_by_drain() {
    let handle = spawn_registry();
    let owner = ConnectionId::next();
    for id in ["s-1", "s-2", "s-3"] {
        handle.upsert(owner, SensorId::new(id), healthy()).await.unwrap();
    }

    let _ = handle.drain_unflushed().await;
    let ids: Vec<String> = handle
        .snapshot_all()
        .await
        .iter()
        .map(|r| r.sensor_id.to_string())
        .collect();
    assert_eq!(ids, vec!["s-1", "s-2", "s-3"]);
}

#[tokio::test]
async fn test_revision_tracks_mutations() {
    let handle = spawn_registry();
    let owner = ConnectionId::next();

    let start = handle.snapshot().await.unwrap().revision;
    handle.upsert(owner, SensorId::new("r"), healthy()).await.unwrap();
    let after_upsert = handle.snapshot().await.unwrap().revision;
    assert!(after_upsert > start);

    // Draining is not a mutation of the snapshot
    let _ = handle.drain_unflushed().await;
    assert_eq!(handle.snapshot().await.unwrap().revision, after_upsert);

    assert!(handle.remove(SensorId::new("r")).await);
    assert!(handle.snapshot().await.unwrap().revision > after_upsert);
}

// ============================================================================
// Removal and ownership
// ============================================================================

#[tokio::test]
async fn test_remove_absent_is_noop() {
    let handle = spawn_registry();
    assert!(!handle.remove(SensorId::new("ghost")).await);
    assert_eq!(handle.size().await, 0);
}

#[tokio::test]
async fn test_release_only_by_owner() {
    let handle = spawn_registry();
    let older = ConnectionId::next();
    let newer = ConnectionId::next();
    let id = SensorId::new("shared");

    handle.upsert(older, id.clone(), healthy()).await.unwrap();
    handle.upsert(newer, id.clone(), healthy()).await.unwrap();

    assert!(!handle.release(id.clone(), older).await);
    assert_eq!(handle.size().await, 1);
    assert!(handle.release(id, newer).await);
    assert_eq!(handle.size().await, 0);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_event_sequence() {
    let handle = spawn_registry();
    let mut rx = handle.subscribe();
    let owner = ConnectionId::next();

    handle.upsert(owner, SensorId::new("e"), healthy()).await.unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        SensorEvent::Registered { count: 1, .. }
    ));
    assert!(matches!(next_event(&mut rx).await, SensorEvent::Updated { .. }));

    handle.upsert(owner, SensorId::new("e"), healthy()).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, SensorEvent::Updated { .. }));

    handle.release(SensorId::new("e"), owner).await;
    match next_event(&mut rx).await {
        SensorEvent::Removed { sensor_id, count, reason } => {
            assert_eq!(sensor_id.as_str(), "e");
            assert_eq!(count, 0);
            assert_eq!(reason, RemovalReason::ConnectionClosed);
        }
        other => panic!("Expected Removed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_alerts_queued_and_drained() {
    let handle = spawn_registry();
    let mut rx = handle.subscribe();

    handle.raise_alert("1-1 : quiet").await.unwrap();
    assert!(matches!(next_event(&mut rx).await, SensorEvent::Alert { .. }));

    assert_eq!(handle.drain_alerts().await, vec!["1-1 : quiet".to_string()]);
    assert!(handle.drain_alerts().await.is_empty());
}

#[tokio::test]
async fn test_alert_queue_bounded() {
    let handle = spawn_registry();
    for i in 0..(MAX_PENDING_ALERTS + 10) {
        handle.raise_alert(format!("alert {i}")).await.unwrap();
    }

    let alerts = handle.drain_alerts().await;
    assert_eq!(alerts.len(), MAX_PENDING_ALERTS);
    // Oldest alerts are dropped first
    assert_eq!(alerts[0], "alert 10");
}

// ============================================================================
// Capacity and concurrency
// ============================================================================

#[tokio::test]
async fn test_capacity_limit() {
    let handle = spawn_registry_with_capacity(2);
    let owner = ConnectionId::next();

    handle.upsert(owner, SensorId::new("a"), healthy()).await.unwrap();
    handle.upsert(owner, SensorId::new("b"), healthy()).await.unwrap();

    let result = handle.upsert(owner, SensorId::new("c"), healthy()).await;
    assert_eq!(result, Err(RegistryError::RegistryFull { max: 2 }));

    // Existing ids can still be updated
    assert!(handle.upsert(owner, SensorId::new("a"), healthy()).await.is_ok());
    assert_eq!(handle.size().await, 2);
}

#[tokio::test]
async fn test_concurrent_upserts() {
    let handle = spawn_registry();
    let mut tasks = Vec::new();

    for i in 0..50 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let owner = ConnectionId::next();
            for _ in 0..10 {
                handle
                    .upsert(owner, SensorId::new(format!("c-{i}")), healthy())
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(handle.size().await, 50);
    assert_eq!(handle.drain_unflushed().await.len(), 50);
}
