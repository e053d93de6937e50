//! Integration tests for outbox replay, id remapping and ping upload

mod common;

use common::{TestApp, BASE_URL};
use rideshare_tracker::api::LocationBatch;
use rideshare_tracker::database::{
    EntityKind, HttpMethod, LatLng, MutationKind, NewExpense, OutboxMeta, PingSource, Receipt,
};
use rideshare_tracker::services::{AppLifecycle, LocationFix, Outcome, TrackerState};
use serde_json::{json, Value};
use std::time::Duration;

fn fix(lat: f64, lng: f64) -> LocationFix {
    LocationFix {
        lat,
        lng,
        accuracy_m: Some(5.0),
        speed_mps: None,
        bearing_deg: None,
        source: PingSource::Gps,
        ts: None,
    }
}

#[tokio::test]
async fn test_online_shift_start_takes_server_id() {
    let t = TestApp::new().await;

    let outcome = t.app.tracker.start_shift().await.unwrap();
    t.app.sync.stop().await;

    assert_eq!(outcome, Outcome::Confirmed("server-1".to_string()));
    let shift = t.app.repo.get_active_shift().await.unwrap().unwrap();
    assert_eq!(shift.id, "server-1");
    assert!(shift.synced);
    assert_eq!(t.shift_id(), "server-1");
    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_queued_shift_is_remapped_on_replay() {
    let t = TestApp::new().await;
    t.server.set_online(false);

    let outcome = t.app.tracker.start_shift().await.unwrap();
    t.app.sync.stop().await;
    assert!(matches!(outcome, Outcome::Queued(_)));
    let local_id = t.shift_id();
    assert_ne!(local_id, "server-1");

    t.server.set_online(true);
    let report = t.app.sync.trigger().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(
        t.app.ids.resolve(&local_id).await.unwrap().as_deref(),
        Some("server-1")
    );
    let mapping = t.app.ids.get(&local_id).await.unwrap().unwrap();
    assert_eq!(mapping.entity, EntityKind::Shift);
    assert!(t.app.repo.get_shift(&local_id).await.unwrap().is_none());
    let shift = t.app.repo.get_shift("server-1").await.unwrap().unwrap();
    assert!(shift.synced);
    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_offline_ride_is_queued_with_meta() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;
    let shift_id = t.shift_id();

    let outcome = t
        .app
        .tracker
        .start_ride(Some(LatLng { lat: 40.7, lng: -74.0 }))
        .await
        .unwrap();

    let Outcome::Queued(entry_id) = outcome else {
        panic!("expected queued outcome, got {:?}", outcome);
    };
    assert_eq!(t.app.tracker.state().await, TrackerState::EnRoute);

    let entry = t.app.outbox.get(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.method, HttpMethod::Post);
    assert_eq!(entry.url, "/v1/rides");

    let meta = entry.parsed_meta().unwrap();
    assert_eq!(meta.kind, Some(MutationKind::RideCreate));
    assert_eq!(meta.local_id.as_deref(), Some(t.ride_id().as_str()));
    assert_eq!(meta.shift_id.as_deref(), Some(shift_id.as_str()));

    let raw: Value = serde_json::from_str(entry.meta.as_deref().unwrap()).unwrap();
    assert_eq!(raw["type"], "ride_create");
    assert!(raw.get("localId").is_some());

    let body: Value = serde_json::from_str(&entry.body).unwrap();
    assert_eq!(body["shift_id"], shift_id);
    assert_eq!(body["pickup_lat"], 40.7);
}

#[tokio::test]
async fn test_replay_rewrites_ids_across_queued_entries() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;
    t.app.tracker.start_ride(None).await.unwrap();
    let local_ride = t.ride_id();
    t.app.tracker.mark_pickup().await.unwrap();
    t.app.tracker.end_ride(2500, None, Some(4.0)).await.unwrap();
    assert_eq!(t.app.outbox.count().await.unwrap(), 3);

    t.server.set_online(true);
    let report = t.drain().await;

    assert_eq!(report.sent, 3);
    assert_eq!(report.rewritten, 2);
    assert_eq!(
        t.server.paths(),
        vec![
            "/v1/shifts".to_string(),
            "/v1/rides".to_string(),
            "/v1/rides/server-2/end".to_string(),
        ]
    );

    let ride_request = &t.server.requests_to("/v1/rides")[0];
    let body: Value = serde_json::from_str(ride_request.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["shift_id"], "server-1");
    assert!(!t.server.requests()[2].url.contains(&local_ride));

    let rides = t.app.repo.rides_for_shift("server-1").await.unwrap();
    assert_eq!(rides.len(), 1);
    assert_eq!(rides[0].id, "server-2");
    assert!(rides[0].synced);
    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_shift_create_is_not_starved_by_its_dependents() {
    let t = TestApp::with_settings(|s| s.sync.outbox_batch_limit = 5).await;
    t.server.set_online(false);
    t.start_shift_manual().await;
    let local_shift = t.shift_id();

    // One failed attempt sinks the shift create below fresh entries
    t.app.sync.trigger().await.unwrap();
    for _ in 0..6 {
        t.app.tracker.start_ride(None).await.unwrap();
        t.app.location.record_fix(&fix(40.7, -74.0)).await.unwrap();
        t.app.tracker.mark_pickup().await.unwrap();
        t.app.tracker.end_ride(1000, None, None).await.unwrap();
    }
    assert_eq!(t.app.outbox.count().await.unwrap(), 13);
    let batch = t.app.outbox.list_pending(5).await.unwrap();
    assert!(batch
        .iter()
        .all(|entry| entry.parsed_meta().unwrap().kind != Some(MutationKind::ShiftCreate)));

    t.server.set_online(true);
    let first = t.app.sync.trigger().await.unwrap();
    assert!(first.sent >= 7);
    assert_eq!(t.server.paths()[0], "/v1/shifts");

    t.drain().await;

    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
    assert_eq!(t.app.repo.pending_ping_count().await.unwrap(), 0);
    assert_eq!(
        t.app.ids.resolve(&local_shift).await.unwrap().as_deref(),
        Some("server-1")
    );
    let shift = t.app.repo.get_shift("server-1").await.unwrap().unwrap();
    assert_eq!(shift.earnings_cents, 6000);
    assert_eq!(shift.ride_count, 6);
    assert_eq!(t.server.requests_to("/v1/shifts").len(), 1);
}

#[tokio::test]
async fn test_overlapping_cycles_send_each_entry_once() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;
    t.app.tracker.start_ride(None).await.unwrap();
    t.app.tracker.mark_pickup().await.unwrap();
    t.app.tracker.end_ride(2200, None, None).await.unwrap();
    assert_eq!(t.app.outbox.count().await.unwrap(), 3);

    t.server.set_online(true);
    t.server.set_delay(Duration::from_millis(50));
    t.app.sync.start().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (nudged, triggered) = tokio::join!(
        async {
            t.app.sync.nudge();
            t.app.sync.trigger().await
        },
        t.app.sync.trigger()
    );
    nudged.unwrap();
    triggered.unwrap();
    t.app.sync.stop().await;

    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
    assert_eq!(
        t.server.paths(),
        vec![
            "/v1/shifts".to_string(),
            "/v1/rides".to_string(),
            "/v1/rides/server-2/end".to_string(),
        ]
    );
    let shift = t.app.repo.get_shift("server-1").await.unwrap().unwrap();
    assert_eq!(shift.earnings_cents, 2200);
}

#[tokio::test]
async fn test_every_request_carries_bearer_token() {
    let t = TestApp::new().await;
    t.start_shift_manual().await;
    t.app.tracker.start_ride(None).await.unwrap();

    let requests = t.server.requests();
    assert_eq!(requests.len(), 2);
    for request in requests {
        assert_eq!(request.bearer, common::TOKEN);
        assert!(request.url.starts_with(BASE_URL));
    }
}

#[tokio::test]
async fn test_direct_ride_after_replayed_shift_uses_server_id() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;

    t.server.set_online(true);
    t.app.sync.trigger().await.unwrap();
    t.server.clear_log();

    let outcome = t.app.tracker.start_ride(None).await.unwrap();

    assert_eq!(outcome, Outcome::Confirmed("server-2".to_string()));
    let request = &t.server.requests_to("/v1/rides")[0];
    let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["shift_id"], "server-1");
    assert_eq!(t.shift_id(), "server-1");
    assert_eq!(t.ride_id(), "server-2");
}

#[tokio::test]
async fn test_duplicate_create_is_dropped() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;
    let local_id = t.shift_id();

    let meta = OutboxMeta::new(MutationKind::ShiftCreate).with_local_id(&local_id);
    t.app
        .outbox
        .enqueue(HttpMethod::Post, "/v1/shifts", &json!({}), Some(&meta))
        .await
        .unwrap();

    t.server.set_online(true);
    let report = t.app.sync.trigger().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(t.server.requests_to("/v1/shifts").len(), 1);
    assert_eq!(
        t.app.ids.resolve(&local_id).await.unwrap().as_deref(),
        Some("server-1")
    );
    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_replay_does_not_double_count_earnings() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;
    t.app.tracker.start_ride(None).await.unwrap();
    t.app.tracker.mark_pickup().await.unwrap();
    t.app.tracker.end_ride(2500, None, None).await.unwrap();

    t.server.set_online(true);
    t.drain().await;
    t.app.sync.trigger().await.unwrap();

    let shift = t.app.repo.get_shift("server-1").await.unwrap().unwrap();
    assert_eq!(shift.earnings_cents, 2500);
    assert_eq!(shift.ride_count, 1);
    assert!(shift.synced);

    let stats = t.app.tracker.view().stats;
    assert_eq!(stats.earnings_cents, 2500);
    assert_eq!(stats.rides, 1);
}

#[tokio::test]
async fn test_failed_entry_is_delivered_after_recovery() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;
    let before = t.app.outbox.list_pending(10).await.unwrap()[0].retry_count;

    for _ in 0..3 {
        let report = t.app.sync.trigger().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 0);
    }

    let entry = &t.app.outbox.list_pending(10).await.unwrap()[0];
    assert_eq!(entry.retry_count, before + 3);
    assert!(entry.last_attempt_at.is_some());

    t.server.set_online(true);
    let report = t.app.sync.trigger().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
    assert!(t.app.repo.get_shift("server-1").await.unwrap().unwrap().synced);
}

#[tokio::test]
async fn test_rejected_entry_is_purged_after_max_retries() {
    let t = TestApp::new().await;
    t.server.fail_path("/v1/shifts", 422);

    let outcome = t.app.tracker.start_shift().await.unwrap();
    t.app.sync.stop().await;
    assert!(matches!(outcome, Outcome::Queued(_)));
    let local_id = t.shift_id();

    let mut purged = 0;
    for _ in 0..12 {
        let report = t.app.sync.trigger().await.unwrap();
        purged += report.requests_purged;
        if t.app.outbox.count().await.unwrap() == 0 {
            break;
        }
    }

    assert_eq!(purged, 1);
    assert_eq!(t.app.outbox.count().await.unwrap(), 0);
    assert!(t.server.requests_to("/v1/shifts").len() >= 11);

    let shift = t.app.repo.get_shift(&local_id).await.unwrap().unwrap();
    assert!(!shift.synced);
    assert!(t.app.ids.resolve(&local_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pings_uploaded_per_shift_and_ride() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.start_shift_manual().await;

    t.app.location.record_fix(&fix(40.70, -74.00)).await.unwrap();
    t.app.location.record_fix(&fix(40.71, -74.01)).await.unwrap();
    t.app.tracker.start_ride(None).await.unwrap();
    for i in 0..3 {
        t.app
            .location
            .record_fix(&fix(40.72 + i as f64 * 0.01, -74.02))
            .await
            .unwrap();
    }
    t.app.tracker.mark_pickup().await.unwrap();
    t.app.tracker.end_ride(1800, None, None).await.unwrap();
    t.app.location.record_fix(&fix(40.80, -74.10)).await.unwrap();
    assert_eq!(t.app.repo.pending_ping_count().await.unwrap(), 6);

    t.server.set_online(true);
    let report = t.drain().await;

    assert_eq!(report.pings_uploaded, 6);
    assert_eq!(t.app.repo.pending_ping_count().await.unwrap(), 0);

    let batches: Vec<LocationBatch> = t
        .server
        .requests_to("/v1/location")
        .iter()
        .map(|r| serde_json::from_str(r.body.as_deref().unwrap()).unwrap())
        .collect();
    assert_eq!(batches.len(), 2);

    assert_eq!(batches[0].shift_id, "server-1");
    assert_eq!(batches[0].ride_id, None);
    assert_eq!(batches[0].pings.len(), 3);

    assert_eq!(batches[1].shift_id, "server-1");
    assert_eq!(batches[1].ride_id.as_deref(), Some("server-2"));
    assert_eq!(batches[1].pings.len(), 3);
}

#[tokio::test]
async fn test_failed_ping_upload_keeps_pings_pending() {
    let t = TestApp::new().await;
    t.start_shift_manual().await;
    t.app.location.record_fix(&fix(40.7, -74.0)).await.unwrap();
    t.server.fail_path("/v1/location", 503);

    let report = t.app.sync.trigger().await.unwrap();

    assert_eq!(report.pings_uploaded, 0);
    assert_eq!(t.app.repo.pending_ping_count().await.unwrap(), 1);

    t.server.clear_failures();
    let report = t.app.sync.trigger().await.unwrap();
    assert_eq!(report.pings_uploaded, 1);
}

#[tokio::test]
async fn test_expense_sync_replaces_receipt_with_url() {
    let t = TestApp::new().await;
    t.server.set_online(false);

    let (expense, outcome) = t
        .app
        .expenses
        .create_expense(NewExpense {
            ts: None,
            category: "Fuel".to_string(),
            amount_cents: 4500,
            note: Some("Full tank".to_string()),
            receipt: Some(Receipt {
                base64: "aGVsbG8=".to_string(),
                mime: "image/jpeg".to_string(),
            }),
        })
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Queued(_)));
    assert_eq!(expense.receipt_base64.as_deref(), Some("aGVsbG8="));
    assert!(!expense.synced);

    t.server.set_online(true);
    let report = t.app.sync.trigger().await.unwrap();
    assert_eq!(report.sent, 1);

    let request = &t.server.requests_to("/v1/expenses")[0];
    let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["receipt_base64"], "aGVsbG8=");
    assert_eq!(body["amount_cents"], 4500);

    let synced = t.app.expenses.get_expense("server-1").await.unwrap();
    assert!(synced.synced);
    assert_eq!(synced.receipt_base64, None);
    assert_eq!(
        synced.receipt_url.as_deref(),
        Some("https://tracker.test/receipts/server-1.jpg")
    );
    assert!(t.app.expenses.get_expense(&expense.id).await.is_err());
}

#[tokio::test]
async fn test_online_expense_is_returned_with_server_id() {
    let t = TestApp::new().await;

    let (expense, outcome) = t
        .app
        .expenses
        .create_expense(NewExpense {
            ts: None,
            category: "  ".to_string(),
            amount_cents: 1200,
            note: None,
            receipt: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Confirmed("server-1".to_string()));
    assert_eq!(expense.id, "server-1");
    assert_eq!(expense.category, "General");
    assert!(expense.synced);
    assert_eq!(expense.receipt_url, None);
}

#[tokio::test]
async fn test_unpaired_app_queues_without_network() {
    let t = TestApp::unpaired().await;

    let outcome = t.app.tracker.start_shift().await.unwrap();
    t.app.sync.stop().await;
    assert!(matches!(outcome, Outcome::Queued(_)));

    let before = t.app.outbox.list_pending(10).await.unwrap()[0].retry_count;
    let report = t.app.sync.trigger().await.unwrap();

    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 0);
    assert!(t.server.requests().is_empty());
    assert_eq!(
        t.app.outbox.list_pending(10).await.unwrap()[0].retry_count,
        before
    );
}

#[tokio::test]
async fn test_foreground_event_drains_outbox() {
    let t = TestApp::new().await;
    t.server.set_online(false);
    t.app.tracker.start_shift().await.unwrap();
    assert!(t.app.sync.is_running().await);

    t.server.set_online(true);
    t.app.publish_lifecycle(AppLifecycle::Foreground);

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while t.app.outbox.count().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    assert!(drained.is_ok());
    assert!(t.app.repo.get_shift("server-1").await.unwrap().is_some());
    t.app.shutdown().await;
}
