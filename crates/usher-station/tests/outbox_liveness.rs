//! Outbox liveness across process restarts.
//!
//! An event enqueued while offline must stay visible in `list_pending`
//! until a connected sync cycle processes it, surviving a simulated
//! restart of the station process in between.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use usher_core::checkin::{CheckinEvent, FailedCheck, FailureReason, SyncResponse};
use usher_core::guest::Guest;
use usher_station::dispatcher::{CycleOutcome, DispatcherConfig, SyncDispatcher, SyncTrigger};
use usher_station::producer::{CheckinOutcome, CheckinProducer};
use usher_station::store::StationStore;
use usher_station::transport::{SyncTransport, TransportError};

struct ScriptedTransport {
    results: Mutex<Vec<Result<SyncResponse, TransportError>>>,
}

impl ScriptedTransport {
    fn new(mut results: Vec<Result<SyncResponse, TransportError>>) -> Self {
        results.reverse();
        Self {
            results: Mutex::new(results),
        }
    }
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn submit_batch(&self, _checks: &[CheckinEvent]) -> Result<SyncResponse, TransportError> {
        self.results
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err(TransportError::Transport("unscripted".into())))
    }

    async fn fetch_guests(&self) -> Result<Vec<Guest>, TransportError> {
        Ok(Vec::new())
    }
}

fn arrival() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 14, 9, 58, 0).unwrap()
}

#[tokio::test]
async fn offline_capture_survives_restart_until_synced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("station.db");

    // Session one: offline check-in lands in the outbox.
    {
        let store = Arc::new(StationStore::open(&path).unwrap());
        store
            .cache_guests(&[Guest::new("g-1", "ada@example.com", "Ada")])
            .unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (_net, rx) = watch::channel(false);
        let producer = CheckinProducer::new(
            Arc::clone(&store),
            transport,
            rx,
            "front-desk-1",
            Duration::from_secs(1),
        );

        let guest = store
            .lookup_guest_by_email("ada@example.com")
            .unwrap()
            .unwrap();
        let outcome = producer.check_in(&guest, arrival()).await.unwrap();
        assert!(matches!(outcome, CheckinOutcome::Queued { .. }));
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    // Simulated restart: a fresh store over the same file still holds the
    // entry.
    let store = Arc::new(StationStore::open(&path).unwrap());
    let pending = store.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event.guest_email, "ada@example.com");
    assert_eq!(pending[0].event.checked_in_at, arrival());

    // Session two: connectivity is back; a sync cycle drains the entry.
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(SyncResponse {
        success_count: 1,
        failed: Vec::new(),
    })]));
    let (_net, rx) = watch::channel(true);
    let (mut dispatcher, _handle) = SyncDispatcher::new(
        Arc::clone(&store),
        transport,
        rx,
        DispatcherConfig::for_testing(),
    );

    let outcome = dispatcher.run_once(SyncTrigger::ConnectivityRegained).await;
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            delivered: 1,
            dead_lettered: 0,
            retained: 0
        }
    );
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn entries_outlive_failed_cycles_until_accepted() {
    let store = Arc::new(StationStore::in_memory().unwrap());
    store
        .cache_guests(&[
            Guest::new("g-1", "ada@example.com", "Ada"),
            Guest::new("g-2", "ghost@example.com", "Ghost"),
        ])
        .unwrap();

    let transport = Arc::new(ScriptedTransport::new(vec![
        // First cycle: the venue uplink is down.
        Err(TransportError::Transport("unreachable".into())),
        // Second cycle: rate limited; still no data loss.
        Err(TransportError::RateLimited),
        // Third cycle: the server answers; one guest doesn't exist.
        Ok(SyncResponse {
            success_count: 1,
            failed: vec![FailedCheck {
                guest_email: "ghost@example.com".to_string(),
                reason: FailureReason::GuestNotFound,
            }],
        }),
    ]));
    let (_net, rx) = watch::channel(true);
    let (mut dispatcher, _handle) = SyncDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        rx,
        DispatcherConfig {
            sync_interval: Duration::from_millis(10),
            backoff: usher_core::retry::BackoffConfig::Fixed {
                delay: Duration::from_millis(1),
            },
        },
    );

    for email in ["ada@example.com", "ghost@example.com"] {
        let event = CheckinEvent::new(email, arrival(), usher_core::checkin::Origin::Local);
        store.enqueue(&event, "front-desk-1").unwrap();
    }

    assert_eq!(
        dispatcher.run_once(SyncTrigger::Manual).await,
        CycleOutcome::Retrying
    );
    assert_eq!(store.pending_count().unwrap(), 2);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
        dispatcher.run_once(SyncTrigger::Manual).await,
        CycleOutcome::Retrying
    );
    assert_eq!(store.pending_count().unwrap(), 2);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
        dispatcher.run_once(SyncTrigger::Manual).await,
        CycleOutcome::Completed {
            delivered: 1,
            dead_lettered: 1,
            retained: 0
        }
    );
    assert_eq!(store.pending_count().unwrap(), 0);

    // The unretryable rejection is surfaced, not lost.
    let rejected = store.list_rejected().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].guest_email, "ghost@example.com");
    assert_eq!(rejected[0].reason, "guest not found");
}
