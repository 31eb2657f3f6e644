use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_jobs::{
    DeleteOutcome, Destination, DestinationOutcome, Engine, EngineConfig, FileStore,
    InMemoryStore, JobError, JobFilter, JobRecord, JobState, JobStore, LeaseToken, ManualClock,
    MessageHandle, OutcomeDelta, Payload, PublishOptions, SendOutcome, Transport,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn publish(due: DateTime<Utc>, destinations: &[&str]) -> JobRecord {
    JobRecord::publish(
        Payload::new(serde_json::json!({"text": "hello"})),
        destinations.iter().map(|d| Destination::from(*d)),
        due,
        3,
        None,
        t(0),
    )
    .unwrap()
}

fn delivered(handle: &str) -> DestinationOutcome {
    DestinationOutcome::Delivered {
        handle: MessageHandle::from(handle),
        delivered_at: t(0),
        attempts: 1,
    }
}

const TTL: Duration = Duration::from_secs(60);

async fn lease_lifecycle(store: &dyn JobStore) {
    let id = store.submit(publish(t(0), &["a", "b"])).await.unwrap();

    assert!(store.due_before(t(-1), 10).await.unwrap().is_empty());
    assert_eq!(store.due_before(t(0), 10).await.unwrap(), vec![id]);

    let leased = store.lease(&id, "w1", TTL, t(0)).await.unwrap();
    assert_eq!(leased.state, JobState::InFlight);
    let w1 = leased.lease_token().unwrap();
    assert!(matches!(
        store.lease(&id, "w2", TTL, t(1)).await,
        Err(JobError::AlreadyLeased(_))
    ));
    assert!(matches!(
        store
            .update(&id, &LeaseToken::new(), OutcomeDelta::new("a".into(), delivered("1")), t(1))
            .await,
        Err(JobError::LeaseLost(_))
    ));

    store
        .update(&id, &w1, OutcomeDelta::new("a".into(), delivered("1")), t(1))
        .await
        .unwrap();
    assert!(matches!(
        store
            .update(&id, &w1, OutcomeDelta::new("a".into(), delivered("2")), t(1))
            .await,
        Err(JobError::OutcomeRegression { .. })
    ));

    let released = store.release(&id, &w1, t(2)).await.unwrap();
    assert_eq!(released.state, JobState::PartiallyDelivered);
    assert!(released.lease.is_none());
    assert!(!released.is_terminal());

    // "b" was never attempted, so the job is due again right away.
    assert_eq!(store.due_before(t(2), 10).await.unwrap(), vec![id]);
}

async fn cancel_waits_for_release(store: &dyn JobStore) {
    let id = store.submit(publish(t(0), &["a"])).await.unwrap();
    let w1 = store
        .lease(&id, "w1", TTL, t(0))
        .await
        .unwrap()
        .lease_token()
        .unwrap();

    let requested = store
        .cancel(&id, Some("changed my mind".into()), t(1))
        .await
        .unwrap();
    assert!(requested.cancel_requested);
    assert_eq!(requested.state, JobState::InFlight);

    let settled = store.release(&id, &w1, t(2)).await.unwrap();
    assert_eq!(settled.state, JobState::Cancelled);
    assert_eq!(settled.cancellation_reason.as_deref(), Some("changed my mind"));
    assert!(store.due_before(t(1_000), 10).await.unwrap().is_empty());

    assert!(matches!(
        store.cancel(&id, None, t(3)).await,
        Err(JobError::AlreadyTerminal(_))
    ));
}

async fn purge_keeps_unfinished(store: &dyn JobStore) {
    let done = store.submit(publish(t(0), &["a"])).await.unwrap();
    let open = store.submit(publish(t(0), &["a"])).await.unwrap();

    let w1 = store
        .lease(&done, "w1", TTL, t(0))
        .await
        .unwrap()
        .lease_token()
        .unwrap();
    store
        .update(&done, &w1, OutcomeDelta::new("a".into(), delivered("1")), t(0))
        .await
        .unwrap();
    store.release(&done, &w1, t(0)).await.unwrap();

    assert!(matches!(
        store.remove(&open).await,
        Err(JobError::NotRemovable(_))
    ));
    assert_eq!(store.purge_finished(t(10)).await.unwrap(), 1);
    assert!(matches!(store.get(&done).await, Err(JobError::NotFound(_))));
    assert!(store.get(&open).await.is_ok());
}

async fn owner_filter(store: &dyn JobStore) {
    store
        .submit(publish(t(5), &["a"]).with_owner(Some("alice".into())))
        .await
        .unwrap();
    store
        .submit(publish(t(1), &["a"]).with_owner(Some("alice".into())))
        .await
        .unwrap();
    store
        .submit(publish(t(0), &["a"]).with_owner(Some("bob".into())))
        .await
        .unwrap();

    let alice = store.list(&JobFilter::new().owner("alice")).await.unwrap();
    assert_eq!(alice.len(), 2);
    assert!(alice[0].due_at <= alice[1].due_at);

    let limited = store.list(&JobFilter::new().limit(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].owner.as_deref(), Some("bob"));
}

async fn relapsed_lease_rejects_old_token(store: &dyn JobStore) {
    let id = store.submit(publish(t(0), &["a"])).await.unwrap();

    let stale = store.lease(&id, "w1", TTL, t(0)).await.unwrap();
    let fresh = store.lease(&id, "w1", TTL, t(61)).await.unwrap();
    let stale = stale.lease_token().unwrap();
    let fresh = fresh.lease_token().unwrap();
    assert_ne!(stale, fresh);

    assert!(matches!(
        store
            .update(&id, &stale, OutcomeDelta::new("a".into(), delivered("1")), t(62))
            .await,
        Err(JobError::LeaseLost(_))
    ));
    assert!(matches!(
        store.release(&id, &stale, t(62)).await,
        Err(JobError::LeaseLost(_))
    ));

    store
        .update(&id, &fresh, OutcomeDelta::new("a".into(), delivered("1")), t(62))
        .await
        .unwrap();
    let settled = store.release(&id, &fresh, t(63)).await.unwrap();
    assert_eq!(settled.state, JobState::Delivered);
}

#[tokio::test]
async fn test_memory_store_contract() {
    lease_lifecycle(&InMemoryStore::new()).await;
    cancel_waits_for_release(&InMemoryStore::new()).await;
    purge_keeps_unfinished(&InMemoryStore::new()).await;
    owner_filter(&InMemoryStore::new()).await;
    relapsed_lease_rejects_old_token(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn test_file_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let open = |name: &str| FileStore::open(dir.path().join(name)).unwrap();

    lease_lifecycle(&open("lease.json")).await;
    cancel_waits_for_release(&open("cancel.json")).await;
    purge_keeps_unfinished(&open("purge.json")).await;
    owner_filter(&open("owner.json")).await;
    relapsed_lease_rejects_old_token(&open("relapse.json")).await;
}

/// Records sends and answers from a fixed script per destination.
#[derive(Default)]
struct ScriptedTransport {
    sent: Mutex<Vec<Destination>>,
    unavailable: Vec<Destination>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, destination: &Destination, _payload: &Payload) -> SendOutcome {
        self.sent.lock().unwrap().push(destination.clone());
        if self.unavailable.contains(destination) {
            SendOutcome::Unavailable("connection reset".to_string())
        } else {
            SendOutcome::Delivered(MessageHandle::from(destination.as_str()))
        }
    }

    async fn delete(&self, _destination: &Destination, _handle: &MessageHandle) -> DeleteOutcome {
        DeleteOutcome::Deleted
    }
}

#[tokio::test]
async fn test_unavailable_destination_backs_off() {
    let transport = Arc::new(ScriptedTransport {
        unavailable: vec!["down".into()],
        ..Default::default()
    });
    let clock = ManualClock::new(t(0));
    let engine = Engine::with_clock(
        Arc::new(InMemoryStore::new()),
        transport.clone(),
        Arc::new(clock.clone()),
        EngineConfig {
            retry_initial_backoff_ms: 1_000,
            ..EngineConfig::default()
        },
    )
    .unwrap();

    let id = engine
        .service()
        .publish_now(
            serde_json::json!({"text": "status update"}),
            ["up", "down"],
            PublishOptions::new().max_attempts(2),
        )
        .await
        .unwrap();

    engine.scheduler().run_pending().await.unwrap();
    let job = engine.service().get_status(&id).await.unwrap();
    assert_eq!(job.next_attempt_at(), Some(t(1)));

    clock.advance(Duration::from_secs(1));
    engine.scheduler().run_pending().await.unwrap();

    let job = engine.service().get_status(&id).await.unwrap();
    assert_eq!(job.state, JobState::PartiallyDelivered);
    assert!(job.partial_success);
    assert_eq!(job.failed_count(), 1);
    assert_eq!(transport.sent.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_schedule_rejects_invalid_requests() {
    let engine = Engine::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(ScriptedTransport::default()),
        EngineConfig::default(),
    )
    .unwrap();

    let no_destinations: Vec<&str> = Vec::new();
    assert!(matches!(
        engine
            .service()
            .publish_now(serde_json::json!({}), no_destinations, PublishOptions::new())
            .await,
        Err(JobError::InvalidJob(_))
    ));
    assert!(matches!(
        engine
            .service()
            .publish_now(
                serde_json::json!({}),
                ["a"],
                PublishOptions::new().max_attempts(99)
            )
            .await,
        Err(JobError::InvalidJob(_))
    ));
    assert!(matches!(
        engine
            .service()
            .publish_now(
                serde_json::json!({}),
                ["a"],
                PublishOptions::new().auto_delete_after(Duration::ZERO)
            )
            .await,
        Err(JobError::InvalidJob(_))
    ));
}
