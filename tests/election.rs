use consul_election::test_utils::FakeConsul;
use consul_election::{
    participate, AsLeader, Error, Kv, LeaderSession, LeadershipConfig, Phase, SessionBehavior,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const KEY: &str = "svc/leader";

fn config(contact: &str) -> LeadershipConfig {
    LeadershipConfig::new(KEY, contact)
        .with_ttl(Duration::from_secs(10))
        .with_lock_delay(Duration::ZERO)
        .with_node("dev-desktop1")
}

/// Leads until cancelled, counting tenures.
fn counting_leader(tenures: Arc<AtomicUsize>) -> impl AsLeader {
    move |tenure: CancellationToken| {
        let tenures = tenures.clone();
        async move {
            tenures.fetch_add(1, Ordering::SeqCst);
            tenure.cancelled().await;
            anyhow::Ok(())
        }
    }
}

async fn join(
    backend: &Arc<FakeConsul>,
    config: LeadershipConfig,
) -> (LeaderSession<FakeConsul>, Arc<AtomicUsize>) {
    let tenures = Arc::new(AtomicUsize::new(0));
    let session = participate(
        backend.clone(),
        config,
        counting_leader(tenures.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    (session, tenures)
}

#[tokio::test(start_paused = true)]
async fn test_single_leader_publishes_contact_info() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let (a, a_tenures) = join(&backend, config("node-A")).await;
    sleep(Duration::from_millis(10)).await;

    assert!(a.is_leader());
    assert_eq!(a.current().await.unwrap(), "node-A");
    assert_eq!(a_tenures.load(Ordering::SeqCst), 1);

    let (b, b_tenures) = join(&backend, config("node-B")).await;
    sleep(Duration::from_millis(10)).await;

    assert!(!b.is_leader());
    assert_eq!(b.phase(), Phase::Acquiring);
    assert_eq!(b.current().await.unwrap(), "node-A");
    assert_eq!(b_tenures.load(Ordering::SeqCst), 0);

    // heartbeats keep A in charge well past the session ttl
    sleep(Duration::from_secs(60)).await;
    assert!(a.is_leader());
    assert!(!b.is_leader());
    assert_eq!(backend.holder(KEY), a.session_id());
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_leader() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let mut candidates = Vec::new();
    for i in 0..5 {
        let (session, _) = join(&backend, config(&format!("node-{i}"))).await;
        candidates.push(session);
    }

    for step in 0..240 {
        sleep(Duration::from_millis(500)).await;

        let leaders: Vec<&LeaderSession<FakeConsul>> =
            candidates.iter().filter(|c| c.is_leader()).collect();
        assert!(leaders.len() <= 1, "{} leaders at step {step}", leaders.len());

        if step % 40 == 39 {
            if let Some(leader) = leaders.first() {
                leader.abdicate().await.unwrap();
            }
        }
    }

    sleep(Duration::from_secs(11)).await;
    let leaders = candidates.iter().filter(|c| c.is_leader()).count();
    assert_eq!(leaders, 1);
}

#[tokio::test(start_paused = true)]
async fn test_abdicate_hands_over() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let (a, a_tenures) = join(&backend, config("node-A")).await;
    sleep(Duration::from_millis(10)).await;
    let (b, _) = join(&backend, config("node-B")).await;
    sleep(Duration::from_millis(10)).await;
    assert!(a.is_leader());

    a.abdicate().await.unwrap();
    assert!(!a.is_leader());
    assert!(matches!(a.current().await, Err(Error::NoLeader { .. })));

    // B's next attempt comes before A contends again
    sleep(Duration::from_secs(11)).await;
    assert!(b.is_leader());
    assert!(!a.is_leader());
    assert_eq!(a.current().await.unwrap(), "node-B");
    assert_eq!(a_tenures.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abdicate_waits_for_in_flight_heartbeat() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let (a, _) = join(&backend, config("node-A")).await;
    sleep(Duration::from_millis(10)).await;
    assert!(a.is_leader());

    // the heartbeat at 10s stays in flight until 11s
    backend.set_acquire_latency(Duration::from_secs(1));
    sleep(Duration::from_millis(10_490)).await;

    a.abdicate().await.unwrap();
    assert!(!a.is_leader());
    assert_eq!(backend.holder(KEY), None);
    assert!(matches!(a.current().await, Err(Error::NoLeader { .. })));

    sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.holder(KEY), None);
    assert!(matches!(a.current().await, Err(Error::NoLeader { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_returning_work_waits_for_in_flight_heartbeat() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let finish = Arc::new(Notify::new());
    let work_finish = finish.clone();
    let a = participate(
        backend.clone(),
        config("node-A"),
        move |tenure: CancellationToken| {
            let finish = work_finish.clone();
            async move {
                tokio::select! {
                    _ = tenure.cancelled() => {}
                    _ = finish.notified() => {}
                }
                anyhow::Ok(())
            }
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(a.is_leader());

    backend.set_acquire_latency(Duration::from_secs(1));
    sleep(Duration::from_millis(10_490)).await;

    finish.notify_one();
    sleep(Duration::from_millis(10)).await;
    // no longer leading as soon as the work returns, heartbeat still in flight
    assert!(!a.is_leader());
    assert_eq!(backend.holder(KEY), a.session_id());

    sleep(Duration::from_secs(2)).await;
    assert!(!a.is_leader());
    assert_eq!(backend.holder(KEY), None);
    assert!(matches!(a.current().await, Err(Error::NoLeader { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_abdicate_without_leadership_is_noop() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let (a, _) = join(&backend, config("node-A")).await;
    sleep(Duration::from_millis(10)).await;
    let (b, _) = join(&backend, config("node-B")).await;
    sleep(Duration::from_millis(10)).await;

    b.abdicate().await.unwrap();
    assert!(a.is_leader());
    assert_eq!(b.current().await.unwrap(), "node-A");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_failure_steps_down() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let cancelled_at = Arc::new(parking_lot::Mutex::new(None));
    let seen = cancelled_at.clone();
    let a = participate(
        backend.clone(),
        config("node-A"),
        move |tenure: CancellationToken| {
            let seen = seen.clone();
            async move {
                tenure.cancelled().await;
                seen.lock().get_or_insert(Instant::now());
                anyhow::Ok(())
            }
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    sleep(Duration::from_millis(10)).await;
    assert!(a.is_leader());
    let failures_from = Instant::now();
    backend.fail_next_acquires(1);

    sleep(Duration::from_secs(10)).await;
    assert!(!a.is_leader());
    let cancelled_at = cancelled_at.lock().expect("leadership work should be cancelled");
    assert!(cancelled_at - failures_from <= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_delete_behavior_clears_key_on_expiry() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let (a, _) = join(&backend, config("node-A").with_behavior(SessionBehavior::Delete)).await;
    sleep(Duration::from_millis(10)).await;
    assert!(a.is_leader());

    backend.expire_session(&a.session_id().unwrap());
    assert!(backend.get_pair(None, KEY).await.unwrap().is_none());
    assert!(matches!(a.current().await, Err(Error::NotFound { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_release_behavior_keeps_value_on_expiry() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let (a, _) = join(&backend, config("node-A").with_behavior(SessionBehavior::Release)).await;
    sleep(Duration::from_millis(10)).await;
    let (b, _) = join(&backend, config("node-B")).await;
    sleep(Duration::from_millis(10)).await;
    assert!(a.is_leader());

    let old = a.session_id().unwrap();
    backend.expire_session(&old);
    assert_eq!(backend.get(None, KEY).await.unwrap(), "node-A");
    assert!(matches!(b.current().await, Err(Error::NoLeader { .. })));

    // A notices at its next heartbeat; B picks the lock up
    sleep(Duration::from_secs(11)).await;
    assert!(!a.is_leader());
    assert_ne!(a.session_id(), Some(old));
    assert!(b.is_leader());
    assert_eq!(b.current().await.unwrap(), "node-B");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected_without_requests() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let result = participate(
        backend.clone(),
        config("node-A").with_ttl(Duration::from_secs(5)),
        counting_leader(Arc::new(AtomicUsize::new(0))),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let result = participate(
        backend.clone(),
        LeadershipConfig::new("", "node-A"),
        counting_leader(Arc::new(AtomicUsize::new(0))),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let (a, _) = join(&backend, config("node-A")).await;
    sleep(Duration::from_millis(10)).await;
    let session = a.session_id().unwrap();
    let phases = a.subscribe();

    a.shutdown().await;

    assert_eq!(*phases.borrow(), Phase::Stopped);
    assert!(!backend.session_exists(&session));
    assert_eq!(backend.holder(KEY), None);

    let requests = backend.request_count();
    sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.request_count(), requests);
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_caller_token_stops_participation() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));

    let token = CancellationToken::new();
    let a = participate(
        backend.clone(),
        config("node-A"),
        counting_leader(Arc::new(AtomicUsize::new(0))),
        token.clone(),
    )
    .await
    .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(a.is_leader());

    token.cancel();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(a.phase(), Phase::Stopped);
    assert_eq!(a.session_id(), None);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_service_does_not_fail_participation() {
    let backend = Arc::new(FakeConsul::new("dev-desktop1"));
    backend.set_unreachable(true);

    // no node override, so the agent lookup fails too
    let config = LeadershipConfig::new(KEY, "node-A")
        .with_ttl(Duration::from_secs(10))
        .with_lock_delay(Duration::ZERO);
    let (a, _) = join(&backend, config).await;

    sleep(Duration::from_secs(5)).await;
    assert!(!a.is_leader());
    assert_eq!(a.phase(), Phase::Candidate);
    assert_eq!(a.session_id(), None);

    backend.set_unreachable(false);
    sleep(Duration::from_secs(5)).await;
    assert!(a.is_leader());
    assert_eq!(a.current().await.unwrap(), "node-A");
}
