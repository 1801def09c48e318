// Leader election on top of Consul sessions and KV locks
//
// Each call to `participate` starts two background tasks:
// - the lease keeper, which keeps one live session for this candidate
// - the lock coordinator, which contends for the lock key with that session
//   and, while it holds the lock, runs the caller's leadership work
// Both only talk to each other through `ElectionState`.

pub mod coordinator;
pub mod handle;
pub mod lease;
pub mod runner;
pub mod state;

pub use handle::LeaderSession;
pub use state::{ElectionState, Phase};

use crate::error::{Error, Result};
use crate::session::{check_limits, SessionBehavior, SessionConfig};
use crate::util::trim_key;
use crate::{Agent, Kv, Sessions};
use coordinator::LockCoordinator;
use futures::future::{BoxFuture, FutureExt};
use lease::LeaseKeeper;
use runner::CallbackRunner;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub const DEFAULT_DESCRIPTION: &str = "default-leader-session";
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// Everything an election needs from the coordination service.
pub trait Backend: Kv + Sessions + Agent + 'static {}

impl<T: Kv + Sessions + Agent + 'static> Backend for T {}

/// Backoff settings of the maintenance loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    /// Wait before the very first acquisition attempt
    pub initial_gap: Duration,
    /// Wait after an acquisition attempt that failed with an error
    pub acquire_error_retry: Duration,
    /// Wait after a failed session creation
    pub lease_retry: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            initial_gap: Duration::from_millis(1),
            acquire_error_retry: Duration::from_secs(1),
            lease_retry: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeadershipConfig {
    /// KV path of the leader lock, typically `service/<name>/leader`
    pub key: String,

    /// Opaque identity published by the leader so followers know how to
    /// reach it, often a URI
    pub contact_info: String,

    /// Human-readable name of the underlying session. Falls back to
    /// [`DEFAULT_DESCRIPTION`] when empty.
    pub description: String,

    /// See [`SessionConfig::lock_delay`]
    pub lock_delay: Duration,

    /// See [`SessionConfig::ttl`]. Also the heartbeat interval and the wait
    /// between lost acquisition attempts.
    pub ttl: Duration,

    pub behavior: SessionBehavior,

    pub datacenter: Option<String>,

    /// Node to bind the session to. Resolved through the agent when unset.
    pub node: Option<String>,

    pub timing: ElectionTiming,
}

impl LeadershipConfig {
    pub fn new(key: impl Into<String>, contact_info: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            contact_info: contact_info.into(),
            description: String::new(),
            lock_delay: DEFAULT_LOCK_DELAY,
            ttl: DEFAULT_TTL,
            behavior: SessionBehavior::Delete,
            datacenter: None,
            node: None,
            timing: ElectionTiming::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_lock_delay(mut self, lock_delay: Duration) -> Self {
        self.lock_delay = lock_delay;
        self
    }

    pub fn with_behavior(mut self, behavior: SessionBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_datacenter(mut self, dc: impl Into<String>) -> Self {
        self.datacenter = Some(dc.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_timing(mut self, timing: ElectionTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Session name used for this election.
    pub fn name(&self) -> &str {
        if self.description.is_empty() {
            DEFAULT_DESCRIPTION
        } else {
            &self.description
        }
    }

    /// Local checks only; never contacts the service.
    pub fn validate(&self) -> Result<()> {
        if trim_key(&self.key).is_empty() {
            return Err(Error::Validation("leadership key required".into()));
        }
        if matches!(&self.node, Some(node) if node.is_empty()) {
            return Err(Error::Validation("session node required".into()));
        }
        check_limits(self.lock_delay, self.ttl)
    }

    pub(crate) fn session_config(&self, node: String) -> SessionConfig {
        SessionConfig {
            node,
            name: self.name().to_string(),
            lock_delay: self.lock_delay,
            ttl: self.ttl,
            behavior: self.behavior,
        }
    }
}

/// Work performed while holding leadership.
///
/// The token is cancelled as soon as leadership is lost (or the election is
/// shut down); the work must then stop anything that requires leadership and
/// return promptly. Returning before cancellation gives leadership up.
pub trait AsLeader: Send + Sync + 'static {
    fn lead(&self, tenure: CancellationToken) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> AsLeader for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn lead(&self, tenure: CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> {
        self(tenure).boxed()
    }
}

/// Starts contending for leadership of `config.key`.
///
/// Only local configuration problems are reported here. An unreachable
/// service does not fail the call; leadership is simply not attained until it
/// becomes reachable. Cancelling `shutdown` (or calling
/// [`LeaderSession::shutdown`], or dropping the handle) stops both background
/// tasks and the leadership work.
pub async fn participate<B, L>(
    backend: Arc<B>,
    mut config: LeadershipConfig,
    leader: L,
    shutdown: CancellationToken,
) -> Result<LeaderSession<B>>
where
    B: Backend,
    L: AsLeader,
{
    config.validate()?;
    config.key = trim_key(&config.key).to_string();

    if config.node.is_none() {
        match backend.self_info().await {
            Ok(me) => config.node = Some(me.name),
            Err(e) => warn!(error = %e, "could not identify local agent, will retry before creating a session"),
        }
    }

    let config = Arc::new(config);
    let state = Arc::new(ElectionState::new());
    let shutdown = shutdown.child_token();
    let span = info_span!("election", key = %config.key);

    let keeper = LeaseKeeper::new(backend.clone(), state.clone(), config.clone(), shutdown.clone());
    let coordinator = LockCoordinator::new(
        backend.clone(),
        state.clone(),
        config.clone(),
        CallbackRunner::new(leader),
        shutdown.clone(),
    );

    let tasks = vec![
        tokio::spawn(keeper.maintain_lease().instrument(span.clone())),
        tokio::spawn(coordinator.maintain_leadership().instrument(span)),
    ];

    info!(key = %config.key, contact = %config.contact_info, "participating in leader election");
    Ok(LeaderSession::new(backend, state, config, shutdown, tasks))
}

/// Sleeps for `duration` unless `token` fires first. Returns `false` if it did.
pub(crate) async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
