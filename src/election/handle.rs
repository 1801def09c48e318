// Leader session - the caller's view of one participation

use super::{Backend, ElectionState, LeadershipConfig, Phase};
use crate::error::{Error, Result};
use crate::session::SessionId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle returned by [`crate::participate`].
///
/// Dropping it ends the participation, the same as cancelling the token
/// passed in. Use [`LeaderSession::shutdown`] to also wait for the background
/// tasks and the session teardown.
pub struct LeaderSession<B: Backend> {
    backend: Arc<B>,
    state: Arc<ElectionState>,
    config: Arc<LeadershipConfig>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<B: Backend> LeaderSession<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        state: Arc<ElectionState>,
        config: Arc<LeadershipConfig>,
        shutdown: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            backend,
            state,
            config,
            shutdown,
            tasks,
        }
    }

    /// The leader key, without a leading `/`.
    pub fn key(&self) -> &str {
        &self.config.key
    }

    /// Session currently backing this participant, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.session()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Receiver of phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.state.subscribe()
    }

    /// Contact info published by the current leader.
    ///
    /// `Error::NotFound` if nobody ever wrote the key, `Error::NoLeader` if
    /// it exists but nobody holds it.
    pub async fn current(&self) -> Result<String> {
        let pair = self
            .backend
            .get_pair(self.config.datacenter.as_deref(), &self.config.key)
            .await?
            .ok_or_else(|| Error::NotFound {
                path: self.config.key.clone(),
            })?;

        if !pair.is_locked() || pair.value.is_empty() {
            return Err(Error::NoLeader {
                key: self.config.key.clone(),
            });
        }
        Ok(pair.value)
    }

    /// Gives leadership up.
    ///
    /// The leadership work is cancelled right away. Once the tenure has
    /// wound down, heartbeat included, the lock is released, clearing the
    /// published contact info. This participant keeps contending and may win
    /// again after a ttl if nobody else does.
    ///
    /// Waits for the leadership work to return, so it must not be awaited
    /// from inside that work.
    pub async fn abdicate(&self) -> Result<()> {
        let mut phases = self.state.subscribe();
        let was_leading = self.state.abdicate();
        if was_leading {
            // the coordinator leaves Abdicating only after joining the heartbeat
            let _ = phases.wait_for(|phase| *phase != Phase::Abdicating).await;
        }
        let Some(session) = self.state.session() else {
            return Ok(());
        };

        let released = self
            .backend
            .release(self.config.datacenter.as_deref(), &self.config.key, &session, "")
            .await?;
        info!(key = %self.config.key, session = %session, was_leading, released, "abdicated");
        Ok(())
    }

    /// Ends the participation and waits until the leadership work has
    /// returned and the session is destroyed.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "election task failed");
            }
        }
        info!(key = %self.config.key, "left leader election");
    }
}

impl<B: Backend> Drop for LeaderSession<B> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<B: Backend> std::fmt::Debug for LeaderSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderSession")
            .field("key", &self.config.key)
            .field("session", &self.state.session())
            .field("phase", &self.state.phase())
            .finish()
    }
}
