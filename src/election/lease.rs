// Lease keeper - keeps exactly one live session for a participant

use super::{pause, Backend, ElectionState, LeadershipConfig};
use crate::error::Result;
use crate::session::SessionId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Creates the participant's session and renews it until shutdown,
/// recreating it whenever a renewal fails.
pub struct LeaseKeeper<B> {
    backend: Arc<B>,
    state: Arc<ElectionState>,
    config: Arc<LeadershipConfig>,
    shutdown: CancellationToken,

    /// Node sessions are bound to, once known
    node: Option<String>,
}

impl<B: Backend> LeaseKeeper<B> {
    pub fn new(
        backend: Arc<B>,
        state: Arc<ElectionState>,
        config: Arc<LeadershipConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let node = config.node.clone();
        Self {
            backend,
            state,
            config,
            shutdown,
            node,
        }
    }

    /// Runs until the participation is shut down. Errors are logged and
    /// retried; only invalid configuration ends the participation early.
    pub async fn maintain_lease(mut self) {
        loop {
            let session = match self.establish().await {
                Ok(session) => session,
                Err(e) if !e.is_retryable() => {
                    error!(error = %e, "cannot create session, abandoning election");
                    self.shutdown.cancel();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?self.config.timing.lease_retry, "session creation failed");
                    if !pause(&self.shutdown, self.config.timing.lease_retry).await {
                        break;
                    }
                    continue;
                }
            };

            info!(session = %session, "session established");
            self.state.set_session(Some(session.clone()));

            // a session that failed to renew may still be alive and holding the lock
            let lost = self.keep_alive(&session).await;
            self.release_session(&session).await;
            if !lost {
                break;
            }
        }
        debug!("lease keeper stopped");
    }

    async fn establish(&mut self) -> Result<SessionId> {
        let node = match &self.node {
            Some(node) => node.clone(),
            None => {
                let me = self.backend.self_info().await?;
                debug!(node = %me.name, "resolved local node");
                self.node = Some(me.name.clone());
                me.name
            }
        };
        let config = self.config.session_config(node);
        self.backend
            .create_session(self.config.datacenter.as_deref(), &config)
            .await
    }

    /// Renews `session` every ttl. Returns `false` on shutdown and `true`
    /// once the session is lost.
    async fn keep_alive(&self, session: &SessionId) -> bool {
        let mut ttl = self.config.ttl;
        loop {
            if !pause(&self.shutdown, ttl).await {
                return false;
            }
            match self
                .backend
                .renew_session(self.config.datacenter.as_deref(), session)
                .await
            {
                Ok(renewed) => {
                    if renewed > Duration::ZERO {
                        ttl = renewed;
                    }
                    debug!(session = %session, ttl = ?ttl, "session renewed");
                }
                Err(e) => {
                    warn!(session = %session, error = %e, "session renewal failed, recreating");
                    return true;
                }
            }
        }
    }

    /// Best effort; the session expires on its own otherwise.
    async fn release_session(&self, session: &SessionId) {
        self.state.set_session(None);
        match self
            .backend
            .destroy_session(self.config.datacenter.as_deref(), session)
            .await
        {
            Ok(()) => info!(session = %session, "session destroyed"),
            Err(e) => warn!(session = %session, error = %e, "failed to destroy session"),
        }
    }
}
