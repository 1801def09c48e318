// Election state - shared between the background tasks and the handle

use crate::session::SessionId;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Where a participant stands in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No session established yet
    Candidate,
    /// Holding a session and contending for the lock
    Acquiring,
    /// Holding the lock; leadership work is running
    Leading,
    /// Leadership given up voluntarily, waiting for the work to wind down
    Abdicating,
    /// Participation ended; terminal
    Stopped,
}

/// State of one participation.
///
/// The lease keeper is the only writer of the session id. The lock
/// coordinator drives the phase, except that an abdication may move it from
/// `Leading` to `Abdicating`. Every phase change is published to watchers.
#[derive(Debug)]
pub struct ElectionState {
    /// Session currently backing this participant
    session: Mutex<Option<SessionId>>,

    /// Cancellation scope of the current tenure, while leading
    tenure: Mutex<Option<CancellationToken>>,

    phase: watch::Sender<Phase>,
}

impl Default for ElectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectionState {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            tenure: Mutex::new(None),
            phase: watch::Sender::new(Phase::Candidate),
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.phase() == Phase::Leading
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_session(&self, session: Option<SessionId>) {
        *self.session.lock() = session;
    }

    /// Moves to `Acquiring` (or back to `Candidate` without a session).
    /// Leaves `Leading`, `Abdicating` and `Stopped` alone.
    pub(crate) fn contend(&self, has_session: bool) {
        let next = if has_session { Phase::Acquiring } else { Phase::Candidate };
        self.transition(|phase| match phase {
            Phase::Candidate | Phase::Acquiring => Some(next),
            _ => None,
        });
    }

    /// Enters `Leading` under `tenure`. Returns `false` once stopped.
    pub(crate) fn begin_tenure(&self, tenure: CancellationToken) -> bool {
        let mut slot = self.tenure.lock();
        let started = self.transition(|phase| match phase {
            Phase::Stopped => None,
            _ => Some(Phase::Leading),
        });
        if started {
            *slot = Some(tenure);
        }
        started
    }

    /// Lock lost: leave `Leading` and cancel the tenure.
    pub(crate) fn step_down(&self) {
        let tenure = self.tenure.lock().clone();
        self.transition(|phase| match phase {
            Phase::Leading => Some(Phase::Acquiring),
            _ => None,
        });
        if let Some(tenure) = tenure {
            tenure.cancel();
        }
    }

    /// Clears the tenure once its work and heartbeat are done.
    pub(crate) fn end_tenure(&self) {
        let mut slot = self.tenure.lock();
        if let Some(tenure) = slot.take() {
            tenure.cancel();
        }
        self.transition(|phase| match phase {
            Phase::Leading | Phase::Abdicating => Some(Phase::Acquiring),
            _ => None,
        });
    }

    /// Voluntary step down. Cancels the tenure if there is one and reports
    /// whether this participant was leading.
    pub(crate) fn abdicate(&self) -> bool {
        let tenure = self.tenure.lock().clone();
        let was_leading = self.transition(|phase| match phase {
            Phase::Leading => Some(Phase::Abdicating),
            _ => None,
        });
        if let Some(tenure) = tenure {
            tenure.cancel();
        }
        was_leading
    }

    pub(crate) fn stop(&self) {
        if let Some(tenure) = self.tenure.lock().take() {
            tenure.cancel();
        }
        self.phase.send_replace(Phase::Stopped);
    }

    fn transition(&self, next: impl FnOnce(Phase) -> Option<Phase>) -> bool {
        self.phase.send_if_modified(|phase| match next(*phase) {
            Some(next) if next != *phase => {
                *phase = next;
                true
            }
            _ => false,
        })
    }
}
