// Callback runner - executes the caller's leadership work once per tenure

use super::AsLeader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

pub struct CallbackRunner<L> {
    leader: L,
}

impl<L: AsLeader> CallbackRunner<L> {
    pub fn new(leader: L) -> Self {
        Self { leader }
    }

    /// Runs the work to completion. It is never aborted; losing leadership
    /// only cancels `tenure`. The outcome is logged and otherwise dropped,
    /// including a panic, which must not take the coordinator down with it.
    pub async fn run(&self, tenure: CancellationToken) {
        let work = self.leader.lead(tenure);
        match tokio::spawn(work.in_current_span()).await {
            Ok(Ok(())) => info!("leadership work finished"),
            Ok(Err(e)) => warn!("leadership work failed: {e:#}"),
            Err(e) if e.is_panic() => error!("leadership work panicked"),
            Err(e) => error!(error = %e, "leadership work did not complete"),
        }
    }
}
