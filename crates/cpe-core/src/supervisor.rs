//! Restart-on-failure wrapper for background loops
//!
//! Every loop runs in its own task so a panic is caught at the join handle
//! instead of taking the daemon down. A loop that errors or panics degrades
//! the agent's health and is rebuilt from its factory after a delay. A loop
//! that returns `Ok` is done and is not restarted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::Result;
use crate::health::AgentHealth;

/// Delay before a failed loop is restarted
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// How a supervised loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Returned `Ok`
    Finished,
    /// Returned an error
    Failed,
    /// Panicked
    Panicked,
}

/// Run a loop built by `factory`, restarting it until it finishes or shutdown
///
/// Returns the number of restarts.
pub async fn supervise<F, Fut>(
    name: &'static str,
    health: Arc<AgentHealth>,
    mut shutdown: watch::Receiver<bool>,
    restart_delay: Duration,
    mut factory: F,
) -> usize
where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut restarts = 0;
    loop {
        if *shutdown.borrow() {
            return restarts;
        }

        let handle = tokio::spawn(factory(shutdown.clone()));
        let exit = match handle.await {
            Ok(Ok(())) => LoopExit::Finished,
            Ok(Err(e)) => {
                error!(task = name, error = %e, "background loop failed");
                LoopExit::Failed
            }
            Err(e) if e.is_panic() => {
                error!(task = name, "background loop panicked");
                LoopExit::Panicked
            }
            Err(e) => {
                warn!(task = name, error = %e, "background loop cancelled");
                return restarts;
            }
        };

        if exit == LoopExit::Finished {
            info!(task = name, "background loop finished");
            return restarts;
        }

        health.degrade();
        restarts += 1;

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {
                warn!(task = name, restarts, "restarting background loop");
            }
            _ = shutdown.changed() => return restarts,
        }
    }
}
