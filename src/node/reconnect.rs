use std::sync::Weak;
use std::time::{Duration, Instant};

use futures::channel::mpsc::UnboundedReceiver as Receiver;
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::client::Lavalink;

/// A message to send from the pool to the [`ReconnectScheduler`].
#[derive(Clone, Debug)]
pub(crate) enum ReconnectSchedulerMessage {
    /// Message to stop the scheduler loop.
    Shutdown,
}

/// Whether a node that made `attempts` reconnect attempts, the latest at `last_attempt`, may try
/// again at `now`.
///
/// The wait grows linearly: the first attempt is immediate, and after `n` attempts the next one
/// waits `n` backoff units.
pub(crate) fn should_attempt(
    attempts: u32,
    last_attempt: Option<Instant>,
    now: Instant,
    backoff: Duration,
) -> bool {
    let Some(last_attempt) = last_attempt else { return true };

    now.saturating_duration_since(last_attempt) >= backoff.saturating_mul(attempts)
}

/// The reconnect scheduler is a simple loop that periodically sweeps the pool's nodes and
/// re-opens the connections that are down.
pub(crate) struct ReconnectScheduler {
    /// The pool whose nodes are swept. The loop ends once it is gone.
    pub pool: Weak<Lavalink>,
    /// A receiver channel for the scheduler to be told to stop.
    pub rx: Receiver<ReconnectSchedulerMessage>,
    /// Time between sweeps.
    pub interval: Duration,
    /// The unit of the linear backoff.
    pub backoff: Duration,
}

impl ReconnectScheduler {
    /// Begins the scheduler loop.
    ///
    /// This waits on [`Self::rx`] for at most [`Self::interval`]; every time that read times out,
    /// all registered nodes are swept. A [`ReconnectSchedulerMessage::Shutdown`], or the pool
    /// going away, ends the loop.
    #[cfg_attr(feature = "tracing_instrument", tracing::instrument(skip(self)))]
    pub async fn run(&mut self) {
        loop {
            match timeout(self.interval, self.rx.next()).await {
                Ok(Some(ReconnectSchedulerMessage::Shutdown)) => {
                    debug!("[Reconnect Scheduler] Received to shutdown.");

                    break;
                },
                Ok(None) => break,
                Err(_) => {
                    if !self.sweep() {
                        break;
                    }
                },
            }
        }

        debug!("[Reconnect Scheduler] Stopped.");
    }

    /// Returns `false` if the pool is gone.
    fn sweep(&self) -> bool {
        let Some(pool) = self.pool.upgrade() else { return false };
        let now = Instant::now();

        for node in pool.nodes() {
            if !node.try_begin_reconnect(now, self.backoff) {
                continue;
            }

            info!(
                "[Reconnect Scheduler] Reconnecting node {} (attempt {})",
                node.name(),
                node.reconnect_attempts()
            );

            // One node failing must not keep the others down.
            if let Err(why) = node.connection().connect() {
                error!("[Reconnect Scheduler] Error reconnecting node {}: {:?}", node.name(), why);
            }
        }

        true
    }
}
