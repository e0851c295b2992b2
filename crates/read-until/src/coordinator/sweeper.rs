use super::Shared;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Resolves actions that outlive the acknowledgment timeout, on a cadence that
/// does not depend on server traffic.
#[cfg_attr(feature = "tracing", tracing::instrument(name = "sweeper", skip_all))]
pub(crate) async fn run(shared: Arc<Shared>, token: CancellationToken) {
    let timeout = shared.config.action_timeout;
    let period = shared.config.sweep_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let _expired = shared.batcher.sweep_timeouts(Instant::now(), timeout);
                #[cfg(feature = "tracing")]
                if !_expired.is_empty() {
                    tracing::warn!(
                        "{} action(s) unacknowledged after {timeout:?}",
                        _expired.len()
                    );
                }
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Sweeper stopped");
}
