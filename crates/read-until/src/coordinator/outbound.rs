use super::Shared;
use crate::{OutboundMessage, OutboundSink, Result, StreamSetup, StreamState};
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Sends action batches and setup changes until `session` is cancelled or a
/// send fails.
///
/// When the cancellation came from `stop`, the session enters
/// [`StreamState::Draining`] and, if configured, pending actions are flushed
/// one last time.
#[cfg_attr(feature = "tracing", tracing::instrument(name = "outbound", skip_all))]
pub(crate) async fn run<K: OutboundSink>(
    mut sink: K,
    shared: Arc<Shared>,
    mut setup: watch::Receiver<StreamSetup>,
    session: CancellationToken,
    stop: CancellationToken,
) -> Result<()> {
    let period = shared.config.dispatch_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        let step = tokio::select! {
            biased;
            () = session.cancelled() => break Ok(()),
            Ok(()) = setup.changed() => {
                let setup = setup.borrow_and_update().clone();
                #[cfg(feature = "tracing")]
                tracing::info!(
                    "Resending setup: channels {}-{}",
                    setup.first_channel,
                    setup.last_channel
                );
                sink.send(OutboundMessage::Setup(setup)).await
            }
            () = shared.batcher.ready() => dispatch(&mut sink, &shared).await,
            _ = ticker.tick() => dispatch(&mut sink, &shared).await,
        };

        if let Err(e) = step {
            break Err(e);
        }
    };

    if let Err(_e) = &result {
        #[cfg(feature = "tracing")]
        tracing::warn!("Outbound stream failed: {_e}");
        session.cancel();
        return result;
    }

    if stop.is_cancelled() {
        shared.set_state(StreamState::Draining);
        if shared.config.drain_on_stop {
            let _pending = shared.batcher.pending_len();
            match dispatch(&mut sink, &shared).await {
                Ok(()) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Flushed {_pending} pending action(s)");
                }
                Err(_e) => {
                    // The session is ending anyway; whatever is left resolves
                    // as cancelled.
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Final action flush failed: {_e}");
                }
            }
        }
    }

    result
}

/// Sends everything pending at the time of the call in batches of at most
/// `max_batch_size`.
///
/// Actions enqueued while sending wait for the next round. A failed send
/// leaves its batch outstanding; the sweeper resolves it once it times out.
async fn dispatch<K: OutboundSink>(sink: &mut K, shared: &Shared) -> Result<()> {
    let max = shared.config.max_batch_size;
    let rounds = shared.batcher.pending_len().div_ceil(max);

    for _ in 0..rounds {
        let batch = shared.batcher.take_batch(max, Instant::now());
        if batch.is_empty() {
            break;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("Sending {} action(s)", batch.len());

        sink.send(OutboundMessage::Actions(batch)).await?;
    }
    Ok(())
}
