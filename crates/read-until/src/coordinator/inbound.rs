use super::{
    Shared,
    filter::{ChunkFilter, Verdict},
};
use crate::{Action, ActionKind, ActionTarget, Error, InboundMessage, InboundSource, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of an inbound loop.
pub(crate) struct InboundEnd {
    /// Whether at least one message arrived.
    pub(crate) received_any: bool,
    pub(crate) result: Result<()>,
}

/// Receives server messages until `session` is cancelled or the stream fails.
///
/// A failure cancels `session` so the outbound loop exits too.
#[cfg_attr(feature = "tracing", tracing::instrument(name = "inbound", skip_all))]
pub(crate) async fn run<S: InboundSource>(
    mut source: S,
    shared: Arc<Shared>,
    session: CancellationToken,
) -> InboundEnd {
    let mut processor = Processor::new(&shared);
    let mut received_any = false;

    let result = loop {
        let received = tokio::select! {
            biased;
            () = session.cancelled() => break Ok(()),
            received = source.receive() => received,
        };

        match received {
            Ok(Some(message)) => {
                received_any = true;
                processor.process(message);
            }
            Ok(None) => {
                break Err(Error::Transport {
                    context: "server closed the stream".to_string(),
                });
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(_e) = &result {
        #[cfg(feature = "tracing")]
        tracing::warn!("Inbound stream failed: {_e}");
        session.cancel();
    }

    InboundEnd {
        received_any,
        result,
    }
}

/// Applies server messages to the cache and batcher. Only O(1) operations
/// per chunk or acknowledgment; nothing here awaits.
struct Processor<'a> {
    shared: &'a Shared,
    filter: ChunkFilter,
    #[cfg(feature = "tracing")]
    summary: super::summary::IntervalSummary,
}

impl<'a> Processor<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            filter: ChunkFilter::new(
                shared.config.one_chunk,
                shared.config.prefilter_classes.clone(),
            ),
            #[cfg(feature = "tracing")]
            summary: super::summary::IntervalSummary::new(),
        }
    }

    fn process(&mut self, message: InboundMessage) {
        let shared = self.shared;
        let counters = &shared.counters;
        counters.record_progress(message.samples_since_start, message.seconds_since_start);

        for ack in message.acks {
            let _kind = shared.batcher.resolve(ack.correlation_id, ack.outcome);
            #[cfg(feature = "tracing")]
            if let Some(kind) = _kind {
                self.summary.record_response(kind, ack.outcome);
            }
        }

        counters.add_chunks(message.units.len() as u64);
        let mut filtered = 0;

        for (channel, mut unit) in message.units {
            // The map key is authoritative.
            unit.channel = channel;

            #[cfg(feature = "tracing")]
            self.summary.record_chunk(&unit, message.samples_since_start);

            let verdict = self.filter.inspect(&unit);
            if matches!(verdict, Verdict::CacheAndStop | Verdict::StopOnly) {
                let stop = Action {
                    channel,
                    target: ActionTarget::Number(unit.item_number),
                    kind: ActionKind::StopFurtherData,
                };
                if let Err(_e) = shared.batcher.enqueue(stop) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Could not stop item {} on channel {channel}: {_e}",
                        unit.item_id
                    );
                }
            }

            match verdict {
                Verdict::Cache | Verdict::CacheAndStop => {
                    // Rejected chunks are counted by the cache.
                    if let Err(_e) = shared.cache.put(unit) {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Dropped chunk: {_e}");
                    }
                }
                Verdict::StopOnly | Verdict::Discard => filtered += 1,
            }
        }

        if filtered > 0 {
            counters.add_filtered(filtered);
        }

        #[cfg(feature = "tracing")]
        self.summary.maybe_emit(&shared.cache);
    }
}
