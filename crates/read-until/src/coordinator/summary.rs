use crate::{ActionKind, ActionOutcome, ChannelCache, WorkUnit};
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

const INTERVAL: Duration = Duration::from_secs(1);

/// Rolling one-second window of inbound activity, logged at `info`.
pub(super) struct IntervalSummary {
    since: Instant,
    chunks: u64,
    samples_behind: u64,
    raw_bytes: usize,
    responses: BTreeMap<(&'static str, &'static str), u64>,
}

impl IntervalSummary {
    pub(super) fn new() -> Self {
        Self {
            since: Instant::now(),
            chunks: 0,
            samples_behind: 0,
            raw_bytes: 0,
            responses: BTreeMap::new(),
        }
    }

    pub(super) fn record_chunk(&mut self, unit: &WorkUnit, acquired: u64) {
        self.chunks += 1;
        self.samples_behind += acquired.saturating_sub(unit.chunk_start_sample);
        self.raw_bytes += unit.payload.len();
    }

    pub(super) fn record_response(&mut self, kind: ActionKind, outcome: ActionOutcome) {
        let outcome = match outcome {
            ActionOutcome::Success => "success",
            ActionOutcome::AlreadyFinished => "already_finished",
            ActionOutcome::Unacknowledged => "unacknowledged",
            ActionOutcome::Cancelled => "cancelled",
        };
        *self.responses.entry((kind.name(), outcome)).or_default() += 1;
    }

    /// Logs and resets the window once it is at least a second old.
    pub(super) fn maybe_emit(&mut self, cache: &ChannelCache) {
        if self.since.elapsed() < INTERVAL {
            return;
        }

        let stats = cache.stats();
        let behind = self.samples_behind.checked_div(self.chunks).unwrap_or(0);
        tracing::info!(
            "Interval update: {} chunks, average {behind} samples behind, {:.2} MB raw data, \
             {} items cached, {} items missed, {} chunks replaced",
            self.chunks,
            self.raw_bytes as f64 / 1024.0 / 1024.0,
            cache.len(),
            stats.missed,
            stats.replaced,
        );
        if !self.responses.is_empty() {
            tracing::info!("Response summary: {:?}", self.responses);
        }

        *self = Self::new();
    }
}
