//! Outbound action queue with acknowledgment tracking.
//!
//! Actions move through three states:
//!
//! 1. **pending** - enqueued, not yet sent. FIFO across all channels.
//! 2. **outstanding** - taken into a batch and handed to the transport, waiting
//!    for the server's acknowledgment.
//! 3. **resolved** - an acknowledgment arrived, the timeout elapsed, or the
//!    session was cancelled. The outcome is delivered through the
//!    [`ActionTicket`] returned at enqueue time.
//!
//! Every action ends in exactly one terminal outcome. A single mutex guards all
//! state; action volume is far below chunk volume, and no other lock is ever
//! acquired while holding it.

use crate::{
    Action, ActionKind, ActionOutcome, ActionRequest, ActionTicket, CorrelationId, Error, Result,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::{
    sync::{Notify, oneshot},
    time::{Duration, Instant},
};


struct Queued {
    request: ActionRequest,
    notify: oneshot::Sender<ActionOutcome>,
}

struct Outstanding {
    dispatched_at: Instant,
    kind: ActionKind,
    notify: oneshot::Sender<ActionOutcome>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    pending: VecDeque<Queued>,
    outstanding: HashMap<CorrelationId, Outstanding>,
    sent: u64,
    acknowledged: u64,
    timed_out: u64,
    cancelled: u64,
    unknown_acks: u64,
}

/// Counters describing the batcher's lifetime activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub pending: usize,
    pub outstanding: usize,
    /// Actions handed to the transport.
    pub sent: u64,
    /// Actions resolved by a server acknowledgment.
    pub acknowledged: u64,
    /// Actions resolved as [`ActionOutcome::Unacknowledged`].
    pub timed_out: u64,
    /// Actions resolved as [`ActionOutcome::Cancelled`].
    pub cancelled: u64,
    /// Acknowledgments that matched no outstanding action.
    pub unknown_acks: u64,
}

/// Thread-safe FIFO of control actions awaiting dispatch.
pub struct ActionBatcher {
    state: Mutex<State>,
    max_pending: Option<usize>,
    threshold: usize,
    wake: Notify,
}

impl ActionBatcher {
    /// Creates a batcher.
    ///
    /// - `max_pending`: bound on unsent actions, `None` for unbounded.
    /// - `threshold`: pending count at which [`ready`](Self::ready) wakes the
    ///   dispatcher ahead of its cadence.
    pub fn new(max_pending: Option<usize>, threshold: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_pending,
            threshold: threshold.max(1),
            wake: Notify::new(),
        }
    }

    /// Queues an action and assigns it a correlation id.
    ///
    /// Never blocks on I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if `max_pending` is set and reached.
    pub fn enqueue(&self, action: Action) -> Result<ActionTicket> {
        let (tx, rx) = oneshot::channel();

        let (id, pending) = {
            let mut state = self.state.lock();
            match self.max_pending {
                Some(capacity) if state.pending.len() >= capacity => {
                    return Err(Error::QueueFull { capacity });
                }
                _ => {}
            }

            let id = CorrelationId::from_raw(state.next_id);
            state.next_id += 1;
            state.pending.push_back(Queued {
                request: ActionRequest {
                    correlation_id: id,
                    channel: action.channel,
                    target: action.target,
                    kind: action.kind,
                },
                notify: tx,
            });
            (id, state.pending.len())
        };

        if pending >= self.threshold {
            self.wake.notify_one();
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("Queued action {id} ({pending} pending)");

        Ok(ActionTicket::new(id, rx))
    }

    /// Takes up to `max_size` of the oldest pending actions and marks them
    /// outstanding as of `now`.
    ///
    /// Returns fewer than `max_size` (possibly none) when fewer are queued.
    pub fn take_batch(&self, max_size: usize, now: Instant) -> Vec<ActionRequest> {
        let mut state = self.state.lock();
        let count = max_size.min(state.pending.len());
        let mut batch = Vec::with_capacity(count);

        for queued in state.pending.drain(..count).collect::<Vec<_>>() {
            state.outstanding.insert(
                queued.request.correlation_id,
                Outstanding {
                    dispatched_at: now,
                    kind: queued.request.kind,
                    notify: queued.notify,
                },
            );
            batch.push(queued.request);
        }
        state.sent += batch.len() as u64;
        batch
    }

    /// Resolves an outstanding action and returns its kind.
    ///
    /// Returns `None` if `id` is not outstanding, e.g. it already timed out or
    /// was never sent. Such acknowledgments are counted and otherwise ignored.
    pub fn resolve(&self, id: CorrelationId, outcome: ActionOutcome) -> Option<ActionKind> {
        let resolved = {
            let mut state = self.state.lock();
            match state.outstanding.remove(&id) {
                Some(outstanding) => {
                    match outcome {
                        ActionOutcome::Unacknowledged => state.timed_out += 1,
                        ActionOutcome::Cancelled => state.cancelled += 1,
                        ActionOutcome::Success | ActionOutcome::AlreadyFinished => {
                            state.acknowledged += 1;
                        }
                    }
                    Some(outstanding)
                }
                None => {
                    state.unknown_acks += 1;
                    None
                }
            }
        };

        match resolved {
            Some(outstanding) => {
                // The caller may have dropped its ticket.
                let _ = outstanding.notify.send(outcome);
                Some(outstanding.kind)
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Acknowledgment for unknown action {id}");
                None
            }
        }
    }

    /// Resolves every outstanding action dispatched more than `timeout` before
    /// `now` as [`ActionOutcome::Unacknowledged`] and returns their ids.
    pub fn sweep_timeouts(&self, now: Instant, timeout: Duration) -> Vec<CorrelationId> {
        let expired = {
            let mut state = self.state.lock();
            let ids = state
                .outstanding
                .iter()
                .filter(|(_, o)| now.saturating_duration_since(o.dispatched_at) > timeout)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();

            let expired = ids
                .into_iter()
                .filter_map(|id| state.outstanding.remove(&id).map(|o| (id, o)))
                .collect::<Vec<_>>();
            state.timed_out += expired.len() as u64;
            expired
        };

        expired
            .into_iter()
            .map(|(id, outstanding)| {
                let _ = outstanding.notify.send(ActionOutcome::Unacknowledged);
                id
            })
            .collect()
    }

    /// Resolves everything still pending or outstanding as
    /// [`ActionOutcome::Cancelled`]. Returns how many actions were cancelled.
    pub fn cancel_all(&self) -> usize {
        let (pending, outstanding) = {
            let mut state = self.state.lock();
            let pending = state.pending.drain(..).collect::<Vec<_>>();
            let outstanding = state.outstanding.drain().collect::<Vec<_>>();
            state.cancelled += (pending.len() + outstanding.len()) as u64;
            (pending, outstanding)
        };

        let count = pending.len() + outstanding.len();
        for queued in pending {
            let _ = queued.notify.send(ActionOutcome::Cancelled);
        }
        for (_, o) in outstanding {
            let _ = o.notify.send(ActionOutcome::Cancelled);
        }
        count
    }

    /// Waits until the pending count reaches the threshold.
    ///
    /// Completes immediately if the threshold was reached since the last call.
    pub async fn ready(&self) {
        self.wake.notified().await;
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn outstanding_len(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn stats(&self) -> BatcherStats {
        let state = self.state.lock();
        BatcherStats {
            pending: state.pending.len(),
            outstanding: state.outstanding.len(),
            sent: state.sent,
            acknowledged: state.acknowledged,
            timed_out: state.timed_out,
            cancelled: state.cancelled,
            unknown_acks: state.unknown_acks,
        }
    }
}

impl Default for ActionBatcher {
    fn default() -> Self {
        Self::new(None, usize::MAX)
    }
}
