//! The consumer-facing session handle.
//!
//! A [`Client`] owns the cache, the action batcher and the background tasks
//! that connect them to a [`Transport`]. Analysis code polls
//! [`Client::get_units`] for the freshest chunk per channel and answers with
//! [`Client::request_action`]; everything else happens on the tokio runtime
//! the client was started on.
//!
//! ```no_run
//! # async fn demo<T: read_until::Transport>(transport: T) -> read_until::Result<()> {
//! use read_until::{Client, ClientConfig};
//! use std::time::Duration;
//!
//! let client = Client::new(ClientConfig::default(), transport)?;
//! client.start()?;
//!
//! for (channel, unit) in client.get_units() {
//!     if unit.stats.median_before - unit.stats.median > 60.0 {
//!         client.unblock(channel, unit.item_number, Duration::from_millis(100))?;
//!     }
//! }
//!
//! client.stop(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

use crate::{
    ActionKind, ActionTarget, ActionTicket, ChannelId, ClientConfig, Error, MetricsSnapshot,
    PopOrder, Result, StreamSetup, StreamState, Transport, WorkUnit,
    coordinator::{self, Shared, sweeper},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

/// How [`Client::stop`] ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The background tasks finished within the timeout.
    Clean,
    /// The timeout elapsed and the background tasks were aborted.
    Forced,
    /// There was no session to stop.
    NotRunning,
}

struct Session {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(Session),
    /// A `stop` call owns the session and is waiting for it to end.
    Stopping,
}

/// Finishes a stop: aborts whatever is left of the session, cancels the
/// remaining actions and closes the stream. Runs on drop so a `stop` future
/// dropped midway still leaves the client stopped and restartable.
struct StopGuard<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    shared: &'a Shared,
    task: JoinHandle<()>,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.task.abort();
        let _cancelled = self.shared.batcher.cancel_all();
        self.shared.set_state(StreamState::Closed);
        *self.lifecycle.lock() = Lifecycle::Idle;

        #[cfg(feature = "tracing")]
        tracing::debug!("{_cancelled} action(s) cancelled on stop");
    }
}

/// A read-until session over transport `T`.
pub struct Client<T: Transport> {
    shared: Arc<Shared>,
    transport: Arc<T>,
    lifecycle: Mutex<Lifecycle>,
}

impl<T: Transport> Client<T> {
    /// Builds a client. Nothing is connected until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    pub fn new(config: ClientConfig, transport: T) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared::new(config)?),
            transport: Arc::new(transport),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Launches the stream coordinator and the timeout sweeper on the current
    /// tokio runtime.
    ///
    /// Calling `start` on a running client does nothing. Starting again after
    /// a stop or a fatal error begins a fresh session with an empty cache.
    ///
    /// # Errors
    ///
    /// - [`Error::NoRuntime`] when called outside a tokio runtime.
    /// - [`Error::Stopping`] while a [`stop`](Self::stop) is still in
    ///   progress.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match &*lifecycle {
            Lifecycle::Running(session) if !session.task.is_finished() => return Ok(()),
            Lifecycle::Stopping => return Err(Error::Stopping),
            Lifecycle::Running(_) | Lifecycle::Idle => {}
        }

        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        self.shared.begin();

        let stop = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.transport);
        let token = stop.clone();

        let fut = async move {
            let sweeper_token = token.child_token();
            let sweeper = tokio::spawn(sweeper::run(Arc::clone(&shared), sweeper_token.clone()));
            coordinator::run(transport, shared, token).await;
            sweeper_token.cancel();
            let _ = sweeper.await;
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(tracing::info_span!("read_until"))
        };

        let task = runtime.spawn(fut);
        *lifecycle = Lifecycle::Running(Session { stop, task });

        #[cfg(feature = "tracing")]
        tracing::info!("Read-until client started");

        Ok(())
    }

    /// Stops the session.
    ///
    /// Pending actions are flushed if `drain_on_stop` is set. If the
    /// background tasks have not finished after `timeout` they are aborted.
    /// Either way the client is no longer running afterwards and every
    /// unresolved action resolves as [`ActionOutcome::Cancelled`].
    ///
    /// Only one caller stops a given session; a concurrent `stop` returns
    /// [`StopOutcome::NotRunning`] straight away, and [`start`](Self::start)
    /// is refused until the stop completes.
    ///
    /// [`ActionOutcome::Cancelled`]: crate::ActionOutcome::Cancelled
    pub async fn stop(&self, timeout: Duration) -> StopOutcome {
        let session = {
            let mut lifecycle = self.lifecycle.lock();
            match core::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(session) => session,
                other => {
                    *lifecycle = other;
                    return StopOutcome::NotRunning;
                }
            }
        };

        #[cfg(feature = "tracing")]
        tracing::info!("Stopping read-until client");

        self.shared.set_running(false);
        session.stop.cancel();

        let mut guard = StopGuard {
            lifecycle: &self.lifecycle,
            shared: &self.shared,
            task: session.task,
        };

        let outcome = match tokio::time::timeout(timeout, &mut guard.task).await {
            Ok(_) => StopOutcome::Clean,
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Stop timed out after {timeout:?}; aborting");
                guard.task.abort();
                // Wait for the abort to land so the session's loops are gone
                // before the stream is reported closed.
                let _ = (&mut guard.task).await;
                StopOutcome::Forced
            }
        };
        drop(guard);

        #[cfg(feature = "tracing")]
        tracing::info!("Read-until client stopped ({outcome:?})");

        outcome
    }

    /// Takes every cached unit, leaving the cache empty.
    pub fn get_units(&self) -> Vec<(ChannelId, WorkUnit)> {
        self.shared.cache.pop_all()
    }

    /// Takes at most `max` cached units in `order` of their last update and
    /// leaves the rest cached.
    pub fn get_units_batch(&self, max: usize, order: PopOrder) -> Vec<(ChannelId, WorkUnit)> {
        self.shared.cache.pop_batch(max, order)
    }

    /// Queues an action for the next outbound batch.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRunning`] if the session is not running.
    /// - [`Error::QueueFull`] if `max_pending` is set and reached.
    pub fn request_action(
        &self,
        channel: ChannelId,
        target: impl Into<ActionTarget>,
        kind: ActionKind,
    ) -> Result<ActionTicket> {
        if !self.shared.is_running() {
            return Err(Error::NotRunning);
        }
        self.shared.batcher.enqueue(crate::Action {
            channel,
            target: target.into(),
            kind,
        })
    }

    /// Ejects an item by reversing its channel for `duration`.
    pub fn unblock(
        &self,
        channel: ChannelId,
        target: impl Into<ActionTarget>,
        duration: Duration,
    ) -> Result<ActionTicket> {
        self.request_action(channel, target, ActionKind::Unblock { duration })
    }

    /// Asks the server to send no more data for an item.
    pub fn stop_receiving(
        &self,
        channel: ChannelId,
        target: impl Into<ActionTarget>,
    ) -> Result<ActionTicket> {
        self.request_action(channel, target, ActionKind::StopFurtherData)
    }

    /// Replaces the stream setup. A running session sends it to the server
    /// straight away, otherwise it is used on the next connect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `setup` is invalid or asks for
    /// channels the cache was not sized for.
    pub fn reconfigure(&self, setup: StreamSetup) -> Result<()> {
        setup.validate()?;
        let (first, last) = self.shared.cache.channels();
        if setup.first_channel < first || setup.last_channel > last {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "channels {}-{} exceed the cached range {first}-{last}",
                    setup.first_channel, setup.last_channel
                ),
            });
        }
        self.shared.setup.send_replace(setup);
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.subscribe_state()
    }

    /// The error that closed the session, if any.
    pub fn fatal_error(&self) -> Option<Error> {
        self.shared.fatal_error()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let cache = &self.shared.cache;
        self.shared
            .counters
            .snapshot(cache.stats(), cache.len(), self.shared.batcher.stats())
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        if let Lifecycle::Running(session) = self.lifecycle.get_mut() {
            session.stop.cancel();
        }
    }
}
