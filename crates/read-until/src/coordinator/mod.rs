//! Stream lifecycle: connect, stream, reconnect, drain, close.
//!
//! [`run`] is the supervisor task spawned by the client. Each connected
//! session is split into two tasks:
//!
//! - [`inbound`] - receives server messages, feeds the cache and resolves
//!   acknowledged actions.
//! - [`outbound`] - sends the setup message, then dispatches action batches on
//!   a fixed cadence or as soon as enough actions are queued.
//!
//! Either task failing cancels the session's token so its sibling exits too.
//! The supervisor then retries with exponential backoff, or gives up and
//! records a fatal error. A third task, the [`sweeper`], times out
//! unacknowledged actions regardless of whether anything is being received.

mod filter;
pub(crate) mod inbound;
pub(crate) mod outbound;
#[cfg(feature = "tracing")]
mod summary;
pub(crate) mod sweeper;

use crate::{
    ActionBatcher, ChannelCache, ClientConfig, Error, InboundSource, OutboundMessage,
    OutboundSink, StreamSetup, StreamState, Transport, session::SessionCounters,
};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{
    sync::watch,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;

/// Session state shared between the client facade and its tasks.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) cache: ChannelCache,
    pub(crate) batcher: ActionBatcher,
    pub(crate) counters: SessionCounters,
    pub(crate) setup: watch::Sender<StreamSetup>,
    state: watch::Sender<StreamState>,
    fatal: Mutex<Option<Error>>,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig) -> crate::Result<Self> {
        config.validate()?;
        let cache = ChannelCache::for_setup(&config.setup, config.cache_mode)?;
        let batcher = ActionBatcher::new(config.max_pending, config.batch_threshold);
        let (setup, _) = watch::channel(config.setup.clone());
        let (state, _) = watch::channel(StreamState::Idle);

        Ok(Self {
            config,
            cache,
            batcher,
            counters: SessionCounters::default(),
            setup,
            state,
            fatal: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Moves to `state`. A closed stream only leaves `Closed` for `Idle`,
    /// when a new session begins.
    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.send_if_modified(|current| {
            if *current == state || (current.is_terminal() && state != StreamState::Idle) {
                return false;
            }
            #[cfg(feature = "tracing")]
            tracing::debug!("Stream state {current:?} -> {state:?}");
            *current = state;
            true
        });
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn fatal_error(&self) -> Option<Error> {
        self.fatal.lock().clone()
    }

    /// Prepares for a fresh session: stale data and errors from a previous
    /// one are discarded.
    pub(crate) fn begin(&self) {
        self.cache.clear();
        *self.fatal.lock() = None;
        self.set_state(StreamState::Idle);
        self.set_running(true);
    }

    /// Ends the session for good. Nothing will ever acknowledge the remaining
    /// actions, so they are cancelled.
    fn fail(&self, error: Error) {
        #[cfg(feature = "tracing")]
        tracing::error!("Session closed: {error}");
        *self.fatal.lock() = Some(error);
        self.set_running(false);
        let _cancelled = self.batcher.cancel_all();
        self.set_state(StreamState::Closed);
    }
}

/// What a session loop returned.
enum LoopEnd {
    Inbound(inbound::InboundEnd),
    Outbound(crate::Result<()>),
}

/// How one connected session ended.
enum SessionEnd {
    /// A stop was requested and the session drained.
    Stopped,
    Failed {
        error: Error,
        /// Whether the server delivered anything before failing. A session
        /// that made progress resets the retry budget.
        progressed: bool,
    },
}

/// Supervises the stream until stopped or until a failure is fatal.
#[cfg_attr(feature = "tracing", tracing::instrument(name = "coordinator", skip_all))]
pub(crate) async fn run<T: Transport>(
    transport: Arc<T>,
    shared: Arc<Shared>,
    stop: CancellationToken,
) {
    let policy = shared.config.reconnect.clone();
    let mut failures = 0_u32;

    loop {
        shared.set_state(StreamState::Connecting);

        let connected = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            connected = transport.connect() => connected,
        };

        let error = match connected {
            Ok((sink, source)) => match stream(sink, source, &shared, &stop).await {
                SessionEnd::Stopped => break,
                SessionEnd::Failed { error, progressed } => {
                    if progressed {
                        failures = 0;
                    }
                    error
                }
            },
            Err(error) => error,
        };

        if stop.is_cancelled() {
            break;
        }

        let attempts = failures + 1;
        if !error.is_retryable() || !policy.enabled || failures >= policy.max_retries {
            shared.fail(Error::FatalTransport {
                context: error.to_string(),
                attempts,
            });
            return;
        }

        failures = attempts;
        shared.counters.add_reconnect();
        let delay = policy.backoff(failures);

        #[cfg(feature = "tracing")]
        tracing::warn!(
            "Stream failed ({error}); reconnect {failures}/{} in {delay:?}",
            policy.max_retries
        );

        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(StreamState::Closed);

    #[cfg(feature = "tracing")]
    tracing::info!("Stream closed");
}

/// Drives one connected session until it fails or a stop is requested.
async fn stream<K, S>(
    mut sink: K,
    source: S,
    shared: &Arc<Shared>,
    stop: &CancellationToken,
) -> SessionEnd
where
    K: OutboundSink,
    S: InboundSource,
{
    shared.set_state(StreamState::Streaming);

    // The server expects the setup before it sends any data.
    let mut setup = shared.setup.subscribe();
    let initial = setup.borrow_and_update().clone();

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Sending setup: channels {}-{}, {:?}, min chunk {}",
        initial.first_channel,
        initial.last_channel,
        initial.raw_data_type,
        initial.min_chunk_size
    );

    if let Err(error) = sink.send(OutboundMessage::Setup(initial)).await {
        return SessionEnd::Failed {
            error,
            progressed: false,
        };
    }

    // Dropping the set aborts both loops, so an aborted supervisor takes its
    // session down with it.
    let session = stop.child_token();
    let mut tasks = JoinSet::new();
    tasks.spawn({
        let (shared, session) = (Arc::clone(shared), session.clone());
        async move { LoopEnd::Inbound(inbound::run(source, shared, session).await) }
    });
    tasks.spawn({
        let (shared, session, stop) = (Arc::clone(shared), session.clone(), stop.clone());
        async move { LoopEnd::Outbound(outbound::run(sink, shared, setup, session, stop).await) }
    });

    let mut progressed = false;
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let end = match joined {
            Ok(LoopEnd::Inbound(end)) => {
                progressed = end.received_any;
                end.result
            }
            Ok(LoopEnd::Outbound(end)) => end,
            Err(e) => {
                session.cancel();
                Err(task_failure(&e))
            }
        };
        // The first loop to fail holds the cause; its sibling only saw the
        // cancellation.
        if result.is_ok() {
            result = end;
        }
    }

    match result {
        Ok(()) if stop.is_cancelled() => SessionEnd::Stopped,
        // Both loops only exit cleanly on cancellation, and the session token
        // is only cancelled by a failing loop or by `stop`.
        Ok(()) => SessionEnd::Failed {
            error: Error::Transport {
                context: "session ended unexpectedly".to_string(),
            },
            progressed,
        },
        Err(error) => SessionEnd::Failed { error, progressed },
    }
}

fn task_failure(error: &JoinError) -> Error {
    Error::Transport {
        context: format!("session task failed: {error}"),
    }
}
