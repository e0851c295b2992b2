//! Error types for the read-until client runtime.
//!
//! Per-message problems (`OutOfRange`, `OutOfOrderChunk`) are counted and
//! dropped by the stream coordinator; they only reach callers that use the
//! cache directly. `QueueFull` and `NotRunning` are returned synchronously to
//! whoever issued the action. Transport failures are retried by the
//! coordinator and only escalate to [`Error::FatalTransport`] once the
//! reconnect budget is spent.
//!
//! Actions that never receive a server response are not errors: they resolve
//! with [`ActionOutcome::Unacknowledged`] or [`ActionOutcome::Cancelled`].
//!
//! [`ActionOutcome::Unacknowledged`]: crate::ActionOutcome::Unacknowledged
//! [`ActionOutcome::Cancelled`]: crate::ActionOutcome::Cancelled

use crate::ChannelId;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors the client runtime can produce.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A chunk arrived for a channel outside the configured range.
    #[error("Channel {channel} is outside the configured range {first}..={last}")]
    OutOfRange {
        channel: ChannelId,
        first: ChannelId,
        last: ChannelId,
    },

    /// A chunk of the cached item arrived with a sequence number that does not
    /// advance past the one already stored.
    #[error("Out-of-order chunk on channel {channel}: sequence {received} after {last}")]
    OutOfOrderChunk {
        channel: ChannelId,
        last: u64,
        received: u64,
    },

    /// The action queue reached its configured bound of unsent requests.
    #[error("Action queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// An action was requested while the session is not running.
    #[error("Client is not running")]
    NotRunning,

    /// A recoverable transport failure. The coordinator reconnects.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// The server sent something the client cannot interpret.
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    /// The session cannot continue: the retry budget is exhausted or the
    /// failure is not recoverable.
    #[error("Fatal transport error after {attempts} attempt(s): {context}")]
    FatalTransport { context: String, attempts: u32 },

    /// The client was started while a previous session is still stopping.
    #[error("Client is still stopping")]
    Stopping,

    /// The client was started outside a tokio runtime.
    #[error("No tokio runtime available to drive the stream")]
    NoRuntime,

    /// The configuration failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Whether the coordinator may recover from this error by reconnecting.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
