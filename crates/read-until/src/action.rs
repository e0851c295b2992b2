use crate::ChannelId;
use core::{fmt, time::Duration};
use tokio::sync::oneshot;

/// Session-unique identifier linking an action to its acknowledgment.
///
/// Rendered as a decimal string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl core::str::FromStr for CorrelationId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Identifies the item an action applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionTarget {
    Id(String),
    Number(u32),
}

impl From<u32> for ActionTarget {
    fn from(number: u32) -> Self {
        Self::Number(number)
    }
}

impl From<String> for ActionTarget {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for ActionTarget {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

/// What the server should do with the targeted item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionKind {
    /// Eject the item by reversing the channel for `duration`.
    Unblock { duration: Duration },
    /// Keep acquiring the item but send no more of its data.
    StopFurtherData,
}

impl ActionKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unblock { .. } => "unblock",
            Self::StopFurtherData => "stop_further_data",
        }
    }
}

/// An action as issued by analysis code, before the batcher assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub channel: ChannelId,
    pub target: ActionTarget,
    pub kind: ActionKind,
}

/// A queued or dispatched action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub correlation_id: CorrelationId,
    pub channel: ChannelId,
    pub target: ActionTarget,
    pub kind: ActionKind,
}

/// Terminal state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionOutcome {
    /// The server applied the action.
    Success,
    /// The targeted item had already ended when the action arrived.
    AlreadyFinished,
    /// No acknowledgment arrived within the configured timeout.
    Unacknowledged,
    /// The session shut down before the action was acknowledged.
    Cancelled,
}

/// A server acknowledgment for a previously sent action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionAck {
    pub correlation_id: CorrelationId,
    pub outcome: ActionOutcome,
}

/// Handle returned to the caller of an action.
///
/// Dropping the ticket is fine: the action is still sent and tracked, the
/// outcome is simply discarded.
#[derive(Debug)]
pub struct ActionTicket {
    id: CorrelationId,
    rx: oneshot::Receiver<ActionOutcome>,
    seen: Option<ActionOutcome>,
}

impl ActionTicket {
    pub(crate) const fn new(id: CorrelationId, rx: oneshot::Receiver<ActionOutcome>) -> Self {
        Self { id, rx, seen: None }
    }

    pub const fn id(&self) -> CorrelationId {
        self.id
    }

    /// Waits for the action to reach a terminal outcome.
    pub async fn outcome(self) -> ActionOutcome {
        match self.seen {
            Some(outcome) => outcome,
            None => self.rx.await.unwrap_or(ActionOutcome::Cancelled),
        }
    }

    /// Returns the outcome if it is already known.
    pub fn try_outcome(&mut self) -> Option<ActionOutcome> {
        if self.seen.is_none() {
            self.seen = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(ActionOutcome::Cancelled),
            };
        }
        self.seen
    }
}
