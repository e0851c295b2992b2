//! The seam between the client runtime and the wire.
//!
//! A [`Transport`] opens one bidirectional session at a time and splits it into
//! an [`OutboundSink`] driven by the outbound loop and an [`InboundSource`]
//! driven by the inbound loop. Implementations own serialization,
//! authentication and connection setup; the runtime only sees the messages
//! below.

use crate::{ActionAck, ActionRequest, ChannelId, Result, StreamSetup, WorkUnit};
use core::future::Future;

/// A message the client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Setup(StreamSetup),
    Actions(Vec<ActionRequest>),
}

/// A message the server sends to the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    /// Acquisition clock, never decreasing within a session.
    pub samples_since_start: u64,
    pub seconds_since_start: f64,
    /// New data, only for channels that have some.
    pub units: Vec<(ChannelId, WorkUnit)>,
    pub acks: Vec<ActionAck>,
}

/// Opens sessions with the server.
pub trait Transport: Send + Sync + 'static {
    type Sink: OutboundSink;
    type Source: InboundSource;

    /// Establishes a new stream.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`](crate::Error::Transport) for failures worth
    /// retrying; anything else ends the session.
    fn connect(&self) -> impl Future<Output = Result<(Self::Sink, Self::Source)>> + Send;
}

/// Sending half of a session.
pub trait OutboundSink: Send + 'static {
    fn send(&mut self, message: OutboundMessage) -> impl Future<Output = Result<()>> + Send;
}

/// Receiving half of a session.
pub trait InboundSource: Send + 'static {
    /// Waits for the next message. `Ok(None)` means the server closed the
    /// stream.
    fn receive(&mut self) -> impl Future<Output = Result<Option<InboundMessage>>> + Send;
}
