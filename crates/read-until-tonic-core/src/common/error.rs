//! Error types for the gRPC adapter.
//!
//! Every adapter error converts into [`read_until::Error`], which decides
//! whether the stream coordinator reconnects:
//!
//! - `Status` - transient codes (`Unavailable`, `Internal`, ...) become
//!   retryable transport errors; codes that a retry cannot fix
//!   (`InvalidArgument`, `Unauthenticated`, ...) become protocol violations.
//! - `Connect` - the channel could not be established; retryable.
//! - `Protocol` - the server sent something this client cannot interpret;
//!   fatal.

use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the gRPC adapter.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The call failed with a gRPC status.
    #[error("gRPC status: {0}")]
    Status(#[from] Status),

    /// The channel could not be established.
    #[error("Connect error: {context}")]
    Connect { context: String },

    /// A response could not be mapped onto the domain model.
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },
}

impl From<Error> for read_until::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Status(status) => match status.code() {
                Code::InvalidArgument
                | Code::FailedPrecondition
                | Code::Unimplemented
                | Code::PermissionDenied
                | Code::Unauthenticated => Self::Protocol {
                    reason: format!("{:?}: {}", status.code(), status.message()),
                },
                _ => Self::Transport {
                    context: format!("{:?}: {}", status.code(), status.message()),
                },
            },
            Error::Connect { context } => Self::Transport { context },
            Error::Protocol { reason } => Self::Protocol { reason },
        }
    }
}
