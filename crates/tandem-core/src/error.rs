//! Error types for Tandem Core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Tandem Error
pub type Result<T> = std::result::Result<T, Error>;

/// How a caller is expected to recover from an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Transient; reissue the same request (same context) later
    Retry,
    /// Stores have diverged or are inconsistent; an operator must act
    ManualRecovery,
    /// The request is invalid or the connection is unusable
    Fatal,
}

/// Core error types for the replication core
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network failure talking to a remote machine
    #[error("Communication error during {operation} with machine {machine_id} ({context}): {source}")]
    Communication {
        /// Operation being performed
        operation: String,
        /// Target machine id (-1 when unknown)
        machine_id: i32,
        /// Context identifiers of the request
        context: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// The local store and the master disagree about an existing transaction
    #[error("Branched data: {0}")]
    BranchedData(String),

    /// No master could be resolved from the current membership
    #[error("Master not found: {0}")]
    MasterNotFound(String),

    /// The coordination service did not reach a synchronized state in time
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    /// The contacted machine is no longer master
    #[error("Not master: {0}")]
    NotMaster(String),

    /// The block framing protocol was violated
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A logical message exceeded the channel's frame length
    #[error("Frame too large: max {max} got {got}")]
    FrameTooLarge {
        /// Maximum accepted message length
        max: usize,
        /// Observed length
        got: usize,
    },

    /// Peer speaks another protocol version
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersionMismatch {
        /// Version this side speaks
        expected: u8,
        /// Version received
        got: u8,
    },

    /// The remote side refused the protocol version this side speaks
    #[error("Protocol version rejected by peer: {0}")]
    ProtocolVersionRejected(String),

    /// Replication attempted between different stores
    #[error("Store id mismatch: expected {expected}, got {actual}")]
    StoreIdMismatch {
        /// Local store id
        expected: String,
        /// Store id presented by the peer
        actual: String,
    },

    /// Transaction state errors (ordering, unknown transaction, ...)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Encoding or decoding of a payload failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by the remote side that has no local counterpart
    #[error("Remote error: {0}")]
    Remote(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a communication error wrapping an I/O failure
    pub fn communication(
        operation: impl Into<String>,
        machine_id: i32,
        context: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Communication {
            operation: operation.into(),
            machine_id,
            context: context.into(),
            source,
        }
    }

    /// Create a branched data error
    pub fn branched(msg: impl Into<String>) -> Self {
        Self::BranchedData(msg.into())
    }

    /// Create a malformed frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify the error for administrative tooling
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::BranchedData(_) | Error::StoreIdMismatch { .. } => Outcome::ManualRecovery,
            Error::Communication { .. }
            | Error::MasterNotFound(_)
            | Error::CoordinationUnavailable(_)
            | Error::NotMaster(_) => Outcome::Retry,
            Error::Io(e) => {
                if is_transient_io(e) {
                    Outcome::Retry
                } else {
                    Outcome::Fatal
                }
            }
            _ => Outcome::Fatal,
        }
    }

    /// True when reissuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        self.outcome() == Outcome::Retry
    }

    /// True when the master must be resolved again before reissuing
    pub fn requires_master_resolution(&self) -> bool {
        matches!(
            self,
            Error::NotMaster(_) | Error::Communication { .. } | Error::MasterNotFound(_)
        )
    }

    /// Wire representation used by the response codec
    pub fn to_remote(&self) -> RemoteError {
        let kind = match self {
            Error::BranchedData(_) => RemoteErrorKind::BranchedData,
            Error::NotMaster(_) => RemoteErrorKind::NotMaster,
            Error::StoreIdMismatch { .. } => RemoteErrorKind::StoreIdMismatch,
            Error::Transaction(_) => RemoteErrorKind::Transaction,
            Error::ProtocolVersionMismatch { .. } | Error::ProtocolVersionRejected(_) => {
                RemoteErrorKind::ProtocolVersion
            }
            Error::MalformedFrame(_) | Error::FrameTooLarge { .. } => RemoteErrorKind::Protocol,
            Error::MasterNotFound(_) | Error::CoordinationUnavailable(_) => {
                RemoteErrorKind::Unavailable
            }
            _ => RemoteErrorKind::Other,
        };
        RemoteError {
            kind,
            message: self.to_string(),
        }
    }
}

fn is_transient_io(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::WouldBlock
    )
}

/// Error kinds that survive a trip over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Branched data detected on the serving side
    BranchedData,
    /// Serving machine is no longer master
    NotMaster,
    /// Store ids differ
    StoreIdMismatch,
    /// Transaction state error
    Transaction,
    /// Protocol version mismatch
    ProtocolVersion,
    /// Framing violation
    Protocol,
    /// Serving side could not reach the coordination service
    Unavailable,
    /// Anything else
    Other,
}

/// Error payload carried by a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Classification
    pub kind: RemoteErrorKind,
    /// Human readable description from the remote side
    pub message: String,
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Self {
        let message = remote.message;
        match remote.kind {
            RemoteErrorKind::BranchedData => Error::BranchedData(message),
            RemoteErrorKind::NotMaster => Error::NotMaster(message),
            RemoteErrorKind::StoreIdMismatch => Error::StoreIdMismatch {
                expected: "local".to_string(),
                actual: message,
            },
            RemoteErrorKind::Transaction => Error::Transaction(message),
            RemoteErrorKind::Protocol => Error::MalformedFrame(message),
            RemoteErrorKind::ProtocolVersion => Error::ProtocolVersionRejected(message),
            RemoteErrorKind::Unavailable => Error::MasterNotFound(message),
            RemoteErrorKind::Other => Error::Remote(message),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_is_not_retryable() {
        let err = Error::branched("txId:5 doesn't match");
        assert_eq!(err.outcome(), Outcome::ManualRecovery);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_communication_is_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::communication("pull_updates", 2, "session 1", io);
        assert_eq!(err.outcome(), Outcome::Retry);
        assert!(err.requires_master_resolution());
        assert!(err.to_string().contains("machine 2"));
    }

    #[test]
    fn test_remote_round_trip_keeps_branch_kind() {
        let err = Error::branched("mismatch");
        let back: Error = err.to_remote().into();
        assert!(matches!(back, Error::BranchedData(_)));
    }

    #[test]
    fn test_version_mismatch_stays_distinct_from_corruption() {
        let err = Error::ProtocolVersionMismatch {
            expected: 1,
            got: 2,
        };
        let back: Error = err.to_remote().into();
        assert!(matches!(back, Error::ProtocolVersionRejected(_)), "{:?}", back);
        assert!(back.to_string().contains("expected 1, got 2"));
        assert_eq!(back.outcome(), Outcome::Fatal);

        let back: Error = Error::malformed("bad header").to_remote().into();
        assert!(matches!(back, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_unexpected_eof_is_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::Io(io).outcome(), Outcome::Fatal);
    }
}
