//! Error taxonomy of a session.

use std::io;

use thiserror::Error;

use crate::fabric::{CmEventType, WcStatus, WrId};

/// Session error type.
///
/// Setup-phase errors (connection, registration, exchange) are fatal for the
/// session. Teardown-phase errors never surface here: they are logged and
/// collected in a [`TeardownReport`](crate::session::TeardownReport).
#[derive(Debug, Error)]
pub enum Error {
    /// A fabric resource could not be created or destroyed, or a connection
    /// event carried a non-zero status.
    #[error("transport error: {context}")]
    Transport {
        /// What was being done.
        context: String,
        /// The error reported by the fabric.
        #[source]
        source: io::Error,
    },

    /// An event or completion arrived out of the expected sequence or type.
    #[error("protocol violation: expected {expected}, got {actual}")]
    ProtocolViolation {
        /// What the protocol expected at this point.
        expected: String,
        /// What actually arrived.
        actual: String,
    },

    /// A work request completed with a non-success status.
    #[error("work request {wr_id} failed: {status}")]
    OperationFailed {
        /// Identifier of the failed work request.
        wr_id: WrId,
        /// Completion status.
        #[source]
        status: WcStatus,
    },

    /// Memory allocation or registration failed.
    #[error("cannot register {len} bytes of memory")]
    Registration {
        /// Requested region length.
        len: usize,
        /// The error reported by the fabric.
        #[source]
        source: io::Error,
    },

    /// The credential exchange did not yield the expected completions.
    #[error("metadata exchange failed: expected {expected} completions, got {got}")]
    MetadataExchangeFailed {
        /// Completions the exchange waits for.
        expected: usize,
        /// Successful completions actually collected.
        got: usize,
        /// The reactor failure that cut the wait short, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Invalid configuration or command-line input.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build a mapper from a fabric [`io::Error`] into [`Error::Transport`].
    pub(crate) fn transport(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Error::Transport { context, source }
    }

    /// A connection event arrived with a non-zero status.
    pub(crate) fn event_status(kind: CmEventType, status: i32) -> Self {
        Error::Transport {
            context: format!("{:?} event carried status {}", kind, status),
            source: io::Error::from_raw_os_error(status.saturating_abs()),
        }
    }

    pub(crate) fn violation(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Non-zero process exit code for this error.
    ///
    /// Transport errors propagate the OS error number, failed work requests
    /// propagate their completion status, everything else maps to `1`.
    pub fn exit_code(&self) -> u8 {
        let code = match self {
            Error::Transport { source, .. } => source.raw_os_error().unwrap_or(1),
            Error::OperationFailed { status, .. } => *status as i32,
            Error::MetadataExchangeFailed {
                source: Some(inner),
                ..
            } => return inner.exit_code(),
            _ => 1,
        };
        match u8::try_from(code) {
            Ok(0) | Err(_) => 1,
            Ok(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_never_zero() {
        let errors = [
            Error::Transport {
                context: "x".into(),
                source: io::Error::new(io::ErrorKind::Other, "no errno"),
            },
            Error::Transport {
                context: "x".into(),
                source: io::Error::from_raw_os_error(libc::ECONNREFUSED),
            },
            Error::OperationFailed {
                wr_id: 3,
                status: WcStatus::RemAccessErr,
            },
            Error::violation("ESTABLISHED", "REJECTED"),
            Error::MetadataExchangeFailed {
                expected: 2,
                got: 1,
                source: None,
            },
            Error::Config("bad".into()),
        ];
        for err in &errors {
            assert_ne!(err.exit_code(), 0, "{}", err);
        }
        assert_eq!(errors[1].exit_code(), libc::ECONNREFUSED as u8);
        assert_eq!(errors[2].exit_code(), WcStatus::RemAccessErr as u8);
    }

    #[test]
    fn event_status_is_transport_error() {
        let err = Error::event_status(CmEventType::ConnectRequest, -libc::ECONNRESET);
        match err {
            Error::Transport { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::ECONNRESET))
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
