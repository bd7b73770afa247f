use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// boxed error raised by a user supplied marshaller or unmarshaller
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// All errors that can occur on the caller side.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error, e.g. failing to bind an endpoint.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),
    /// The call failed for good.
    ///
    /// Either the transport failed again after the one reconnect-and-retry round, or it failed
    /// in a way that retrying can't fix (the executor itself raised, the server is closed).
    #[error("rpc call {procedure:?} failed: {source}")]
    Rpc {
        /// the procedure that was called
        procedure: String,
        /// the last transport failure
        #[source]
        source: TransportError,
    },
    /// The executor reported a version this caller can't talk to.
    ///
    /// The caller stays unusable after this.
    #[error("unsupported executor version {version:?}, supported: {supported:?}")]
    UnsupportedExecutorVersion {
        /// version string returned by the executor
        version: String,
        /// versions this caller accepts
        supported: Vec<String>,
    },
    /// Version negotiation could not complete because the executor was unreachable.
    #[error("can't reach executor: {0}")]
    ExecutorConnection(#[source] TransportError),
    /// `call` before a successful `start`, or after `stop`
    #[error("caller is not started")]
    NotStarted,
    /// `start` called more than once
    #[error("caller is already started")]
    AlreadyStarted,
    /// Error raised by the marshaller, passed through untouched.
    #[error("{0}")]
    Marshal(#[source] BoxError),
    /// Error raised by the unmarshaller, passed through untouched.
    #[error("{0}")]
    Unmarshal(#[source] BoxError),
    /// The stream or call protocol was used incorrectly.
    #[error("protocol contract violated: {0}")]
    Contract(#[from] ContractViolation),
    /// `AsyncExecutor::get` found no waiting call
    #[error("no waiting calls")]
    NoWaitingCalls,
    /// The reply came after the parked call gave up waiting for it.
    #[error("call {index} expired before a reply was supplied")]
    CallExpired {
        /// correlation index of the expired call
        index: u64,
    },
    /// The executor answered a reserved procedure with something malformed.
    #[error("malformed reply: {0}")]
    Protocol(String),
}

impl Error {
    /// wrap a marshaller error
    pub fn marshal<E: Into<BoxError>>(e: E) -> Self {
        Error::Marshal(e.into())
    }

    /// wrap an unmarshaller error
    pub fn unmarshal<E: Into<BoxError>>(e: E) -> Self {
        Error::Unmarshal(e.into())
    }

    /// the transport error behind this error, if any
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Error::Rpc { source, .. } => Some(source),
            Error::ExecutorConnection(e) => Some(e),
            _ => None,
        }
    }
}

/// Misuse of the protocol by the code driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// `write` after `end_write` on a stream
    #[error("write after end_write")]
    WriteAfterEndWrite,
}

/// what went wrong inside a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// connectivity hiccup, reconnecting may fix it
    Transient,
    /// no reply within the call timeout, the peer may still be running the call
    Timeout,
    /// the remote side answered with a failure (executor error, rejected procedure)
    Remote,
    /// the channel or the server is shut down
    Closed,
    /// the peer sent something we can't decode
    Protocol,
}

/// Error reported by a `Channel` or `Connector`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    /// create a new transport error
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    /// connectivity failure that is worth a reconnect
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Transient, message)
    }

    /// the reply did not come in time
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// failure reported by the remote side
    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Remote, message)
    }

    /// the channel is closed
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    /// undecodable data on the wire
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    /// the error kind
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// whether a reconnect-and-retry may help
    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => TransportError::timeout(err.to_string()),
            _ => TransportError::transient(err.to_string()),
        }
    }
}

/// Failure raised by an executor while running a procedure.
///
/// It is sent back to the caller, where it shows up as an `Error::Rpc` whose transport error
/// kind is `Remote`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExecutorError(pub String);

impl ExecutorError {
    /// create an executor error from anything printable
    pub fn new(msg: impl Into<String>) -> Self {
        ExecutorError(msg.into())
    }
}

impl From<String> for ExecutorError {
    fn from(s: String) -> Self {
        ExecutorError(s)
    }
}

impl From<&str> for ExecutorError {
    fn from(s: &str) -> Self {
        ExecutorError(s.to_owned())
    }
}

impl From<TransportError> for ExecutorError {
    fn from(e: TransportError) -> Self {
        ExecutorError(format!("inbound stream broken: {}", e.message()))
    }
}

impl From<ExecutorError> for TransportError {
    fn from(e: ExecutorError) -> Self {
        TransportError::remote(e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let e: TransportError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(e.is_transient());
        assert_eq!(e.message(), "reset");
    }

    #[test]
    fn timeouts_are_not_transient() {
        let e: TransportError = io::Error::new(io::ErrorKind::TimedOut, "wait rsp timeout").into();
        assert_eq!(e.kind(), TransportErrorKind::Timeout);
        assert!(!e.is_transient());
    }

    #[test]
    fn executor_error_travels_as_remote() {
        let e: TransportError = ExecutorError::from("boom").into();
        assert_eq!(e.kind(), TransportErrorKind::Remote);
        assert!(!e.is_transient());
    }

    #[test]
    fn marshal_error_is_passed_through() {
        let inner = io::Error::new(io::ErrorKind::InvalidData, "bad value");
        let e = Error::marshal(inner);
        assert_eq!(e.to_string(), "bad value");
        match e {
            Error::Marshal(b) => assert!(b.downcast_ref::<io::Error>().is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
