//! the transport contract consumed by the rpc layer
//!
//! A `Channel` is one live connection to an executor. It offers a unary primitive and a
//! bidirectional stream primitive. A `Connector` knows how to make a fresh `Channel`, which is
//! what the caller uses to tear down and recreate a channel that went stale.
use std::sync::Arc;
use std::time::Duration;

use crate::errors::TransportError;

/// Outbound frames of a stream.
///
/// The transport pulls frames from it until it returns `None`, which means the writer side is
/// done. Pulling may block.
pub type FrameIter = Box<dyn Iterator<Item = Vec<u8>> + Send>;

/// Inbound frames of a stream, in the order the peer wrote them.
///
/// The iterator ends when the peer finished writing; an `Err` item means the stream broke.
pub type InboundFrames = Box<dyn Iterator<Item = Result<Vec<u8>, TransportError>> + Send>;

/// one connection to an executor
pub trait Channel: Send + Sync {
    /// send one call and block for its reply
    ///
    /// connectivity failures must be reported as transient errors so that the caller can
    /// reconnect and retry
    fn unary_call(
        &self,
        name: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError>;

    /// open a bidirectional stream
    ///
    /// the transport drains `outbound` on its own, the first frames of it are the stream header
    fn open_stream(&self, outbound: FrameIter) -> Result<InboundFrames, TransportError>;

    /// release the local resources of the channel
    fn close(&self) {}
}

/// creates channels to one executor
pub trait Connector: Send + Sync {
    /// make a new channel
    fn connect(&self) -> Result<Arc<dyn Channel>, TransportError>;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn unary_call(
        &self,
        name: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).unary_call(name, payload, timeout)
    }

    fn open_stream(&self, outbound: FrameIter) -> Result<InboundFrames, TransportError> {
        (**self).open_stream(outbound)
    }

    fn close(&self) {
        (**self).close()
    }
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn connect(&self) -> Result<Arc<dyn Channel>, TransportError> {
        (**self).connect()
    }
}
