//! in-process transport
//!
//! Calls go straight into the server's `Exchange`, no bytes are framed. Used to embed an
//! executor in the controller process and throughout the tests.
//!
//! ```rust
//! use exec_rpc::{loopback, Caller, EchoExecutor, Server, ServerConfig};
//!
//! let (endpoint, connector) = loopback::pair();
//! let server = Server::new(ServerConfig::default());
//! server.listen(EchoExecutor::new(), endpoint, false).unwrap();
//!
//! let caller = Caller::new(connector);
//! caller.start().unwrap();
//! assert_eq!(caller.call("echo", b"hello").unwrap(), b"hello");
//! caller.stop();
//! server.wait();
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use may::sync::{mpsc, Mutex};

use crate::channel::{Channel, Connector, FrameIter, InboundFrames};
use crate::dispatch::{Exchange, StreamSink};
use crate::errors::TransportError;
use crate::procedure::ProcedureCall;
use crate::server::{Endpoint, Listener};
use crate::stream::FrameReader;

/// the bound server, if any, plus a flag that drops when it unbinds
type Slot = Arc<Mutex<Option<(Exchange, Arc<AtomicBool>)>>>;

/// create a connected endpoint/connector pair
pub fn pair() -> (LoopbackEndpoint, LoopbackConnector) {
    let slot: Slot = Arc::new(Mutex::new(None));
    (
        LoopbackEndpoint { slot: slot.clone() },
        LoopbackConnector { slot },
    )
}

/// server half of a loopback pair
pub struct LoopbackEndpoint {
    slot: Slot,
}

struct LoopbackListener {
    slot: Slot,
    bound: Arc<AtomicBool>,
}

impl Listener for LoopbackListener {}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.bound.store(false, Ordering::Release);
        self.slot.lock().unwrap().take();
        info!("loopback endpoint unbound");
    }
}

impl Endpoint for LoopbackEndpoint {
    fn bind(self, exchange: Exchange) -> std::io::Result<Box<dyn Listener>> {
        let bound = Arc::new(AtomicBool::new(true));
        *self.slot.lock().unwrap() = Some((exchange, bound.clone()));
        Ok(Box::new(LoopbackListener {
            slot: self.slot,
            bound,
        }))
    }
}

/// client half of a loopback pair, connects to whatever server is bound right now
#[derive(Clone)]
pub struct LoopbackConnector {
    slot: Slot,
}

impl Connector for LoopbackConnector {
    fn connect(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let slot = self.slot.lock().unwrap();
        let Some((exchange, bound)) = slot.as_ref() else {
            return Err(TransportError::transient("no server bound to the loopback endpoint"));
        };
        Ok(Arc::new(LoopbackChannel {
            exchange: exchange.clone(),
            bound: bound.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// one loopback connection
pub struct LoopbackChannel {
    exchange: Exchange,
    bound: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl LoopbackChannel {
    fn check(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("channel closed"));
        }
        if !self.bound.load(Ordering::Acquire) {
            return Err(TransportError::transient("connection lost"));
        }
        Ok(())
    }
}

impl Channel for LoopbackChannel {
    fn unary_call(
        &self,
        name: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        let (tx, rx) = mpsc::channel();
        self.exchange
            .unary(ProcedureCall::new(name, payload), move |ret| {
                // the caller may have timed out already
                tx.send(ret).ok();
            });

        match timeout {
            Some(t) => rx
                .recv_timeout(t)
                .map_err(|_| TransportError::timeout(format!("no reply within {t:?}")))?,
            None => rx
                .recv()
                .map_err(|_| TransportError::transient("call dropped by the server"))?,
        }
    }

    fn open_stream(&self, outbound: FrameIter) -> Result<InboundFrames, TransportError> {
        self.check()?;
        let (tx, rx) = mpsc::channel();
        let inbound = FrameReader::new(Box::new(outbound.map(Ok::<Vec<u8>, TransportError>)));
        self.exchange.streaming(inbound, Box::new(LoopbackSink { tx }));
        Ok(Box::new(LoopbackFrames {
            rx,
            closed: self.closed.clone(),
            done: false,
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct LoopbackSink {
    tx: mpsc::Sender<Result<Vec<u8>, TransportError>>,
}

impl StreamSink for LoopbackSink {
    fn send(&mut self, chunk: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(Ok(chunk))
            .map_err(|_| TransportError::closed("stream reader is gone"))
    }

    fn finish(self: Box<Self>, ret: Result<(), TransportError>) {
        if let Err(e) = ret {
            self.tx.send(Err(e)).ok();
        }
    }
}

struct LoopbackFrames {
    rx: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
    closed: Arc<AtomicBool>,
    done: bool,
}

impl Iterator for LoopbackFrames {
    type Item = Result<Vec<u8>, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.closed.load(Ordering::Acquire) {
            self.done = true;
            return Some(Err(TransportError::transient("channel closed")));
        }
        match self.rx.recv() {
            Ok(Ok(frame)) => Some(Ok(frame)),
            Ok(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}
