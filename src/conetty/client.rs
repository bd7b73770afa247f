use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use may::net::TcpStream;
use may::sync::Mutex;
use may::{coroutine, go};
use may_waiter::TokenWaiter;

use super::frame::{self, Frame, FrameType};
use super::queued_writer::QueuedWriter;
use super::{FrameSender, RoutedFrames};
use crate::channel::{Channel, Connector, FrameIter, InboundFrames};
use crate::errors::TransportError;
use crate::procedure::ProcedureCall;

type Reply = Result<Vec<u8>, TransportError>;

/// state shared by the channel, its listener and its stream pumps
struct Conn {
    sock: QueuedWriter<TcpStream>,
    // waiter tokens of unary calls still waiting for a reply
    pending: Mutex<HashSet<usize>>,
    streams: Mutex<HashMap<u64, FrameSender>>,
    next_stream: AtomicU64,
    alive: AtomicBool,
}

impl Conn {
    fn check(&self) -> Result<(), TransportError> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::transient("connection lost"))
        }
    }

    fn route(&self, frame: Frame) {
        match frame.ty {
            FrameType::Response | FrameType::ResponseError => {
                let id = frame.id as usize;
                // the waiter is alive as long as its token is pending
                let mut pending = self.pending.lock().unwrap();
                if pending.remove(&id) {
                    let id = unsafe { may_waiter::ID::from_usize(id) };
                    TokenWaiter::set_rsp(id, frame.decode_rsp());
                } else {
                    warn!("drop rsp for a call that gave up: id={}", frame.id);
                }
            }
            FrameType::StreamData => {
                let streams = self.streams.lock().unwrap();
                match streams.get(&frame.id) {
                    Some(tx) => {
                        // the reader may be gone already
                        tx.send(Ok(frame.payload().to_vec())).ok();
                    }
                    None => warn!("drop frame of unknown stream: id={}", frame.id),
                }
            }
            FrameType::StreamEnd => {
                self.streams.lock().unwrap().remove(&frame.id);
            }
            FrameType::StreamError => {
                if let Some(tx) = self.streams.lock().unwrap().remove(&frame.id) {
                    tx.send(Err(TransportError::remote(frame.message()))).ok();
                }
            }
            FrameType::Request => error!("unexpected request frame: id={}", frame.id),
        }
    }

    /// fail everything still waiting on this connection
    fn lost(&self) {
        self.alive.store(false, Ordering::Release);
        let mut pending = self.pending.lock().unwrap();
        for id in pending.drain() {
            let id = unsafe { may_waiter::ID::from_usize(id) };
            TokenWaiter::<Reply>::set_rsp(id, Err(TransportError::transient("connection lost")));
        }
        for (_, tx) in self.streams.lock().unwrap().drain() {
            tx.send(Err(TransportError::transient("connection lost"))).ok();
        }
    }
}

/// One multiplexed TCP connection to a server.
///
/// Any number of unary calls and streams may be in flight at once.
pub struct TcpChannel {
    conn: Arc<Conn>,
    // the raw socket, used to shut the connection down
    raw: TcpStream,
    // the listening coroutine
    listener: Mutex<Option<coroutine::JoinHandle<()>>>,
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("alive", &self.conn.alive.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.raw.shutdown(Shutdown::Both).ok();
        if let Some(h) = self.listener.lock().ok().and_then(|mut l| l.take()) {
            unsafe { h.coroutine().cancel() };
            h.join().ok();
        }
    }
}

impl TcpChannel {
    /// run the protocol over a connected stream
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        // here we must clone the socket for read
        // we can't share it between coroutines
        let mut r_stream = BufReader::new(stream.try_clone()?);
        let raw = stream.try_clone()?;
        let conn = Arc::new(Conn {
            sock: QueuedWriter::new(stream),
            pending: Mutex::new(HashSet::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        });

        let listener_conn = conn.clone();
        let listener = go!(
            coroutine::Builder::new().name("TcpChannelListener".to_owned()),
            move || {
                let conn = listener_conn;
                let mut buf = BytesMut::with_capacity(1024 * 32);
                loop {
                    let frame = match Frame::decode_from(&mut r_stream, &mut buf) {
                        Ok(r) => r,
                        Err(ref e) => {
                            if e.kind() == io::ErrorKind::UnexpectedEof {
                                info!("tcp channel decode rsp: connection closed");
                            } else {
                                error!("tcp channel decode rsp: err = {:?}", e);
                            }
                            break;
                        }
                    };
                    info!("receive frame, id={} ty={:?}", frame.id, frame.ty);
                    conn.route(frame);
                }
                conn.lost();
            }
        )?;

        Ok(TcpChannel {
            conn,
            raw,
            listener: Mutex::new(Some(listener)),
        })
    }
}

impl Channel for TcpChannel {
    fn unary_call(
        &self,
        name: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        self.conn.check()?;
        let waiter = TokenWaiter::<Reply>::new();
        let id = waiter.id().unwrap();
        info!("request id = {:?}", id);

        // send the request
        let id: usize = id.into();
        let req = frame::encode_req(id as u64, &ProcedureCall::new(name, payload))
            .map_err(|e| TransportError::protocol(e.to_string()))?;

        self.conn.pending.lock().unwrap().insert(id);
        // the listener may have failed the pending set just before the insert
        let sent = self
            .conn
            .check()
            .and_then(|_| self.conn.sock.write(req).map_err(TransportError::from));
        if let Err(e) = sent {
            self.conn.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        // wait for the rsp
        let ret = waiter.wait_rsp(timeout);
        self.conn.pending.lock().unwrap().remove(&id);
        match ret {
            Ok(rsp) => rsp,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                Err(TransportError::timeout(format!("no reply: {e}")))
            }
            Err(e) => Err(TransportError::transient(format!("no reply: {e}"))),
        }
    }

    fn open_stream(&self, outbound: FrameIter) -> Result<InboundFrames, TransportError> {
        self.conn.check()?;
        let sid = self.conn.next_stream.fetch_add(1, Ordering::AcqRel);
        let (tx, inbound) = RoutedFrames::new();
        self.conn.streams.lock().unwrap().insert(sid, tx);

        let conn = self.conn.clone();
        go!(
            coroutine::Builder::new().name(format!("TcpStreamPump-{sid}")),
            move || {
                for data in outbound {
                    let sent = frame::encode(sid, FrameType::StreamData, &data)
                        .and_then(|f| conn.sock.write(f));
                    if let Err(e) = sent {
                        error!("stream write failed: id={sid} err={e}");
                        return;
                    }
                }
                let end = frame::encode(sid, FrameType::StreamEnd, &[]);
                if let Err(e) = end.and_then(|f| conn.sock.write(f)) {
                    error!("stream end failed: id={sid} err={e}");
                }
            }
        )
        .map_err(TransportError::from)?;

        info!("stream opened: id={sid}");
        Ok(Box::new(inbound))
    }

    fn close(&self) {
        self.conn.alive.store(false, Ordering::Release);
        // the listener sees the shutdown and fails whatever is still waiting
        self.raw.shutdown(Shutdown::Both).ok();
    }
}

/// Opens a fresh `TcpChannel` to one server address on every `connect`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    /// resolve the server address, the first resolved address is used
    pub fn new<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        })?;
        Ok(TcpConnector { addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let stream = TcpStream::connect(self.addr)?;
        stream.set_nodelay(true)?;
        info!("connected to {}", self.addr);
        Ok(Arc::new(TcpChannel::new(stream)?))
    }
}
