use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;

use super::frame::{self, Frame, FrameType};
use super::queued_writer::QueuedWriter;
use super::{FrameSender, RoutedFrames};
use crate::dispatch::{Exchange, StreamSink};
use crate::errors::TransportError;
use crate::server::{Endpoint, Listener};
use crate::stream::FrameReader;

use bytes::BytesMut;
use co_managed::Manager;
use may::net::{TcpListener, TcpStream};
use may::{coroutine, go};

macro_rules! t {
    ($e: expr) => {
        match $e {
            Ok(val) => val,
            Err(err) => {
                error!("call = {:?}\nerr = {:?}", stringify!($e), err);
                continue;
            }
        }
    };
}

/// Listen for TCP callers on a socket address.
#[derive(Debug, Clone, Copy)]
pub struct TcpEndpoint(pub SocketAddr);

/// a bare port listens on every interface
impl Endpoint for u16 {
    fn bind(self, exchange: Exchange) -> io::Result<Box<dyn Listener>> {
        TcpEndpoint((Ipv4Addr::UNSPECIFIED, self).into()).bind(exchange)
    }
}

impl Endpoint for TcpEndpoint {
    fn bind(self, exchange: Exchange) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(self.0)?;
        let local_addr = listener.local_addr()?;
        let instance = go!(
            coroutine::Builder::new().name("TcpServer".to_owned()),
            move || {
                let manager = Manager::new();
                for stream in listener.incoming() {
                    let stream = t!(stream);
                    t!(stream.set_nodelay(true));
                    let exchange = exchange.clone();
                    manager.add(move || {
                        if let Err(e) = serve(stream, exchange) {
                            error!("tcp server connection failed: err = {:?}", e);
                        }
                    });
                }
            }
        )?;
        Ok(Box::new(TcpListening {
            local_addr,
            instance: Some(instance),
        }))
    }
}

/// the accept loop of a bound `TcpEndpoint`
struct TcpListening {
    local_addr: SocketAddr,
    instance: Option<coroutine::JoinHandle<()>>,
}

impl Listener for TcpListening {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

impl Drop for TcpListening {
    fn drop(&mut self) {
        // cancelling the accept loop drops its manager, which cancels every connection
        if let Some(s) = self.instance.take() {
            unsafe { s.coroutine().cancel() };
            s.join().ok();
        }
        info!("tcp endpoint closed: addr={}", self.local_addr);
    }
}

/// shut the socket down when the connection coroutine ends, even by cancel
struct CloseOnDrop(TcpStream);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.shutdown(Shutdown::Both).ok();
    }
}

/// serve one connection until the peer goes away
fn serve(stream: TcpStream, exchange: Exchange) -> io::Result<()> {
    let _close = CloseOnDrop(stream.try_clone()?);
    // the read half of the stream
    let mut rs = BufReader::new(stream.try_clone()?);
    // the write half of the stream
    let ws = Arc::new(QueuedWriter::new(stream));
    let mut buf = BytesMut::with_capacity(1024 * 32);
    let mut streams: HashMap<u64, FrameSender> = HashMap::new();

    loop {
        let req = match Frame::decode_from(&mut rs, &mut buf) {
            Ok(r) => r,
            Err(ref e) => {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    info!("tcp server decode req: connection closed");
                } else {
                    error!("tcp server decode req: err = {:?}", e);
                }
                break;
            }
        };

        let id = req.id;
        match req.ty {
            FrameType::Request => {
                info!("get request: id={:?}", id);
                let w_stream = ws.clone();
                let reply = move |ret: Result<Vec<u8>, TransportError>| {
                    let data = match ret {
                        Ok(rsp) => frame::encode(id, FrameType::Response, &rsp),
                        Err(e) => {
                            frame::encode(id, FrameType::ResponseError, e.message().as_bytes())
                        }
                    };
                    info!("send rsp: id={id}");
                    // send the result back to client
                    if let Err(e) = data.and_then(|d| w_stream.write(d)) {
                        error!("tcp write to client failed: id={id} err={e}");
                    }
                };
                match req.decode_req() {
                    Ok(call) => exchange.unary(call, reply),
                    Err(e) => reply(Err(e)),
                }
            }
            FrameType::StreamData => match streams.get(&id) {
                Some(tx) => {
                    // the executor may have stopped reading
                    tx.send(Ok(req.payload().to_vec())).ok();
                }
                None => {
                    info!("get stream: id={:?}", id);
                    let (tx, frames) = RoutedFrames::new();
                    tx.send(Ok(req.payload().to_vec())).ok();
                    streams.insert(id, tx);
                    let sink = TcpSink {
                        id,
                        ws: ws.clone(),
                    };
                    exchange.streaming(FrameReader::new(Box::new(frames)), Box::new(sink));
                }
            },
            FrameType::StreamEnd => {
                streams.remove(&id);
            }
            ty => warn!("unexpected frame from client: id={id} ty={ty:?}"),
        }
    }

    for (_, tx) in streams.drain() {
        tx.send(Err(TransportError::transient("connection lost"))).ok();
    }
    Ok(())
}

/// sends the chunks of one streaming reply back over the connection
struct TcpSink {
    id: u64,
    ws: Arc<QueuedWriter<TcpStream>>,
}

impl StreamSink for TcpSink {
    fn send(&mut self, chunk: Vec<u8>) -> Result<(), TransportError> {
        let data = frame::encode(self.id, FrameType::StreamData, &chunk)?;
        Ok(self.ws.write(data)?)
    }

    fn finish(self: Box<Self>, ret: Result<(), TransportError>) {
        let data = match ret {
            Ok(()) => frame::encode(self.id, FrameType::StreamEnd, &[]),
            Err(e) => frame::encode(self.id, FrameType::StreamError, e.message().as_bytes()),
        };
        if let Err(e) = data.and_then(|d| self.ws.write(d)) {
            error!("stream finish failed: id={} err={e}", self.id);
        }
    }
}
