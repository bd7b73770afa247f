//! server side routing of calls
//!
//! The `Dispatcher` applies the reserved-name table and isolates executor panics. The
//! `Exchange` is what a transport sees of a server: it queues calls on the worker pool and hands
//! the outcome back through a reply callback or a `StreamSink`.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{ExecutorError, TransportError};
use crate::executor::Executor;
use crate::pool::WorkerPool;
use crate::procedure::{ProcedureCall, Reserved};
use crate::stream::FrameReader;

const PANICKED: &str = "rpc panicked in server!";

/// shutdown request flag shared by a server and everything serving it
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    /// a flag that is not raised yet
    pub fn new() -> Self {
        Self::default()
    }

    /// raise the flag
    pub fn request(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            info!("server shutdown requested");
        }
    }

    /// whether the flag was raised
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// receiving end of a streaming reply
pub trait StreamSink: Send {
    /// deliver one chunk, an error means the caller is gone
    fn send(&mut self, chunk: Vec<u8>) -> Result<(), TransportError>;

    /// the stream is over, `Err` if it failed
    fn finish(self: Box<Self>, ret: Result<(), TransportError>);
}

/// routes calls to the reserved handlers or the executor
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    shutdown: Shutdown,
}

impl Dispatcher {
    /// route calls to `executor`, `_rpc_stop` raises `shutdown`
    pub fn new(executor: Arc<dyn Executor>, shutdown: Shutdown) -> Self {
        Dispatcher { executor, shutdown }
    }

    /// run one unary call
    pub fn dispatch(&self, call: &ProcedureCall) -> Result<Vec<u8>, ExecutorError> {
        match call.reserved() {
            Some(Reserved::GetVersion) => Ok(self.executor.get_version().into_bytes()),
            Some(Reserved::Stop) => {
                self.shutdown.request();
                Ok(Vec::new())
            }
            Some(Reserved::DeviceTimeUsec) => Ok(device_time_usec().to_string().into_bytes()),
            Some(Reserved::Unassigned) => {
                warn!("rejected reserved procedure {:?}", call.name);
                Err(ExecutorError(format!("unknown reserved procedure {:?}", call.name)))
            }
            None => {
                let executor = &self.executor;
                catch_unwind(AssertUnwindSafe(|| {
                    executor.execute_procedure(&call.name, &call.payload)
                }))
                .unwrap_or_else(|_| {
                    error!("executor panicked: procedure={:?}", call.name);
                    Err(ExecutorError::new(PANICKED))
                })
            }
        }
    }

    /// Run one streaming call.
    ///
    /// The first two inbound frames are the procedure name and its params, the rest is handed to
    /// the executor. Each yielded chunk goes to `sink` until the executor is exhausted or the
    /// caller is gone.
    pub fn dispatch_streaming(
        &self,
        mut inbound: FrameReader,
        sink: &mut dyn StreamSink,
    ) -> Result<(), TransportError> {
        let name = inbound
            .read()?
            .ok_or_else(|| TransportError::protocol("stream header without procedure name"))?;
        let params = inbound
            .read()?
            .ok_or_else(|| TransportError::protocol("stream header without params"))?;
        let name = String::from_utf8_lossy(&name).into_owned();
        info!("stream request: procedure={name:?}");

        if Reserved::parse(&name).is_some() {
            warn!("rejected reserved streaming procedure {name:?}");
            return Err(TransportError::remote(format!(
                "reserved procedure {name:?} can't be streamed"
            )));
        }

        let executor = &self.executor;
        let mut chunks = catch_unwind(AssertUnwindSafe(|| {
            executor.execute_streaming_procedure(&name, &params, inbound)
        }))
        .unwrap_or_else(|_| Err(ExecutorError::new(PANICKED)))?;

        loop {
            let chunk = match catch_unwind(AssertUnwindSafe(|| chunks.next())) {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    warn!("streaming procedure failed: procedure={name:?} err={e}");
                    return Err(e.into());
                }
                Ok(None) => return Ok(()),
                Err(_) => {
                    error!("executor panicked while streaming: procedure={name:?}");
                    return Err(TransportError::remote(PANICKED));
                }
            };
            if let Err(e) = sink.send(chunk) {
                warn!("stream receiver gone: procedure={name:?} err={e}");
                return Ok(());
            }
        }
    }

    /// the shutdown flag this dispatcher raises
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

fn device_time_usec() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default()
}

/// A running server as seen by its transports.
///
/// Cheap to clone; every clone feeds the same worker pool.
#[derive(Clone)]
pub struct Exchange {
    dispatcher: Dispatcher,
    pool: Arc<WorkerPool>,
}

impl Exchange {
    pub(crate) fn new(dispatcher: Dispatcher, pool: Arc<WorkerPool>) -> Self {
        Exchange { dispatcher, pool }
    }

    /// whether the server stopped taking calls
    pub fn is_closed(&self) -> bool {
        self.dispatcher.shutdown.is_requested()
    }

    /// Queue a unary call, `reply` runs on the worker once it is done.
    pub fn unary<F>(&self, call: ProcedureCall, reply: F)
    where
        F: FnOnce(Result<Vec<u8>, TransportError>) + Send + 'static,
    {
        if self.is_closed() {
            return reply(Err(closed()));
        }
        info!("get request: procedure={:?}", call.name);
        let dispatcher = self.dispatcher.clone();
        // the reply callback is consumed either by the job or, if the pool is gone, here
        let slot = Arc::new(may::sync::Mutex::new(Some(reply)));
        let job_slot = slot.clone();
        let queued = self.pool.submit(move || {
            let ret = dispatcher.dispatch(&call).map_err(TransportError::from);
            if let Some(reply) = job_slot.lock().unwrap().take() {
                reply(ret);
            }
        });
        if !queued {
            if let Some(reply) = slot.lock().unwrap().take() {
                reply(Err(closed()));
            }
        }
    }

    /// Queue a streaming call.
    ///
    /// `inbound` carries the stream header followed by the caller's frames.
    pub fn streaming(&self, inbound: FrameReader, sink: Box<dyn StreamSink>) {
        if self.is_closed() {
            return sink.finish(Err(closed()));
        }
        let dispatcher = self.dispatcher.clone();
        let slot = Arc::new(may::sync::Mutex::new(Some((inbound, sink))));
        let job_slot = slot.clone();
        let queued = self.pool.submit(move || {
            let Some((inbound, mut sink)) = job_slot.lock().unwrap().take() else {
                return;
            };
            let ret = dispatcher.dispatch_streaming(inbound, &mut *sink);
            if let Err(e) = &ret {
                error!("stream failed: {e}");
            }
            sink.finish(ret);
        });
        if !queued {
            if let Some((_, sink)) = slot.lock().unwrap().take() {
                sink.finish(Err(closed()));
            }
        }
    }
}

fn closed() -> TransportError {
    TransportError::closed("server is shut down")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ChunkIter, EchoExecutor};
    use crate::procedure::{DEVICE_TIME_USEC, GET_VERSION, STOP};
    use std::sync::atomic::AtomicUsize;

    /// counts every call that reaches it
    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Executor for Counting {
        fn execute_procedure(&self, name: &str, p: &[u8]) -> Result<Vec<u8>, ExecutorError> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            match name {
                "panic" => panic!("boom"),
                "fail" => Err(ExecutorError::from("failed")),
                _ => Ok(p.to_vec()),
            }
        }

        fn execute_streaming_procedure(
            &self,
            name: &str,
            _payload: &[u8],
            inbound: FrameReader,
        ) -> Result<ChunkIter, ExecutorError> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            if name == "explode" {
                return Ok(Box::new(inbound.map(|_| -> Result<Vec<u8>, ExecutorError> {
                    panic!("mid stream")
                })));
            }
            Ok(Box::new(inbound.map(|f| {
                f.map(|f| f.to_ascii_uppercase())
                    .map_err(ExecutorError::from)
            })))
        }

        fn get_version(&self) -> String {
            "3.1".into()
        }
    }

    fn frames(items: &[&[u8]]) -> FrameReader {
        let items: Vec<Result<Vec<u8>, TransportError>> =
            items.iter().map(|f| Ok(f.to_vec())).collect();
        FrameReader::new(Box::new(items.into_iter()))
    }

    #[derive(Default)]
    struct Collect(Vec<Vec<u8>>);

    impl StreamSink for Collect {
        fn send(&mut self, chunk: Vec<u8>) -> Result<(), TransportError> {
            self.0.push(chunk);
            Ok(())
        }

        fn finish(self: Box<Self>, _ret: Result<(), TransportError>) {}
    }

    fn setup() -> (Arc<Counting>, Dispatcher) {
        let executor = Arc::new(Counting::default());
        let dispatcher = Dispatcher::new(executor.clone(), Shutdown::new());
        (executor, dispatcher)
    }

    #[test]
    fn reserved_names_never_reach_the_executor() {
        let (executor, dispatcher) = setup();
        let version = dispatcher
            .dispatch(&ProcedureCall::new(GET_VERSION, Vec::new()))
            .unwrap();
        assert_eq!(version, b"3.1");

        let usec = dispatcher
            .dispatch(&ProcedureCall::new(DEVICE_TIME_USEC, Vec::new()))
            .unwrap();
        let usec: u128 = String::from_utf8(usec).unwrap().parse().unwrap();
        assert!(usec > 1_600_000_000_000_000);

        assert!(dispatcher
            .dispatch(&ProcedureCall::new("_rpc_reboot", Vec::new()))
            .is_err());

        assert!(!dispatcher.shutdown().is_requested());
        assert_eq!(
            dispatcher.dispatch(&ProcedureCall::new(STOP, Vec::new())).unwrap(),
            b""
        );
        assert!(dispatcher.shutdown().is_requested());
        assert_eq!(executor.calls.load(Ordering::Acquire), 0);

        dispatcher
            .dispatch(&ProcedureCall::new("echo", b"x".to_vec()))
            .unwrap();
        assert_eq!(executor.calls.load(Ordering::Acquire), 1);
    }

    #[test]
    fn panics_are_isolated() {
        let (_, dispatcher) = setup();
        let err = dispatcher
            .dispatch(&ProcedureCall::new("panic", Vec::new()))
            .unwrap_err();
        assert_eq!(err.0, PANICKED);
        let err = dispatcher
            .dispatch(&ProcedureCall::new("fail", Vec::new()))
            .unwrap_err();
        assert_eq!(err.0, "failed");
    }

    #[test]
    fn stream_header_is_stripped() {
        let (_, dispatcher) = setup();
        let mut sink = Collect::default();
        dispatcher
            .dispatch_streaming(frames(&[b"upper", b"", b"abc", b"d"]), &mut sink)
            .unwrap();
        assert_eq!(sink.0, vec![b"ABC".to_vec(), b"D".to_vec()]);
    }

    #[test]
    fn broken_stream_requests() {
        let (executor, dispatcher) = setup();
        let mut sink = Collect::default();
        let err = dispatcher
            .dispatch_streaming(frames(&[b"upper"]), &mut sink)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::TransportErrorKind::Protocol);

        let err = dispatcher
            .dispatch_streaming(frames(&[b"_rpc_stop", b""]), &mut sink)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::TransportErrorKind::Remote);
        assert!(!dispatcher.shutdown().is_requested());

        let err = dispatcher
            .dispatch_streaming(frames(&[b"explode", b"", b"x"]), &mut sink)
            .unwrap_err();
        assert_eq!(err.message(), PANICKED);
        assert_eq!(executor.calls.load(Ordering::Acquire), 1);
    }

    #[test]
    fn broken_inbound_fails_the_stream() {
        let (_, dispatcher) = setup();
        let mut sink = Collect::default();
        let items = vec![
            Ok(b"upper".to_vec()),
            Ok(Vec::new()),
            Ok(b"a".to_vec()),
            Err(TransportError::transient("reset")),
            Ok(b"b".to_vec()),
        ];
        let err = dispatcher
            .dispatch_streaming(FrameReader::new(Box::new(items.into_iter())), &mut sink)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::TransportErrorKind::Remote);
        assert!(err.message().contains("reset"));
        // the frames before the failure were delivered, nothing after it
        assert_eq!(sink.0, vec![b"A".to_vec()]);
    }

    #[test]
    fn exchange_rejects_calls_after_shutdown() {
        let shutdown = Shutdown::new();
        let dispatcher = Dispatcher::new(Arc::new(EchoExecutor::new()), shutdown.clone());
        let exchange = Exchange::new(dispatcher, Arc::new(WorkerPool::new(2).unwrap()));

        let (tx, rx) = may::sync::mpsc::channel();
        let tx1 = tx.clone();
        exchange.unary(ProcedureCall::new("echo", b"hi".to_vec()), move |ret| {
            tx1.send(ret).unwrap();
        });
        assert_eq!(rx.recv().unwrap().unwrap(), b"hi");

        shutdown.request();
        assert!(exchange.is_closed());
        exchange.unary(ProcedureCall::new("echo", b"hi".to_vec()), move |ret| {
            tx.send(ret).unwrap();
        });
        let err = rx.recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::errors::TransportErrorKind::Closed);
    }
}
