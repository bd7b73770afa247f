//! out-of-order execution
//!
//! An `AsyncExecutor` never answers a call by itself. Every incoming call is parked on its
//! worker and listed in `waiting_calls`, in arrival order. Some external actor, usually a test,
//! picks calls with `get()` and answers them with `Call::return_value` in any order it likes.
//! Answered calls move to `logged_calls`, in the order they were answered.
//!
//! ```rust
//! use exec_rpc::{loopback, AsyncServer, Caller};
//! use std::sync::Arc;
//!
//! let (endpoint, connector) = loopback::pair();
//! let server = AsyncServer::start(endpoint).unwrap();
//!
//! let caller = Arc::new(Caller::new(connector));
//! caller.start().unwrap();
//! let c = caller.clone();
//! let h = std::thread::spawn(move || c.call("dummy_send", b"abc").unwrap());
//!
//! let call = loop {
//!     match server.get() {
//!         Ok(call) => break call,
//!         Err(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
//!     }
//! };
//! assert_eq!(call.params(), b"abc");
//! call.return_value(b"done".to_vec()).unwrap();
//! assert_eq!(h.join().unwrap(), b"done");
//! ```
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use may::sync::{mpsc, Mutex};

use crate::errors::{Error, ExecutorError};
use crate::executor::Executor;
use crate::server::{Endpoint, Server, ServerConfig};

#[derive(Default)]
struct LedgerState {
    next_index: u64,
    waiting: BTreeMap<u64, Arc<Call>>,
    log: Vec<Arc<Call>>,
}

struct Ledger {
    state: Mutex<LedgerState>,
}

struct Reply {
    returned: bool,
    expired: bool,
    value: Option<Vec<u8>>,
    signal: Option<mpsc::Sender<Vec<u8>>>,
}

/// One parked call of an `AsyncExecutor`.
pub struct Call {
    index: u64,
    procedure_name: String,
    params: Vec<u8>,
    reply: Mutex<Reply>,
    ledger: Weak<Ledger>,
}

impl Call {
    /// arrival index, starts at 0 and is never reused
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn procedure_name(&self) -> &str {
        &self.procedure_name
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// whether a reply was supplied
    pub fn is_returned(&self) -> bool {
        self.reply.lock().unwrap().returned
    }

    /// the supplied reply, if any
    pub fn returned_value(&self) -> Option<Vec<u8>> {
        self.reply.lock().unwrap().value.clone()
    }

    /// Supply the reply and release the parked worker.
    ///
    /// Returns `Error::CallExpired` if the worker already gave up waiting.
    ///
    /// # Panics
    /// if a reply was already supplied for this call
    pub fn return_value(&self, value: impl Into<Vec<u8>>) -> Result<(), Error> {
        let value = value.into();
        let ledger = self.ledger.upgrade();
        // ledger before reply, same order as the expiry path
        let mut state = ledger.as_ref().map(|l| l.state.lock().unwrap());
        let mut reply = self.reply.lock().unwrap();
        assert!(!reply.returned, "call {} already returned", self.index);
        if reply.expired {
            warn!("reply to expired call: index={}", self.index);
            return Err(Error::CallExpired { index: self.index });
        }

        reply.returned = true;
        reply.value = Some(value.clone());
        if let Some(state) = state.as_mut() {
            if let Some(call) = state.waiting.remove(&self.index) {
                state.log.push(call);
            }
        }
        if let Some(signal) = reply.signal.take() {
            // the worker is parked on the other end until its call expires
            signal.send(value).ok();
        }
        info!("returning on call: index={}", self.index);
        Ok(())
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reply = self.reply.lock().unwrap();
        write!(
            f,
            "Call:\nindex={}\nreturned={}\nprocedure_name={:?}\nparams={:?}",
            self.index,
            reply.returned,
            self.procedure_name,
            String::from_utf8_lossy(&self.params)
        )?;
        if let Some(value) = reply.value.as_ref() {
            write!(f, "\nreturn value={:?}", String::from_utf8_lossy(value))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Call(index={}, returned={}, procedure_name={})",
            self.index,
            self.is_returned(),
            self.procedure_name
        )
    }
}

/// Executor whose replies are supplied from outside, in any order.
#[derive(Clone)]
pub struct AsyncExecutor {
    ledger: Arc<Ledger>,
    version: String,
    reply_timeout: Option<Duration>,
}

impl Default for AsyncExecutor {
    fn default() -> Self {
        AsyncExecutor {
            ledger: Arc::new(Ledger {
                state: Mutex::new(LedgerState::default()),
            }),
            version: "1.0".to_owned(),
            reply_timeout: None,
        }
    }
}

impl AsyncExecutor {
    /// an executor reporting version `"1.0"` whose calls wait for their reply forever
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on calls that got no reply within `timeout`.
    ///
    /// The expired call leaves `waiting_calls` without entering the log, and its caller gets a
    /// remote error.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// report `version` to callers
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// the oldest waiting call
    pub fn get(&self) -> Result<Arc<Call>, Error> {
        let state = self.ledger.state.lock().unwrap();
        state
            .waiting
            .values()
            .next()
            .cloned()
            .ok_or(Error::NoWaitingCalls)
    }

    /// whether no call is waiting
    pub fn empty(&self) -> bool {
        self.ledger.state.lock().unwrap().waiting.is_empty()
    }

    /// calls waiting for a reply, oldest first
    pub fn waiting_calls(&self) -> Vec<Arc<Call>> {
        let state = self.ledger.state.lock().unwrap();
        state.waiting.values().cloned().collect()
    }

    /// answered calls, in the order they were answered
    pub fn logged_calls(&self) -> Vec<Arc<Call>> {
        self.ledger.state.lock().unwrap().log.clone()
    }

    fn park(&self, name: &str, payload: &[u8]) -> (Arc<Call>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let mut state = self.ledger.state.lock().unwrap();
        let index = state.next_index;
        state.next_index += 1;
        let call = Arc::new(Call {
            index,
            procedure_name: name.to_owned(),
            params: payload.to_vec(),
            reply: Mutex::new(Reply {
                returned: false,
                expired: false,
                value: None,
                signal: Some(tx),
            }),
            ledger: Arc::downgrade(&self.ledger),
        });
        state.waiting.insert(index, call.clone());
        (call, rx)
    }

    fn expire(&self, call: &Call, timeout: Duration) -> Result<Vec<u8>, ExecutorError> {
        let mut state = self.ledger.state.lock().unwrap();
        let mut reply = call.reply.lock().unwrap();
        if reply.returned {
            // answered between the timeout and taking the lock
            return Ok(reply.value.clone().unwrap_or_default());
        }
        reply.expired = true;
        reply.signal = None;
        state.waiting.remove(&call.index);
        warn!("call expired: index={} after {timeout:?}", call.index);
        Err(ExecutorError(format!(
            "call {} got no reply within {timeout:?}",
            call.index
        )))
    }
}

impl Executor for AsyncExecutor {
    fn execute_procedure(&self, name: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        let (call, rx) = self.park(name, payload);
        info!("incoming {call:?}");

        match self.reply_timeout {
            None => rx
                .recv()
                .map_err(|_| ExecutorError(format!("call {} was dropped", call.index))),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(value) => Ok(value),
                Err(_) => self.expire(&call, timeout),
            },
        }
    }

    fn get_version(&self) -> String {
        self.version.clone()
    }
}

impl fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.ledger.state.lock().unwrap();
        f.debug_struct("AsyncExecutor")
            .field("version", &self.version)
            .field("waiting", &state.waiting.len())
            .field("logged", &state.log.len())
            .finish()
    }
}

/// A server and the `AsyncExecutor` it runs, in one object.
///
/// Dropping it stops the server, giving in-flight calls up to 10 seconds.
pub struct AsyncServer {
    server: Server,
    executor: AsyncExecutor,
}

impl AsyncServer {
    /// listen on `endpoint` with a default executor and config
    pub fn start<P: Endpoint>(endpoint: P) -> Result<Self, Error> {
        Self::start_with(endpoint, AsyncExecutor::new(), ServerConfig::default())
    }

    /// listen on `endpoint` with the given executor and config
    pub fn start_with<P: Endpoint>(
        endpoint: P,
        executor: AsyncExecutor,
        config: ServerConfig,
    ) -> Result<Self, Error> {
        let server = Server::new(config);
        server.listen(executor.clone(), endpoint, false)?;
        Ok(AsyncServer { server, executor })
    }

    /// the oldest waiting call
    pub fn get(&self) -> Result<Arc<Call>, Error> {
        self.executor.get()
    }

    /// whether no call is waiting
    pub fn empty(&self) -> bool {
        self.executor.empty()
    }

    /// calls waiting for a reply, oldest first
    pub fn waiting_calls(&self) -> Vec<Arc<Call>> {
        self.executor.waiting_calls()
    }

    /// answered calls, in the order they were answered
    pub fn logged_calls(&self) -> Vec<Arc<Call>> {
        self.executor.logged_calls()
    }

    pub fn executor(&self) -> &AsyncExecutor {
        &self.executor
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// stop the server, returns whether every in-flight call finished within `timeout`
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        self.server.stop(timeout)
    }
}

impl Drop for AsyncServer {
    fn drop(&mut self) {
        self.stop(Some(Duration::from_secs(10)));
    }
}
