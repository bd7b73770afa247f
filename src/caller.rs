use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use may::sync::Mutex;

use crate::channel::{Channel, Connector};
use crate::errors::{Error, TransportError};
use crate::marshal::{Marshaller, Unmarshaller};
use crate::policy::{default_policies, run_chain, Failure, Invoke, RetryPolicy};
use crate::procedure::{ProcedureCall, DEVICE_TIME_USEC, GET_VERSION, STOP};
use crate::recorder::{ApiCall, Recorder};
use crate::stream::StreamAdapter;

/// caller settings
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// executor versions this caller can talk to, compared as exact strings
    pub supported_versions: Vec<String>,
    /// How long one unary attempt may wait for its reply, `None` waits forever.
    ///
    /// A timed out call is not retried, the executor may still be running it.
    pub call_timeout: Option<Duration>,
}

impl Default for CallerConfig {
    fn default() -> Self {
        CallerConfig {
            supported_versions: vec!["1.0".to_owned()],
            call_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Ready,
    Rejected,
    Stopped,
}

/// the installed channel and its generation
struct Slot {
    generation: u64,
    channel: Option<Arc<dyn Channel>>,
}

/// the current channel plus the means to replace it
struct Link {
    connector: Box<dyn Connector>,
    slot: Mutex<Slot>,
    reconnects: AtomicUsize,
    timeout: Option<Duration>,
}

impl Link {
    fn current(&self) -> Result<(u64, Arc<dyn Channel>), TransportError> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(ch) = slot.channel.as_ref() {
            return Ok((slot.generation, ch.clone()));
        }
        let ch = self.connector.connect()?;
        slot.generation += 1;
        slot.channel = Some(ch.clone());
        Ok((slot.generation, ch))
    }

    fn close(&self) {
        if let Some(ch) = self.slot.lock().unwrap().channel.take() {
            ch.close();
        }
    }
}

impl Invoke for Link {
    fn invoke(&self, call: &ProcedureCall) -> Result<Vec<u8>, Failure> {
        let (generation, ch) = self.current().map_err(|error| Failure {
            generation: 0,
            error,
        })?;
        ch.unary_call(&call.name, &call.payload, self.timeout)
            .map_err(|error| Failure { generation, error })
    }

    fn reconnect(&self, stale: u64) -> Result<(), Failure> {
        let mut slot = self.slot.lock().unwrap();
        if slot.generation != stale && slot.channel.is_some() {
            // another call already replaced the failed channel
            debug!("channel {stale} already recreated as {}", slot.generation);
            return Ok(());
        }
        // streams opened on the stale channel go down with it
        if let Some(old) = slot.channel.take() {
            old.close();
        }
        let fresh = self.connector.connect().map_err(|error| Failure {
            generation: stale,
            error,
        })?;
        slot.generation += 1;
        slot.channel = Some(fresh);
        let n = self.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
        info!("channel recreated, reconnects={n}");
        Ok(())
    }
}

/// Client side facade of the rpc layer.
///
/// ```rust,no_run
/// use exec_rpc::conetty::TcpConnector;
/// use exec_rpc::Caller;
///
/// let caller = Caller::new(TcpConnector::new(("127.0.0.1", 30001)).unwrap());
/// caller.start().unwrap();
/// let ret = caller.call("echo", b"hello").unwrap();
/// assert_eq!(ret, b"hello");
/// caller.stop();
/// ```
pub struct Caller {
    link: Link,
    policies: Vec<Box<dyn RetryPolicy>>,
    config: CallerConfig,
    phase: Mutex<Phase>,
    recorder: Mutex<Option<Arc<dyn Recorder>>>,
}

impl Caller {
    /// create a caller with the default config and retry policies
    pub fn new<C: Connector + 'static>(connector: C) -> Self {
        Self::with_config(connector, CallerConfig::default())
    }

    /// create a caller with the default retry policies
    pub fn with_config<C: Connector + 'static>(connector: C, config: CallerConfig) -> Self {
        Self::with_policies(connector, config, default_policies())
    }

    /// create a caller, `policies` are applied outermost first around every unary call
    pub fn with_policies<C: Connector + 'static>(
        connector: C,
        config: CallerConfig,
        policies: Vec<Box<dyn RetryPolicy>>,
    ) -> Self {
        Caller {
            link: Link {
                connector: Box::new(connector),
                slot: Mutex::new(Slot {
                    generation: 0,
                    channel: None,
                }),
                reconnects: AtomicUsize::new(0),
                timeout: config.call_timeout,
            },
            policies,
            config,
            phase: Mutex::new(Phase::Idle),
            recorder: Mutex::new(None),
        }
    }

    /// Connect and negotiate the executor version.
    ///
    /// Must succeed once before any call. An unsupported version leaves the caller unusable.
    pub fn start(&self) -> Result<(), Error> {
        self.recorded("start", "", || {
            {
                let mut phase = self.phase.lock().unwrap();
                if *phase != Phase::Idle {
                    return Err(Error::AlreadyStarted);
                }
                *phase = Phase::Starting;
            }

            let ret = self.negotiate();
            let mut phase = self.phase.lock().unwrap();
            if *phase != Phase::Starting {
                // stopped while negotiating, drop whatever channel negotiation opened
                warn!("caller stopped during start");
                self.link.close();
                return ret.and(Err(Error::NotStarted));
            }
            *phase = match &ret {
                Ok(()) => Phase::Ready,
                Err(Error::UnsupportedExecutorVersion { .. }) => Phase::Rejected,
                Err(_) => Phase::Idle,
            };
            ret
        })
    }

    fn negotiate(&self) -> Result<(), Error> {
        self.link.current().map_err(Error::ExecutorConnection)?;
        let version = self.executor_version().map_err(|e| match e {
            Error::Rpc { source, .. } => Error::ExecutorConnection(source),
            other => other,
        })?;

        if !self.config.supported_versions.contains(&version) {
            error!(
                "unsupported executor version {version:?}, supported={:?}",
                self.config.supported_versions
            );
            self.link.close();
            return Err(Error::UnsupportedExecutorVersion {
                version,
                supported: self.config.supported_versions.clone(),
            });
        }
        info!("executor version {version:?} accepted");
        Ok(())
    }

    /// Ask the executor to shut down, then release the channel.
    ///
    /// Reaching the executor is best effort, a failure here is only logged.
    pub fn stop(&self) {
        let _ = self.recorded("stop", STOP, || {
            let was_ready = {
                let mut phase = self.phase.lock().unwrap();
                let ready = *phase == Phase::Ready;
                *phase = Phase::Stopped;
                ready
            };
            if was_ready {
                let call = ProcedureCall::new(STOP, Vec::new());
                if let Err(f) = self.link.invoke(&call) {
                    debug!("stop notification not delivered: {}", f.error);
                }
            }
            self.link.close();
            Ok(())
        });
    }

    /// whether `start` succeeded and `stop` wasn't called yet
    pub fn is_started(&self) -> bool {
        *self.phase.lock().unwrap() == Phase::Ready
    }

    /// call a procedure with raw bytes in and out
    pub fn call(&self, procedure: &str, params: impl AsRef<[u8]>) -> Result<Vec<u8>, Error> {
        self.recorded("call", procedure, || {
            self.ensure_ready()?;
            self.invoke(procedure, params.as_ref().to_vec())
        })
    }

    /// Call a procedure, marshalling `params` and unmarshalling the reply.
    ///
    /// Marshaller and unmarshaller errors come back as `Error::Marshal` / `Error::Unmarshal`
    /// holding the original error.
    pub fn call_with<P, R, M, U>(
        &self,
        procedure: &str,
        params: &P,
        marshaller: &M,
        unmarshaller: &U,
    ) -> Result<R, Error>
    where
        P: ?Sized,
        M: Marshaller<P>,
        U: Unmarshaller<R>,
    {
        self.recorded("call", procedure, || {
            self.ensure_ready()?;
            let payload = marshaller.marshal(params).map_err(Error::marshal)?;
            let ret = self.invoke(procedure, payload)?;
            unmarshaller.unmarshal(ret).map_err(Error::unmarshal)
        })
    }

    /// Open a streaming call.
    ///
    /// The stream is bound to the channel it was opened on and is not retried; if that channel
    /// gets recreated by a retry the stream ends with an error.
    pub fn call_streaming(
        &self,
        procedure: &str,
        params: impl Into<Vec<u8>>,
    ) -> Result<StreamAdapter, Error> {
        self.recorded("call_streaming", procedure, || {
            self.ensure_ready()?;
            let rpc_err = |source| Error::Rpc {
                procedure: procedure.to_owned(),
                source,
            };
            let (_, channel) = self.link.current().map_err(rpc_err)?;
            StreamAdapter::open(&*channel, procedure, params.into()).map_err(rpc_err)
        })
    }

    /// the version string of the executor
    pub fn get_executor_version(&self) -> Result<String, Error> {
        self.recorded("get_executor_version", GET_VERSION, || {
            self.ensure_ready()?;
            self.executor_version()
        })
    }

    fn executor_version(&self) -> Result<String, Error> {
        let ret = self.invoke(GET_VERSION, Vec::new())?;
        Ok(String::from_utf8_lossy(&ret).into_owned())
    }

    /// the executor side wall clock, in microseconds
    pub fn device_time_usec(&self) -> Result<u64, Error> {
        self.recorded("device_time_usec", DEVICE_TIME_USEC, || {
            self.ensure_ready()?;
            let ret = self.invoke(DEVICE_TIME_USEC, Vec::new())?;
            let text = String::from_utf8_lossy(&ret);
            text.trim()
                .parse::<u64>()
                .map_err(|e| Error::Protocol(format!("device time {text:?}: {e}")))
        })
    }

    /// how many times the channel was torn down and recreated
    pub fn reconnect_count(&self) -> usize {
        self.link.reconnects.load(Ordering::Acquire)
    }

    /// start recording every api call, returns the recorder it replaces
    pub fn attach_recorder(&self, recorder: Arc<dyn Recorder>) -> Option<Arc<dyn Recorder>> {
        self.recorder.lock().unwrap().replace(recorder)
    }

    /// stop recording, returns the detached recorder
    pub fn detach_recorder(&self) -> Option<Arc<dyn Recorder>> {
        self.recorder.lock().unwrap().take()
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        match *self.phase.lock().unwrap() {
            Phase::Ready => Ok(()),
            _ => Err(Error::NotStarted),
        }
    }

    fn invoke(&self, procedure: &str, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        let call = ProcedureCall::new(procedure, payload);
        info!("call: procedure={procedure:?} len={}", call.payload.len());
        run_chain(&self.policies, &self.link, &call).map_err(|f| Error::Rpc {
            procedure: call.name,
            source: f.error,
        })
    }

    fn recorded<T>(
        &self,
        api: &'static str,
        procedure: &str,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let recorder = self.recorder.lock().unwrap().clone();
        let Some(recorder) = recorder else {
            return f();
        };

        let started = SystemTime::now();
        let clock = Instant::now();
        let ret = f();
        recorder.record(ApiCall {
            api,
            procedure: procedure.to_owned(),
            started,
            elapsed: clock.elapsed(),
            error: ret.as_ref().err().map(|e| e.to_string()),
        });
        ret
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("config", &self.config)
            .field("phase", &*self.phase.lock().unwrap())
            .field("reconnects", &self.reconnect_count())
            .finish()
    }
}
