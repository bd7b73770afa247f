use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use may::coroutine;
use may::sync::Mutex;

use crate::dispatch::{Dispatcher, Exchange, Shutdown};
use crate::errors::Error;
use crate::executor::Executor;
use crate::pool::WorkerPool;

/// server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// number of worker coroutines, each runs one call or one whole stream at a time
    pub workers: usize,
    /// how often `wait` and `stop` look at the shutdown flag and the in-flight count
    pub drain_poll: Duration,
    /// how long `wait` lets in-flight calls finish after `_rpc_stop`
    pub stop_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            workers: 10,
            drain_poll: Duration::from_millis(5),
            stop_grace: Duration::from_secs(1),
        }
    }
}

/// A bound endpoint.
///
/// Dropping it stops accepting and drops every live connection.
pub trait Listener: Send {
    /// the socket address callers should connect to, if the endpoint has one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Where a server accepts callers.
pub trait Endpoint {
    /// start accepting, feeding every call into `exchange`
    fn bind(self, exchange: Exchange) -> io::Result<Box<dyn Listener>>;
}

struct Running {
    shutdown: Shutdown,
    pool: Arc<WorkerPool>,
    listener: Box<dyn Listener>,
}

impl Running {
    /// stop accepting, give in-flight calls `grace` to finish, then release the workers
    fn teardown(self, grace: Option<Duration>, poll: Duration, drain_first: bool) -> bool {
        self.shutdown.request();
        let Running { pool, listener, .. } = self;
        let drained = if drain_first {
            let drained = pool.wait_idle(grace, poll);
            drop(listener);
            drained
        } else {
            drop(listener);
            pool.wait_idle(grace, poll)
        };
        pool.close();
        info!("server stopped, drained={drained}");
        drained
    }
}

/// Binds an executor to an endpoint and serves calls on a pool of worker coroutines.
///
/// ```rust,no_run
/// use exec_rpc::{EchoExecutor, Server, ServerConfig};
///
/// let server = Server::new(ServerConfig::default());
/// // serve until a caller sends `_rpc_stop`
/// server.listen(EchoExecutor::new(), 30001u16, true).unwrap();
/// ```
pub struct Server {
    config: ServerConfig,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// create a server that is not listening yet
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            running: Mutex::new(None),
        }
    }

    /// Start serving `executor` on `endpoint`.
    ///
    /// With `blocking` this returns only after shutdown, otherwise it returns once bound and
    /// `wait` or `stop` finish the job.
    pub fn listen<E, P>(&self, executor: E, endpoint: P, blocking: bool) -> Result<(), Error>
    where
        E: Executor,
        P: Endpoint,
    {
        {
            let mut running = self.running.lock().unwrap();
            if running.is_some() {
                return Err(Error::AlreadyStarted);
            }

            let shutdown = Shutdown::new();
            let pool = Arc::new(WorkerPool::new(self.config.workers)?);
            let dispatcher = Dispatcher::new(Arc::new(executor), shutdown.clone());
            let listener = endpoint.bind(Exchange::new(dispatcher, pool.clone()))?;
            info!(
                "server listening: addr={:?} workers={}",
                listener.local_addr(),
                pool.size()
            );
            *running = Some(Running {
                shutdown,
                pool,
                listener,
            });
        }

        if blocking {
            self.wait();
        }
        Ok(())
    }

    /// Block until the server shuts down, either by `_rpc_stop` or by `stop` from another thread.
    pub fn wait(&self) {
        loop {
            {
                let mut running = self.running.lock().unwrap();
                let requested = match running.as_ref() {
                    None => return,
                    Some(r) => r.shutdown.is_requested(),
                };
                if requested {
                    if let Some(r) = running.take() {
                        drop(running);
                        r.teardown(Some(self.config.stop_grace), self.config.drain_poll, true);
                    }
                    return;
                }
            }
            coroutine::sleep(self.config.drain_poll);
        }
    }

    /// Stop accepting, drop live connections and wait up to `timeout` for in-flight calls.
    ///
    /// Returns whether everything drained in time; `None` waits as long as it takes. Stopping a
    /// server that isn't running returns `true`.
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        let running = self.running.lock().unwrap().take();
        match running {
            Some(r) => r.teardown(timeout, self.config.drain_poll, false),
            None => true,
        }
    }

    /// whether the server is bound and not shut down
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| !r.shutdown.is_requested())
    }

    /// the address of the bound endpoint, if it has one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.listener.local_addr())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(r) = self.running.lock().ok().and_then(|mut r| r.take()) {
            r.teardown(Some(Duration::ZERO), self.config.drain_poll, false);
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}
