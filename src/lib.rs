//! exec_rpc is a controller/executor remote procedure call layer based on coroutines.
//!
//! A controller process drives a remote executor process through named procedures. Payloads
//! are opaque bytes; typed values go through a marshaller picked per call. Next to plain
//! request/response calls there are bidirectional streaming calls, and an out-of-order mode
//! where the replies to parked calls are supplied from outside in any order.
//!
//! ## Pieces
//! * `Caller`: the client facade. Negotiates the executor version on `start`, then `call`s
//!   procedures, reconnecting once on a transient transport failure.
//! * `Executor`: what a server runs. `Server` binds one to an `Endpoint` and serves calls on a
//!   pool of worker coroutines.
//! * `StreamAdapter`: blocking `read`/`write`/`end_write` handle of a streaming call.
//! * `AsyncExecutor`: parks every call until `Call::return_value` is supplied.
//!
//! Procedure names starting with `_rpc_` belong to the layer itself and never reach an
//! executor.
//!
//! Example usage:
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
//! assert_eq!(caller.get_executor_version().unwrap(), "1.0");
//! assert_eq!(caller.call("echo", "hello").unwrap(), b"hello");
//!
//! let stream = caller.call_streaming("words", b"".to_vec()).unwrap();
//! stream.write(b"abc".to_vec()).unwrap();
//! stream.end_write();
//! assert_eq!(stream.read().unwrap().unwrap(), b"words:");
//! assert_eq!(stream.read().unwrap().unwrap(), b"abc");
//! assert_eq!(stream.read().unwrap(), None);
//!
//! caller.stop();
//! server.wait();
//! ```
//!
//! The `conetty` module carries the same protocol over TCP.

#[macro_use]
extern crate log;

pub mod async_executor;
pub mod caller;
pub mod channel;
pub mod conetty;
pub mod dispatch;
mod errors;
pub mod executor;
pub mod loopback;
pub mod marshal;
pub mod policy;
mod pool;
pub mod procedure;
pub mod recorder;
pub mod server;
pub mod stream;

pub use async_executor::{AsyncExecutor, AsyncServer, Call};
pub use caller::{Caller, CallerConfig};
pub use channel::{Channel, Connector};
pub use errors::{
    BoxError, ContractViolation, Error, ExecutorError, TransportError, TransportErrorKind,
};
pub use executor::{EchoExecutor, Executor};
pub use marshal::{Identity, Marshaller, Unmarshaller};
pub use policy::{Failure, NoRetry, ReconnectOnce, RetryPolicy};
pub use procedure::{ProcedureCall, ProcedureResponse};
pub use recorder::{ApiCall, CallRecorder, Recorder};
pub use server::{Endpoint, Server, ServerConfig};
pub use stream::{FrameReader, StreamAdapter, StreamHandle};
