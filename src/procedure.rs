use serde::{Deserialize, Serialize};

/// prefix of every procedure name owned by the rpc layer itself
pub const RESERVED_PREFIX: &str = "_rpc_";
/// returns `Executor::get_version`
pub const GET_VERSION: &str = "_rpc_get_version";
/// asks the server to shut down
pub const STOP: &str = "_rpc_stop";
/// returns the executor side wall clock in microseconds
pub const DEVICE_TIME_USEC: &str = "_rpc_device_time_usec";

/// A named invocation with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureCall {
    /// procedure name
    pub name: String,
    /// marshalled parameters
    pub payload: Vec<u8>,
}

impl ProcedureCall {
    /// create a new call
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        ProcedureCall {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// the reserved procedure this call targets, if any
    pub fn reserved(&self) -> Option<Reserved> {
        Reserved::parse(&self.name)
    }
}

/// The reply to one `ProcedureCall`, or one chunk of a streaming reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureResponse {
    /// marshalled return value
    pub payload: Vec<u8>,
}

/// Procedure names intercepted by the dispatcher before they reach the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserved {
    /// `_rpc_get_version`
    GetVersion,
    /// `_rpc_stop`
    Stop,
    /// `_rpc_device_time_usec`
    DeviceTimeUsec,
    /// any other `_rpc_` name, kept back for future use
    Unassigned,
}

impl Reserved {
    /// classify a procedure name, `None` for names that belong to the executor
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            GET_VERSION => Some(Reserved::GetVersion),
            STOP => Some(Reserved::Stop),
            DEVICE_TIME_USEC => Some(Reserved::DeviceTimeUsec),
            _ if name.starts_with(RESERVED_PREFIX) => Some(Reserved::Unassigned),
            _ => None,
        }
    }
}

/// whether `name` is owned by the rpc layer
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}
