use std::sync::Arc;

use crate::errors::ExecutorError;
use crate::stream::FrameReader;

/// Lazily produced chunks of a streaming reply.
///
/// An `Err` item ends the stream and is reported to the caller.
pub type ChunkIter = Box<dyn Iterator<Item = Result<Vec<u8>, ExecutorError>> + Send>;

/// The procedures a server exposes.
///
/// Implementations are shared by every worker, so they must be callable concurrently.
/// Procedure names starting with `_rpc_` never reach an executor.
pub trait Executor: Send + Sync + 'static {
    /// run a unary procedure
    fn execute_procedure(&self, name: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError>;

    /// Run a streaming procedure.
    ///
    /// `inbound` yields the frames the caller writes after the stream header, in order, and
    /// ends when the caller calls `end_write`; an `Err` item means the caller's side broke.
    /// The returned iterator is drained lazily; every item is sent to the caller as one chunk.
    fn execute_streaming_procedure(
        &self,
        name: &str,
        _payload: &[u8],
        _inbound: FrameReader,
    ) -> Result<ChunkIter, ExecutorError> {
        Err(ExecutorError(format!(
            "streaming procedure {name:?} is not supported"
        )))
    }

    /// the version reported to callers during negotiation
    fn get_version(&self) -> String;
}

impl<E: Executor> Executor for Arc<E> {
    fn execute_procedure(&self, name: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        (**self).execute_procedure(name, payload)
    }

    fn execute_streaming_procedure(
        &self,
        name: &str,
        payload: &[u8],
        inbound: FrameReader,
    ) -> Result<ChunkIter, ExecutorError> {
        (**self).execute_streaming_procedure(name, payload, inbound)
    }

    fn get_version(&self) -> String {
        (**self).get_version()
    }
}

/// Echoes every payload back.
///
/// Its streaming form first yields `"<name>:<params>"`, then echoes each inbound frame.
#[derive(Debug, Clone)]
pub struct EchoExecutor {
    version: String,
}

impl Default for EchoExecutor {
    fn default() -> Self {
        EchoExecutor {
            version: "1.0".to_owned(),
        }
    }
}

impl EchoExecutor {
    /// an echo executor reporting version `"1.0"`
    pub fn new() -> Self {
        Self::default()
    }

    /// an echo executor reporting `version`
    pub fn with_version(version: impl Into<String>) -> Self {
        EchoExecutor {
            version: version.into(),
        }
    }
}

impl Executor for EchoExecutor {
    fn execute_procedure(&self, name: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        info!("echo: procedure={name:?} len={}", payload.len());
        Ok(payload.to_vec())
    }

    fn execute_streaming_procedure(
        &self,
        name: &str,
        payload: &[u8],
        inbound: FrameReader,
    ) -> Result<ChunkIter, ExecutorError> {
        let mut first = name.as_bytes().to_vec();
        first.push(b':');
        first.extend_from_slice(payload);
        let frames = inbound.map(|frame| frame.map_err(ExecutorError::from));
        Ok(Box::new(std::iter::once(Ok(first)).chain(frames)))
    }

    fn get_version(&self) -> String {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;

    fn inbound(frames: &[&[u8]]) -> FrameReader {
        let frames: Vec<Result<Vec<u8>, TransportError>> =
            frames.iter().map(|f| Ok(f.to_vec())).collect();
        FrameReader::new(Box::new(frames.into_iter()))
    }

    #[test]
    fn echo_unary() {
        let echo = EchoExecutor::new();
        assert_eq!(echo.execute_procedure("echo", b"hello").unwrap(), b"hello");
        assert_eq!(echo.get_version(), "1.0");
    }

    #[test]
    fn echo_streaming() {
        let echo = Arc::new(EchoExecutor::with_version("2.0"));
        let chunks: Vec<Vec<u8>> = echo
            .execute_streaming_procedure("s", b"p", inbound(&[b"a", b"b"]))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks, vec![b"s:p".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(echo.get_version(), "2.0");
    }

    #[test]
    fn streaming_is_unsupported_by_default() {
        struct Unary;
        impl Executor for Unary {
            fn execute_procedure(&self, _: &str, p: &[u8]) -> Result<Vec<u8>, ExecutorError> {
                Ok(p.to_vec())
            }
            fn get_version(&self) -> String {
                "1.0".into()
            }
        }
        let err = Unary
            .execute_streaming_procedure("s", b"", inbound(&[]))
            .err()
            .unwrap();
        assert!(err.0.contains("not supported"));
    }
}
