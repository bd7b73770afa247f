//! blocking read/write handle over the bidirectional frame primitive
//!
//! The caller writes into a queue; the transport pulls from that queue through `QueuedFrames`.
//! Since the transport side is a puller, closing the write side is done by pushing an
//! `EndWrite` sentinel that ends the pulling loop.
use may::sync::{mpsc, Mutex};

use crate::channel::{Channel, FrameIter, InboundFrames};
use crate::errors::{ContractViolation, Error, TransportError};

/// item of the pending write queue
#[derive(Debug)]
enum Outbound {
    Frame(Vec<u8>),
    EndWrite,
}

/// the transport facing end of the write queue
struct QueuedFrames {
    rx: mpsc::Receiver<Outbound>,
    done: bool,
}

impl Iterator for QueuedFrames {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Outbound::Frame(frame)) => Some(frame),
            // the sentinel, or the adapter is gone
            Ok(Outbound::EndWrite) | Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

/// Forward-only reader over inbound frames.
///
/// Used by the caller side `StreamAdapter` and handed to executors as the frames written by the
/// caller after the stream header.
pub struct FrameReader {
    frames: InboundFrames,
    done: bool,
}

impl FrameReader {
    /// wrap the inbound half of a stream
    pub fn new(frames: InboundFrames) -> Self {
        FrameReader {
            frames,
            done: false,
        }
    }

    /// block for the next frame, `Ok(None)` once the peer finished writing
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.done {
            return Ok(None);
        }
        match self.frames.next() {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// Yields frames until the peer finished writing. A broken stream yields its error once, then
/// ends.
impl Iterator for FrameReader {
    type Item = Result<Vec<u8>, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("done", &self.done)
            .finish()
    }
}

struct Writer {
    tx: mpsc::Sender<Outbound>,
    ended: bool,
}

/// Caller side handle of a streaming call.
///
/// All methods take `&self`, so one thread may read while another writes (share it with an
/// `Arc`). Dropping the handle closes the write side if that wasn't done yet.
pub struct StreamAdapter {
    procedure: String,
    writer: Mutex<Writer>,
    reader: Mutex<FrameReader>,
}

/// the handle returned by `Caller::call_streaming`
pub type StreamHandle = StreamAdapter;

impl StreamAdapter {
    /// open a stream on `channel` and send the `[procedure, params]` header
    pub fn open(
        channel: &dyn Channel,
        procedure: &str,
        params: Vec<u8>,
    ) -> Result<Self, TransportError> {
        let (tx, rx) = mpsc::channel();
        // the receiver is alive here, these can't fail
        tx.send(Outbound::Frame(procedure.as_bytes().to_vec())).ok();
        tx.send(Outbound::Frame(params)).ok();

        let outbound: FrameIter = Box::new(QueuedFrames { rx, done: false });
        let inbound = channel.open_stream(outbound)?;
        info!("stream opened: procedure={procedure:?}");

        Ok(StreamAdapter {
            procedure: procedure.to_owned(),
            writer: Mutex::new(Writer { tx, ended: false }),
            reader: Mutex::new(FrameReader::new(inbound)),
        })
    }

    /// name of the streamed procedure
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// block until the executor yields the next chunk; `None` once it is exhausted
    pub fn read(&self) -> Result<Option<Vec<u8>>, Error> {
        let mut reader = self.reader.lock().unwrap();
        reader.read().map_err(|source| Error::Rpc {
            procedure: self.procedure.clone(),
            source,
        })
    }

    /// read every remaining chunk
    pub fn read_all(&self) -> Result<Vec<Vec<u8>>, Error> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// send one frame to the executor
    ///
    /// fails with `ContractViolation::WriteAfterEndWrite` once `end_write` was called
    pub fn write(&self, frame: impl Into<Vec<u8>>) -> Result<(), Error> {
        let writer = self.writer.lock().unwrap();
        if writer.ended {
            error!("write after end_write: procedure={:?}", self.procedure);
            return Err(ContractViolation::WriteAfterEndWrite.into());
        }
        writer
            .tx
            .send(Outbound::Frame(frame.into()))
            .map_err(|_| Error::Rpc {
                procedure: self.procedure.clone(),
                source: TransportError::closed("stream writer is gone"),
            })
    }

    /// tell the executor no more frames will come, calling it again does nothing
    pub fn end_write(&self) {
        let mut writer = self.writer.lock().unwrap();
        if writer.ended {
            return;
        }
        writer.ended = true;
        // the transport may already have dropped its end
        writer.tx.send(Outbound::EndWrite).ok();
        info!("stream end write: procedure={:?}", self.procedure);
    }

    /// whether `end_write` was called
    pub fn is_write_ended(&self) -> bool {
        self.writer.lock().unwrap().ended
    }
}

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        if let Ok(mut writer) = self.writer.lock() {
            if !writer.ended {
                writer.ended = true;
                writer.tx.send(Outbound::EndWrite).ok();
            }
        }
    }
}

impl std::fmt::Debug for StreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAdapter")
            .field("procedure", &self.procedure)
            .field("write_ended", &self.is_write_ended())
            .finish()
    }
}
