//! multiplexed TCP transport based on coroutines
//!
//! the general communication procedure is as below
//! 1. client send request frame to server, id is the client side waiter token
//! 2. server decode the `ProcedureCall` from the request and queue it on a worker
//! 3. server send out the response frame with the same id
//! 4. client listener coroutine wakes up the waiter of that id
//!
//! streams are sequences of data frames in both directions sharing one stream id, each side ends
//! its half with an end frame. The server may end a stream with an error frame instead.
use may::sync::mpsc;

use crate::errors::TransportError;

pub use client::{TcpChannel, TcpConnector};
pub use frame::{FrameType, FRAME_MAX_LEN};
pub use server::TcpEndpoint;

mod client;
/// raw frame protocol
mod frame;
mod queued_writer;
/// Provides server framework
mod server;

type FrameSender = mpsc::Sender<Result<Vec<u8>, TransportError>>;

/// inbound half of a stream, fed by a connection reader coroutine
struct RoutedFrames {
    rx: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
    done: bool,
}

impl RoutedFrames {
    fn new() -> (FrameSender, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, RoutedFrames { rx, done: false })
    }
}

impl Iterator for RoutedFrames {
    type Item = Result<Vec<u8>, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Ok(frame)) => Some(Ok(frame)),
            Ok(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            // the reader dropped the sender on the end frame
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}
