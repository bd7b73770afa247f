use std::io::{self, Cursor, ErrorKind, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};

use crate::errors::TransportError;
use crate::procedure::ProcedureCall;

// Frame layout
// id(u64) + ty(u8) + len(u64) + payload([u8; len])

// req frame payload
// bincode(ProcedureCall)

// rsp error / stream error payload
// utf-8 message

const HEAD_LEN: usize = 17;

// max frame len
pub const FRAME_MAX_LEN: u64 = 1024 * 1024 * 1024;

/// what a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// unary call, id is the caller's waiter token
    Request = 0,
    /// unary reply
    Response = 1,
    /// unary failure
    ResponseError = 2,
    /// one frame of a stream, in either direction
    StreamData = 3,
    /// the sender of this frame finished writing the stream
    StreamEnd = 4,
    /// the stream failed on the server side
    StreamError = 5,
}

impl FrameType {
    fn from_u8(ty: u8) -> Option<Self> {
        use FrameType::*;
        Some(match ty {
            0 => Request,
            1 => Response,
            2 => ResponseError,
            3 => StreamData,
            4 => StreamEnd,
            5 => StreamError,
            _ => return None,
        })
    }
}

/// raw frame wrapper, low level protocol
#[derive(Debug)]
pub struct Frame {
    /// frame id, req and rsp has the same id
    pub id: u64,
    /// frame type
    pub ty: FrameType,
    /// payload data
    data: Bytes,
}

impl Frame {
    /// decode a frame from the reader
    pub fn decode_from<R: Read>(r: &mut R, buf: &mut BytesMut) -> io::Result<Self> {
        let id = r.read_u64::<BigEndian>()?;
        let ty = r.read_u8()?;
        let len = r.read_u64::<BigEndian>()?;
        info!("decode id={id:?} ty={ty} len={len}");

        if len > FRAME_MAX_LEN {
            let s = format!("decode too big frame length. len={len}");
            error!("{s}");
            return Err(io::Error::new(ErrorKind::InvalidInput, s));
        }

        let Some(ty) = FrameType::from_u8(ty) else {
            let s = format!("invalid frame type. ty={ty}");
            error!("{s}");
            return Err(io::Error::new(ErrorKind::InvalidData, s));
        };

        buf.clear();
        buf.resize(len as usize, 0);
        r.read_exact(&mut buf[..])?;
        let data = buf.split().freeze();

        Ok(Frame { id, ty, data })
    }

    /// the frame payload
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// decode a request from the frame
    pub fn decode_req(&self) -> Result<ProcedureCall, TransportError> {
        bincode::deserialize(&self.data)
            .map_err(|e| TransportError::protocol(format!("bad request: {e}")))
    }

    /// decode a response from the frame
    pub fn decode_rsp(&self) -> Result<Vec<u8>, TransportError> {
        match self.ty {
            FrameType::Response => Ok(self.data.to_vec()),
            FrameType::ResponseError => Err(TransportError::remote(self.message())),
            ty => {
                let s = format!("invalid response type. ty={ty:?}");
                error!("{s}");
                Err(TransportError::protocol(s))
            }
        }
    }

    /// the payload of an error frame
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// frame buffer that can be serialized into
pub struct FrameBuf(Cursor<Vec<u8>>);

impl Default for FrameBuf {
    fn default() -> Self {
        FrameBuf::new()
    }
}

impl FrameBuf {
    /// crate a new `FrameBuf` instance
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.resize(HEAD_LEN, 0);
        let mut cursor = Cursor::new(buf);
        // leave enough space to write id, ty and len
        cursor.set_position(HEAD_LEN as u64);
        FrameBuf(cursor)
    }

    /// convert self into raw buf that can be send as a frame
    pub fn finish(self, id: u64, ty: FrameType) -> io::Result<Vec<u8>> {
        let mut cursor = self.0;
        let len = (cursor.get_ref().len() - HEAD_LEN) as u64;
        if len > FRAME_MAX_LEN {
            let s = format!("encode too big frame length. len={len}");
            error!("{s}");
            return Err(io::Error::new(ErrorKind::InvalidInput, s));
        }

        // write from start
        cursor.set_position(0);
        cursor.write_u64::<BigEndian>(id)?;
        cursor.write_u8(ty as u8)?;
        cursor.write_u64::<BigEndian>(len)?;
        info!("encode id={id:?} ty={ty:?} len={len}");

        Ok(cursor.into_inner())
    }
}

impl Write for FrameBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// encode a frame with a raw payload
pub fn encode(id: u64, ty: FrameType, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = FrameBuf::new();
    buf.write_all(payload)?;
    buf.finish(id, ty)
}

/// encode a request frame
pub fn encode_req(id: u64, call: &ProcedureCall) -> io::Result<Vec<u8>> {
    let mut buf = FrameBuf::new();
    bincode::serialize_into(&mut buf, call)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e.to_string()))?;
    buf.finish(id, FrameType::Request)
}
