//! Wire serialization for job requests and responses
//!
//! Frames are a 4-byte big-endian length prefix followed by exactly one
//! JSON document, so a reader always knows where a message ends without
//! lookahead. The transport is supplied as two narrow capabilities, a
//! `read` and a `write` closure, which lets the same codec run over
//! stdin/stdout, anonymous pipes, or a unix socket unchanged.
//!
//! Batch mode only ever emits responses, so a batch `Serdes` carries no
//! read capability; daemon mode carries both.

use crate::message::{Request, Response};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use thiserror::Error;
use tracing::trace;

/// Upper bound on one inbound frame; a larger prefix means the request
/// stream is garbage. Outbound frames are unbounded: a decoded 4K frame
/// legitimately serializes to well over this.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub type ReadFn = Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>;
pub type WriteFn = Box<dyn FnMut(&[u8]) -> io::Result<usize> + Send>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("peer closed the stream")]
    EndOfStream,

    #[error("stream ended inside a frame")]
    Truncated,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),

    #[error("transport has no read capability")]
    NotReadable,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Clean end of input, as opposed to a mid-stream failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, WireError::EndOfStream)
    }
}

/// Message codec bound to one transport
pub struct Serdes {
    read: Option<ReadFn>,
    write: WriteFn,
}

impl Serdes {
    /// Write-only codec for batch mode.
    pub fn batch(write: WriteFn) -> Self {
        Self { read: None, write }
    }

    /// Bidirectional codec for daemon mode.
    pub fn daemon(read: ReadFn, write: WriteFn) -> Self {
        Self {
            read: Some(read),
            write,
        }
    }

    /// Write one complete, self-delimited response frame. Responses of any
    /// size are written; only inbound frames are capped.
    pub fn write_response(&mut self, response: &Response) -> Result<(), WireError> {
        let body = serde_json::to_vec(response)?;
        if body.len() > u32::MAX as usize {
            // The length prefix cannot represent it.
            return Err(WireError::FrameTooLarge(body.len()));
        }
        trace!(bytes = body.len(), kind = ?response.kind, "writing response frame");
        let prefix = (body.len() as u32).to_be_bytes();
        write_all(&mut self.write, &prefix)?;
        write_all(&mut self.write, &body)?;
        Ok(())
    }

    /// Block until one complete request frame has been read.
    ///
    /// Returns `WireError::EndOfStream` when the peer closes between
    /// frames; a close inside a frame is `Truncated`.
    pub fn read_request(&mut self) -> Result<Request, WireError> {
        let read = self.read.as_mut().ok_or(WireError::NotReadable)?;

        let mut prefix = [0u8; 4];
        match read_full(read, &mut prefix)? {
            0 => return Err(WireError::EndOfStream),
            4 => {}
            _ => return Err(WireError::Truncated),
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            return Err(WireError::Protocol("zero-length frame"));
        }
        if len > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        if read_full(read, &mut body)? != len {
            return Err(WireError::Truncated);
        }

        trace!(bytes = len, "read request frame");
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Fill `buf` as far as the source allows; returns bytes read (< buf.len()
/// only at end of stream).
fn read_full(read: &mut ReadFn, buf: &mut [u8]) -> Result<usize, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(filled)
}

/// Push every byte to the sink, retrying partial writes.
fn write_all(write: &mut WriteFn, mut buf: &[u8]) -> Result<(), WireError> {
    while !buf.is_empty() {
        match write(buf) {
            Ok(0) => {
                return Err(WireError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink accepted no bytes",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(())
}

/// Read capability over this process's stdin.
pub fn stdin_read() -> ReadFn {
    let stdin = io::stdin();
    Box::new(move |buf| stdin.lock().read(buf))
}

/// Write capability over this process's stdout.
pub fn stdout_write() -> WriteFn {
    let stdout = io::stdout();
    Box::new(move |buf| {
        let mut lock = stdout.lock();
        let n = lock.write(buf)?;
        lock.flush()?;
        Ok(n)
    })
}

/// Read/write capabilities over a unix socket connection.
pub fn unix_socket_transport(path: &Path) -> io::Result<(ReadFn, WriteFn)> {
    let stream = UnixStream::connect(path)?;
    let mut reader = stream.try_clone()?;
    let mut writer = stream;
    Ok((
        Box::new(move |buf| reader.read(buf)),
        Box::new(move |buf| writer.write(buf)),
    ))
}
