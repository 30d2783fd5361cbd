//! Length-prefixed binary RPC protocol.
//!
//! ## Wire format
//!
//! ```text
//! Request:
//!   ┌──────────┬──────────────┬───────────────────┐
//!   │ op_id:u32│ payload_len  │ payload            │
//!   │  (LE)    │   :u32 (LE)  │ :bytes[payload_len]│
//!   └──────────┴──────────────┴───────────────────┘
//!
//! Reply:
//!   ┌──────────┬──────────────────────────────────┐
//!   │reply_len │ result, err_code, extra…          │
//!   │ :u32 (LE)│ (op-specific — see ops::file/dir) │
//!   └──────────┴──────────────────────────────────┘
//! ```
//!
//! `reply_len` is the byte count of everything that follows it. Integers
//! are little-endian throughout — the concrete choice for "host byte
//! order," since client and server are assumed to share an x86-64 host.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Operation identifiers, matching the 0..8 range of the wire protocol.
pub const OP_OPEN: u32 = 0;
pub const OP_CLOSE: u32 = 1;
pub const OP_WRITE: u32 = 2;
pub const OP_READ: u32 = 3;
pub const OP_LSEEK: u32 = 4;
pub const OP_STAT: u32 = 5;
pub const OP_UNLINK: u32 = 6;
pub const OP_GETDIRENTRIES: u32 = 7;
pub const OP_GETDIRTREE: u32 = 8;

/// Ceiling on a declared `payload_len`, to keep a malformed or malicious
/// length prefix from driving an unbounded allocation.
const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// RPC-layer errors: framing, decoding, and protocol violations. These are
/// distinct from *operation* errors (a failed `open`, `stat`, etc.), which
/// are never represented as `RpcError` — they are captured as
/// `(result, err_code)` pairs and written straight into the reply body.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,
}

pub type RpcResult<T> = Result<T, RpcError>;

// ---------------------------------------------------------------------------
// Frame reader
// ---------------------------------------------------------------------------

/// Reads into `buf` until full, coalescing whatever fragmentation the
/// transport hands back. Returns the number of bytes actually filled,
/// which is less than `buf.len()` only on EOF.
async fn read_coalesced<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read the 8-byte request header (`op_id`, `payload_len`).
///
/// A clean EOF before any header byte arrives ends the session normally
/// (`RpcError::ConnectionClosed`); a short read partway through the header
/// is a protocol error, since it means the peer half-closed mid-frame.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> RpcResult<(u32, u32)> {
    let mut buf = [0u8; 8];
    let n = read_coalesced(reader, &mut buf).await?;
    if n == 0 {
        return Err(RpcError::ConnectionClosed);
    }
    if n < buf.len() {
        return Err(RpcError::Protocol("truncated request header".into()));
    }
    let op_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let payload_len = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    Ok((op_id, payload_len))
}

/// Read the announced `payload_len` bytes of a request payload.
pub async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    payload_len: u32,
) -> RpcResult<Vec<u8>> {
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(RpcError::Protocol(format!(
            "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_SIZE})"
        )));
    }
    let mut buf = vec![0u8; payload_len as usize];
    let n = read_coalesced(reader, &mut buf).await?;
    if n < buf.len() {
        return Err(RpcError::Protocol(format!(
            "truncated payload: declared {payload_len} bytes, got {n}"
        )));
    }
    Ok(buf)
}

/// Write a reply body, prefixed with its length.
///
/// `body` is everything that goes after `reply_len` on the wire — the op
/// executors build it directly, since its shape (result width, presence
/// of `extra`) varies per operation.
pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> RpcResult<()> {
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

/// A bounds-checked cursor over a request payload.
///
/// Every read returns `RpcError::Protocol` rather than panicking when the
/// payload is shorter than the field layout demands — a malformed payload
/// is a protocol error (session terminates silently), never a panic.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_bytes(&mut self, n: usize) -> RpcResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(RpcError::Protocol(format!(
                "truncated payload: need {n} more bytes, have {}",
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_i32(&mut self) -> RpcResult<i32> {
        Ok(i32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> RpcResult<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> RpcResult<i64> {
        Ok(i64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> RpcResult<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
