//! Per-connection session handler.
//!
//! Each accepted TCP connection gets one task running [`serve_connection`].
//! A session owns its own file-descriptor table for its entire lifetime and
//! processes requests strictly one at a time — there is no per-session
//! concurrency, so the table needs no locking.

use std::net::SocketAddr;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;

use crate::ops::{self, FdTable};
use crate::rpc::{self, RpcError, RpcResult};

/// Drive the request/response loop for one accepted connection until the
/// peer closes it or a protocol error ends the session.
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);
    let mut fds: FdTable = FdTable::new();

    loop {
        let (op_id, payload_len) = match rpc::read_header(&mut reader).await {
            Ok(header) => header,
            Err(RpcError::ConnectionClosed) => {
                eprintln!("rfsd: {peer} disconnected");
                break;
            }
            Err(e) => {
                eprintln!("rfsd: {peer} header error: {e}");
                break;
            }
        };

        let payload = match rpc::read_payload(&mut reader, payload_len).await {
            Ok(p) => p,
            Err(e) => {
                eprintln!("rfsd: {peer} payload error: {e}");
                break;
            }
        };

        let body = match dispatch(op_id, &payload, &mut fds).await {
            Ok(body) => body,
            Err(e) => {
                eprintln!("rfsd: {peer} request error: {e}");
                break;
            }
        };

        if let Err(e) = rpc::write_reply(&mut writer, &body).await {
            eprintln!("rfsd: {peer} write error: {e}");
            break;
        }
    }

    let leaked = fds.len();
    if leaked > 0 {
        eprintln!("rfsd: {peer} session ended, releasing {leaked} open descriptor(s)");
    }
    // `fds` drops here, closing any descriptor the client opened but never
    // explicitly closed.
}

/// Route a decoded request to its op executor.
async fn dispatch(op_id: u32, payload: &[u8], fds: &mut FdTable) -> RpcResult<Vec<u8>> {
    match op_id {
        rpc::OP_OPEN => ops::file::open(payload, fds).await,
        rpc::OP_CLOSE => ops::file::close(payload, fds).await,
        rpc::OP_WRITE => ops::file::write(payload, fds).await,
        rpc::OP_READ => ops::file::read(payload, fds).await,
        rpc::OP_LSEEK => ops::file::lseek(payload, fds).await,
        rpc::OP_STAT => ops::file::stat(payload).await,
        rpc::OP_UNLINK => ops::file::unlink(payload).await,
        rpc::OP_GETDIRENTRIES => ops::dir::getdirentries(payload, fds).await,
        rpc::OP_GETDIRTREE => ops::dir::getdirtree(payload).await,
        other => Err(RpcError::Protocol(format!("unknown op_id {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn request(
        stream: &mut TcpStream,
        op_id: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        stream.write_all(&op_id.to_le_bytes()).await.unwrap();
        stream
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .unwrap();
        stream.write_all(payload).await.unwrap();
        stream.flush().await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn open_write_read_close_round_trip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            serve_connection(stream, peer).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_test.txt");
        let path_str = path.to_str().unwrap();

        let mut stream = TcpStream::connect(local_addr).await.unwrap();

        // open(O_WRONLY | O_CREAT)
        let mut open_payload = Vec::new();
        let flags = libc::O_WRONLY | libc::O_CREAT;
        open_payload.extend_from_slice(&flags.to_le_bytes());
        open_payload.extend_from_slice(&0o644u32.to_le_bytes());
        open_payload.extend_from_slice(&(path_str.len() as u64).to_le_bytes());
        open_payload.extend_from_slice(path_str.as_bytes());
        let body = request(&mut stream, rpc::OP_OPEN, &open_payload).await;
        let fd = i32::from_le_bytes(body[0..4].try_into().unwrap());
        assert!(fd >= 0);

        // write
        let mut write_payload = Vec::new();
        write_payload.extend_from_slice(&fd.to_le_bytes());
        write_payload.extend_from_slice(&5u64.to_le_bytes());
        write_payload.extend_from_slice(b"howdy");
        let body = request(&mut stream, rpc::OP_WRITE, &write_payload).await;
        let n = i64::from_le_bytes(body[0..8].try_into().unwrap());
        assert_eq!(n, 5);

        // close
        let mut close_payload = Vec::new();
        close_payload.extend_from_slice(&fd.to_le_bytes());
        let body = request(&mut stream, rpc::OP_CLOSE, &close_payload).await;
        let result = i32::from_le_bytes(body[0..4].try_into().unwrap());
        assert_eq!(result, 0);

        assert_eq!(std::fs::read(&path).unwrap(), b"howdy");

        drop(stream);
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("session task timed out")
            .expect("session task panicked");
    }

    #[tokio::test]
    async fn unknown_op_id_terminates_session_without_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            serve_connection(stream, peer).await;
        });

        let mut stream = TcpStream::connect(local_addr).await.unwrap();
        stream.write_all(&99u32.to_le_bytes()).await.unwrap();
        stream.write_all(&0u32.to_le_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 1];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server should close without replying");

        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("session task timed out")
            .expect("session task panicked");
    }
}
