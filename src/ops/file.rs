//! File-descriptor-based and path-based file operations.
//!
//! Every operation here is a thin wrapper around the matching raw `libc`
//! syscall, run inside `spawn_blocking`. None of them go through
//! `std::fs`/`tokio::fs` for the actual I/O — only raw syscalls reproduce
//! a local call's flags, return value, and `errno` bit-for-bit.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use super::FdTable;
use crate::rpc::{Cursor, RpcResult};

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn cstring_path(bytes: &[u8]) -> RpcResult<CString> {
    CString::new(bytes).map_err(|_| {
        crate::rpc::RpcError::Protocol("path contains an interior NUL byte".into())
    })
}

/// `open(path, flags, mode)` — returns the real fd to the client and, on
/// success, files it under that fd in the session's table.
pub async fn open(payload: &[u8], fds: &mut FdTable) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let flags = cur.read_i32()?;
    let mode = cur.read_u32()?;
    let path_len = cur.read_u64()? as usize;
    let path = cur.read_bytes(path_len)?.to_vec();
    let cpath = cstring_path(&path)?;

    let (fd, errno) = tokio::task::spawn_blocking(move || {
        let ret = unsafe { libc::open(cpath.as_ptr(), flags, mode as libc::c_uint) };
        let errno = if ret < 0 { last_errno() } else { 0 };
        (ret, errno)
    })
    .await
    .expect("open: blocking task panicked");

    if fd >= 0 {
        fds.insert(fd, unsafe { std::fs::File::from_raw_fd(fd) });
    }

    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&fd.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    Ok(body)
}

/// `close(fd)` — removes the descriptor from the session's table and
/// performs the real `close(2)` so the caller sees its genuine result.
pub async fn close(payload: &[u8], fds: &mut FdTable) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let fd = cur.read_i32()?;

    let (result, errno) = match fds.remove(&fd) {
        Some(file) => {
            // `into_raw_fd` hands the descriptor to the syscall below
            // without running `File`'s own `close`-on-drop.
            let raw_fd = file.into_raw_fd();
            tokio::task::spawn_blocking(move || {
                let ret = unsafe { libc::close(raw_fd) };
                let errno = if ret < 0 { last_errno() } else { 0 };
                (ret, errno)
            })
            .await
            .expect("close: blocking task panicked")
        }
        None => (-1, libc::EBADF),
    };

    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&result.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    Ok(body)
}

/// `read(fd, nbyte)` — a raw `read(2)` on the session's descriptor, so
/// short reads and `errno` are surfaced to the client exactly as a local
/// call would surface them. Deliberately bypasses `tokio::fs::File`'s own
/// `read`/`write`: its `poll_write` in particular returns success as soon
/// as the bytes are copied into its internal buffer, before the real
/// `write(2)` has even run, which would let a failing write report
/// `result=nbyte, err_code=0` here. Raw syscalls keep every fd operation
/// on one consistent kernel offset with nothing buffered in between.
pub async fn read(payload: &[u8], fds: &mut FdTable) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let fd = cur.read_i32()?;
    let nbyte = cur.read_u64()? as usize;

    let (result, errno, data) = match fds.get(&fd) {
        Some(file) => {
            let raw_fd = file.as_raw_fd();
            tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; nbyte];
                let ret =
                    unsafe { libc::read(raw_fd, buf.as_mut_ptr() as *mut libc::c_void, nbyte) };
                if ret >= 0 {
                    buf.truncate(ret as usize);
                    (ret as i64, 0, buf)
                } else {
                    (ret as i64, last_errno(), Vec::new())
                }
            })
            .await
            .expect("read: blocking task panicked")
        }
        None => (-1i64, libc::EBADF, Vec::new()),
    };

    let mut body = Vec::with_capacity(12 + data.len());
    body.extend_from_slice(&result.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    if result >= 0 {
        body.extend_from_slice(&data);
    }
    Ok(body)
}

/// `write(fd, nbyte, data)` — a raw `write(2)`; partial writes are
/// possible and are reported verbatim, not retried. See [`read`] for why
/// this doesn't go through `tokio::fs::File`.
pub async fn write(payload: &[u8], fds: &mut FdTable) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let fd = cur.read_i32()?;
    let nbyte = cur.read_u64()? as usize;
    let data = cur.read_bytes(nbyte)?.to_vec();

    let (result, errno) = match fds.get(&fd) {
        Some(file) => {
            let raw_fd = file.as_raw_fd();
            tokio::task::spawn_blocking(move || {
                let ret = unsafe {
                    libc::write(raw_fd, data.as_ptr() as *const libc::c_void, data.len())
                };
                let errno = if ret < 0 { last_errno() } else { 0 };
                (ret as i64, errno)
            })
            .await
            .expect("write: blocking task panicked")
        }
        None => (-1i64, libc::EBADF),
    };

    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&result.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    Ok(body)
}

/// `lseek(fd, offset, whence)` — calls the raw syscall directly (rather
/// than `SeekFrom`) so an invalid `whence` surfaces the same `EINVAL` a
/// local caller would see.
pub async fn lseek(payload: &[u8], fds: &mut FdTable) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let fd = cur.read_i32()?;
    let offset = cur.read_i64()?;
    let whence = cur.read_i32()?;

    let (result, errno) = match fds.get(&fd) {
        Some(file) => {
            let raw_fd = file.as_raw_fd();
            tokio::task::spawn_blocking(move || {
                let ret = unsafe { libc::lseek(raw_fd, offset, whence) };
                let errno = if ret < 0 { last_errno() } else { 0 };
                (ret, errno)
            })
            .await
            .expect("lseek: blocking task panicked")
        }
        None => (-1i64, libc::EBADF),
    };

    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&result.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    Ok(body)
}

/// `stat(path)` — the raw `struct stat` is always appended to the reply,
/// whether or not the call succeeded, matching the original server.
pub async fn stat(payload: &[u8]) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let path_len = cur.read_i32()? as usize;
    let path = cur.read_bytes(path_len)?.to_vec();
    let cpath = cstring_path(&path)?;

    let (result, errno, statbuf) = tokio::task::spawn_blocking(move || {
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::stat(cpath.as_ptr(), &mut statbuf) };
        let errno = if ret < 0 { last_errno() } else { 0 };
        (ret, errno, statbuf)
    })
    .await
    .expect("stat: blocking task panicked");

    let raw_statbuf = unsafe {
        std::slice::from_raw_parts(
            &statbuf as *const libc::stat as *const u8,
            std::mem::size_of::<libc::stat>(),
        )
    };

    let mut body = Vec::with_capacity(8 + raw_statbuf.len());
    body.extend_from_slice(&result.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    body.extend_from_slice(raw_statbuf);
    Ok(body)
}

/// `unlink(path)`.
pub async fn unlink(payload: &[u8]) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let path_len = cur.read_i32()? as usize;
    let path = cur.read_bytes(path_len)?.to_vec();
    let cpath = cstring_path(&path)?;

    let (result, errno) = tokio::task::spawn_blocking(move || {
        let ret = unsafe { libc::unlink(cpath.as_ptr()) };
        let errno = if ret < 0 { last_errno() } else { 0 };
        (ret, errno)
    })
    .await
    .expect("unlink: blocking task panicked");

    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&result.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn open_payload(path: &str, flags: i32, mode: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&mode.to_le_bytes());
        buf.extend_from_slice(&(path.len() as u64).to_le_bytes());
        buf.extend_from_slice(path.as_bytes());
        buf
    }

    fn decode_i32_i32(body: &[u8]) -> (i32, i32) {
        (
            i32::from_le_bytes(body[0..4].try_into().unwrap()),
            i32::from_le_bytes(body[4..8].try_into().unwrap()),
        )
    }

    #[tokio::test]
    async fn open_then_read_round_trips_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeting.txt");
        std::fs::write(&path, b"hello rfsd").unwrap();

        let mut fds = FdTable::new();
        let payload = open_payload(path.to_str().unwrap(), libc::O_RDONLY, 0);
        let body = open(&payload, &mut fds).await.unwrap();
        let fd = i32::from_le_bytes(body[0..4].try_into().unwrap());
        assert!(fd >= 0);
        assert!(fds.contains_key(&fd));

        let mut read_payload_buf = Vec::new();
        read_payload_buf.extend_from_slice(&fd.to_le_bytes());
        read_payload_buf.extend_from_slice(&64u64.to_le_bytes());
        let body = read(&read_payload_buf, &mut fds).await.unwrap();
        let n = i64::from_le_bytes(body[0..8].try_into().unwrap());
        assert_eq!(n, 10);
        assert_eq!(&body[12..12 + 10], b"hello rfsd");
    }

    #[tokio::test]
    async fn open_missing_file_reports_enoent() {
        let mut fds = FdTable::new();
        let payload = open_payload("/nonexistent/path/does/not/exist", libc::O_RDONLY, 0);
        let body = open(&payload, &mut fds).await.unwrap();
        let (fd, errno) = decode_i32_i32(&body);
        assert_eq!(fd, -1);
        assert_eq!(errno, libc::ENOENT);
    }

    #[tokio::test]
    async fn close_unknown_fd_is_ebadf() {
        let mut fds = FdTable::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&999i32.to_le_bytes());
        let body = close(&payload, &mut fds).await.unwrap();
        let (result, errno) = decode_i32_i32(&body);
        assert_eq!(result, -1);
        assert_eq!(errno, libc::EBADF);
    }

    #[tokio::test]
    async fn close_removes_descriptor_from_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"x").unwrap();

        let mut fds = FdTable::new();
        let open_body = open(&open_payload(path.to_str().unwrap(), libc::O_RDONLY, 0), &mut fds)
            .await
            .unwrap();
        let fd = i32::from_le_bytes(open_body[0..4].try_into().unwrap());

        let mut close_payload = Vec::new();
        close_payload.extend_from_slice(&fd.to_le_bytes());
        let close_body = close(&close_payload, &mut fds).await.unwrap();
        let (result, _) = decode_i32_i32(&close_body);
        assert_eq!(result, 0);
        assert!(!fds.contains_key(&fd));
    }

    #[tokio::test]
    async fn write_then_stat_reflects_new_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut fds = FdTable::new();
        let open_body = open(
            &open_payload(path.to_str().unwrap(), libc::O_WRONLY | libc::O_CREAT, 0o644),
            &mut fds,
        )
        .await
        .unwrap();
        let fd = i32::from_le_bytes(open_body[0..4].try_into().unwrap());

        let mut write_payload_buf = Vec::new();
        write_payload_buf.extend_from_slice(&fd.to_le_bytes());
        write_payload_buf.extend_from_slice(&5u64.to_le_bytes());
        write_payload_buf.extend_from_slice(b"abcde");
        let body = write(&write_payload_buf, &mut fds).await.unwrap();
        let n = i64::from_le_bytes(body[0..8].try_into().unwrap());
        assert_eq!(n, 5);

        let mut stat_payload = Vec::new();
        let path_str = path.to_str().unwrap();
        stat_payload.extend_from_slice(&(path_str.len() as i32).to_le_bytes());
        stat_payload.extend_from_slice(path_str.as_bytes());
        let stat_body = stat(&stat_payload).await.unwrap();
        let (result, _errno) = decode_i32_i32(&stat_body);
        assert_eq!(result, 0);
        let statbuf_bytes = &stat_body[8..];
        assert_eq!(statbuf_bytes.len(), std::mem::size_of::<libc::stat>());
        let statbuf: libc::stat =
            unsafe { std::ptr::read_unaligned(statbuf_bytes.as_ptr() as *const libc::stat) };
        assert_eq!(statbuf.st_size, 5);
    }

    #[tokio::test]
    async fn lseek_unknown_fd_is_ebadf() {
        let mut fds = FdTable::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&42i32.to_le_bytes());
        payload.extend_from_slice(&0i64.to_le_bytes());
        payload.extend_from_slice(&(libc::SEEK_SET).to_le_bytes());
        let body = lseek(&payload, &mut fds).await.unwrap();
        let result = i64::from_le_bytes(body[0..8].try_into().unwrap());
        let errno = i32::from_le_bytes(body[8..12].try_into().unwrap());
        assert_eq!(result, -1);
        assert_eq!(errno, libc::EBADF);
    }

    #[tokio::test]
    async fn unlink_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("to_remove.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"bye").unwrap();

        let path_str = path.to_str().unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&(path_str.len() as i32).to_le_bytes());
        payload.extend_from_slice(path_str.as_bytes());
        let body = unlink(&payload).await.unwrap();
        let (result, _) = decode_i32_i32(&body);
        assert_eq!(result, 0);
        assert!(!path.exists());
    }
}
