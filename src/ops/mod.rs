//! RPC operation handlers for the filesystem server.
//!
//! Each submodule implements one category of the nine wire operations:
//!
//! | Module | Operations |
//! |---|---|
//! | `file` | `open`, `close`, `write`, `read`, `lseek`, `stat`, `unlink` |
//! | `dir`  | `getdirentries`, `getdirtree` |
//!
//! Both modules share the session's file-descriptor table — the only path
//! by which a client-supplied `fd` resolves back to an open file, which is
//! what keeps one session from ever touching another session's descriptors.

use std::collections::HashMap;
use std::fs::File;

pub mod dir;
pub mod file;

/// A session's open files, keyed by the real OS descriptor number.
///
/// Holds a plain `std::fs::File` purely as the fd's owner — every actual
/// read/write/seek against it goes through a raw `libc` call on its
/// `as_raw_fd()`, never through `File`'s own (buffering, deferred-error)
/// I/O methods, so the kernel file offset and `errno` are never touched
/// by anything but the syscall the client asked for.
///
/// Owned exclusively by one `session::serve_connection` task — requests
/// within a session are handled strictly one at a time (§5), so this
/// needs no internal locking.
pub type FdTable = HashMap<i32, File>;
