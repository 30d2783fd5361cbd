//! Directory operations: `getdirentries` and `getdirtree`.

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::FdTable;
use crate::rpc::{Cursor, RpcResult};

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// `getdirentries(fd, nbyte, basep)` — a single raw `getdirentries(2)`
/// call against an already-open directory descriptor. The updated
/// `basep` the kernel writes back is read but not returned to the
/// client — a known limitation carried over unchanged.
pub async fn getdirentries(payload: &[u8], fds: &mut FdTable) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let fd = cur.read_i32()?;
    let nbyte = cur.read_u64()? as usize;
    let basep = cur.read_i64()?;

    let (result, errno, buf) = match fds.get(&fd) {
        Some(file) => {
            let raw_fd = file.as_raw_fd();
            tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; nbyte];
                let mut basep_val: libc::off_t = basep as libc::off_t;
                let ret = unsafe {
                    libc::getdirentries(
                        raw_fd,
                        buf.as_mut_ptr() as *mut libc::c_char,
                        nbyte,
                        &mut basep_val,
                    )
                };
                let errno = if ret < 0 { last_errno() } else { 0 };
                (ret as i64, errno, buf)
            })
            .await
            .expect("getdirentries: blocking task panicked")
        }
        None => (-1i64, libc::EBADF, Vec::new()),
    };

    let n = result.max(0) as usize;
    let mut body = Vec::with_capacity(12 + n);
    body.extend_from_slice(&result.to_le_bytes());
    body.extend_from_slice(&errno.to_le_bytes());
    body.extend_from_slice(&buf[..n.min(buf.len())]);
    Ok(body)
}

/// One node of a serialized directory tree: a name and its children.
/// Both plain files and subdirectories become nodes — a file is simply a
/// node with zero children.
struct TreeNode {
    name: Vec<u8>,
    children: Vec<TreeNode>,
}

fn file_name_bytes(path: &Path) -> Vec<u8> {
    path.file_name()
        .map(|n| n.as_bytes().to_vec())
        .unwrap_or_else(|| path.as_os_str().as_bytes().to_vec())
}

/// Builds the tree rooted at `root` iteratively, with an explicit stack
/// standing in for the call stack a recursive walk would use — this is
/// what keeps an unusually deep directory tree from blowing the stack.
fn build_tree(root: &Path) -> std::io::Result<TreeNode> {
    let root_meta = std::fs::symlink_metadata(root)?;
    let mut root_node = TreeNode {
        name: file_name_bytes(root),
        children: Vec::new(),
    };
    if !root_meta.is_dir() {
        return Ok(root_node);
    }

    // Each stack frame is a directory node still being populated, plus the
    // queue of its own entries not yet visited.
    struct Frame {
        node: TreeNode,
        pending: VecDeque<PathBuf>,
    }

    let mut frames = vec![Frame {
        node: TreeNode {
            name: root_node.name.clone(),
            children: Vec::new(),
        },
        pending: read_dir_entries(root)?,
    }];

    loop {
        let top = frames.last_mut().unwrap();
        match top.pending.pop_front() {
            Some(entry_path) => {
                let meta = std::fs::symlink_metadata(&entry_path)?;
                if meta.is_dir() && !meta.is_symlink() {
                    let pending = read_dir_entries(&entry_path)?;
                    frames.push(Frame {
                        node: TreeNode {
                            name: file_name_bytes(&entry_path),
                            children: Vec::new(),
                        },
                        pending,
                    });
                } else {
                    top.node.children.push(TreeNode {
                        name: file_name_bytes(&entry_path),
                        children: Vec::new(),
                    });
                }
            }
            None => {
                let finished = frames.pop().unwrap().node;
                match frames.last_mut() {
                    Some(parent) => parent.node.children.push(finished),
                    None => {
                        root_node = finished;
                        break;
                    }
                }
            }
        }
    }

    Ok(root_node)
}

fn read_dir_entries(dir: &Path) -> std::io::Result<VecDeque<PathBuf>> {
    let mut entries = VecDeque::new();
    for entry in std::fs::read_dir(dir)? {
        entries.push_back(entry?.path());
    }
    Ok(entries)
}

/// Serializes the tree in preorder (`name_len, child_count, name`,
/// followed immediately by each child's own serialization), using an
/// explicit stack rather than recursion for the same reason `build_tree`
/// does.
fn serialize_tree(root: &TreeNode) -> Vec<u8> {
    let mut out = Vec::new();
    let mut stack: Vec<(&TreeNode, usize)> = vec![(root, 0)];

    fn write_header(out: &mut Vec<u8>, node: &TreeNode) {
        out.extend_from_slice(&(node.name.len() as i32).to_le_bytes());
        out.extend_from_slice(&(node.children.len() as i32).to_le_bytes());
        out.extend_from_slice(&node.name);
    }

    write_header(&mut out, root);

    while let Some((node, next_child)) = stack.pop() {
        if next_child < node.children.len() {
            stack.push((node, next_child + 1));
            let child = &node.children[next_child];
            write_header(&mut out, child);
            stack.push((child, 0));
        }
    }

    out
}

/// `getdirtree(path)` — builds and serializes the whole tree rooted at
/// `path` in one round trip.
pub async fn getdirtree(payload: &[u8]) -> RpcResult<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let path_len = cur.read_i32()? as usize;
    let path_bytes = cur.read_bytes(path_len)?.to_vec();
    let _ = CString::new(path_bytes.clone())
        .map_err(|_| crate::rpc::RpcError::Protocol("path contains an interior NUL byte".into()))?;
    let path = PathBuf::from(std::ffi::OsStr::from_bytes(&path_bytes));

    let outcome = tokio::task::spawn_blocking(move || match build_tree(&path) {
        Ok(tree) => Ok(serialize_tree(&tree)),
        Err(e) => Err(e.raw_os_error().unwrap_or(0)),
    })
    .await
    .expect("getdirtree: blocking task panicked");

    let mut body = Vec::new();
    match outcome {
        Ok(serialized) => {
            body.extend_from_slice(&0i32.to_le_bytes());
            body.extend_from_slice(&(serialized.len() as i64).to_le_bytes());
            body.extend_from_slice(&0i32.to_le_bytes());
            body.extend_from_slice(&serialized);
            body.push(0);
        }
        Err(errno) => {
            body.extend_from_slice(&1i32.to_le_bytes());
            body.extend_from_slice(&errno.to_le_bytes());
        }
    }
    Ok(body)
}
