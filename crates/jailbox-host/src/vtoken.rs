//! Host-hosted virtual descriptor table (spec.md §4.4 step 7, §4.5).
//!
//! Backs `sb.open`/`sb.read`/`sb.write`/`sb.close`/`sb.stat` for nodes the
//! Broker's resolver decided have no real host path of their own, either
//! a PROXY-resolved leaf or an explicitly virtual (`real_path: None`)
//! `VNodeDesc`. Every such node is, in this Host implementation, backed by
//! a real file somewhere under a private "virtual store" directory; the
//! Jail never learns that path, only the opaque token.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use jailbox_shared::{JailboxError, JailboxResult};

/// Translates a subset of POSIX `open(2)` flags into `OpenOptions`. Only
/// the bits the virtual store needs to honor are interpreted; anything
/// else (e.g. `O_DIRECT`) is silently ignored, matching the Broker's own
/// "policy decides write/create/exclusive intent; the rest doesn't reach
/// a real open" posture for virtual nodes.
fn open_options_for(flags: i32, mode: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    let accmode = flags & libc::O_ACCMODE;
    opts.read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR);
    opts.write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR);
    if flags & libc::O_CREAT != 0 {
        opts.create(true);
        opts.mode(mode as u32);
    }
    if flags & libc::O_EXCL != 0 {
        opts.create_new(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    opts
}

struct VirtualFile {
    file: File,
}

/// Monotonically allocates positive tokens; the Broker stores each as
/// `-(token + 1)` so a virtual fd is distinguishable from a real one by
/// sign (spec.md §4.4).
pub struct VirtualFdTable {
    root: PathBuf,
    next_token: AtomicI64,
    open: Mutex<HashMap<i64, VirtualFile>>,
}

impl VirtualFdTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_token: AtomicI64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Maps a jailed virtual path onto a path under the store root. The
    /// leading `/` is stripped so `Path::join` can't escape `root` via an
    /// absolute override, and `..` components are rejected outright.
    fn store_path(&self, virtual_path: &str) -> JailboxResult<PathBuf> {
        let relative = virtual_path.trim_start_matches('/');
        if relative.split('/').any(|c| c == "..") {
            return Err(JailboxError::PolicyDenied {
                errno: libc::EACCES,
                reason: "virtual path must not contain `..`".into(),
            });
        }
        Ok(self.root.join(relative))
    }

    pub fn open(&self, virtual_path: &str, flags: i32, mode: i32) -> JailboxResult<i64> {
        let path = self.store_path(virtual_path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| JailboxError::Internal(format!("virtual store mkdir failed: {e}")))?;
        }
        let file = open_options_for(flags, mode)
            .open(&path)
            .map_err(|e| map_open_error(&e))?;

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.open.lock().unwrap().insert(token, VirtualFile { file });
        Ok(token)
    }

    pub fn read(&self, token: i64, len: usize) -> JailboxResult<Vec<u8>> {
        let mut open = self.open.lock().unwrap();
        let entry = open.get_mut(&token).ok_or_else(|| bad_token(token))?;
        let mut buf = vec![0u8; len];
        let n = entry
            .file
            .read(&mut buf)
            .map_err(|e| JailboxError::Internal(format!("virtual read failed: {e}")))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, token: i64, bytes: &[u8]) -> JailboxResult<i64> {
        let mut open = self.open.lock().unwrap();
        let entry = open.get_mut(&token).ok_or_else(|| bad_token(token))?;
        let n = entry
            .file
            .write(bytes)
            .map_err(|e| JailboxError::Internal(format!("virtual write failed: {e}")))?;
        Ok(n as i64)
    }

    pub fn stat(&self, token: i64) -> JailboxResult<(u64, u32, i64)> {
        let open = self.open.lock().unwrap();
        let entry = open.get(&token).ok_or_else(|| bad_token(token))?;
        let meta = entry
            .file
            .metadata()
            .map_err(|e| JailboxError::Internal(format!("virtual stat failed: {e}")))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok((meta.len(), mode_bits(&meta), mtime))
    }

    pub fn close(&self, token: i64) -> JailboxResult<()> {
        self.open
            .lock()
            .unwrap()
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| bad_token(token))
    }

    pub fn lseek(&self, token: i64, offset: i64, whence: i32) -> JailboxResult<i64> {
        let mut open = self.open.lock().unwrap();
        let entry = open.get_mut(&token).ok_or_else(|| bad_token(token))?;
        let pos = match whence {
            libc::SEEK_SET => SeekFrom::Start(offset.max(0) as u64),
            libc::SEEK_CUR => SeekFrom::Current(offset),
            libc::SEEK_END => SeekFrom::End(offset),
            _ => return Err(JailboxError::PolicyDenied { errno: libc::EINVAL, reason: "unknown whence".into() }),
        };
        entry
            .file
            .seek(pos)
            .map(|p| p as i64)
            .map_err(|e| JailboxError::Internal(format!("virtual lseek failed: {e}")))
    }

    pub fn ensure_dir(&self, virtual_path: &str) -> JailboxResult<()> {
        let path = self.store_path(virtual_path)?;
        std::fs::create_dir_all(&path).map_err(|e| JailboxError::Internal(format!("virtual mkdir failed: {e}")))
    }

    pub fn remove_file(&self, virtual_path: &str) -> JailboxResult<()> {
        let path = self.store_path(virtual_path)?;
        std::fs::remove_file(&path).map_err(|e| map_open_error(&e))
    }

    pub fn remove_dir(&self, virtual_path: &str) -> JailboxResult<()> {
        let path = self.store_path(virtual_path)?;
        std::fs::remove_dir(&path).map_err(|e| map_open_error(&e))
    }

    pub fn rename(&self, from: &str, to: &str) -> JailboxResult<()> {
        let from = self.store_path(from)?;
        let to = self.store_path(to)?;
        std::fs::rename(&from, &to).map_err(|e| map_open_error(&e))
    }

    /// Whether a node at this virtual path already exists in the store, and
    /// if so, whether it's a directory. Used by [`crate::rpc_server`] to
    /// answer `sb.getnode` for PROXY subtrees.
    pub fn lookup(&self, virtual_path: &str) -> JailboxResult<Option<(PathBuf, bool)>> {
        let path = self.store_path(virtual_path)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some((path, meta.is_dir()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(JailboxError::Internal(format!("virtual store metadata failed: {e}"))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn bad_token(token: i64) -> JailboxError {
    JailboxError::Fd(format!("no open virtual descriptor for token {token}"))
}

fn map_open_error(e: &std::io::Error) -> JailboxError {
    let errno = e.raw_os_error().unwrap_or(libc::EIO);
    JailboxError::PolicyDenied { errno, reason: e.to_string() }
}

fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_write_read_round_trips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let table = VirtualFdTable::new(dir.path());

        let token = table.open("/greeting.txt", libc::O_CREAT | libc::O_RDWR, 0o600).unwrap();
        table.write(token, b"hello").unwrap();
        table.lseek(token, 0, libc::SEEK_SET).unwrap();
        let data = table.read(token, 16).unwrap();
        assert_eq!(data, b"hello");
        table.close(token).unwrap();
    }

    #[test]
    fn read_on_unknown_token_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let table = VirtualFdTable::new(dir.path());
        assert!(table.read(999, 10).is_err());
    }

    #[test]
    fn store_path_rejects_dotdot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let table = VirtualFdTable::new(dir.path());
        assert!(table.open("/../escape.txt", libc::O_CREAT | libc::O_RDWR, 0o600).is_err());
    }

    #[test]
    fn lookup_reports_directory_vs_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = VirtualFdTable::new(dir.path());
        table.ensure_dir("/pkg").unwrap();
        let token = table.open("/pkg/mod.py", libc::O_CREAT | libc::O_WRONLY, 0o600).unwrap();
        table.close(token).unwrap();

        let (_, is_dir) = table.lookup("/pkg").unwrap().unwrap();
        assert!(is_dir);
        let (_, is_dir) = table.lookup("/pkg/mod.py").unwrap().unwrap();
        assert!(!is_dir);
        assert!(table.lookup("/pkg/missing.py").unwrap().is_none());
    }
}
