//! JSON-RPC client half of the Broker → Host promotion (spec.md §4.5, §6).
//!
//! Line-delimited JSON-RPC 2.0 over the two descriptors the Host pre-opened
//! before spawning this process (`IN`/`OUT`; spec.md §2 step 1). One request
//! is ever in flight at a time (spec.md §5: "each RPC fully completes before
//! the next begins on that channel"), so correlation by id is a sanity check
//! rather than a pipelining necessity.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use jailbox_shared::vfs_desc::VfsDesc;
use jailbox_shared::wire::{JsonRpcRequest, JsonRpcResponse, JsonRpcResult, Namespace};
use jailbox_shared::{JailboxError, JailboxResult};
use jailbox_shared::limits::ResourceLimits;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use super::vfs::HostEscalation;

/// Pre-opened descriptor numbers the Host hands this process at spawn time
/// (spec.md §2 step 1). These are distinct from RPCSOCK, which is created
/// fresh after the fork and is never visible on these numbers.
pub const HOST_IN_FD: RawFd = 3;
pub const HOST_OUT_FD: RawFd = 4;

pub struct HostClient {
    reader: BufReader<File>,
    writer: File,
    next_id: i64,
}

impl HostClient {
    /// # Safety
    /// `in_fd`/`out_fd` must be valid, open, not otherwise owned descriptors
    /// (the caller hands over ownership). Used once at process start with
    /// the fixed descriptors the Host guarantees are open.
    pub unsafe fn from_raw_fds(in_fd: RawFd, out_fd: RawFd) -> Self {
        let in_owned = unsafe { OwnedFd::from_raw_fd(in_fd) };
        let out_owned = unsafe { OwnedFd::from_raw_fd(out_fd) };
        Self {
            reader: BufReader::new(File::from(in_owned)),
            writer: File::from(out_owned),
            next_id: 1,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> JailboxResult<JsonRpcResult> {
        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest::new(method, params, id);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;

        let mut response_line = String::new();
        let n = self.reader.read_line(&mut response_line)?;
        if n == 0 {
            return Err(JailboxError::Transport("Host channel closed mid-request".into()));
        }
        let response: JsonRpcResponse = serde_json::from_str(response_line.trim_end())?;
        if response.id != id {
            return Err(JailboxError::Protocol(format!(
                "Host response id {} does not correlate with request id {id}",
                response.id
            )));
        }
        if response.is_protocol_error() {
            let code = response.error.as_ref().map(|e| e.code).unwrap_or(0);
            let message = response.error.map(|e| e.message).unwrap_or_default();
            return Err(JailboxError::Rpc { code, message });
        }
        match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(JailboxError::Rpc { code: err.code, message: err.message }),
            (None, None) => Err(JailboxError::Protocol("Host response has neither result nor error".into())),
        }
    }

    fn decode_bytes(result: &JsonRpcResult) -> JailboxResult<Vec<u8>> {
        let data = result.data.as_ref().ok_or_else(|| JailboxError::Protocol("expected data field".into()))?;
        let text = data.as_str().ok_or_else(|| JailboxError::Protocol("expected string data field".into()))?;
        if result.is_base64.unwrap_or(false) {
            Ok(STANDARD.decode(text)?)
        } else {
            Ok(text.as_bytes().to_vec())
        }
    }

    /// `sys.getlimits`, first leg of the startup trampoline (SPEC_FULL's
    /// supplemented-features section).
    pub fn getlimits(&mut self) -> JailboxResult<ResourceLimits> {
        let result = self.call("sys.getlimits", serde_json::json!([]))?;
        let data = result.data.ok_or_else(|| JailboxError::Protocol("getlimits: missing data".into()))?;
        serde_json::from_value(data).map_err(JailboxError::from)
    }

    /// `sys.getfs`, second leg.
    pub fn getfs(&mut self) -> JailboxResult<VfsDesc> {
        let result = self.call("sys.getfs", serde_json::json!([]))?;
        let data = result.data.ok_or_else(|| JailboxError::Protocol("getfs: missing data".into()))?;
        serde_json::from_value(data).map_err(JailboxError::from)
    }

    /// `sys.getpythonpath`, third leg, named for the interpreter this
    /// engine was distilled alongside (SPEC_FULL §"Supplemented features").
    pub fn getpythonpath(&mut self) -> JailboxResult<String> {
        let result = self.call("sys.getpythonpath", serde_json::json!([]))?;
        let data = result.data.ok_or_else(|| JailboxError::Protocol("getpythonpath: missing data".into()))?;
        data.as_str()
            .map(str::to_string)
            .ok_or_else(|| JailboxError::Protocol("getpythonpath: data not a string".into()))
    }

    /// `sb.chdir`: informs the Host which directory subsequent relative
    /// resolutions should be measured from (the counterpart of `getcwd`,
    /// which `HostEscalation::getcwd` below already calls).
    pub fn chdir(&mut self, path: &str) -> JailboxResult<()> {
        self.call("sb.chdir", serde_json::json!([path])).map(|_| ())
    }

    /// `sb.open`: Host-hosted open for a node with no real backing.
    /// Returns the positive token the Host assigned; the broker stores it
    /// negated-minus-one (spec.md §4.4 step 7).
    pub fn open(&mut self, path: &str, flags: i32, mode: i32) -> JailboxResult<i64> {
        let result = self.call("sb.open", serde_json::json!([path, flags, mode]))?;
        let data = result.data.ok_or_else(|| JailboxError::Protocol("sb.open: missing data".into()))?;
        data.as_i64().ok_or_else(|| JailboxError::Protocol("sb.open: token not an integer".into()))
    }

    pub fn vfd_read(&mut self, token: i64, len: usize) -> JailboxResult<Vec<u8>> {
        let result = self.call("sb.read", serde_json::json!([token, len]))?;
        Self::decode_bytes(&result)
    }

    pub fn vfd_write(&mut self, token: i64, bytes: &[u8]) -> JailboxResult<i64> {
        let encoded = STANDARD.encode(bytes);
        let result = self.call("sb.write", serde_json::json!([token, encoded]))?;
        Ok(result.code as i64)
    }

    pub fn vfd_close(&mut self, token: i64) -> JailboxResult<()> {
        self.call("sb.close", serde_json::json!([token])).map(|_| ())
    }

    /// Seeks a Host-hosted virtual descriptor. Needed by `sys_lseek` for
    /// any fd backed by `FdBacking::Virtual`, and in turn by the
    /// file-backed `mmap` emulation's fill loop (`jail::shims::shim_mmap`),
    /// which always positions the fd before reading from it.
    pub fn vfd_lseek(&mut self, token: i64, offset: i64, whence: i32) -> JailboxResult<i64> {
        let result = self.call("sb.lseek", serde_json::json!([token, offset, whence]))?;
        Ok(result.code as i64)
    }

    /// Returns `(size, mode, mtime_secs)`; the Broker fills these into a
    /// zeroed `libc::stat` it sends back to the Jail, leaving fields the
    /// Host-hosted facet has no opinion on at their zero default.
    pub fn vfd_stat(&mut self, token: i64) -> JailboxResult<(u64, u32, i64)> {
        let result = self.call("sb.stat", serde_json::json!([token]))?;
        let data = result.data.ok_or_else(|| JailboxError::Protocol("sb.stat: missing data".into()))?;
        let size = data.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
        let mode = data.get("mode").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let mtime = data.get("mtime").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok((size, mode, mtime))
    }

    pub fn unlink(&mut self, path: &str) -> JailboxResult<()> {
        self.call("sb.unlink", serde_json::json!([path])).map(|_| ())
    }

    pub fn mkdir(&mut self, path: &str, mode: i32) -> JailboxResult<()> {
        self.call("sb.mkdir", serde_json::json!([path, mode])).map(|_| ())
    }

    pub fn rmdir(&mut self, path: &str) -> JailboxResult<()> {
        self.call("sb.rmdir", serde_json::json!([path])).map(|_| ())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> JailboxResult<()> {
        self.call("sb.rename", serde_json::json!([from, to])).map(|_| ())
    }

    /// Low-level escape hatch for `App`-namespace frames (library calls the
    /// interpreter's own runtime exposes directly to Host policy, rather
    /// than through the syscall-trap path). `rpc_loop` forwards these
    /// verbatim; nothing in `broker::dispatch` calls this directly.
    pub fn call_raw(&mut self, namespace: Namespace, method: &str, json_args: &[u8]) -> JailboxResult<JsonRpcResult> {
        let params: serde_json::Value = serde_json::from_slice(json_args)?;
        self.call(&format!("{}.{}", namespace.method_prefix(), method), params)
    }
}

impl HostEscalation for HostClient {
    fn getnode(&mut self, parent_name: &str, parent_real_path: Option<&str>, child: &str, full_path: &str) -> JailboxResult<jailbox_shared::vfs_desc::VNodeDesc> {
        let result = self.call("sb.getnode", serde_json::json!([parent_name, parent_real_path, child, full_path]))?;
        let data = result.data.ok_or_else(|| JailboxError::Protocol("sb.getnode: missing data".into()))?;
        serde_json::from_value(data).map_err(JailboxError::from)
    }

    fn getcwd(&mut self) -> JailboxResult<String> {
        let result = self.call("sb.getcwd", serde_json::json!([]))?;
        let data = result.data.ok_or_else(|| JailboxError::Protocol("sb.getcwd: missing data".into()))?;
        data.as_str().map(str::to_string).ok_or_else(|| JailboxError::Protocol("sb.getcwd: data not a string".into()))
    }
}
