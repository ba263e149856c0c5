//! Host-side JSON-RPC answering loop (spec.md §4.5, §6), paired with
//! `jailbox-worker::broker::host_client`.
//!
//! One request is ever in flight on this channel (spec.md §5), so the
//! loop is a plain read-dispatch-write cycle: read one line, parse it as
//! a [`JsonRpcRequest`], dispatch on `method`, write back exactly one
//! [`JsonRpcResponse`] with the same `id`. The worker closing its end of
//! the channel (EOF) is the ordinary way this loop ends, not an error.

use std::io::{BufRead, BufReader, Read, Write};

use jailbox_shared::vfs_desc::{NodeFlags, VNodeDesc};
use jailbox_shared::wire::{JsonRpcRequest, JsonRpcResponse, JsonRpcResult};
use jailbox_shared::{JailboxError, JailboxResult};
use serde_json::Value;

use crate::policy::HostPolicy;
use crate::vtoken::VirtualFdTable;

/// Host-side state backing one Jail/Broker pair's escalations: the static
/// policy it was handed at spawn time, the mutable "current directory"
/// the Broker's relative-path resolution asks for, and the virtual
/// descriptor table backing PROXY/virtual nodes.
pub struct HostSession {
    policy: HostPolicy,
    cwd: std::sync::Mutex<String>,
    vfds: VirtualFdTable,
}

impl HostSession {
    /// `session_slot` scopes this session's virtual descriptor store to
    /// `<home>/sessions/<slot>` so two Jail/Broker pairs running
    /// concurrently under the same home directory (see
    /// [`crate::lock::LockManager`]) never see each other's virtual
    /// files.
    pub fn new(policy: HostPolicy, session_slot: u32) -> Self {
        let store_root = policy.home.join("sessions").join(session_slot.to_string());
        Self {
            cwd: std::sync::Mutex::new("/".to_string()),
            vfds: VirtualFdTable::new(store_root),
            policy,
        }
    }

    fn dispatch(&self, method: &str, params: &Value) -> JailboxResult<JsonRpcResult> {
        match method {
            "sys.getlimits" => ok_data(serde_json::to_value(self.policy.limits)?),
            "sys.getfs" => ok_data(serde_json::to_value(&self.policy.vfs)?),
            "sys.getpythonpath" => ok_data(Value::String(self.policy.interpreter_path.clone())),

            "sb.getcwd" => ok_data(Value::String(self.cwd.lock().unwrap().clone())),
            "sb.chdir" => {
                let path = str_param(params, 0)?;
                *self.cwd.lock().unwrap() = path;
                ok_empty()
            }
            "sb.getnode" => self.sb_getnode(params),

            "sb.open" => {
                let path = str_param(params, 0)?;
                let flags = int_param(params, 1)?;
                let mode = int_param(params, 2)?;
                let token = self.vfds.open(&path, flags as i32, mode as i32)?;
                ok_data(Value::from(token))
            }
            "sb.read" => {
                let token = int_param(params, 0)?;
                let len = int_param(params, 1)? as usize;
                let data = self.vfds.read(token, len)?;
                ok_bytes(data)
            }
            "sb.write" => {
                let token = int_param(params, 0)?;
                let data = bytes_param(params, 1)?;
                let n = self.vfds.write(token, &data)?;
                Ok(JsonRpcResult { code: n as i32, data: None, is_base64: None })
            }
            "sb.close" => {
                let token = int_param(params, 0)?;
                self.vfds.close(token)?;
                ok_empty()
            }
            "sb.lseek" => {
                let token = int_param(params, 0)?;
                let offset = int_param(params, 1)?;
                let whence = int_param(params, 2)? as i32;
                let pos = self.vfds.lseek(token, offset, whence)?;
                Ok(JsonRpcResult { code: pos as i32, data: None, is_base64: None })
            }
            "sb.stat" => {
                let token = int_param(params, 0)?;
                let (size, mode, mtime) = self.vfds.stat(token)?;
                ok_data(serde_json::json!({ "size": size, "mode": mode, "mtime": mtime }))
            }
            "sb.unlink" => {
                let path = str_param(params, 0)?;
                self.vfds.remove_file(&path)?;
                ok_empty()
            }
            "sb.mkdir" => {
                let path = str_param(params, 0)?;
                self.vfds.ensure_dir(&path)?;
                ok_empty()
            }
            "sb.rmdir" => {
                let path = str_param(params, 0)?;
                self.vfds.remove_dir(&path)?;
                ok_empty()
            }
            "sb.rename" => {
                let from = str_param(params, 0)?;
                let to = str_param(params, 1)?;
                self.vfds.rename(&from, &to)?;
                ok_empty()
            }

            other if other.starts_with("app.") => Err(JailboxError::Rpc {
                code: -(libc::ENOSYS as i64),
                message: format!("no application-level handler registered for {other}"),
            }),

            other => Err(JailboxError::Rpc {
                code: -(libc::ENOSYS as i64),
                message: format!("unknown method {other}"),
            }),
        }
    }

    /// Answers a PROXY step (spec.md §4.3 step 3, scenario 6): the
    /// virtual store is consulted for an entry already materialized at
    /// `full_path`; a leaf with no matching entry is reported as absent
    /// rather than auto-created, since `sb.getnode` only resolves, it
    /// never creates (creation is `sb.open`/`sb.mkdir`'s job).
    fn sb_getnode(&self, params: &Value) -> JailboxResult<JsonRpcResult> {
        // parent_name/parent_real_path (params[0], params[1]) aren't needed:
        // the virtual store keys entries by the already-accumulated
        // `full_path`, not by the parent the walk arrived from.
        let child = str_param(params, 2)?;
        let full_path = str_param(params, 3)?;

        match self.vfds.lookup(&full_path)? {
            // `real_path` stays unset deliberately: this node is backed by
            // the Host's private virtual store, not a path the Broker can
            // open directly, so every subsequent open/read/write on it
            // must keep escalating through `sb.*` rather than falling
            // through to a real `open(2)`.
            Some((_, true)) => ok_data(serde_json::to_value(VNodeDesc::dir(child))?),
            Some((_, false)) => {
                let desc = VNodeDesc {
                    name: child,
                    flags: NodeFlags::WRITABLE,
                    real_path: None,
                    filter: None,
                    children: Vec::new(),
                };
                ok_data(serde_json::to_value(desc)?)
            }
            None => Err(JailboxError::Rpc {
                code: -(libc::ENOENT as i64),
                message: format!("no node materialized at {full_path}"),
            }),
        }
    }
}

fn ok_empty() -> JailboxResult<JsonRpcResult> {
    Ok(JsonRpcResult { code: 0, data: None, is_base64: None })
}

fn ok_data(value: Value) -> JailboxResult<JsonRpcResult> {
    Ok(JsonRpcResult { code: 0, data: Some(value), is_base64: None })
}

fn ok_bytes(bytes: Vec<u8>) -> JailboxResult<JsonRpcResult> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    Ok(JsonRpcResult {
        code: bytes.len() as i32,
        data: Some(Value::String(STANDARD.encode(bytes))),
        is_base64: Some(true),
    })
}

fn str_param(params: &Value, idx: usize) -> JailboxResult<String> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| JailboxError::Protocol(format!("expected string param at index {idx}")))
}

fn int_param(params: &Value, idx: usize) -> JailboxResult<i64> {
    params
        .get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| JailboxError::Protocol(format!("expected integer param at index {idx}")))
}

fn bytes_param(params: &Value, idx: usize) -> JailboxResult<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let text = str_param(params, idx)?;
    STANDARD.decode(&text).map_err(JailboxError::from)
}

/// Runs the answering loop until the worker's end of the channel closes.
/// `in_stream` carries requests from the worker; `out_stream` carries
/// responses back.
pub fn run<R: Read, W: Write>(session: &HostSession, in_stream: R, mut out_stream: W) -> JailboxResult<()> {
    let mut reader = BufReader::new(in_stream);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed JSON-RPC request from worker");
                continue;
            }
        };

        let response = match session.dispatch(&request.method, &request.params) {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(JailboxError::Rpc { code, message }) => JsonRpcResponse::failure(request.id, code, message),
            Err(e) => JsonRpcResponse::failure(request.id, -(libc::EIO as i64), e.to_string()),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        out_stream.write_all(out.as_bytes())?;
        out_stream.flush()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailbox_shared::identity::FakeIdentity;
    use jailbox_shared::limits::ResourceLimits;
    use jailbox_shared::vfs_desc::VfsDesc;

    fn test_policy(home: &std::path::Path) -> HostPolicy {
        HostPolicy {
            vfs: VfsDesc::new(VNodeDesc::dir("/")),
            limits: ResourceLimits::default(),
            interpreter_path: "/python3".to_string(),
            identity: FakeIdentity::default(),
            home: home.to_path_buf(),
        }
    }

    #[test]
    fn getlimits_returns_policy_limits() {
        let dir = tempfile::tempdir().unwrap();
        let session = HostSession::new(test_policy(dir.path()), 0);
        let result = session.dispatch("sys.getlimits", &Value::Array(vec![])).unwrap();
        let limits: ResourceLimits = serde_json::from_value(result.data.unwrap()).unwrap();
        assert_eq!(limits, ResourceLimits::default());
    }

    #[test]
    fn open_write_read_close_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let session = HostSession::new(test_policy(dir.path()), 0);

        let open = session
            .dispatch("sb.open", &serde_json::json!(["/greeting.txt", libc::O_CREAT | libc::O_RDWR, 0o600]))
            .unwrap();
        let token = open.data.unwrap().as_i64().unwrap();

        session.dispatch("sb.write", &serde_json::json!([token, base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hi")])).unwrap();
        session.dispatch("sb.close", &serde_json::json!([token])).unwrap();
    }

    #[test]
    fn lseek_repositions_a_virtual_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let session = HostSession::new(test_policy(dir.path()), 0);

        let open = session
            .dispatch("sb.open", &serde_json::json!(["/seekable.txt", libc::O_CREAT | libc::O_RDWR, 0o600]))
            .unwrap();
        let token = open.data.unwrap().as_i64().unwrap();

        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hello world");
        session.dispatch("sb.write", &serde_json::json!([token, encoded])).unwrap();

        let seek = session.dispatch("sb.lseek", &serde_json::json!([token, 6, libc::SEEK_SET])).unwrap();
        assert_eq!(seek.code, 6);

        let read = session.dispatch("sb.read", &serde_json::json!([token, 5])).unwrap();
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, read.data.unwrap().as_str().unwrap()).unwrap();
        assert_eq!(decoded, b"world");

        session.dispatch("sb.close", &serde_json::json!([token])).unwrap();
    }

    #[test]
    fn unknown_method_is_rpc_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let session = HostSession::new(test_policy(dir.path()), 0);
        let err = session.dispatch("sb.frobnicate", &Value::Array(vec![])).unwrap_err();
        matches!(err, JailboxError::Rpc { .. });
    }

    #[test]
    fn run_loop_answers_one_request_and_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let session = HostSession::new(test_policy(dir.path()), 0);

        let request = JsonRpcRequest::new("sys.getpythonpath", serde_json::json!([]), 7);
        let mut input = serde_json::to_string(&request).unwrap();
        input.push('\n');

        let mut output = Vec::new();
        run(&session, input.as_bytes(), &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let response: JsonRpcResponse = serde_json::from_str(output.trim_end()).unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(response.result.unwrap().data.unwrap(), "/python3");
    }
}
