//! Wire formats for the two RPC legs (spec.md §6).
//!
//! The Jail↔Broker leg is a binary frame on a datagram socket (RPCSOCK).
//! The Broker↔Host leg is line-delimited JSON-RPC 2.0. The two are kept
//! deliberately separate: the hot path stays allocation-light binary, the
//! policy path stays human-debuggable JSON.

use crate::errors::{JailboxError, JailboxResult};
use serde::{Deserialize, Serialize};

/// Namespace tag on an inner-channel request frame.
///
/// `Sys` is serviced locally by the broker against the virtual filesystem.
/// `Sb` is a broker-local metadata query (no filesystem walk). `App` is
/// forwarded to the Host as JSON-RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Namespace {
    Sys = 0,
    Sb = 1,
    App = 2,
}

impl Namespace {
    pub fn from_i16(v: i16) -> JailboxResult<Self> {
        match v {
            0 => Ok(Namespace::Sys),
            1 => Ok(Namespace::Sb),
            2 => Ok(Namespace::App),
            other => Err(JailboxError::Protocol(format!(
                "unknown inner-channel namespace tag {other}"
            ))),
        }
    }

    /// JSON-RPC method prefix used when this namespace is promoted to the
    /// Host (spec.md §4.5).
    pub fn method_prefix(self) -> &'static str {
        match self {
            Namespace::Sys => "sys",
            Namespace::Sb => "sb",
            Namespace::App => "app",
        }
    }
}

/// Maximum argument payload carried in a single inner-channel frame.
/// Oversized payloads are a protocol violation (spec.md §7).
pub const MAX_ARG_LEN: usize = 1 << 16;

/// A request frame on the inner channel.
///
/// Wire shape: `[i16 namespace][u16 key][u16 arglen]` followed by `arglen`
/// bytes. For `Sys`, `key` is the kernel syscall number and the payload is
/// tightly packed syscall arguments. For `Sb`/`App`, `key` is the length of
/// a null-terminated method name that precedes the JSON argument array,
/// which then occupies `arglen` bytes total (method name + JSON).
#[derive(Debug, Clone)]
pub struct InnerRequest {
    pub namespace: Namespace,
    /// Syscall number (Sys) or method-name byte length (Sb/App).
    pub key: u16,
    pub payload: Vec<u8>,
}

impl InnerRequest {
    pub fn sys(syscall_nr: u16, args: Vec<u8>) -> Self {
        Self {
            namespace: Namespace::Sys,
            key: syscall_nr,
            payload: args,
        }
    }

    pub fn method(namespace: Namespace, method: &str, json_args: &[u8]) -> JailboxResult<Self> {
        if !matches!(namespace, Namespace::Sb | Namespace::App) {
            return Err(JailboxError::Protocol(
                "method() frames must use Sb or App namespace".into(),
            ));
        }
        let method_len = method.len() + 1; // null terminator included
        if method_len > u16::MAX as usize {
            return Err(JailboxError::Protocol("method name too long".into()));
        }
        let mut payload = Vec::with_capacity(method_len + json_args.len());
        payload.extend_from_slice(method.as_bytes());
        payload.push(0);
        payload.extend_from_slice(json_args);
        Ok(Self {
            namespace,
            key: method_len as u16,
            payload,
        })
    }

    /// Total length on the wire: 6-byte header + payload (spec.md §8
    /// invariant: `6 + arglen`, method name already folded into the
    /// payload for non-Sys frames).
    pub fn wire_len(&self) -> usize {
        6 + self.payload.len()
    }

    pub fn encode(&self) -> JailboxResult<Vec<u8>> {
        if self.payload.len() > MAX_ARG_LEN {
            return Err(JailboxError::Protocol("argument payload too large".into()));
        }
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(&(self.namespace as i16).to_le_bytes());
        buf.extend_from_slice(&self.key.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> JailboxResult<Self> {
        if buf.len() < 6 {
            return Err(JailboxError::Protocol("frame shorter than 6-byte header".into()));
        }
        let namespace = Namespace::from_i16(i16::from_le_bytes([buf[0], buf[1]]))?;
        let key = u16::from_le_bytes([buf[2], buf[3]]);
        let arglen = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        if buf.len() != 6 + arglen {
            return Err(JailboxError::Protocol(format!(
                "frame length mismatch: header declares {arglen} bytes, got {}",
                buf.len() - 6
            )));
        }
        Ok(Self {
            namespace,
            key,
            payload: buf[6..].to_vec(),
        })
    }

    /// Split a non-Sys payload back into (method name, json bytes).
    pub fn split_method(&self) -> JailboxResult<(&str, &[u8])> {
        let name_len = self.key as usize;
        if name_len == 0 || name_len > self.payload.len() {
            return Err(JailboxError::Protocol("method-name length out of range".into()));
        }
        let (name_bytes, rest) = self.payload.split_at(name_len);
        let name = std::str::from_utf8(name_bytes)
            .map_err(|e| JailboxError::Protocol(format!("method name not utf8: {e}")))?
            .trim_end_matches('\0');
        Ok((name, rest))
    }
}

/// A response frame on the inner channel: `[i32 retval][i32 errno][i32 outlen]`
/// followed by `outlen` bytes of structured output.
#[derive(Debug, Clone)]
pub struct InnerResponse {
    pub retval: i32,
    pub errno: i32,
    pub output: Vec<u8>,
}

impl InnerResponse {
    pub fn ok(retval: i32, output: Vec<u8>) -> Self {
        Self {
            retval,
            errno: 0,
            output,
        }
    }

    pub fn error(errno: i32) -> Self {
        Self {
            retval: -1,
            errno,
            output: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.output.len());
        buf.extend_from_slice(&self.retval.to_le_bytes());
        buf.extend_from_slice(&self.errno.to_le_bytes());
        buf.extend_from_slice(&(self.output.len() as i32).to_le_bytes());
        buf.extend_from_slice(&self.output);
        buf
    }

    pub fn decode(buf: &[u8]) -> JailboxResult<Self> {
        if buf.len() < 12 {
            return Err(JailboxError::Protocol("response shorter than 12-byte header".into()));
        }
        let retval = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let errno = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let outlen = i32::from_le_bytes(buf[8..12].try_into().unwrap());
        if outlen < 0 || buf.len() != 12 + outlen as usize {
            return Err(JailboxError::Protocol("response length mismatch".into()));
        }
        Ok(Self {
            retval,
            errno,
            output: buf[12..].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------
// Outer channel: line-delimited JSON-RPC 2.0 (Broker ⇄ Host)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
    pub id: i64,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: i64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResult {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "base64")]
    pub is_base64: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonRpcResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorBody>,
    pub id: i64,
}

/// JSON-RPC reserved error-code range; responses in this range are
/// protocol errors and fatal (spec.md §6).
pub const JSONRPC_RESERVED_RANGE: std::ops::Range<i64> = -32768..-31999;

impl JsonRpcResponse {
    pub fn success(id: i64, result: JsonRpcResult) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: i64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcErrorBody {
                code,
                message: message.into(),
            }),
            id,
        }
    }

    pub fn is_protocol_error(&self) -> bool {
        self.error
            .as_ref()
            .map(|e| JSONRPC_RESERVED_RANGE.contains(&e.code))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_request_roundtrip_sys() {
        let req = InnerRequest::sys(libc::SYS_read as u16, vec![1, 2, 3, 4]);
        let encoded = req.encode().unwrap();
        assert_eq!(encoded.len(), req.wire_len());
        let decoded = InnerRequest::decode(&encoded).unwrap();
        assert_eq!(decoded.namespace, Namespace::Sys);
        assert_eq!(decoded.key, libc::SYS_read as u16);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn inner_request_roundtrip_method() {
        let req = InnerRequest::method(Namespace::Sb, "getcwd", b"[]").unwrap();
        let encoded = req.encode().unwrap();
        let decoded = InnerRequest::decode(&encoded).unwrap();
        let (name, json) = decoded.split_method().unwrap();
        assert_eq!(name, "getcwd");
        assert_eq!(json, b"[]");
    }

    #[test]
    fn inner_request_wire_len_matches_header_invariant() {
        let req = InnerRequest::method(Namespace::App, "open", b"{}").unwrap();
        assert_eq!(req.wire_len(), 6 + req.payload.len());
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut buf = InnerRequest::sys(0, vec![1, 2]).encode().unwrap();
        buf.push(0xFF); // trailing garbage byte not accounted for in arglen
        assert!(InnerRequest::decode(&buf).is_err());
    }

    #[test]
    fn inner_response_roundtrip() {
        let resp = InnerResponse::ok(4096, vec![9, 9, 9]);
        let encoded = resp.encode();
        let decoded = InnerResponse::decode(&encoded).unwrap();
        assert_eq!(decoded.retval, 4096);
        assert_eq!(decoded.errno, 0);
        assert_eq!(decoded.output, vec![9, 9, 9]);
    }

    #[test]
    fn jsonrpc_response_id_correlates_with_request() {
        let req = JsonRpcRequest::new("sb.getcwd", serde_json::json!([]), 42);
        let resp = JsonRpcResponse::success(
            req.id,
            JsonRpcResult {
                code: 0,
                data: Some(serde_json::json!("/tmp")),
                is_base64: None,
            },
        );
        assert_eq!(resp.id, req.id);
    }

    #[test]
    fn jsonrpc_reserved_range_is_protocol_error() {
        let resp = JsonRpcResponse::failure(1, -32600, "invalid request");
        assert!(resp.is_protocol_error());
        let resp = JsonRpcResponse::failure(1, -1, "app-level ENOENT");
        assert!(!resp.is_protocol_error());
    }
}
