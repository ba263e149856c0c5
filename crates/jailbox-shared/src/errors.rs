//! Error types shared across the jail, broker, and host processes.

use thiserror::Error;

/// Result type for jailbox operations.
pub type JailboxResult<T> = Result<T, JailboxError>;

#[derive(Debug, Error)]
pub enum JailboxError {
    /// Requested path resolves outside the policy, is filtered, or denies
    /// the requested access. Carries the errno the caller should see.
    #[error("policy denied ({errno}): {reason}")]
    PolicyDenied { errno: i32, reason: String },

    /// The virtual filesystem resolver could not find or build a node.
    #[error("resolve error: {0}")]
    Resolve(String),

    /// The fd table ran out of slots, or an operation referenced an
    /// invalid/mismatched descriptor.
    #[error("descriptor table error: {0}")]
    Fd(String),

    /// Read/write failure on RPCSOCK or the Host channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame, wrong field types, bad base64, oversized payload,
    /// or a length mismatch. Always fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// JSON-RPC level error (reserved-range code, or an `error` response).
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Policy/config file could not be parsed or was internally inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for JailboxError {
    fn from(err: std::io::Error) -> Self {
        JailboxError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for JailboxError {
    fn from(err: serde_json::Error) -> Self {
        JailboxError::Protocol(format!("JSON error: {err}"))
    }
}

impl From<base64::DecodeError> for JailboxError {
    fn from(err: base64::DecodeError) -> Self {
        JailboxError::Protocol(format!("base64 error: {err}"))
    }
}

impl From<String> for JailboxError {
    fn from(err: String) -> Self {
        JailboxError::Internal(err)
    }
}

impl From<&str> for JailboxError {
    fn from(err: &str) -> Self {
        JailboxError::Internal(err.to_string())
    }
}

impl JailboxError {
    /// Map an error to the negative-errno process exit convention of
    /// spec.md §6: fatal errors exit with the negated syscall errno.
    pub fn exit_code(&self) -> i32 {
        match self {
            JailboxError::PolicyDenied { errno, .. } => -errno,
            JailboxError::Protocol(_) => -libc::EPROTO,
            JailboxError::Transport(_) => -libc::EIO,
            _ => -libc::EINVAL,
        }
    }
}
