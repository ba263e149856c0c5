//! The Jail half of the worker process (spec.md §4.1, §2 steps 4–5).
//!
//! By the time [`run`] is called the fork has already happened: we are
//! the child, RPCSOCK has already been dup'd onto fd 3, and the outer
//! Host pipes have already been closed by the caller. What's left is the
//! startup trampoline (receive limits, the virtual filesystem tree, and
//! the virtual interpreter path over RPCSOCK), installing the seccomp
//! filter and the `SIGSYS` trap handler, flipping the identity-shim flag,
//! and handing control to the interpreter.

pub mod dispatch;
pub mod filter;
pub mod interpreter;
pub mod rpc_client;
pub mod shims;
pub mod trap;

use interpreter::Interpreter;
use jailbox_shared::identity::IDENTITY_COMMITTED_FLAG;
use jailbox_shared::{JailboxError, JailboxResult};
use std::os::unix::io::RawFd;

/// RPCSOCK's fixed descriptor number after the startup rename (spec.md
/// §2 step 2; mirrored by `filter::RPCSOCK_FD`).
pub const RPCSOCK_FD: RawFd = 3;

pub struct JailStartup {
    pub interpreter: Box<dyn Interpreter>,
    pub script_args: Vec<String>,
}

/// Runs the Jail side of the worker to completion. On success this never
/// returns (the interpreter has been exec'd in its place); any `Err` is
/// returned before the filter goes up, so the caller can still log it
/// through the pre-fork logging handle.
pub fn run(startup: JailStartup) -> JailboxResult<std::convert::Infallible> {
    let limits = rpc_client::recv_limits(RPCSOCK_FD)?;
    let vfs_desc = rpc_client::recv_vfs_desc(RPCSOCK_FD)?;
    let interpreter_path = rpc_client::recv_interpreter_path(RPCSOCK_FD)?;
    tracing::debug!(
        memory_bytes = limits.memory_bytes,
        vfs_root = %vfs_desc.root.name,
        interpreter_path = %interpreter_path,
        "jail startup handshake complete"
    );

    trap::set_rpcsock_fd(RPCSOCK_FD);

    let self_pid = std::process::id() as i64;
    #[cfg(target_os = "linux")]
    {
        let program = filter::build_trap_filter(libc::SIGSYS, self_pid)
            .map_err(|e| JailboxError::Internal(format!("filter build failed: {e}")))?;
        filter::apply_filter(&program).map_err(|e| JailboxError::Internal(format!("filter install failed: {e}")))?;
    }
    trap::install().map_err(|e| JailboxError::Internal(format!("trap handler install failed: {e}")))?;

    // One-way flag: the identity shims (out of scope for this workspace
    // per spec.md §4.6) read this via the dynamic loader to know the
    // sandbox uid/gid facade is now live.
    commit_identity_flag();

    startup.interpreter.exec(&interpreter_path, &startup.script_args)
}

/// Sets the process-wide, one-way flag the (out-of-tree) identity shims
/// consult. Carried here as a plain environment write since the shim
/// library itself is not built by this workspace, see
/// `jailbox_shared::identity` for the contract both sides agree on.
fn commit_identity_flag() {
    unsafe {
        std::env::set_var(IDENTITY_COMMITTED_FLAG, "1");
    }
}
