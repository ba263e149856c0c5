//! Process-level orchestration for spec.md §2's startup sequence (steps
//! 2–5): connect to the Host on the pre-opened descriptors, fetch policy,
//! create the Jail↔Broker socket pair, fork, and hand each half off to
//! its own module.
//!
//! This is the one place in the workspace that calls `fork()` directly;
//! everything downstream of it (`broker::run`, `jail::run`) assumes its
//! half of the split has already happened.

use crate::broker::host_client::{HostClient, HOST_IN_FD, HOST_OUT_FD};
use crate::broker::{self, BrokerStartup};
use crate::jail::{self, interpreter::ExecInterpreter, JailStartup};
use jailbox_shared::{JailboxError, JailboxResult};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{fork, ForkResult};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

/// Descriptor the Jail's end of RPCSOCK is renamed to after the fork
/// (spec.md §2 step 2), mirrored by `jail::RPCSOCK_FD` /
/// `jail::filter::RPCSOCK_FD`.
const JAIL_RPCSOCK_FD: RawFd = 3;

/// Runs the full startup sequence and, in whichever half this call
/// returns into, the corresponding main loop. In the child this never
/// returns on success (the interpreter has been exec'd in its place); in
/// the parent it returns the process exit code spec.md §6 describes.
pub fn run() -> i32 {
    match run_inner() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "worker startup failed");
            e.exit_code()
        }
    }
}

fn run_inner() -> JailboxResult<i32> {
    // Step 1 (already done by the Host before spawning us): IN=3, OUT=4
    // carry line-delimited JSON-RPC to/from the Host.
    let mut host = unsafe { HostClient::from_raw_fds(HOST_IN_FD, HOST_OUT_FD) };

    // Step 3: ask Host for policy before anything else exists to act on.
    let limits = host.getlimits()?;
    let vfs_desc = host.getfs()?;
    let interpreter_path = host.getpythonpath()?;

    // A fresh datagram socket pair joins Broker and Jail (spec.md §2
    // step 2).
    let (broker_end, jail_end) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty())
        .map_err(|e| JailboxError::Transport(format!("socketpair failed: {e}")))?;

    match unsafe { fork() }.map_err(|e| JailboxError::Internal(format!("fork failed: {e}")))? {
        ForkResult::Child => {
            drop(broker_end);
            // "closes the outer pipes in the child" (spec.md §2 step 2):
            // the Jail never touches the Host directly.
            unsafe {
                libc::close(HOST_IN_FD);
                libc::close(HOST_OUT_FD);
            }
            rename_to_rpcsock_fd(jail_end)?;
            jail::run(JailStartup { interpreter: Box::new(ExecInterpreter), script_args: Vec::new() })?;
            unreachable!("jail::run never returns on success");
        }
        ForkResult::Parent { child } => {
            drop(jail_end);
            let broker_fd = broker_end.as_raw_fd();
            broker::rpc_loop::send_startup_handshake(broker_fd, &limits, &vfs_desc, &interpreter_path)?;
            // `broker::run` owns the raw fd for the rest of the
            // process's life; let `OwnedFd`'s destructor go without
            // closing it out from under that ownership.
            std::mem::forget(broker_end);
            Ok(broker::run(BrokerStartup { broker_sock: broker_fd, jail_pid: child, limits, vfs_desc, host }))
        }
    }
}

/// Dup's the Jail's socket end onto fd 3 (spec.md §2 step 2: "the Jail's
/// end is renamed to descriptor 3 (RPCSOCK)"), closing whichever original
/// fd isn't already 3.
fn rename_to_rpcsock_fd(jail_end: OwnedFd) -> JailboxResult<()> {
    let raw = jail_end.into_raw_fd();
    if raw != JAIL_RPCSOCK_FD {
        unsafe {
            if libc::dup2(raw, JAIL_RPCSOCK_FD) < 0 {
                return Err(JailboxError::Internal("dup2 to RPCSOCK fd failed".into()));
            }
            libc::close(raw);
        }
    }
    Ok(())
}
