//! The Broker half of the worker process (spec.md §4.2–§4.5, §2 steps 3–5).
//!
//! By the time [`run`] is called the fork has already happened: we are the
//! parent, the Jail's end of RPCSOCK has already been handed off, and the
//! Host's `getlimits`/`getfs`/`getpythonpath` answers have already been
//! forwarded down to the Jail over that same socket. What's left is the
//! steady-state loop: read a frame, service it (directly against the
//! virtual filesystem for `Sys`, locally for `Sb`, via `Host` for `App`),
//! write the reply, repeat until the Jail's end of the socket goes away,
//! then reap the child and compute the exit status spec.md §6 describes.

pub mod dispatch;
pub mod fdtable;
pub mod host_client;
pub mod rpc_loop;
pub mod vfs;

use dispatch::BrokerState;
use fdtable::FdTable;
use host_client::HostClient;
use jailbox_shared::limits::ResourceLimits;
use jailbox_shared::vfs_desc::VfsDesc;
use vfs::VfsTree;

/// Everything the Broker needs to run the steady-state loop, assembled
/// right after the fork returns in the parent.
pub struct BrokerStartup {
    pub broker_sock: std::os::unix::io::RawFd,
    pub jail_pid: nix::unistd::Pid,
    pub limits: ResourceLimits,
    pub vfs_desc: VfsDesc,
    pub host: HostClient,
}

/// Runs the Broker to completion: the RPC loop, then the child reap, then
/// returns the process exit code spec.md §6's CLI contract describes
/// (exited child → child's exit code; signalled child → negative signal
/// number; fatal Broker-side error → negated syscall errno).
pub fn run(startup: BrokerStartup) -> i32 {
    let vfs = VfsTree::build(&startup.vfs_desc);
    let fds = FdTable::new(startup.limits.max_fds as usize);
    let mut state = BrokerState::new(vfs, fds, startup.host);

    let loop_result = rpc_loop::run(startup.broker_sock, &mut state);
    if let Err(e) = &loop_result {
        tracing::warn!(error = %e, "broker RPC loop ended abnormally; terminating jail");
        let _ = nix::sys::signal::kill(startup.jail_pid, nix::sys::signal::Signal::SIGTERM);
    }

    let exit_code = reap(startup.jail_pid);
    if let Err(e) = loop_result {
        return e.exit_code().min(exit_code);
    }
    exit_code
}

/// Blocking `waitpid` on the Jail child (spec.md §5: "the Broker's
/// child-reaper propagates the exit code or signal to the Host"), mapped
/// to spec.md §6's CLI convention: exited → exit code, signalled →
/// negative signal number.
fn reap(pid: nix::unistd::Pid) -> i32 {
    use nix::sys::wait::{waitpid, WaitStatus};
    match waitpid(pid, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, signal, _)) => -(signal as i32),
        Ok(_) => -(libc::EIO),
        Err(_) => -(libc::ECHILD),
    }
}
