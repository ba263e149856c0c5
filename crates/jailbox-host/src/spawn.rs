//! Spawns `jailbox-worker` with descriptors 3 (IN) and 4 (OUT) wired back
//! to this process (spec.md §2 step 1), then services its JSON-RPC
//! escalations until it exits.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use jailbox_shared::{JailboxError, JailboxResult};

use crate::lock::{FileLockManager, LockManager};
use crate::policy::HostPolicy;
use crate::rpc_server::{self, HostSession};

const WORKER_BIN_NAME: &str = "jailbox-worker";

fn worker_binary_path() -> JailboxResult<PathBuf> {
    if let Some(path) = std::env::var_os("JAILBOX_WORKER_BIN") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()
        .map_err(|e| JailboxError::Config(format!("cannot resolve current executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| JailboxError::Config("executable has no parent directory".into()))?;
    Ok(dir.join(WORKER_BIN_NAME))
}

fn pipe_pair() -> JailboxResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(JailboxError::Internal(format!(
            "pipe2() failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: pipe2 just handed back two freshly opened, uniquely owned
    // descriptors.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Spawns one worker process for `policy` and blocks servicing its
/// JSON-RPC escalations until it exits. Returns the worker's own exit
/// code, which `jailbox-worker::broker::run` already computes per
/// spec.md §6's convention (child's exit code, or the negated signal
/// number if it was killed).
pub fn run_one(policy: HostPolicy) -> JailboxResult<i32> {
    std::fs::create_dir_all(&policy.home).map_err(|e| {
        JailboxError::Config(format!("failed to create home dir {}: {e}", policy.home.display()))
    })?;

    // Worker's OUT (fd4): worker writes requests, Host reads them here.
    let (host_reads_requests, worker_writes_requests) = pipe_pair()?;
    // Worker's IN (fd3): Host writes responses, worker reads them there.
    let (worker_reads_responses, host_writes_responses) = pipe_pair()?;

    let worker_in_raw = worker_reads_responses.as_raw_fd();
    let worker_out_raw = worker_writes_requests.as_raw_fd();

    let binary = worker_binary_path()?;
    let mut command = Command::new(&binary);
    command
        .env("JAILBOX_HOME", &policy.home)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: only dup2 is called between fork and exec, which is on the
    // async-signal-safe list.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(worker_in_raw, 3) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(worker_out_raw, 4) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child: Child = command
        .spawn()
        .map_err(|e| JailboxError::Internal(format!("failed to spawn {}: {e}", binary.display())))?;

    // These were O_CLOEXEC; the child's dup2'd copies at 3/4 survive its
    // exec independently. Dropping the Host's originals here lets EOF
    // propagate correctly once the worker exits.
    drop(worker_reads_responses);
    drop(worker_writes_requests);

    let locks = FileLockManager::new(policy.home.join("locks"))?;
    let slot = locks.allocate()?;

    let session = HostSession::new(policy, slot.0);
    let requests_in = std::fs::File::from(host_reads_requests);
    let responses_out = std::fs::File::from(host_writes_responses);

    if let Err(e) = rpc_server::run(&session, requests_in, responses_out) {
        tracing::warn!(error = %e, "host RPC loop ended abnormally; killing worker");
        let _ = child.kill();
    }

    let status = child
        .wait()
        .map_err(|e| JailboxError::Internal(format!("failed to wait for worker: {e}")))?;

    if let Err(e) = locks.free(slot) {
        tracing::warn!(error = %e, slot = %slot, "failed to free session lock");
    }

    Ok(exit_code_of(&status))
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| -status.signal().unwrap_or(libc::EIO))
}
