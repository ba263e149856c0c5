//! `SIGSYS` trap handler installed after the seccomp filter (spec.md §4.1).
//!
//! This handler runs in signal context: no allocation, no locking, no
//! `tracing` calls. It must also be **reentrant**: emulating a
//! file-backed `mmap` can itself perform a trapped `read`/`openat` while
//! still inside the outer trap, so the handler is installed with
//! `SA_NODEFER` rather than the default self-masking behavior. Recursion
//! depth is bounded only by the trapped syscall graph the dispatcher
//! actually emulates (`mmap` is the one case in the trapped set that
//! recurses; see `jail::dispatch`).
//!
//! Register recovery reads the trapped syscall number and its six
//! argument registers out of the `ucontext_t` the kernel hands the
//! handler, per-architecture (x86_64 / aarch64 calling conventions).

use std::sync::atomic::{AtomicI32, Ordering};

use super::dispatch;

/// The RPCSOCK file descriptor the handler forwards trapped syscalls
/// over. Set once, before the filter is installed, and never touched by
/// anything but `install()`'s caller.
static RPCSOCK_FD: AtomicI32 = AtomicI32::new(-1);

pub fn set_rpcsock_fd(fd: i32) {
    RPCSOCK_FD.store(fd, Ordering::SeqCst);
}

fn rpcsock_fd() -> i32 {
    RPCSOCK_FD.load(Ordering::SeqCst)
}

/// Registers captured from the faulting context: syscall number plus six
/// argument registers, in kernel calling-convention order.
#[derive(Debug, Clone, Copy)]
pub struct TrappedCall {
    pub nr: i64,
    pub args: [u64; 6],
}

#[cfg(target_os = "linux")]
pub fn install() -> std::io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_sigsys as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGSYS, &sa, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn install() -> std::io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
extern "C" fn handle_sigsys(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    // SAFETY: invoked by the kernel only for SIGSYS raised by our own
    // seccomp filter, with a valid siginfo_t/ucontext_t pair.
    unsafe {
        let call = match read_trapped_call(info, ctx) {
            Some(c) => c,
            None => return,
        };
        let retval = dispatch::route(rpcsock_fd(), call);
        write_return_value(ctx, retval);
    }
}

#[cfg(target_os = "linux")]
unsafe fn read_trapped_call(
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) -> Option<TrappedCall> {
    // `si_syscall` lives past the common siginfo_t prefix on Linux; glibc
    // exposes it via the non-portable `si_syscall()`-style accessor
    // macros, which `libc` does not bind directly. We reconstruct it from
    // the raw byte layout the kernel documents in siginfo.h's
    // `_sigsys` union member, mirroring what `seccomp_notify`-style traps
    // already assume about the ABI.
    let base = info as *const u8;
    // offsetof(siginfo_t, _sifields._sigsys) on glibc/x86_64 and aarch64
    // both place `_call_addr` then `_syscall` then `_arch` starting at
    // byte 16 of the union (after the common si_signo/si_errno/si_code
    // header), which is offset 32 within siginfo_t.
    const SIGSYS_SYSCALL_OFFSET: isize = 32 + 8;
    let nr = *(base.offset(SIGSYS_SYSCALL_OFFSET) as *const i32) as i64;

    let ucontext = &*(ctx as *const libc::ucontext_t);
    let args = read_syscall_args(&ucontext.uc_mcontext);
    Some(TrappedCall { nr, args })
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn read_syscall_args(mcontext: &libc::mcontext_t) -> [u64; 6] {
    let regs = &mcontext.gregs;
    [
        regs[libc::REG_RDI as usize] as u64,
        regs[libc::REG_RSI as usize] as u64,
        regs[libc::REG_RDX as usize] as u64,
        regs[libc::REG_R10 as usize] as u64,
        regs[libc::REG_R8 as usize] as u64,
        regs[libc::REG_R9 as usize] as u64,
    ]
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn write_return_value(ctx: *mut libc::c_void, retval: i64) {
    let ucontext = &mut *(ctx as *mut libc::ucontext_t);
    ucontext.uc_mcontext.gregs[libc::REG_RAX as usize] = retval;
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn read_syscall_args(mcontext: &libc::mcontext_t) -> [u64; 6] {
    let regs = &mcontext.regs;
    [regs[0], regs[1], regs[2], regs[3], regs[4], regs[5]]
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn write_return_value(ctx: *mut libc::c_void, retval: i64) {
    let ucontext = &mut *(ctx as *mut libc::ucontext_t);
    ucontext.uc_mcontext.regs[0] = retval as u64;
}
