//! Per-syscall emulation that needs more than "forward the frame, copy
//! back the result" (spec.md §4.1).
//!
//! Every trapped syscall except `mmap` is a single round trip through
//! [`super::dispatch::service_trapped_syscall`]: the broker either answers
//! directly out of the virtual filesystem or (after a `PROXY` escalation)
//! out of a real descriptor it already holds, and whatever it returns is
//! the Jail's syscall result verbatim.
//!
//! `mmap` is different: the broker never hands the Jail a real host file
//! descriptor (spec.md §8's fd-table invariant: the Jail only ever holds
//! virtual descriptor numbers, never a real one), so a file-backed mapping
//! can't be built with a single `mmap(2)` call against a borrowed fd.
//! Instead the shim here performs the sequence spec.md §4.1 spells out:
//! an anonymous private mapping sized to the request, filled by replaying
//! `lseek`/`read` through the broker exactly as any other trapped I/O
//! would be, then `mprotect`ed to the protection the caller actually
//! asked for.

use super::dispatch;
use super::trap::TrappedCall;
use jailbox_shared::syscalls::{descriptor_for_name, Arch};

/// mmap(2) argument order: addr, length, prot, flags, fd, offset.
const ARG_LENGTH: usize = 1;
const ARG_PROT: usize = 2;
const ARG_FLAGS: usize = 3;
const ARG_FD: usize = 4;
const ARG_OFFSET: usize = 5;

pub fn shim_mmap(rpcsock_fd: i32, call: &TrappedCall) -> i64 {
    let length = call.args[ARG_LENGTH] as usize;
    let prot = call.args[ARG_PROT] as i32;
    let flags = call.args[ARG_FLAGS] as i32;
    let fd = call.args[ARG_FD] as i32;
    let offset = call.args[ARG_OFFSET] as i64;

    if flags & libc::MAP_ANONYMOUS != 0 {
        // The filter's allow-list lets ANONYMOUS|PRIVATE mappings with
        // none of SHARED/GROWSDOWN/STACK through the kernel directly
        // (spec.md §4.1); reaching this shim with MAP_ANONYMOUS set means
        // one of those forbidden bits was present.
        return -(libc::EPERM as i64);
    }

    if fd < 0 {
        return -(libc::EBADF as i64);
    }

    // Step 1: anonymous private mapping of the requested length, at
    // kernel choice of address, writable so the fill loop can land bytes.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return -(libc::ENOMEM as i64);
    }

    if let Err(errno) = fill_from_file(rpcsock_fd, fd, offset, addr as *mut u8, length) {
        unsafe {
            libc::munmap(addr, length);
        }
        return -(errno as i64);
    }

    // Step 4: apply the protection the caller actually asked for.
    if unsafe { libc::mprotect(addr, length, prot) } != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        unsafe {
            libc::munmap(addr, length);
        }
        return -(errno as i64);
    }

    addr as i64
}

/// Steps 2–3 of the file-backed `mmap` sequence: `lseek` to `offset`, then
/// `read` until `length` bytes are filled or EOF (a short file simply
/// leaves the tail of the anonymous mapping zeroed, matching ordinary
/// `mmap`'s own short-file behavior).
fn fill_from_file(rpcsock_fd: i32, fd: i32, offset: i64, dest: *mut u8, length: usize) -> Result<(), i32> {
    let arch = Arch::detect();
    let lseek_nr = arch.syscall_nr("lseek").ok_or(libc::ENOSYS)?;
    let read_nr = arch.syscall_nr("read").ok_or(libc::ENOSYS)?;
    let lseek_desc = descriptor_for_name("lseek").ok_or(libc::ENOSYS)?;
    let read_desc = descriptor_for_name("read").ok_or(libc::ENOSYS)?;

    let seek_call = TrappedCall {
        nr: lseek_nr,
        args: [fd as u64, offset as u64, libc::SEEK_SET as u64, 0, 0, 0],
    };
    let seek_ret = dispatch::service_trapped_syscall(rpcsock_fd, &lseek_desc, seek_call);
    if seek_ret < 0 {
        return Err((-seek_ret) as i32);
    }

    let mut filled = 0usize;
    while filled < length {
        let remaining = length - filled;
        let ptr = unsafe { dest.add(filled) };
        let read_call = TrappedCall {
            nr: read_nr,
            args: [fd as u64, ptr as u64, remaining as u64, 0, 0, 0],
        };
        let n = dispatch::service_trapped_syscall(rpcsock_fd, &read_desc, read_call);
        if n < 0 {
            return Err((-n) as i32);
        }
        if n == 0 {
            break; // EOF: remainder stays zero-filled.
        }
        filled += n as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shim_mmap_rejects_bad_anonymous_flag_combinations() {
        let call = TrappedCall {
            nr: 9,
            args: [
                0,
                4096,
                libc::PROT_READ as u64,
                (libc::MAP_ANONYMOUS | libc::MAP_SHARED) as u64,
                u64::MAX, // fd: -1 as unsigned
                0,
            ],
        };
        assert_eq!(shim_mmap(3, &call), -(libc::EPERM as i64));
    }

    #[test]
    fn shim_mmap_rejects_negative_fd_for_file_backed_request() {
        let call = TrappedCall {
            nr: 9,
            args: [0, 4096, libc::PROT_READ as u64, libc::MAP_PRIVATE as u64, u64::MAX, 0],
        };
        assert_eq!(shim_mmap(3, &call), -(libc::EBADF as i64));
    }
}
