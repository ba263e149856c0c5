//! Maps a trapped syscall's raw registers onto an inner-channel frame and
//! blocks for the broker's emulated result (spec.md §4.1's "Dispatch" and
//! "Per-syscall shims" subsections).
//!
//! Everything in this module runs inside the `SIGSYS` handler (see
//! `jail::trap`), so it stays off the heap: the frame is packed into a
//! fixed stack buffer and moved with raw `send`/`recv`, rather than
//! through `jailbox_shared::wire`'s allocating `InnerRequest`/
//! `InnerResponse` types, which describe the same wire shape for the
//! broker side, which never runs in signal context and can afford a
//! `Vec`. Pointer arguments (`Path`, `Buffer`) are dereferenced directly:
//! the trap handler runs in the Jail's own address space, so reading a
//! `char *` the trapped instruction already had access to is safe: we're
//! not crossing a trust boundary by looking, only by acting.

use super::shims;
use super::trap::TrappedCall;
use jailbox_shared::syscalls::{self, Arch, ArgKind, BufferDirection, SyscallDescriptor, FIXED_SIZE_BUFFER};

const MAX_FRAME: usize = 4096;
const MAX_PATH: usize = 4096;
const SYS_NAMESPACE: i16 = 0; // jailbox_shared::wire::Namespace::Sys

/// Entry point called from the `SIGSYS` handler. Looks the trapped number
/// up by name on this architecture; an unrecognized number means the
/// kernel filter trapped something `jail::filter`'s allow-list never
/// anticipated, which per spec.md §4.1/§7 is fatal: the process exits
/// with the trap signal's own numeric value rather than returning.
pub fn route(fd: i32, call: TrappedCall) -> i64 {
    let arch = Arch::detect();
    let name = match syscalls::name_for_trapped_nr(arch, call.nr) {
        Some(name) => name,
        None => unsafe { libc::_exit(libc::SIGSYS) },
    };
    let descriptor = match syscalls::descriptor_for_name(name) {
        Some(d) => d,
        None => unsafe { libc::_exit(libc::SIGSYS) },
    };

    if name == "mmap" {
        return shims::shim_mmap(fd, &call);
    }
    service_trapped_syscall(fd, &descriptor, call)
}

/// Same entry point `shims::shim_mmap` uses for the non-mmap legs of its
/// own emulation (the `lseek`/`read`/`mprotect` round trips it drives
/// itself): pack one trapped syscall's arguments per its descriptor,
/// forward it, and unpack the reply, including writing any `Out` buffer
/// back into the Jail's own memory at the original pointer.
pub fn service_trapped_syscall(fd: i32, descriptor: &SyscallDescriptor, call: TrappedCall) -> i64 {
    if fd < 0 {
        return -(libc::ENOSYS as i64);
    }

    let mut frame = [0u8; MAX_FRAME];
    let (frame_len, out_buf) = match encode_args(&mut frame, descriptor, &call) {
        Some(v) => v,
        None => return -(libc::E2BIG as i64),
    };

    if send_all(fd, &frame[..frame_len]).is_err() {
        return -(libc::EIO as i64);
    }

    let mut resp = [0u8; MAX_FRAME];
    let resp_len = match recv_some(fd, &mut resp) {
        Some(n) => n,
        None => return -(libc::EIO as i64),
    };

    decode_and_apply(&resp[..resp_len], out_buf)
}

/// `[i16 namespace][u16 key=syscall_nr][u16 arglen]` header, followed by
/// the tightly packed arguments the descriptor calls for. Scalar kinds
/// (`Int`/`Fd`/`Flags`/`Mode`/`Offset`) are packed as 8-byte little-endian
/// values; `Path` is copied out of the Jail's memory NUL-terminated;
/// `In`-direction `Buffer`s are length-prefixed (`u32`) followed by their
/// bytes. `Out`-direction buffers contribute nothing to the request (the
/// broker learns the caller's requested capacity from the sibling length
/// argument, already packed as a plain scalar) but are remembered here so
/// the reply can be written back into the Jail's memory.
fn encode_args(
    buf: &mut [u8; MAX_FRAME],
    descriptor: &SyscallDescriptor,
    call: &TrappedCall,
) -> Option<(usize, Option<(u64, usize)>)> {
    let mut len = 6usize; // header reserved up front, filled in at the end
    let mut out_buf: Option<(u64, usize)> = None;

    for (i, kind) in descriptor.args.iter().enumerate() {
        match *kind {
            ArgKind::Unused => {}
            ArgKind::Int | ArgKind::Fd | ArgKind::Flags | ArgKind::Mode | ArgKind::Offset => {
                if len + 8 > buf.len() {
                    return None;
                }
                buf[len..len + 8].copy_from_slice(&call.args[i].to_le_bytes());
                len += 8;
            }
            ArgKind::Path => {
                let ptr = call.args[i] as *const u8;
                let cap = buf.len().checked_sub(len + 1)?.min(MAX_PATH);
                let written = unsafe { copy_cstr(ptr, &mut buf[len..len + cap]) }?;
                len += written;
                buf[len] = 0;
                len += 1;
            }
            ArgKind::Buffer { len_arg, direction: BufferDirection::In } => {
                let requested = call.args[len_arg as usize] as usize;
                let cap = buf.len().checked_sub(len + 4)?;
                let n = requested.min(cap);
                buf[len..len + 4].copy_from_slice(&(n as u32).to_le_bytes());
                len += 4;
                if n > 0 {
                    unsafe {
                        std::ptr::copy_nonoverlapping(call.args[i] as *const u8, buf[len..].as_mut_ptr(), n);
                    }
                }
                len += n;
            }
            ArgKind::Buffer { len_arg, direction: BufferDirection::Out } => {
                let cap = if len_arg == FIXED_SIZE_BUFFER {
                    std::mem::size_of::<libc::stat>()
                } else {
                    call.args[len_arg as usize] as usize
                };
                out_buf = Some((call.args[i], cap.min(MAX_FRAME)));
            }
        }
    }

    let arglen = len - 6;
    buf[0..2].copy_from_slice(&SYS_NAMESPACE.to_le_bytes());
    buf[2..4].copy_from_slice(&(call.nr as u16).to_le_bytes());
    buf[4..6].copy_from_slice(&(arglen as u16).to_le_bytes());
    Some((len, out_buf))
}

/// Reads a NUL-terminated string out of `ptr` into `dst`, returning the
/// number of bytes copied (excluding the terminator). `None` if the
/// string doesn't terminate within `dst`'s capacity.
unsafe fn copy_cstr(ptr: *const u8, dst: &mut [u8]) -> Option<usize> {
    for i in 0..dst.len() {
        let byte = unsafe { *ptr.add(i) };
        if byte == 0 {
            return Some(i);
        }
        dst[i] = byte;
    }
    None
}

/// `[i32 retval][i32 errno][i32 outlen]` followed by up to `outlen` bytes
/// of output. A non-zero errno always wins (it encodes a negative result);
/// otherwise any `Out` buffer is written back into the Jail's memory at
/// its original pointer before returning `retval`. `mmap`'s emulation
/// piggybacks a 64-bit address on this same path via `shims::shim_mmap`,
/// which does its own decode for the final leg: `retval` here only ever
/// carries values that fit an `i64` syscall return.
fn decode_and_apply(buf: &[u8], out_buf: Option<(u64, usize)>) -> i64 {
    if buf.len() < 12 {
        return -(libc::EIO as i64);
    }
    let retval = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let errno = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let outlen = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]).max(0) as usize;

    if errno != 0 {
        return -(errno as i64);
    }

    if let Some((ptr, cap)) = out_buf {
        let n = outlen.min(cap).min(buf.len().saturating_sub(12));
        if n > 0 && ptr != 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(buf[12..12 + n].as_ptr(), ptr as *mut u8, n);
            }
        }
    }

    retval as i64
}

fn send_all(fd: i32, buf: &[u8]) -> Result<(), ()> {
    let mut sent = 0usize;
    while sent < buf.len() {
        let n = unsafe { libc::send(fd, buf[sent..].as_ptr() as *const libc::c_void, buf.len() - sent, 0) };
        if n <= 0 {
            return Err(());
        }
        sent += n as usize;
    }
    Ok(())
}

fn recv_some(fd: i32, buf: &mut [u8]) -> Option<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n <= 0 {
        None
    } else {
        Some(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailbox_shared::syscalls::descriptor_for_name;

    #[test]
    fn encode_args_packs_header_and_path_for_open() {
        let path = b"/data/hello.txt\0";
        let descriptor = descriptor_for_name("open").unwrap();
        let call = TrappedCall {
            nr: 2,
            args: [path.as_ptr() as u64, libc::O_RDONLY as u64, 0, 0, 0, 0],
        };
        let mut buf = [0u8; MAX_FRAME];
        let (len, out_buf) = encode_args(&mut buf, &descriptor, &call).unwrap();
        assert!(out_buf.is_none());
        let arglen = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        assert_eq!(len, 6 + arglen);
        // path bytes + NUL + 8 (flags) + 8 (mode)
        assert_eq!(arglen, (path.len() - 1) + 1 + 8 + 8);
        assert_eq!(&buf[6..6 + path.len() - 1], &path[..path.len() - 1]);
    }

    #[test]
    fn encode_args_remembers_out_buffer_for_fstat() {
        let descriptor = descriptor_for_name("fstat").unwrap();
        let mut statbuf = [0u8; 256];
        let call = TrappedCall {
            nr: 5,
            args: [4, statbuf.as_mut_ptr() as u64, 0, 0, 0, 0],
        };
        let mut buf = [0u8; MAX_FRAME];
        let (_, out_buf) = encode_args(&mut buf, &descriptor, &call).unwrap();
        let (ptr, cap) = out_buf.unwrap();
        assert_eq!(ptr, statbuf.as_ptr() as u64);
        assert_eq!(cap, std::mem::size_of::<libc::stat>());
    }

    #[test]
    fn decode_and_apply_returns_negative_errno_on_failure() {
        let mut buf = [0u8; 12];
        buf[4..8].copy_from_slice(&libc::ENOENT.to_le_bytes());
        assert_eq!(decode_and_apply(&buf, None), -(libc::ENOENT as i64));
    }

    #[test]
    fn decode_and_apply_writes_output_into_out_buffer() {
        let mut dst = [0u8; 8];
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&4i32.to_le_bytes()); // retval = 4 bytes read
        buf[8..12].copy_from_slice(&4i32.to_le_bytes()); // outlen = 4
        buf[12..16].copy_from_slice(b"data");
        let retval = decode_and_apply(&buf, Some((dst.as_mut_ptr() as u64, dst.len())));
        assert_eq!(retval, 4);
        assert_eq!(&dst[..4], b"data");
    }
}
