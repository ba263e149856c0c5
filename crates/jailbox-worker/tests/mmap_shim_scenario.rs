//! Scenario 5 from spec.md §8: file-backed `mmap` emulation. Stands in for
//! the broker with a small thread that answers the `lseek`/`read` frames
//! the shim sends over the inner channel, the same way `jail::dispatch`'s
//! raw socket I/O would see them in the real two-process setup.

use jailbox_worker::jail::shims::shim_mmap;
use jailbox_worker::jail::trap::TrappedCall;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;

/// `[i32 retval][i32 errno][i32 outlen]` + payload, matching
/// `jail::dispatch::decode_and_apply`'s hand-rolled response decode.
fn encode_response(retval: i32, errno: i32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&retval.to_le_bytes());
    out.extend_from_slice(&errno.to_le_bytes());
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[test]
fn scenario_file_backed_mmap_fills_and_protects() {
    let (jail_end, broker_end) = UnixDatagram::pair().unwrap();
    let file_contents = b"shared-object-first-page-bytes".to_vec();
    let length = 4096usize;

    let worker = std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut call_index = 0;
        loop {
            let n = match broker_end.recv(&mut buf) {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            let response = if call_index == 0 {
                // lseek
                encode_response(0, 0, &[])
            } else if call_index == 1 {
                encode_response(file_contents.len() as i32, 0, &file_contents)
            } else {
                encode_response(0, 0, &[]) // EOF: the fill loop stops here
            };
            let is_last = call_index >= 2;
            call_index += 1;
            if broker_end.send(&response).is_err() {
                break;
            }
            if is_last {
                break;
            }
        }
    });

    let call = TrappedCall {
        nr: 9,
        args: [0, length as u64, libc::PROT_READ as u64, libc::MAP_PRIVATE as u64, 5, 0],
    };
    let addr = shim_mmap(jail_end.as_raw_fd(), &call);
    worker.join().unwrap();

    assert!(addr > 0, "shim_mmap should return a mapped address, got {addr}");

    let slice = unsafe { std::slice::from_raw_parts(addr as *const u8, length) };
    let file_contents = b"shared-object-first-page-bytes";
    assert_eq!(&slice[..file_contents.len()], file_contents);
    assert!(slice[file_contents.len()..].iter().all(|&b| b == 0), "tail beyond the file's content stays zero-filled");

    unsafe {
        libc::munmap(addr as *mut libc::c_void, length);
    }
}

#[test]
fn scenario_disallowed_anonymous_reaches_shim_as_eperm() {
    // Anonymous mappings are handled by the kernel directly per the
    // seccomp allow-list (jail::filter); reaching this shim with
    // MAP_ANONYMOUS set means a forbidden bit (SHARED/GROWSDOWN/STACK)
    // was present, so the shim refuses it outright.
    let call = TrappedCall {
        nr: 9,
        args: [0, 4096, libc::PROT_READ as u64, (libc::MAP_ANONYMOUS | libc::MAP_STACK) as u64, u64::MAX, 0],
    };
    assert_eq!(shim_mmap(3, &call), -(libc::EPERM as i64));
}
