//! Jail-side startup handshake over RPCSOCK (spec.md §2; the
//! "getlimits"/"getfs"/"getpythonpath" trampoline documented in
//! SPEC_FULL.md's supplemented-features section).
//!
//! This runs entirely *before* the seccomp filter is installed, so unlike
//! `jail::dispatch`/`jail::trap` it can use ordinary allocating I/O
//! through [`jailbox_shared::wire`].

use jailbox_shared::limits::ResourceLimits;
use jailbox_shared::vfs_desc::VfsDesc;
use jailbox_shared::{JailboxError, JailboxResult};
use std::os::unix::io::RawFd;

fn read_exact(fd: RawFd, len: usize) -> JailboxResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = nix::unistd::read(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &mut buf[read..])
            .map_err(|e| JailboxError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(JailboxError::Transport("RPCSOCK closed during startup handshake".into()));
        }
        read += n;
    }
    Ok(buf)
}

fn read_u32_prefixed(fd: RawFd) -> JailboxResult<Vec<u8>> {
    let len_buf = read_exact(fd, 4)?;
    let len = u32::from_le_bytes(len_buf.try_into().unwrap()) as usize;
    read_exact(fd, len)
}

/// Step 1 of the startup trampoline: the broker pushes resource limits
/// unsolicited, as a fixed-size binary blob, before the jail asks for
/// anything.
pub fn recv_limits(fd: RawFd) -> JailboxResult<ResourceLimits> {
    let buf = read_exact(fd, ResourceLimits::WIRE_LEN)?;
    ResourceLimits::decode(&buf).ok_or_else(|| JailboxError::Protocol("malformed resource limits blob".into()))
}

/// Step 2: the broker pushes the virtual filesystem tree as a
/// length-prefixed JSON document.
pub fn recv_vfs_desc(fd: RawFd) -> JailboxResult<VfsDesc> {
    let json = read_u32_prefixed(fd)?;
    serde_json::from_slice(&json).map_err(JailboxError::from)
}

/// Step 3: the broker pushes the virtual interpreter path as a
/// length-prefixed string.
pub fn recv_interpreter_path(fd: RawFd) -> JailboxResult<String> {
    let bytes = read_u32_prefixed(fd)?;
    String::from_utf8(bytes).map_err(|e| JailboxError::Protocol(format!("interpreter path not utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn recv_limits_reads_fixed_size_blob() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let limits = ResourceLimits::default();
        a.send(&limits.encode()).unwrap();
        drop(a);
        let mut buf = [0u8; ResourceLimits::WIRE_LEN];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(n, ResourceLimits::WIRE_LEN);
        assert_eq!(ResourceLimits::decode(&buf), Some(limits));
    }

    #[test]
    fn u32_prefixed_roundtrip_via_socketpair() {
        use std::os::fd::AsRawFd;
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let payload = b"{\"root\":{}}";
        let mut framed = Vec::new();
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(payload);
        let mut a = a;
        a.write_all(&framed).unwrap();
        drop(a);
        let got = read_u32_prefixed(b.as_raw_fd()).unwrap();
        assert_eq!(got, payload);
    }
}
