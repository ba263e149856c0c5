//! Inner-channel frame loop and the pre-loop startup push (spec.md §4.2,
//! §2 step 3, §6).
//!
//! Three namespaces cross this socket (spec.md §4.2): `Sys` frames are
//! serviced against the virtual filesystem by [`super::dispatch`]; `Sb`
//! frames are answered locally without touching the filesystem at all
//! (metadata the interpreter's own runtime asks of its host process,
//! rather than a syscall); `App` frames are forwarded to the Host
//! verbatim as `app.`-prefixed JSON-RPC and the reply relayed back
//! unchanged. The out-of-tree interpreter-level library (spec.md §1's
//! "external collaborator") is the only thing that would ever emit `Sb`
//! or `App` frames today; nothing in this workspace's `jail::dispatch`
//! does, but the wire format and this loop support them so a future
//! library binding can use them without a protocol change.

use super::dispatch::BrokerState;
use jailbox_shared::limits::ResourceLimits;
use jailbox_shared::vfs_desc::VfsDesc;
use jailbox_shared::wire::{InnerRequest, InnerResponse, Namespace};
use jailbox_shared::{JailboxError, JailboxResult};
use std::os::unix::io::RawFd;

/// Largest frame this loop will attempt to read. Anything the kernel
/// delivers larger than this on the datagram socket is a protocol
/// violation (spec.md §7: "oversized argument payloads ... always fatal").
const MAX_FRAME: usize = 1 << 17;

/// Pushes the startup trampoline down RPCSOCK in the fixed order spec.md
/// §2 step 3 and SPEC_FULL's supplemented-features section describe:
/// limits (fixed-size blob), then the virtual filesystem tree, then the
/// virtual interpreter path (both length-prefixed), all unsolicited;
/// the Jail's [`super::super::jail::rpc_client`] reads them in this same
/// order without asking first.
pub fn send_startup_handshake(
    broker_sock: RawFd,
    limits: &ResourceLimits,
    vfs_desc: &VfsDesc,
    interpreter_path: &str,
) -> JailboxResult<()> {
    send_all(broker_sock, &limits.encode())?;
    send_u32_prefixed(broker_sock, &serde_json::to_vec(vfs_desc)?)?;
    send_u32_prefixed(broker_sock, interpreter_path.as_bytes())?;
    Ok(())
}

fn send_all(fd: RawFd, buf: &[u8]) -> JailboxResult<()> {
    use std::os::fd::BorrowedFd;
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut sent = 0usize;
    while sent < buf.len() {
        let n = nix::unistd::write(fd, &buf[sent..]).map_err(|e| JailboxError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(JailboxError::Transport("RPCSOCK closed mid-handshake".into()));
        }
        sent += n;
    }
    Ok(())
}

fn send_u32_prefixed(fd: RawFd, payload: &[u8]) -> JailboxResult<()> {
    send_all(fd, &(payload.len() as u32).to_le_bytes())?;
    send_all(fd, payload)
}

/// Steady-state loop: read one frame, service it, write one reply,
/// repeat. Returns once the Jail's end of the socket stops producing
/// frames (clean exit) or a transport/protocol error makes continuing
/// unsafe, per spec.md §4.2: any parse failure is fatal to the Broker.
pub fn run(broker_sock: RawFd, state: &mut BrokerState) -> JailboxResult<()> {
    let mut buf = vec![0u8; MAX_FRAME];
    loop {
        let n = match recv_some(broker_sock, &mut buf) {
            Some(0) | None => return Ok(()), // jail process gone; normal shutdown path
            Some(n) => n,
        };

        let request = InnerRequest::decode(&buf[..n])?;
        let response = match request.namespace {
            Namespace::Sys => state.handle_sys(&request),
            Namespace::Sb => handle_sb(&request)?,
            Namespace::App => handle_app(state, &request)?,
        };

        send_all(broker_sock, &response.encode())?;
    }
}

fn recv_some(fd: RawFd, buf: &mut [u8]) -> Option<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        None
    } else {
        Some(n as usize)
    }
}

/// `Sb` frames are answered without any Host round trip or filesystem
/// walk; there is currently exactly one such query, a liveness probe
/// the embedding library can use to confirm the Broker is alive and
/// servicing frames before it issues any `Sys` traffic.
fn handle_sb(request: &InnerRequest) -> JailboxResult<InnerResponse> {
    let (method, _json) = request.split_method()?;
    match method {
        "ping" => Ok(InnerResponse::ok(0, Vec::new())),
        _ => Ok(InnerResponse::error(libc::ENOSYS)),
    }
}

/// `App` frames are forwarded verbatim to the Host as `app.<method>`
/// JSON-RPC; the result's `code`/`data` fold back into an `InnerResponse`
/// the same shape a `Sys` handler would have produced.
fn handle_app(state: &mut BrokerState, request: &InnerRequest) -> JailboxResult<InnerResponse> {
    let (method, json) = request.split_method()?;
    match state.host.call_raw(Namespace::App, method, json) {
        Ok(result) => {
            let output = match result.data {
                Some(serde_json::Value::String(s)) if result.is_base64.unwrap_or(false) => {
                    use base64::{engine::general_purpose::STANDARD, Engine as _};
                    STANDARD.decode(s).map_err(JailboxError::from)?
                }
                Some(value) => serde_json::to_vec(&value)?,
                None => Vec::new(),
            };
            Ok(InnerResponse::ok(result.code, output))
        }
        Err(JailboxError::Rpc { .. }) => Ok(InnerResponse::error(libc::EIO)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn startup_handshake_is_readable_back_in_order() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let limits = ResourceLimits::default();
        let vfs_desc = VfsDesc::new(jailbox_shared::vfs_desc::VNodeDesc::dir(""));
        send_startup_handshake(a.as_raw_fd(), &limits, &vfs_desc, "/usr/bin/python3").unwrap();

        let mut limit_buf = [0u8; ResourceLimits::WIRE_LEN];
        b.recv(&mut limit_buf).unwrap();
        assert_eq!(ResourceLimits::decode(&limit_buf), Some(limits));
    }

    #[test]
    fn handle_sb_ping_returns_ok() {
        let request = InnerRequest::method(Namespace::Sb, "ping", b"[]").unwrap();
        let response = handle_sb(&request).unwrap();
        assert_eq!(response.errno, 0);
    }

    #[test]
    fn handle_sb_unknown_method_is_enosys() {
        let request = InnerRequest::method(Namespace::Sb, "frobnicate", b"[]").unwrap();
        let response = handle_sb(&request).unwrap();
        assert_eq!(response.errno, libc::ENOSYS);
    }
}
