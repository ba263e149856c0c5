//! `Sys`-namespace syscall handlers (spec.md §4.2, §4.4).
//!
//! Unlike `jail::dispatch`, this runs in an ordinary process context (no
//! signal-safety constraints), so it can allocate, call into
//! `broker::vfs`/`broker::fdtable`, and escalate to the Host through
//! `broker::host_client`. This module owns the "tightly packed argument
//! payload" side of the inner-channel contract spec.md §4.2 describes: it
//! decodes the same positional layout `jail::dispatch::encode_args` wrote,
//! using the syscall's `SyscallDescriptor` to know how many bytes each
//! argument occupies and which argument, if any, is a buffer.

use super::fdtable::{check_open_policy, FdBacking, FdEntry, FdTable, OpenIntent};
use super::host_client::HostClient;
use super::vfs::{filter_allows, HostEscalation, NodeId, VfsTree};
use jailbox_shared::syscalls::{self, Arch, ArgKind, BufferDirection, FIXED_SIZE_BUFFER};
use jailbox_shared::vfs_desc::NodeFlags;
use jailbox_shared::wire::{InnerRequest, InnerResponse};
use jailbox_shared::{JailboxError, JailboxResult};
use std::os::fd::{FromRawFd, OwnedFd};

/// Broker-side state a `Sys` frame is serviced against: the virtual tree,
/// the descriptor table, and the Host escalation channel (spec.md §4.2's
/// "per-syscall handler ... looks up an argument-description vector").
pub struct BrokerState {
    pub vfs: VfsTree,
    pub fds: FdTable,
    pub host: HostClient,
}

impl BrokerState {
    pub fn new(vfs: VfsTree, fds: FdTable, host: HostClient) -> Self {
        Self { vfs, fds, host }
    }

    /// Entry point from `rpc_loop`: decode `req`'s payload per its
    /// descriptor, run the named handler, and encode the result.
    pub fn handle_sys(&mut self, req: &InnerRequest) -> InnerResponse {
        let arch = Arch::detect();
        let name = match syscalls::name_for_trapped_nr(arch, req.key as i64) {
            Some(name) => name,
            None => return InnerResponse::error(libc::ENOSYS),
        };
        let descriptor = match syscalls::descriptor_for_name(name) {
            Some(d) => d,
            None => return InnerResponse::error(libc::ENOSYS),
        };
        let args = match decode_args(&descriptor, &req.payload) {
            Some(a) => a,
            None => return InnerResponse::error(libc::EINVAL),
        };

        let result = match name {
            "open" => self.sys_open(&args, &descriptor),
            "openat" => self.sys_openat(&args, &descriptor),
            "close" => self.sys_close(&args),
            "read" => self.sys_read(&args, &descriptor),
            "write" => self.sys_write(&args),
            "lseek" => self.sys_lseek(&args),
            "fstat" => self.sys_fstat(&args, &descriptor),
            "stat" => self.sys_stat(&args, &descriptor, true),
            "lstat" => self.sys_stat(&args, &descriptor, false),
            "access" => self.sys_access(&args),
            "readlink" => self.sys_readlink(&args, &descriptor),
            "getcwd" => self.sys_getcwd(&args, &descriptor),
            "chdir" => self.sys_chdir(&args),
            "unlink" => self.sys_unlink(&args),
            "mkdir" => self.sys_mkdir(&args),
            "rmdir" => self.sys_rmdir(&args),
            "rename" => self.sys_rename(&args),
            "fcntl" => self.sys_fcntl(&args),
            "ioctl" => self.sys_ioctl(&args),
            _ => Err(errno(libc::ENOSYS)),
        };

        match result {
            Ok(resp) => resp,
            Err(Failure::Errno(e)) => InnerResponse::error(e),
        }
    }

    fn resolve(&mut self, path: &str) -> JailboxResult<NodeId> {
        self.vfs.resolve(path, &mut self.host)
    }

    /// See `VfsTree::resolve_with_filter`: the filter/blacklist pair a new
    /// child name of the resolved node would be checked against, needed
    /// before `mkdir`/a rename's destination leg create one directly.
    fn resolve_with_filter(&mut self, path: &str) -> JailboxResult<(NodeId, Vec<super::vfs::FilterPattern>, bool)> {
        self.vfs.resolve_with_filter(path, &mut self.host)
    }

    /// `parent_of` is pure string splitting, so any caller that needs the
    /// *parent* of a path that hasn't been resolved yet (because it
    /// doesn't exist) has to absolutize it first, or a relative `path`
    /// resolves its parent against the wrong directory. Shares
    /// `vfs::absolutize` with `VfsTree::resolve`'s own cwd substitution.
    fn absolutize(&mut self, path: &str) -> JailboxResult<String> {
        super::vfs::absolutize(path, &mut self.host)
    }

    fn sys_open(&mut self, args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let flags = int_arg(args, 1)?;
        let mode = int_arg(args, 2)?;
        let _ = descriptor;
        self.open_node(&path, flags as i32, mode as i32)
    }

    fn sys_openat(&mut self, args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor) -> Result<InnerResponse, Failure> {
        // Relative-to-fd opens are resolved against the virtual cwd (Host
        // supplies AT_FDCWD semantics); explicit dirfd-relative resolution
        // is out of scope for the syscalls the target interpreter needs.
        let path = text_arg(args, 1)?;
        let flags = int_arg(args, 2)?;
        let mode = int_arg(args, 3)?;
        let _ = descriptor;
        self.open_node(&path, flags as i32, mode as i32)
    }

    fn open_node(&mut self, path: &str, flags: i32, mode: i32) -> Result<InnerResponse, Failure> {
        let wants_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        let o_creat = flags & libc::O_CREAT != 0;
        let o_excl = flags & libc::O_EXCL != 0;
        let o_directory = flags & libc::O_DIRECTORY != 0;
        let o_cloexec = flags & libc::O_CLOEXEC != 0;

        let node_id = self.resolve(path).ok();
        let (is_directory, writable, real_path, name) = match node_id {
            Some(id) => {
                let node = self.vfs.node(id);
                (node.flags.contains(NodeFlags::DIRECTORY), node.flags.contains(NodeFlags::WRITABLE), node.real_path.clone(), node.name.clone())
            }
            None => (false, false, None, String::new()),
        };

        let intent = OpenIntent {
            node_exists: node_id.is_some(),
            is_directory,
            writable_node: writable,
            o_creat,
            o_excl,
            o_directory,
            wants_write,
        };
        if let Err(denial) = check_open_policy(&intent) {
            return Err(errno(denial.errno()));
        }

        let backing = match &real_path {
            Some(p) => {
                let c_path = std::ffi::CString::new(p.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode) };
                if fd < 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                FdBacking::Real(unsafe { OwnedFd::from_raw_fd(fd) })
            }
            None => {
                let token = self.host.open(path, flags, mode).map_err(|_| errno(libc::EIO))?;
                FdBacking::Virtual(FdTable::encode_virtual_token(token))
            }
        };

        let mut node_flags = NodeFlags::empty();
        if o_cloexec {
            node_flags |= NodeFlags::CLOEXEC;
        }
        let real_path_str = real_path.map(|p| p.to_string_lossy().into_owned());
        let entry = FdEntry { name, real_path: real_path_str, backing, flags: node_flags };
        let fd = self.fds.insert(entry).map_err(|_| errno(libc::EMFILE))?;
        Ok(InnerResponse::ok(fd, Vec::new()))
    }

    fn sys_close(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let fd = int_arg(args, 0)? as i32;
        match self.fds.take(fd) {
            Some(FdEntry { backing: FdBacking::Real(owned), .. }) => {
                drop(owned);
                Ok(InnerResponse::ok(0, Vec::new()))
            }
            Some(FdEntry { backing: FdBacking::Virtual(stored), .. }) => {
                let token = FdTable::decode_virtual_token(stored);
                let _ = self.host.vfd_close(token);
                Ok(InnerResponse::ok(0, Vec::new()))
            }
            None => Err(errno(libc::EBADF)),
        }
    }

    fn sys_read(&mut self, args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor) -> Result<InnerResponse, Failure> {
        let fd = int_arg(args, 0)? as i32;
        let requested = out_capacity(args, descriptor, 1)?;
        let entry = self.fds.get(fd).map_err(|_| errno(libc::EBADF))?;
        match &entry.backing {
            FdBacking::Real(owned) => {
                let mut buf = vec![0u8; requested];
                let n = unsafe { libc::read(owned.as_raw_fd_compat(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n < 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                buf.truncate(n as usize);
                Ok(InnerResponse::ok(n as i32, buf))
            }
            FdBacking::Virtual(stored) => {
                let token = FdTable::decode_virtual_token(*stored);
                let data = self.host.vfd_read(token, requested).map_err(|_| errno(libc::EIO))?;
                Ok(InnerResponse::ok(data.len() as i32, data))
            }
        }
    }

    fn sys_write(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let fd = int_arg(args, 0)? as i32;
        let data = data_arg(args, 1)?;
        let entry = self.fds.get(fd).map_err(|_| errno(libc::EBADF))?;
        match &entry.backing {
            FdBacking::Real(owned) => {
                let n = unsafe { libc::write(owned.as_raw_fd_compat(), data.as_ptr() as *const libc::c_void, data.len()) };
                if n < 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                Ok(InnerResponse::ok(n as i32, Vec::new()))
            }
            FdBacking::Virtual(stored) => {
                let token = FdTable::decode_virtual_token(*stored);
                let n = self.host.vfd_write(token, data).map_err(|_| errno(libc::EIO))?;
                Ok(InnerResponse::ok(n as i32, Vec::new()))
            }
        }
    }

    fn sys_lseek(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let fd = int_arg(args, 0)? as i32;
        let offset = int_arg(args, 1)?;
        let whence = int_arg(args, 2)? as i32;
        let entry = self.fds.get(fd).map_err(|_| errno(libc::EBADF))?;
        match &entry.backing {
            FdBacking::Real(owned) => {
                let pos = unsafe { libc::lseek(owned.as_raw_fd_compat(), offset, whence) };
                if pos < 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                Ok(InnerResponse::ok(pos as i32, Vec::new()))
            }
            FdBacking::Virtual(stored) => {
                let token = FdTable::decode_virtual_token(*stored);
                let pos = self.host.vfd_lseek(token, offset, whence).map_err(|_| errno(libc::EIO))?;
                Ok(InnerResponse::ok(pos as i32, Vec::new()))
            }
        }
    }

    fn sys_fstat(&mut self, args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor) -> Result<InnerResponse, Failure> {
        let fd = int_arg(args, 0)? as i32;
        let _ = out_capacity(args, descriptor, 1)?;
        let entry = self.fds.get(fd).map_err(|_| errno(libc::EBADF))?;
        match &entry.backing {
            FdBacking::Real(owned) => {
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                if unsafe { libc::fstat(owned.as_raw_fd_compat(), &mut st) } != 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                Ok(InnerResponse::ok(0, stat_bytes(&st)))
            }
            FdBacking::Virtual(stored) => {
                let token = FdTable::decode_virtual_token(*stored);
                let (size, mode, mtime) = self.host.vfd_stat(token).map_err(|_| errno(libc::EIO))?;
                Ok(InnerResponse::ok(0, stat_bytes(&synthesize_stat(size, mode, mtime))))
            }
        }
    }

    fn sys_stat(&mut self, args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor, follow: bool) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let _ = out_capacity(args, descriptor, 1)?;
        let node_id = self.resolve(&path).map_err(|_| errno(libc::ENOENT))?;
        let node = self.vfs.node(node_id);
        match &node.real_path {
            Some(p) => {
                let c_path = std::ffi::CString::new(p.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                let rc = if follow {
                    unsafe { libc::stat(c_path.as_ptr(), &mut st) }
                } else {
                    unsafe { libc::lstat(c_path.as_ptr(), &mut st) }
                };
                if rc != 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                Ok(InnerResponse::ok(0, stat_bytes(&st)))
            }
            None => {
                let token = self.host.open(&path, libc::O_RDONLY, 0).map_err(|_| errno(libc::EIO))?;
                let (size, mode, mtime) = self.host.vfd_stat(token).map_err(|_| errno(libc::EIO))?;
                let _ = self.host.vfd_close(token);
                Ok(InnerResponse::ok(0, stat_bytes(&synthesize_stat(size, mode, mtime))))
            }
        }
    }

    fn sys_access(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let mode = int_arg(args, 1)? as i32;
        let node_id = self.resolve(&path).map_err(|_| errno(libc::ENOENT))?;
        let node = self.vfs.node(node_id);
        match &node.real_path {
            Some(p) => {
                let c_path = std::ffi::CString::new(p.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                if unsafe { libc::access(c_path.as_ptr(), mode) } != 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                Ok(InnerResponse::ok(0, Vec::new()))
            }
            None => Ok(InnerResponse::ok(0, Vec::new())),
        }
    }

    fn sys_readlink(&mut self, args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let cap = out_capacity(args, descriptor, 1)?;
        let node_id = self.resolve(&path).map_err(|_| errno(libc::ENOENT))?;
        let node = self.vfs.node(node_id);
        let real_path = node.real_path.clone().ok_or_else(|| errno(libc::EINVAL))?;
        let c_path = std::ffi::CString::new(real_path.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
        let mut buf = vec![0u8; cap];
        let n = unsafe { libc::readlink(c_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if n < 0 {
            return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
        }
        buf.truncate(n as usize);
        Ok(InnerResponse::ok(n as i32, buf))
    }

    fn sys_getcwd(&mut self, args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor) -> Result<InnerResponse, Failure> {
        let cap = out_capacity(args, descriptor, 0)?;
        let cwd = self.host.getcwd().map_err(|_| errno(libc::EIO))?;
        let mut bytes = cwd.into_bytes();
        bytes.push(0);
        if bytes.len() > cap {
            return Err(errno(libc::ERANGE));
        }
        let len = bytes.len() as i32;
        Ok(InnerResponse::ok(len, bytes))
    }

    fn sys_chdir(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let node_id = self.resolve(&path).map_err(|_| errno(libc::ENOENT))?;
        if !self.vfs.node(node_id).flags.contains(NodeFlags::DIRECTORY) {
            return Err(errno(libc::ENOTDIR));
        }
        self.host.chdir(&path).map_err(|_| errno(libc::EIO))?;
        Ok(InnerResponse::ok(0, Vec::new()))
    }

    fn sys_unlink(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let node_id = self.resolve(&path).map_err(|_| errno(libc::ENOENT))?;
        let node = self.vfs.node(node_id);
        if !node.flags.contains(NodeFlags::WRITABLE) {
            return Err(errno(libc::EROFS));
        }
        match &node.real_path {
            Some(p) => {
                let c_path = std::ffi::CString::new(p.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                if unsafe { libc::unlink(c_path.as_ptr()) } != 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
            }
            None => self.host.unlink(&path).map_err(|_| errno(libc::EIO))?,
        }
        Ok(InnerResponse::ok(0, Vec::new()))
    }

    fn sys_mkdir(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let mode = int_arg(args, 1)? as i32;
        if self.resolve(&path).is_ok() {
            return Err(errno(libc::EEXIST));
        }
        // The target itself is absent, but creating it still needs the
        // same gate `open_node` applies to writes: the parent must already
        // be a writable directory node, or any path could be materialized
        // into the Host's virtual store regardless of policy. `path` may
        // be relative, so resolve the parent against the absolute form or
        // a relative mkdir checks (and later creates into) the wrong node.
        let absolute = self.absolutize(&path).map_err(|_| errno(libc::EIO))?;
        let (parent_id, filter, blacklist) =
            self.resolve_with_filter(&parent_of(&absolute)).map_err(|_| errno(libc::ENOENT))?;
        let parent = self.vfs.node(parent_id);
        if !parent.flags.contains(NodeFlags::DIRECTORY) {
            return Err(errno(libc::ENOTDIR));
        }
        if !parent.flags.contains(NodeFlags::WRITABLE) {
            return Err(errno(libc::EROFS));
        }
        let leaf = leaf_name(&absolute);
        if !filter_allows(&filter, blacklist, leaf) {
            return Err(errno(libc::EACCES));
        }
        // Only a RECURSE parent scans its real directory for children
        // (`VfsTree::step`), so a real_path on a non-RECURSE node (an
        // explicit-children-only mapping, or one the Host handed back via
        // PROXY) would make the new directory permanently unresolvable if
        // created directly on disk, go through the virtual store instead.
        let parent_real = if parent.flags.contains(NodeFlags::RECURSE) { parent.real_path.clone() } else { None };
        match parent_real {
            // A real-backed RECURSE|WRITABLE parent needs the directory
            // created on the real filesystem too, or a subsequent lookup
            // under it resolves via `VfsTree::step`'s RECURSE scan of the
            // real directory and finds nothing there (same real-vs-virtual
            // branch `sys_rename` takes below).
            Some(parent_real) => {
                let real_child = parent_real.join(leaf);
                let c_path = std::ffi::CString::new(real_child.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                if unsafe { libc::mkdir(c_path.as_ptr(), mode as libc::mode_t) } != 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
            }
            None => self.host.mkdir(&absolute, mode).map_err(|_| errno(libc::EROFS))?,
        }
        Ok(InnerResponse::ok(0, Vec::new()))
    }

    fn sys_rmdir(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let path = text_arg(args, 0)?;
        let node_id = self.resolve(&path).map_err(|_| errno(libc::ENOENT))?;
        let node = self.vfs.node(node_id);
        if !node.flags.contains(NodeFlags::DIRECTORY) {
            return Err(errno(libc::ENOTDIR));
        }
        if !node.flags.contains(NodeFlags::WRITABLE) {
            return Err(errno(libc::EROFS));
        }
        match &node.real_path {
            Some(p) => {
                let c_path = std::ffi::CString::new(p.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                if unsafe { libc::rmdir(c_path.as_ptr()) } != 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
            }
            None => self.host.rmdir(&path).map_err(|_| errno(libc::EIO))?,
        }
        Ok(InnerResponse::ok(0, Vec::new()))
    }

    fn sys_rename(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let from = text_arg(args, 0)?;
        let to = text_arg(args, 1)?;
        let from_node = self.resolve(&from).map_err(|_| errno(libc::ENOENT))?;
        if !self.vfs.node(from_node).flags.contains(NodeFlags::WRITABLE) {
            return Err(errno(libc::EROFS));
        }
        let from_real = self.vfs.node(from_node).real_path.clone();
        match from_real {
            Some(from_path) => {
                let to_node = self.resolve(&to).ok();
                let to_path = match to_node {
                    Some(id) => self.vfs.node(id).real_path.clone().ok_or_else(|| errno(libc::EXDEV))?,
                    // `to` doesn't resolve yet, the common rename-to-a-new-
                    // name case (e.g. an atomic tmpfile commit). That's still
                    // fine as long as its parent is a writable real-backed
                    // directory; only a genuine virtual-to-real crossing is
                    // EXDEV.
                    None => {
                        let absolute_to = self.absolutize(&to).map_err(|_| errno(libc::EIO))?;
                        let (parent_id, filter, blacklist) =
                            self.resolve_with_filter(&parent_of(&absolute_to)).map_err(|_| errno(libc::ENOENT))?;
                        let parent = self.vfs.node(parent_id);
                        if !parent.flags.contains(NodeFlags::DIRECTORY) {
                            return Err(errno(libc::ENOTDIR));
                        }
                        if !parent.flags.contains(NodeFlags::WRITABLE) {
                            return Err(errno(libc::EROFS));
                        }
                        // Same reasoning as `sys_mkdir`: only a RECURSE
                        // parent's real directory is scanned for new
                        // children, so a real_path on a non-RECURSE node
                        // would make the renamed-in name unresolvable again.
                        if !parent.flags.contains(NodeFlags::RECURSE) {
                            return Err(errno(libc::EXDEV));
                        }
                        let parent_real = parent.real_path.clone().ok_or_else(|| errno(libc::EXDEV))?;
                        let leaf = leaf_name(&absolute_to);
                        if !filter_allows(&filter, blacklist, leaf) {
                            return Err(errno(libc::EACCES));
                        }
                        parent_real.join(leaf)
                    }
                };
                let c_from = std::ffi::CString::new(from_path.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                let c_to = std::ffi::CString::new(to_path.as_os_str().as_encoded_bytes()).map_err(|_| errno(libc::EINVAL))?;
                if unsafe { libc::rename(c_from.as_ptr(), c_to.as_ptr()) } != 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
            }
            None => self.host.rename(&from, &to).map_err(|_| errno(libc::EIO))?,
        }
        Ok(InnerResponse::ok(0, Vec::new()))
    }

    fn sys_fcntl(&mut self, args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        let fd = int_arg(args, 0)? as i32;
        let cmd = int_arg(args, 1)? as i32;
        let entry = self.fds.get(fd).map_err(|_| errno(libc::EBADF))?;
        match (&entry.backing, cmd) {
            (FdBacking::Real(owned), libc::F_GETFD | libc::F_GETFL) => {
                let rc = unsafe { libc::fcntl(owned.as_raw_fd_compat(), cmd) };
                if rc < 0 {
                    return Err(errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                Ok(InnerResponse::ok(rc, Vec::new()))
            }
            (FdBacking::Virtual(_), libc::F_GETFD) => {
                let cloexec = if entry.flags.contains(NodeFlags::CLOEXEC) { libc::FD_CLOEXEC } else { 0 };
                Ok(InnerResponse::ok(cloexec, Vec::new()))
            }
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn sys_ioctl(&mut self, _args: &[DecodedArg]) -> Result<InnerResponse, Failure> {
        // No ioctl the target interpreter needs is emulated; the trapped
        // entry exists so the filter's allow-list can omit ioctl entirely.
        Err(errno(libc::ENOTTY))
    }
}

#[derive(Debug)]
enum Failure {
    Errno(i32),
}

fn errno(e: i32) -> Failure {
    Failure::Errno(e)
}

fn synthesize_stat(size: u64, mode: u32, mtime: i64) -> libc::stat {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    st.st_size = size as i64;
    st.st_mode = mode;
    st.st_mtime = mtime;
    st
}

fn stat_bytes(st: &libc::stat) -> Vec<u8> {
    let ptr = st as *const libc::stat as *const u8;
    unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<libc::stat>()) }.to_vec()
}

/// Small compatibility shim: `OwnedFd::as_raw_fd` requires the `AsRawFd`
/// trait import at every call site, which clutters handlers that just need
/// the bare integer for a `libc` call.
trait AsRawFdCompat {
    fn as_raw_fd_compat(&self) -> i32;
}
impl AsRawFdCompat for OwnedFd {
    fn as_raw_fd_compat(&self) -> i32 {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

#[derive(Debug)]
enum DecodedArg {
    Int(i64),
    Text(String),
    Data(Vec<u8>),
    OutPlaceholder,
}

fn int_arg(args: &[DecodedArg], i: usize) -> Result<i64, Failure> {
    match args.get(i) {
        Some(DecodedArg::Int(v)) => Ok(*v),
        _ => Err(errno(libc::EINVAL)),
    }
}

fn text_arg(args: &[DecodedArg], i: usize) -> Result<String, Failure> {
    match args.get(i) {
        Some(DecodedArg::Text(v)) => Ok(v.clone()),
        _ => Err(errno(libc::EINVAL)),
    }
}

/// The directory a new entry at `path` would be created in, per the policy
/// checks `sys_mkdir`/`sys_rename` need before a name that doesn't resolve
/// yet can be materialized. `"/"` for a path with no parent segment.
fn parent_of(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => "/".to_string(),
    }
}

fn leaf_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn data_arg<'a>(args: &'a [DecodedArg], i: usize) -> Result<&'a [u8], Failure> {
    match args.get(i) {
        Some(DecodedArg::Data(v)) => Ok(v.as_slice()),
        _ => Err(errno(libc::EINVAL)),
    }
}

/// Capacity of the `Out` buffer at argument index `i`: either the fixed ABI
/// size (`FIXED_SIZE_BUFFER` sentinel) or the already-decoded sibling `Int`
/// argument's value (spec.md §4.4/§6: "fixed-width args" carry their own
/// declared width).
fn out_capacity(args: &[DecodedArg], descriptor: &jailbox_shared::syscalls::SyscallDescriptor, i: usize) -> Result<usize, Failure> {
    match descriptor.args[i] {
        ArgKind::Buffer { len_arg, direction: BufferDirection::Out } => {
            if len_arg == FIXED_SIZE_BUFFER {
                Ok(std::mem::size_of::<libc::stat>())
            } else {
                int_arg(args, len_arg as usize).map(|v| v as usize)
            }
        }
        _ => Err(errno(libc::EINVAL)),
    }
}

/// Decodes a `Sys` frame's payload into positional [`DecodedArg`]s,
/// mirroring `jail::dispatch::encode_args`'s wire layout exactly (both
/// sides walk `descriptor.args` in the same order).
fn decode_args(descriptor: &jailbox_shared::syscalls::SyscallDescriptor, payload: &[u8]) -> Option<Vec<DecodedArg>> {
    let mut pos = 0usize;
    let mut out = Vec::with_capacity(6);
    for kind in descriptor.args.iter() {
        match *kind {
            ArgKind::Unused => {}
            ArgKind::Int | ArgKind::Fd | ArgKind::Flags | ArgKind::Mode | ArgKind::Offset => {
                let bytes = payload.get(pos..pos + 8)?;
                out.push(DecodedArg::Int(i64::from_le_bytes(bytes.try_into().ok()?)));
                pos += 8;
            }
            ArgKind::Path => {
                let nul = payload[pos..].iter().position(|&b| b == 0)?;
                let text = std::str::from_utf8(&payload[pos..pos + nul]).ok()?.to_string();
                out.push(DecodedArg::Text(text));
                pos += nul + 1;
            }
            ArgKind::Buffer { direction: BufferDirection::In, .. } => {
                let len_bytes = payload.get(pos..pos + 4)?;
                let len = u32::from_le_bytes(len_bytes.try_into().ok()?) as usize;
                pos += 4;
                let data = payload.get(pos..pos + len)?.to_vec();
                pos += len;
                out.push(DecodedArg::Data(data));
            }
            ArgKind::Buffer { direction: BufferDirection::Out, .. } => {
                out.push(DecodedArg::OutPlaceholder);
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_args_recovers_open_s_path_and_flags() {
        let descriptor = syscalls::descriptor_for_name("open").unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(b"/data/hello.txt\0");
        payload.extend_from_slice(&(libc::O_RDONLY as i64).to_le_bytes());
        payload.extend_from_slice(&0i64.to_le_bytes());
        let args = decode_args(&descriptor, &payload).unwrap();
        match &args[0] {
            DecodedArg::Text(p) => assert_eq!(p, "/data/hello.txt"),
            other => panic!("expected Text, got {other:?}"),
        }
        match &args[1] {
            DecodedArg::Int(f) => assert_eq!(*f, libc::O_RDONLY as i64),
            other => panic!("expected Int, got {other:?}"),
        }
    }

    #[test]
    fn decode_args_leaves_out_buffers_as_placeholders() {
        let descriptor = syscalls::descriptor_for_name("read").unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&4i64.to_le_bytes()); // fd
        payload.extend_from_slice(&4096i64.to_le_bytes()); // count
        let args = decode_args(&descriptor, &payload).unwrap();
        assert!(matches!(args[1], DecodedArg::OutPlaceholder));
        assert!(matches!(args[2], DecodedArg::Int(4096)));
    }

    #[test]
    fn out_capacity_uses_fixed_size_sentinel_for_fstat() {
        let descriptor = syscalls::descriptor_for_name("fstat").unwrap();
        let args = vec![DecodedArg::Int(4), DecodedArg::OutPlaceholder];
        let cap = out_capacity(&args, &descriptor, 1).unwrap();
        assert_eq!(cap, std::mem::size_of::<libc::stat>());
    }

    #[test]
    fn out_capacity_reads_sibling_int_for_read() {
        let descriptor = syscalls::descriptor_for_name("read").unwrap();
        let args = vec![DecodedArg::Int(4), DecodedArg::OutPlaceholder, DecodedArg::Int(128)];
        let cap = out_capacity(&args, &descriptor, 1).unwrap();
        assert_eq!(cap, 128);
    }

    #[test]
    fn parent_of_splits_at_the_last_separator() {
        assert_eq!(parent_of("/data/out.tmp"), "/data");
        assert_eq!(parent_of("/data/nested/leaf"), "/data/nested");
        assert_eq!(parent_of("/data/"), "/");
        assert_eq!(parent_of("/top"), "/");
    }

    #[test]
    fn leaf_name_returns_the_final_path_segment() {
        assert_eq!(leaf_name("/data/out.tmp"), "out.tmp");
        assert_eq!(leaf_name("/data/nested/leaf"), "leaf");
        assert_eq!(leaf_name("/top"), "top");
    }
}
