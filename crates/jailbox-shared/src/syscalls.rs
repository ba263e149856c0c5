//! Per-architecture syscall descriptor tables.
//!
//! The Jail's seccomp filter traps a fixed set of filesystem-touching
//! syscalls (spec.md §4.1) and forwards them to the Broker as `Sys`
//! namespace inner-channel frames. This module is the single place that
//! knows which syscalls those are, their raw numbers per architecture, and
//! how to interpret their argument registers, so the filter builder, the
//! trap dispatcher, and the broker-side emulation all agree on one table
//! instead of three ad-hoc ones.

use serde::{Deserialize, Serialize};

/// How a trapped syscall's argument register should be interpreted when
/// packing it into an inner-channel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    /// Plain integer, copied verbatim.
    Int,
    /// A file descriptor already open in the Jail's (or Broker's virtual)
    /// table.
    Fd,
    /// A NUL-terminated path string read out of the Jail's memory.
    Path,
    /// A buffer pointer paired with a length argument elsewhere in the
    /// same call (index of the length arg is carried alongside). `In`
    /// buffers (e.g. `write`'s source) are copied out of the Jail's
    /// memory into the request frame; `Out` buffers (e.g. `read`'s
    /// destination, `stat`'s struct) are filled from the broker's
    /// response after the round trip.
    Buffer { len_arg: u8, direction: BufferDirection },
    /// Open/mmap-style flag bitmask.
    Flags,
    /// File mode bits (`open(2)`'s optional third argument).
    Mode,
    /// Byte offset, e.g. `lseek`/`mmap`'s offset argument.
    Offset,
    /// Argument not used by this syscall's emulation.
    Unused,
}

/// Which way a [`ArgKind::Buffer`] crosses the Jail/Broker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferDirection {
    /// Caller-supplied data, read out of the Jail's memory and sent.
    In,
    /// Broker-supplied data, written back into the Jail's memory from the
    /// response payload once the round trip completes.
    Out,
}

/// Sentinel `len_arg` for an [`ArgKind::Buffer`] whose size is fixed by the
/// platform ABI rather than carried in a sibling argument (e.g. `fstat`'s
/// `struct stat`), rather than referencing one of the six register slots.
pub const FIXED_SIZE_BUFFER: u8 = 0xFF;

/// Describes one trapped syscall: its identity, how many of its six
/// register arguments are meaningful, and how each should be decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallDescriptor {
    pub name: &'static str,
    pub args: [ArgKind; 6],
    /// True if emulating this syscall may itself need to perform a
    /// recursive mmap (spec.md §4.1's file-backed mmap sequence) rather
    /// than a single synchronous RPC round trip.
    pub recursive_emulation: bool,
}

macro_rules! descriptor {
    ($name:literal, [$($arg:expr),* $(,)?], recursive = $rec:literal) => {{
        let mut args = [ArgKind::Unused; 6];
        let given = [$($arg),*];
        let mut i = 0;
        while i < given.len() {
            args[i] = given[i];
            i += 1;
        }
        SyscallDescriptor {
            name: $name,
            args,
            recursive_emulation: $rec,
        }
    }};
}

/// The syscalls the Jail's filter traps and forwards to the Broker. Order
/// is insignificant; lookups go through [`descriptor_for_name`] or the
/// architecture-specific number tables below.
pub fn trapped_descriptors() -> &'static [SyscallDescriptor] {
    const TABLE: &[fn() -> SyscallDescriptor] = &[
        || descriptor!("open", [ArgKind::Path, ArgKind::Flags, ArgKind::Mode], recursive = false),
        || descriptor!("openat", [ArgKind::Fd, ArgKind::Path, ArgKind::Flags, ArgKind::Mode], recursive = false),
        || descriptor!("close", [ArgKind::Fd], recursive = false),
        || descriptor!(
            "read",
            [ArgKind::Fd, ArgKind::Buffer { len_arg: 2, direction: BufferDirection::Out }, ArgKind::Int],
            recursive = false
        ),
        || descriptor!(
            "write",
            [ArgKind::Fd, ArgKind::Buffer { len_arg: 2, direction: BufferDirection::In }, ArgKind::Int],
            recursive = false
        ),
        || descriptor!("lseek", [ArgKind::Fd, ArgKind::Offset, ArgKind::Int], recursive = false),
        || descriptor!(
            "fstat",
            [ArgKind::Fd, ArgKind::Buffer { len_arg: FIXED_SIZE_BUFFER, direction: BufferDirection::Out }],
            recursive = false
        ),
        || descriptor!(
            "stat",
            [ArgKind::Path, ArgKind::Buffer { len_arg: FIXED_SIZE_BUFFER, direction: BufferDirection::Out }],
            recursive = false
        ),
        || descriptor!(
            "lstat",
            [ArgKind::Path, ArgKind::Buffer { len_arg: FIXED_SIZE_BUFFER, direction: BufferDirection::Out }],
            recursive = false
        ),
        || descriptor!("access", [ArgKind::Path, ArgKind::Flags], recursive = false),
        || descriptor!(
            "readlink",
            [ArgKind::Path, ArgKind::Buffer { len_arg: 2, direction: BufferDirection::Out }, ArgKind::Int],
            recursive = false
        ),
        || descriptor!(
            "getcwd",
            [ArgKind::Buffer { len_arg: 1, direction: BufferDirection::Out }, ArgKind::Int],
            recursive = false
        ),
        || descriptor!("chdir", [ArgKind::Path], recursive = false),
        || descriptor!("unlink", [ArgKind::Path], recursive = false),
        || descriptor!("mkdir", [ArgKind::Path, ArgKind::Mode], recursive = false),
        || descriptor!("rmdir", [ArgKind::Path], recursive = false),
        || descriptor!("rename", [ArgKind::Path, ArgKind::Path], recursive = false),
        || descriptor!(
            "mmap",
            [ArgKind::Int, ArgKind::Int, ArgKind::Flags, ArgKind::Flags, ArgKind::Fd, ArgKind::Offset],
            recursive = true
        ),
        || descriptor!("fcntl", [ArgKind::Fd, ArgKind::Int, ArgKind::Int], recursive = false),
        || descriptor!("ioctl", [ArgKind::Fd, ArgKind::Int, ArgKind::Int], recursive = false),
    ];
    static CACHE: std::sync::OnceLock<Vec<SyscallDescriptor>> = std::sync::OnceLock::new();
    CACHE.get_or_init(|| TABLE.iter().map(|f| f()).collect())
}

pub fn descriptor_for_name(name: &str) -> Option<SyscallDescriptor> {
    trapped_descriptors().iter().find(|d| d.name == name).cloned()
}

/// Reverse of [`Arch::syscall_nr`]: maps a trapped raw syscall number back
/// to its canonical name on the given architecture. Used by the Jail's
/// trap dispatcher (spec.md §4.1: "looks the syscall up by number in the
/// per-architecture name table") and by the Broker's `Sys`-namespace frame
/// handler, which receives only the raw number over the wire.
pub fn name_for_trapped_nr(arch: Arch, nr: i64) -> Option<&'static str> {
    trapped_descriptors()
        .iter()
        .find(|d| arch.syscall_nr(d.name) == Some(nr))
        .map(|d| d.name)
}

/// Per-architecture raw syscall numbers for the trapped set, needed by
/// both the filter builder (to list the numbers it traps) and the trap
/// dispatcher (to map a trapped number back to a name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn detect() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        }
    }

    /// Raw syscall number for a trapped syscall name, resolved against
    /// whatever architecture this crate is built for. `None` means the
    /// syscall doesn't exist under that name on this arch (e.g. `open`,
    /// `stat`, and `lstat` have no standalone number on aarch64, only
    /// their `*at` equivalents do).
    #[cfg(target_os = "linux")]
    pub fn syscall_nr(self, name: &str) -> Option<i64> {
        Some(match name {
            "read" => libc::SYS_read,
            "write" => libc::SYS_write,
            "close" => libc::SYS_close,
            "fstat" => libc::SYS_fstat,
            "lseek" => libc::SYS_lseek,
            "mmap" => libc::SYS_mmap,
            "access" => libc::SYS_access,
            "rename" => libc::SYS_rename,
            "mkdir" => libc::SYS_mkdir,
            "rmdir" => libc::SYS_rmdir,
            "readlink" => libc::SYS_readlink,
            "unlink" => libc::SYS_unlink,
            "fcntl" => libc::SYS_fcntl,
            "ioctl" => libc::SYS_ioctl,
            "getcwd" => libc::SYS_getcwd,
            "chdir" => libc::SYS_chdir,
            "openat" => libc::SYS_openat,
            #[cfg(target_arch = "x86_64")]
            "open" => libc::SYS_open,
            #[cfg(target_arch = "x86_64")]
            "stat" => libc::SYS_stat,
            #[cfg(target_arch = "x86_64")]
            "lstat" => libc::SYS_lstat,

            // Not trapped/forwarded to the Broker (no `SyscallDescriptor`
            // above) but still resolved here: `jail::filter` looks these up
            // by name too, to name the unconditional or narrowly-conditioned
            // allow-list entries around the trapped set (memory management,
            // signal return plumbing, process exit, and the interpreter exec
            // itself).
            "readv" => libc::SYS_readv,
            "writev" => libc::SYS_writev,
            "brk" => libc::SYS_brk,
            "munmap" => libc::SYS_munmap,
            "mprotect" => libc::SYS_mprotect,
            "rt_sigreturn" => libc::SYS_rt_sigreturn,
            "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
            "sigaltstack" => libc::SYS_sigaltstack,
            "rt_sigaction" => libc::SYS_rt_sigaction,
            "getrusage" => libc::SYS_getrusage,
            "tgkill" => libc::SYS_tgkill,
            "futex" => libc::SYS_futex,
            "uname" => libc::SYS_uname,
            "exit" => libc::SYS_exit,
            "exit_group" => libc::SYS_exit_group,
            "execve" => libc::SYS_execve,
            _ => return None,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn syscall_nr(self, _name: &str) -> Option<i64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_trapped_descriptor_is_unique() {
        let names: Vec<&str> = trapped_descriptors().iter().map(|d| d.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names.len(), sorted.len());
    }

    #[test]
    fn open_has_path_flags_mode_layout() {
        let d = descriptor_for_name("open").unwrap();
        assert_eq!(d.args[0], ArgKind::Path);
        assert_eq!(d.args[1], ArgKind::Flags);
        assert_eq!(d.args[2], ArgKind::Mode);
    }

    #[test]
    fn mmap_is_flagged_recursive() {
        let d = descriptor_for_name("mmap").unwrap();
        assert!(d.recursive_emulation);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn read_resolves_to_a_syscall_number_on_this_arch() {
        assert!(Arch::detect().syscall_nr("read").is_some());
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    #[test]
    fn stat_has_no_standalone_number_on_aarch64() {
        assert_eq!(Arch::Aarch64.syscall_nr("stat"), None);
    }
}
