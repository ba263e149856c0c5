//! Virtual descriptor table and `open_node` (spec.md §3, §4.4).
//!
//! Jail-visible descriptors are small non-negative integers the Broker
//! hands out starting at 4 (0–2 are stdio, 3 is RPCSOCK itself and never
//! allocable). Each slot owns either a real host `OwnedFd` or a negative
//! Host-hosted virtual token, never both (spec.md §8's fd-table
//! invariant), enforced by representation: [`FdBacking`] is an enum, not
//! two optional fields that could both be set.

use jailbox_shared::vfs_desc::NodeFlags;
use jailbox_shared::{JailboxError, JailboxResult};
use std::os::fd::OwnedFd;

/// First allocable virtual descriptor (spec.md §4.4: "slot 3 is the
/// RPCSOCK to the Jail").
pub const FIRST_ALLOCABLE: i32 = 4;

#[derive(Debug)]
pub enum FdBacking {
    /// A real descriptor the Broker itself opened against a node's
    /// `real_path`.
    Real(OwnedFd),
    /// A Host-hosted virtual descriptor, identified by the positive token
    /// the Host returned (spec.md §4.4 step 7: stored as `-(token + 1)`
    /// so the sign alone distinguishes real vs. virtual).
    Virtual(i64),
}

#[derive(Debug)]
pub struct FdEntry {
    pub name: String,
    pub real_path: Option<String>,
    pub backing: FdBacking,
    pub flags: NodeFlags,
}

/// Fixed-capacity slot table (spec.md §3: "a fixed-capacity mapping").
pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Token encoding for the negative/positive fd-token split (spec.md
    /// §4.4 step 7).
    pub fn encode_virtual_token(host_token: i64) -> i64 {
        -(host_token + 1)
    }

    pub fn decode_virtual_token(stored: i64) -> i64 {
        -stored - 1
    }

    /// Allocates the lowest free slot `>= 4` for `entry`. `EMFILE` if the
    /// table is full (spec.md §4.4, §7).
    pub fn insert(&mut self, entry: FdEntry) -> JailboxResult<i32> {
        for i in FIRST_ALLOCABLE as usize..self.slots.len() {
            if self.slots[i].is_none() {
                self.slots[i] = Some(entry);
                return Ok(i as i32);
            }
        }
        Err(JailboxError::Fd("descriptor table exhausted (EMFILE)".into()))
    }

    pub fn get(&self, fd: i32) -> JailboxResult<&FdEntry> {
        self.slots
            .get(fd as usize)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| JailboxError::Fd(format!("no such jail-visible descriptor {fd}")))
    }

    pub fn get_mut(&mut self, fd: i32) -> JailboxResult<&mut FdEntry> {
        self.slots
            .get_mut(fd as usize)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| JailboxError::Fd(format!("no such jail-visible descriptor {fd}")))
    }

    /// Removes and returns the entry at `fd`, if any (`close`'s handler
    /// drops the real fd or tells the Host to drop its virtual one).
    pub fn take(&mut self, fd: i32) -> Option<FdEntry> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// The denial order spec.md §4.4 specifies for `open_node`, independent of
/// which branch actually resolves the write (real vs. Host-virtual). The
/// caller (broker::dispatch) evaluates these against a resolved [`VNode`]
/// before doing any real I/O.
pub struct OpenIntent {
    pub node_exists: bool,
    pub is_directory: bool,
    pub writable_node: bool,
    pub o_creat: bool,
    pub o_excl: bool,
    pub o_directory: bool,
    pub wants_write: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum OpenDenial {
    Erofs,
    Enoent,
    Eisdir,
    Eexist,
    Enotdir,
}

impl OpenDenial {
    pub fn errno(&self) -> i32 {
        match self {
            OpenDenial::Erofs => libc::EROFS,
            OpenDenial::Enoent => libc::ENOENT,
            OpenDenial::Eisdir => libc::EISDIR,
            OpenDenial::Eexist => libc::EEXIST,
            OpenDenial::Enotdir => libc::ENOTDIR,
        }
    }
}

/// Evaluates spec.md §4.4's ordered rule list. `Ok(())` means the open is
/// policy-clean and the caller may proceed to the real/virtual open.
pub fn check_open_policy(intent: &OpenIntent) -> Result<(), OpenDenial> {
    if !intent.node_exists && intent.o_creat {
        return Err(OpenDenial::Erofs); // writes never create new virtual nodes
    }
    if !intent.node_exists {
        return Err(OpenDenial::Enoent);
    }
    if intent.is_directory && intent.wants_write {
        return Err(OpenDenial::Eisdir);
    }
    if intent.o_creat || intent.o_excl {
        return Err(OpenDenial::Eexist);
    }
    if intent.wants_write && !intent.writable_node {
        return Err(OpenDenial::Erofs);
    }
    if intent.is_directory && !intent.o_directory {
        return Err(OpenDenial::Enotdir);
    }
    Ok(())
}
