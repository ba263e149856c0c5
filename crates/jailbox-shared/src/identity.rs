//! Identity-shim contract (spec.md §4.6).
//!
//! The identity shims themselves (the preloaded library that makes
//! `getpwuid`/`getuid`/friends return a fixed fake identity inside the
//! Jail) are explicitly out of scope for this workspace (spec.md marks
//! §4.6 as a Non-goal for the implementation, not for the contract). What
//! does belong here is the *data* both sides must agree on: the fixed
//! identity the Host hands the Jail at startup, and the flag name the
//! Jail uses to tell the Broker a one-way identity change has been
//! committed.

use serde::{Deserialize, Serialize};

/// The fixed fake identity presented inside the Jail, independent of the
/// Host's real uid/gid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl FakeIdentity {
    /// Fixed sandbox identity every jailed process is presented with.
    pub const DEFAULT: FakeIdentity = FakeIdentity { uid: 1000, gid: 1000 };
}

impl Default for FakeIdentity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Name of the one-way flag the Jail sets, by dynamic-loader name lookup,
/// once the seccomp filter is installed (spec.md §4.6, §6): before this
/// point the preloaded identity shims fall through to the real libc
/// implementations so the interpreter's own startup is undisturbed; after,
/// they switch to returning [`FakeIdentity::DEFAULT`] and friends. Carried
/// as a named constant so the startup handshake and the (out-of-scope)
/// shim implementation can agree on it without sharing code.
pub const IDENTITY_COMMITTED_FLAG: &str = "sandbox_identity_committed";
