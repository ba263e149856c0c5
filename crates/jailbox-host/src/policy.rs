//! Host policy: the virtual filesystem tree, resource limits, the virtual
//! interpreter path, and the fake identity handed to a Jail/Broker pair
//! (spec.md §2 step 2, §3, §5).
//!
//! A plain struct that can be built in-process by an embedder via its
//! builder, or loaded from a TOML policy file on disk for the
//! `jailbox-host` CLI.

use std::path::{Path, PathBuf};

use jailbox_shared::identity::FakeIdentity;
use jailbox_shared::limits::ResourceLimits;
use jailbox_shared::vfs_desc::VfsDesc;
use jailbox_shared::{JailboxError, JailboxResult};
use serde::{Deserialize, Serialize};

/// Everything a single Jail/Broker pair needs to be started (spec.md §2
/// step 2's "getlimits"/"getfs"/"getpythonpath" trio, plus the identity
/// the (out-of-scope) identity shim is seeded with).
#[derive(Debug, Clone)]
pub struct HostPolicy {
    pub vfs: VfsDesc,
    pub limits: ResourceLimits,
    /// Path to the interpreter binary as it appears inside the jailed
    /// view of the filesystem (spec.md §4.1's "getpythonpath").
    pub interpreter_path: String,
    pub identity: FakeIdentity,
    /// Directory the Host keeps its logs, lock files, and scratch
    /// materializations under.
    pub home: PathBuf,
}

impl HostPolicy {
    pub fn builder(interpreter_path: impl Into<String>, vfs: VfsDesc) -> HostPolicyBuilder {
        HostPolicyBuilder {
            vfs,
            limits: ResourceLimits::default(),
            interpreter_path: interpreter_path.into(),
            identity: FakeIdentity::default(),
            home: default_home(),
        }
    }

    /// Loads and validates a TOML policy file (see [`PolicyFile`] for the
    /// on-disk shape).
    pub fn from_file(path: impl AsRef<Path>) -> JailboxResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            JailboxError::Config(format!("failed to read policy file {}: {e}", path.display()))
        })?;
        let file: PolicyFile = toml::from_str(&text)
            .map_err(|e| JailboxError::Config(format!("invalid policy file {}: {e}", path.display())))?;
        file.into_policy()
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".jailbox")
}

/// Fluent builder for embedders that construct a policy in-process
/// rather than from a file on disk.
pub struct HostPolicyBuilder {
    vfs: VfsDesc,
    limits: ResourceLimits,
    interpreter_path: String,
    identity: FakeIdentity,
    home: PathBuf,
}

impl HostPolicyBuilder {
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn identity(mut self, identity: FakeIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn build(self) -> HostPolicy {
        HostPolicy {
            vfs: self.vfs,
            limits: self.limits,
            interpreter_path: self.interpreter_path,
            identity: self.identity,
            home: self.home,
        }
    }
}

/// On-disk TOML shape of a policy file. Kept distinct from [`HostPolicy`]
/// so optional fields can fall back to defaults without `HostPolicy`
/// itself growing `Option`s that every in-process caller would have to
/// populate.
#[derive(Debug, Deserialize, Serialize)]
struct PolicyFile {
    interpreter_path: String,
    vfs: VfsDesc,
    #[serde(default)]
    limits: Option<ResourceLimits>,
    #[serde(default)]
    identity: Option<FakeIdentity>,
    #[serde(default)]
    home: Option<PathBuf>,
}

impl PolicyFile {
    fn into_policy(self) -> JailboxResult<HostPolicy> {
        if self.interpreter_path.is_empty() {
            return Err(JailboxError::Config("interpreter_path must not be empty".into()));
        }
        Ok(HostPolicy {
            vfs: self.vfs,
            limits: self.limits.unwrap_or_default(),
            interpreter_path: self.interpreter_path,
            identity: self.identity.unwrap_or_default(),
            home: self.home.unwrap_or_else(default_home),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailbox_shared::vfs_desc::VNodeDesc;

    fn sample_vfs() -> VfsDesc {
        VfsDesc::new(VNodeDesc::dir("/").with_children(vec![VNodeDesc::file(
            "python3",
            "/usr/bin/python3.11",
        )]))
    }

    #[test]
    fn builder_fills_in_defaults() {
        let policy = HostPolicy::builder("/python3", sample_vfs()).build();
        assert_eq!(policy.interpreter_path, "/python3");
        assert_eq!(policy.limits, ResourceLimits::default());
        assert_eq!(policy.identity, FakeIdentity::default());
    }

    #[test]
    fn from_file_parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(
            &path,
            r#"
            interpreter_path = "/python3"

            [vfs.root]
            name = "/"
            flags = 32
            children = []
            "#,
        )
        .unwrap();

        let policy = HostPolicy::from_file(&path).unwrap();
        assert_eq!(policy.interpreter_path, "/python3");
        assert_eq!(policy.limits, ResourceLimits::default());
    }

    #[test]
    fn from_file_rejects_empty_interpreter_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(
            &path,
            r#"
            interpreter_path = ""

            [vfs.root]
            name = "/"
            flags = 32
            children = []
            "#,
        )
        .unwrap();

        assert!(HostPolicy::from_file(&path).is_err());
    }
}
