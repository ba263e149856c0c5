//! Wire/file schema for describing a virtual filesystem tree (spec.md §3,
//! §4.3). This is the shape the Host serializes into the "getfs" startup
//! message and that a policy TOML file deserializes into; the Broker's
//! live `VNode` tree (in `jailbox-worker::broker::vfs`) is built from it.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Per-node behavior flags (spec.md §3's VNode flag set).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NodeFlags: u16 {
        /// Symlinks under this node are followed rather than reported.
        const FOLLOW    = 0b0000_0001;
        /// Directory listing recurses into the real filesystem instead of
        /// relying only on explicit children.
        const RECURSE   = 0b0000_0010;
        /// Entries matching `filter` are hidden/denied rather than shown.
        const BLACKLIST = 0b0000_0100;
        /// Resolution of this node is escalated to the Host (spec.md §4.5).
        const PROXY     = 0b0000_1000;
        /// Writes are permitted; absent this flag the node is read-only.
        const WRITABLE  = 0b0001_0000;
        /// Node represents a directory rather than a leaf file.
        const DIRECTORY = 0b0010_0000;
        /// Descriptors opened on this node are closed across `exec`.
        const CLOEXEC   = 0b0100_0000;
        /// Descriptor is excluded from the Jail's automatic close-on-exit
        /// sweep (used for the reserved stdio/RPCSOCK slots).
        const NOCLOSE   = 0b1000_0000;
    }
}

/// One node in the virtual filesystem description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VNodeDesc {
    /// Name as it appears to the jailed program (not a host path).
    pub name: String,
    pub flags: NodeFlags,
    /// Host-side path this node maps to, when it maps directly to one.
    /// Absent for purely virtual (synthetic) nodes, and for `PROXY` nodes
    /// whose real path is decided by the Host at resolution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_path: Option<String>,
    /// Shell-glob filter pattern applied to directory children; whether it
    /// allow-lists or deny-lists depends on `BLACKLIST`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Explicit children, checked before `RECURSE` falls through to the
    /// real filesystem.
    #[serde(default)]
    pub children: Vec<VNodeDesc>,
}

impl VNodeDesc {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: NodeFlags::DIRECTORY,
            real_path: None,
            filter: None,
            children: Vec::new(),
        }
    }

    pub fn file(name: impl Into<String>, real_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: NodeFlags::empty(),
            real_path: Some(real_path.into()),
            filter: None,
            children: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    pub fn with_children(mut self, children: Vec<VNodeDesc>) -> Self {
        self.children = children;
        self
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(NodeFlags::DIRECTORY)
    }

    pub fn is_proxy(&self) -> bool {
        self.flags.contains(NodeFlags::PROXY)
    }
}

/// The full tree description plus the one reserved scratch node used for
/// transient materialization (spec.md §3, "Supplemented features" in
/// SPEC_FULL.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsDesc {
    pub root: VNodeDesc,
}

impl VfsDesc {
    pub fn new(root: VNodeDesc) -> Self {
        Self { root }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_flags_roundtrip_through_json() {
        let node = VNodeDesc::dir("lib").with_flags(NodeFlags::RECURSE | NodeFlags::FOLLOW);
        let json = serde_json::to_string(&node).unwrap();
        let back: VNodeDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(back.flags, node.flags);
        assert!(back.flags.contains(NodeFlags::RECURSE));
    }

    #[test]
    fn blacklist_without_filter_is_representable_but_inert() {
        let node = VNodeDesc::dir("tmp").with_flags(NodeFlags::BLACKLIST);
        assert!(node.filter.is_none());
    }

    #[test]
    fn proxy_node_has_no_required_real_path() {
        let node = VNodeDesc::dir("proc").with_flags(NodeFlags::PROXY);
        assert!(node.real_path.is_none());
        assert!(node.is_proxy());
    }
}
