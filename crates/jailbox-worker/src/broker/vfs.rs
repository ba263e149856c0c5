//! Virtual filesystem tree and resolver (spec.md §3, §4.3).
//!
//! The tree is arena-owned: nodes are addressed by [`NodeId`] (an index
//! into `VfsTree::nodes`) rather than by `Rc`/`RefCell` parent/child
//! pointers, per SPEC_FULL.md's design-notes guidance to keep the eager
//! `Tree` layer and the lazy `RealOverlay` layer (RECURSE/PROXY) visibly
//! separate. The root's `parent` is itself, matching spec.md §3's
//! "root self-loop" invariant; `..` at the root is a no-op ascent.

use jailbox_shared::vfs_desc::{NodeFlags, VNodeDesc, VfsDesc};
use jailbox_shared::{JailboxError, JailboxResult};
use std::path::{Path, PathBuf};

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct VNode {
    pub name: String,
    pub real_path: Option<PathBuf>,
    pub flags: NodeFlags,
    pub filter: Vec<FilterPattern>,
    pub blacklist: bool,
    pub parent: NodeId,
    pub children: Vec<NodeId>,
}

impl VNode {
    fn is_directory(&self) -> bool {
        self.flags.contains(NodeFlags::DIRECTORY)
    }
}

/// One glob pattern from a `VNodeDesc::filter` string, split at its first
/// `/` so the resolver can match one path component at a time while
/// carrying the remainder forward for the next descent (spec.md §4.3
/// step 3a: "`a/b/*.py` becomes `b/*.py` one level deeper").
#[derive(Debug, Clone)]
pub struct FilterPattern {
    pub first_segment: String,
    pub rest: Option<String>,
}

/// Prefixes `path` with the Host-tracked cwd when it isn't already
/// absolute. Shared by `VfsTree::resolve` and by handlers that need the
/// absolute form of a path before it resolves to anything (`mkdir`, a
/// rename's destination leg), so a relative path isn't checked or created
/// against the wrong directory.
pub fn absolutize(path: &str, host: &mut dyn HostEscalation) -> JailboxResult<String> {
    if path.starts_with('/') {
        return Ok(path.to_string());
    }
    let cwd = host.getcwd()?;
    Ok(format!("{}/{}", cwd.trim_end_matches('/'), path))
}

/// `VNodeDesc::filter` is one pattern, or several separated by `;`
/// (spec.md §3 describes "an ordered list of shell-glob patterns").
pub fn parse_filter(raw: &str) -> Vec<FilterPattern> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|p| match p.split_once('/') {
            Some((first, rest)) => FilterPattern { first_segment: first.to_string(), rest: Some(rest.to_string()) },
            None => FilterPattern { first_segment: p.to_string(), rest: None },
        })
        .collect()
}

/// `fnmatch(..., FNM_PERIOD)`-equivalent: a leading `.` in `name` is only
/// matched by a pattern that itself starts with `.` (globset's default
/// glob semantics otherwise let `*` match a leading dot).
fn glob_matches(pattern: &str, name: &str) -> bool {
    if name.starts_with('.') && !pattern.starts_with('.') {
        return false;
    }
    globset::Glob::new(pattern)
        .map(|g| g.compile_matcher().is_match(name))
        .unwrap_or(false)
}

/// Evaluates `c` against one node's filter list: `Some(patterns-to-carry)`
/// if `c` is allowed to be descended into, `None` if policy denies it.
/// Whether `name` passes the filter/blacklist pair `resolve_with_filter`
/// returned for some already-resolved parent (the same check `step`
/// makes before descending into an existing entry), reused here for a
/// handler that's about to create a new one instead.
pub fn filter_allows(filters: &[FilterPattern], blacklist: bool, name: &str) -> bool {
    apply_filter(filters, blacklist, name).is_some()
}

fn apply_filter(filters: &[FilterPattern], blacklist: bool, c: &str) -> Option<Vec<FilterPattern>> {
    if filters.is_empty() {
        return Some(Vec::new());
    }
    let mut matched_any = false;
    let mut carried = Vec::new();
    for pat in filters {
        if glob_matches(&pat.first_segment, c) {
            matched_any = true;
            if let Some(rest) = &pat.rest {
                carried.push(match rest.split_once('/') {
                    Some((first, tail)) => FilterPattern { first_segment: first.to_string(), rest: Some(tail.to_string()) },
                    None => FilterPattern { first_segment: rest.clone(), rest: None },
                });
            }
        }
    }
    if blacklist {
        if matched_any {
            None // a blacklist match denies
        } else {
            Some(Vec::new()) // no match: not denied, and nothing left to carry
        }
    } else if matched_any {
        Some(carried)
    } else {
        None // whitelist: no match across all patterns denies
    }
}

/// Answers the two things the resolver can't decide locally: a `PROXY`
/// step's node description, and the current working directory for
/// relative-path resolution (spec.md §4.3 steps 1 and 3's Host escalation).
/// Implemented by `broker::host_client` in the live process; tests supply
/// a stub.
pub trait HostEscalation {
    fn getnode(&mut self, parent_name: &str, parent_real_path: Option<&str>, child: &str, full_path: &str) -> JailboxResult<VNodeDesc>;
    fn getcwd(&mut self) -> JailboxResult<String>;
}

pub struct VfsTree {
    nodes: Vec<VNode>,
    root: NodeId,
    /// Reserved landing spot for both PROXY resolutions and RECURSE-
    /// discovered real entries (spec.md §3's "scratch" parent); overwritten
    /// on every use, never persisted (spec.md §4.3 invariants).
    scratch: NodeId,
}

fn enoent() -> JailboxError {
    JailboxError::PolicyDenied { errno: libc::ENOENT, reason: "path not present in the virtual filesystem".into() }
}

impl VfsTree {
    pub fn build(desc: &VfsDesc) -> Self {
        let mut nodes = Vec::new();
        let root = push_desc_tree(&mut nodes, &desc.root, None);
        // Root's parent is itself (spec.md §3).
        nodes[root].parent = root;
        let scratch = nodes.len();
        nodes.push(VNode {
            name: String::from(".scratch"),
            real_path: None,
            flags: NodeFlags::DIRECTORY,
            filter: Vec::new(),
            blacklist: false,
            parent: root,
            children: Vec::new(),
        });
        Self { nodes, root, scratch }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &VNode {
        &self.nodes[id]
    }

    /// Full path from the root down to `id`, used only for PROXY
    /// escalation requests and diagnostics (spec.md §4.3 step 3: PROXY's
    /// `getnode` call takes the accumulated `full_path`).
    pub fn path_to(&self, mut id: NodeId) -> String {
        let mut parts = Vec::new();
        while id != self.root {
            parts.push(self.nodes[id].name.clone());
            let parent = self.nodes[id].parent;
            if parent == id {
                break;
            }
            id = parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Resolves `path` against this tree, per spec.md §4.3's algorithm.
    pub fn resolve(&mut self, path: &str, host: &mut dyn HostEscalation) -> JailboxResult<NodeId> {
        self.resolve_with_filter(path, host).map(|(id, _, _)| id)
    }

    /// Resolves `path`, also returning the filter/blacklist pair that
    /// would gate a *new* child name of the resolved node (spec.md §4.3
    /// step 3a). A materialized RECURSE node's own `filter` field is
    /// always empty (`step` never stores one on it); the live pattern
    /// fragments a multi-segment filter carries between levels exist only
    /// as this walk's local state, so a handler that creates a name
    /// directly (`mkdir`, a rename's destination leg) instead of
    /// descending through `step` needs this to check the same restriction
    /// `step` would have applied to an equivalent lookup.
    pub fn resolve_with_filter(
        &mut self,
        path: &str,
        host: &mut dyn HostEscalation,
    ) -> JailboxResult<(NodeId, Vec<FilterPattern>, bool)> {
        let absolute = absolutize(path, host)?;
        let path = absolute.as_str();

        let mut cur = self.root;
        let mut carried_filter: Vec<FilterPattern> = Vec::new();

        for component in path.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                let parent = self.nodes[cur].parent;
                cur = parent;
                carried_filter.clear();
                continue;
            }

            cur = self.step(cur, component, &mut carried_filter, host)?;
        }

        let filter = if carried_filter.is_empty() { self.nodes[cur].filter.clone() } else { carried_filter };
        let blacklist = self.nodes[cur].blacklist;
        Ok((cur, filter, blacklist))
    }

    fn step(
        &mut self,
        cur: NodeId,
        c: &str,
        carried_filter: &mut Vec<FilterPattern>,
        host: &mut dyn HostEscalation,
    ) -> JailboxResult<NodeId> {
        if self.nodes[cur].flags.contains(NodeFlags::PROXY) {
            let parent_name = self.nodes[cur].name.clone();
            let parent_real = self.nodes[cur].real_path.clone();
            let full_path = format!("{}/{}", self.path_to(cur), c);
            let desc = host.getnode(&parent_name, parent_real.as_deref().and_then(|p| p.to_str()), c, &full_path)?;
            carried_filter.clear();
            return Ok(self.materialize_scratch_child(desc, cur));
        }

        // Explicit children always shadow an equally named real entry.
        if let Some(&child) = self.nodes[cur].children.iter().find(|&&id| self.nodes[id].name == c) {
            carried_filter.clear();
            return Ok(child);
        }

        let real_path = self.nodes[cur].real_path.clone();
        let recurse = self.nodes[cur].flags.contains(NodeFlags::RECURSE);
        if let (Some(real_path), true) = (real_path, recurse) {
            let node_filter: &[FilterPattern] =
                if carried_filter.is_empty() { &self.nodes[cur].filter } else { carried_filter.as_slice() };
            let blacklist = self.nodes[cur].flags.contains(NodeFlags::BLACKLIST);
            let next_filter = match apply_filter(node_filter, blacklist, c) {
                Some(carry) => carry,
                None => return Err(enoent()),
            };

            let entry_path = real_path.join(c);
            let entry = find_dir_entry(&real_path, c)?;
            let follow = self.nodes[cur].flags.contains(NodeFlags::FOLLOW);
            let inherited_flags = self.nodes[cur].flags & !NodeFlags::DIRECTORY;

            let meta = if follow { std::fs::metadata(&entry_path) } else { std::fs::symlink_metadata(&entry_path) };
            let meta = meta.map_err(|_| enoent())?;
            if meta.file_type().is_symlink() && !follow {
                return Err(enoent());
            }

            let mut flags = inherited_flags;
            if meta.is_dir() {
                flags |= NodeFlags::DIRECTORY;
            }

            let _ = entry; // directory-entry collation already confirmed existence above
            let materialized = VNode {
                name: c.to_string(),
                real_path: Some(entry_path),
                flags,
                filter: Vec::new(),
                blacklist,
                parent: cur,
                children: Vec::new(),
            };
            *carried_filter = next_filter;
            return Ok(self.install_scratch(materialized));
        }

        Err(enoent())
    }

    fn materialize_scratch_child(&mut self, desc: VNodeDesc, parent: NodeId) -> NodeId {
        let node = desc_to_node(&desc, parent);
        self.install_scratch(node)
    }

    /// Overwrites the reserved scratch slot's sole child with `node` and
    /// returns its id. Never persists across calls (spec.md §4.3).
    fn install_scratch(&mut self, node: VNode) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.nodes[self.scratch].children.clear();
        self.nodes[self.scratch].children.push(id);
        id
    }
}

/// Scans a real directory for an entry named `c` under host locale
/// collation (spec.md §4.3 step 3b). We rely on `std::fs::read_dir`'s
/// OS-provided ordering/collation rather than re-implementing `strcoll`.
fn find_dir_entry(dir: &Path, c: &str) -> JailboxResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|_| enoent())?;
    for entry in entries.flatten() {
        if entry.file_name() == std::ffi::OsStr::new(c) {
            return Ok(());
        }
    }
    Err(enoent())
}

fn push_desc_tree(nodes: &mut Vec<VNode>, desc: &VNodeDesc, parent: Option<NodeId>) -> NodeId {
    let id = nodes.len();
    nodes.push(VNode {
        name: desc.name.clone(),
        real_path: desc.real_path.as_ref().map(PathBuf::from),
        flags: desc.flags,
        filter: desc.filter.as_deref().map(parse_filter).unwrap_or_default(),
        blacklist: desc.flags.contains(NodeFlags::BLACKLIST),
        parent: parent.unwrap_or(id),
        children: Vec::new(),
    });
    for child in &desc.children {
        let child_id = push_desc_tree(nodes, child, Some(id));
        nodes[id].children.push(child_id);
    }
    id
}

fn desc_to_node(desc: &VNodeDesc, parent: NodeId) -> VNode {
    VNode {
        name: desc.name.clone(),
        real_path: desc.real_path.as_ref().map(PathBuf::from),
        flags: desc.flags,
        filter: desc.filter.as_deref().map(parse_filter).unwrap_or_default(),
        blacklist: desc.flags.contains(NodeFlags::BLACKLIST),
        parent,
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoProxyHost;
    impl HostEscalation for NoProxyHost {
        fn getnode(&mut self, _p: &str, _rp: Option<&str>, _c: &str, _full: &str) -> JailboxResult<VNodeDesc> {
            Err(enoent())
        }
        fn getcwd(&mut self) -> JailboxResult<String> {
            Ok("/".to_string())
        }
    }

    fn fixture_tree(tmp: &std::path::Path) -> VfsTree {
        std::fs::write(tmp.join("hello.txt"), b"hi").unwrap();
        std::fs::write(tmp.join("hello.bin"), b"\0\0").unwrap();
        let data = VNodeDesc::dir("data")
            .with_flags(NodeFlags::RECURSE | NodeFlags::FOLLOW)
            .with_filter("*.txt");
        let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![data]));
        desc.root.children[0].real_path = Some(tmp.to_string_lossy().to_string());
        VfsTree::build(&desc)
    }

    #[test]
    fn resolve_finds_real_backed_file_matching_whitelist() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tree = fixture_tree(tmp.path());
        let mut host = NoProxyHost;
        let id = tree.resolve("/data/hello.txt", &mut host).unwrap();
        assert_eq!(tree.node(id).name, "hello.txt");
    }

    #[test]
    fn resolve_denies_non_matching_whitelist_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tree = fixture_tree(tmp.path());
        let mut host = NoProxyHost;
        let err = tree.resolve("/data/hello.bin", &mut host).unwrap_err();
        match err {
            JailboxError::PolicyDenied { errno, .. } => assert_eq!(errno, libc::ENOENT),
            other => panic!("expected PolicyDenied, got {other:?}"),
        }
    }

    #[test]
    fn resolve_root_dotdot_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tree = fixture_tree(tmp.path());
        let mut host = NoProxyHost;
        let root = tree.resolve("/", &mut host).unwrap();
        let root_up = tree.resolve("/..", &mut host).unwrap();
        assert_eq!(root, root_up);
    }

    #[test]
    fn shadowing_explicit_child_wins_over_real_entry() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("passwd"), b"real").unwrap();
        let mut desc = VfsDesc::new(
            VNodeDesc::dir("")
                .with_flags(NodeFlags::DIRECTORY)
                .with_children(vec![VNodeDesc::dir("etc")
                    .with_flags(NodeFlags::DIRECTORY | NodeFlags::RECURSE)
                    .with_children(vec![VNodeDesc::file("passwd", "/dev/null").with_flags(NodeFlags::empty())])]),
        );
        desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
        let mut tree = VfsTree::build(&desc);
        let mut host = NoProxyHost;
        let id = tree.resolve("/etc/passwd", &mut host).unwrap();
        assert_eq!(tree.node(id).real_path, Some(PathBuf::from("/dev/null")));
    }

    #[test]
    fn blacklist_filter_denies_matching_real_entry() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("secret.key"), b"x").unwrap();
        let mut desc = VfsDesc::new(
            VNodeDesc::dir("")
                .with_flags(NodeFlags::DIRECTORY)
                .with_children(vec![VNodeDesc::dir("data")
                    .with_flags(NodeFlags::DIRECTORY | NodeFlags::RECURSE | NodeFlags::BLACKLIST)
                    .with_filter("*.key")]),
        );
        desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
        let mut tree = VfsTree::build(&desc);
        let mut host = NoProxyHost;
        let err = tree.resolve("/data/secret.key", &mut host).unwrap_err();
        assert!(matches!(err, JailboxError::PolicyDenied { errno, .. } if errno == libc::ENOENT));
    }

    /// A multi-segment filter like `sub/*.txt` is only fully represented as
    /// `resolve_with_filter`'s walk-local `carried_filter`: `step` always
    /// materializes the RECURSE-mapped `sub` node with an empty `filter`
    /// field of its own. A caller that wants the restriction gating a new
    /// name directly under `sub` (as `sys_mkdir`/`sys_rename` do) has to use
    /// the carried state, not the resolved node's own field.
    #[test]
    fn resolve_with_filter_carries_multi_segment_pattern_to_the_final_component() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let data = VNodeDesc::dir("data")
            .with_flags(NodeFlags::RECURSE | NodeFlags::WRITABLE)
            .with_filter("sub/*.txt");
        let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![data]));
        desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
        let mut tree = VfsTree::build(&desc);
        let mut host = NoProxyHost;

        let (sub_id, filter, blacklist) = tree.resolve_with_filter("/data/sub", &mut host).unwrap();
        assert!(tree.node(sub_id).filter.is_empty(), "step never stores a filter on a materialized RECURSE node");
        assert!(!blacklist);
        assert!(filter_allows(&filter, blacklist, "notes.txt"));
        assert!(!filter_allows(&filter, blacklist, "notes.bin"));
    }

    #[test]
    fn resolve_of_path_to_a_nested_materialized_node_is_identity() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub").join("leaf.txt"), b"x").unwrap();
        let data = VNodeDesc::dir("data").with_flags(NodeFlags::RECURSE | NodeFlags::FOLLOW);
        let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![data]));
        desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
        let mut tree = VfsTree::build(&desc);
        let mut host = NoProxyHost;

        let leaf = tree.resolve("/data/sub/leaf.txt", &mut host).unwrap();
        let path = tree.path_to(leaf);
        assert_eq!(path, "/data/sub/leaf.txt");
    }
}
