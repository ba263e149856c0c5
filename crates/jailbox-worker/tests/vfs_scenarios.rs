//! End-to-end scenarios from spec.md §8, exercised against the public
//! `broker::vfs` resolver API the way the Broker's dispatch loop would
//! drive it.

use jailbox_shared::vfs_desc::{NodeFlags, VNodeDesc, VfsDesc};
use jailbox_worker::broker::fdtable::{check_open_policy, OpenDenial, OpenIntent};
use jailbox_worker::broker::vfs::{HostEscalation, VfsTree};
use jailbox_worker::broker::vfs::NodeId;
use jailbox_shared::{JailboxError, JailboxResult};

struct NoEscalation;
impl HostEscalation for NoEscalation {
    fn getnode(&mut self, _parent: &str, _parent_real: Option<&str>, _child: &str, _full: &str) -> JailboxResult<VNodeDesc> {
        Err(JailboxError::PolicyDenied { errno: libc::ENOENT, reason: "no proxy configured".into() })
    }
    fn getcwd(&mut self) -> JailboxResult<String> {
        Ok("/".to_string())
    }
}

fn denial_errno(id: JailboxResult<NodeId>) -> i32 {
    match id.unwrap_err() {
        JailboxError::PolicyDenied { errno, .. } => errno,
        other => panic!("expected PolicyDenied, got {other:?}"),
    }
}

/// Scenario 1: read-only virtual file backed by a real path, whitelisted
/// by extension.
#[test]
fn scenario_read_only_virtual_file_backed_by_real_path() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("hello.txt"), b"hello world").unwrap();
    std::fs::write(tmp.path().join("hello.bin"), b"\x00\x01").unwrap();

    let data = VNodeDesc::dir("data")
        .with_flags(NodeFlags::RECURSE | NodeFlags::FOLLOW)
        .with_filter("*.txt");
    let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![data]));
    desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
    let mut tree = VfsTree::build(&desc);
    let mut host = NoEscalation;

    let file_id = tree.resolve("/data/hello.txt", &mut host).unwrap();
    let real_path = tree.node(file_id).real_path.clone().unwrap();
    let contents = std::fs::read(&real_path).unwrap();
    assert_eq!(contents, b"hello world");

    // hello.bin isn't matched by the whitelist filter.
    assert_eq!(denial_errno(tree.resolve("/data/hello.bin", &mut host)), libc::ENOENT);

    // The resolved node carries no WRITABLE flag, so a write open is denied
    // independent of any real filesystem permission.
    let intent = OpenIntent {
        node_exists: true,
        is_directory: false,
        writable_node: tree.node(file_id).flags.contains(NodeFlags::WRITABLE),
        o_creat: false,
        o_excl: false,
        o_directory: false,
        wants_write: true,
    };
    assert_eq!(check_open_policy(&intent), Err(OpenDenial::Erofs));
}

/// Scenario 2: an explicit virtual child shadows a same-named real entry.
#[test]
fn scenario_shadowing_explicit_child_wins() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("passwd"), b"real-passwd-contents").unwrap();

    let etc = VNodeDesc::dir("etc")
        .with_flags(NodeFlags::RECURSE)
        .with_children(vec![VNodeDesc::dir("passwd")]); // virtual, no real_path
    let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![etc]));
    desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
    let mut tree = VfsTree::build(&desc);
    let mut host = NoEscalation;

    let id = tree.resolve("/etc/passwd", &mut host).unwrap();
    assert!(tree.node(id).real_path.is_none(), "must resolve to the virtual node, not the real file");
}

/// Scenario 3: symlink policy. FOLLOW unset denies traversal through a
/// symlink; FOLLOW set permits it.
#[test]
fn scenario_symlink_policy_follow_gate() {
    let tmp = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret"), b"outside-secret").unwrap();
    std::os::unix::fs::symlink(outside.path().join("secret"), tmp.path().join("link")).unwrap();

    let make_tree = |follow: bool| {
        let mut flags = NodeFlags::RECURSE;
        if follow {
            flags |= NodeFlags::FOLLOW;
        }
        let data = VNodeDesc::dir("data").with_flags(flags);
        let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![data]));
        desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
        VfsTree::build(&desc)
    };

    let mut host = NoEscalation;

    let mut no_follow = make_tree(false);
    assert_eq!(denial_errno(no_follow.resolve("/data/link", &mut host)), libc::ENOENT);

    let mut follow = make_tree(true);
    let id = follow.resolve("/data/link", &mut host).unwrap();
    let real_path = follow.node(id).real_path.clone().unwrap();
    assert_eq!(std::fs::read(&real_path).unwrap(), b"outside-secret");
}

/// Scenario 6: a PROXY node escalates each path component to the Host,
/// which hands back virtual nodes one level at a time.
#[test]
fn scenario_proxy_walk_escalates_each_component() {
    struct RecordingProxyHost {
        calls: Vec<(String, String)>,
    }
    impl HostEscalation for RecordingProxyHost {
        fn getnode(&mut self, parent_name: &str, _parent_real: Option<&str>, child: &str, full_path: &str) -> JailboxResult<VNodeDesc> {
            self.calls.push((parent_name.to_string(), full_path.to_string()));
            match (parent_name, child) {
                ("vroot", "foo") => Ok(VNodeDesc::dir("foo").with_flags(NodeFlags::PROXY)),
                ("foo", "bar") => Ok(VNodeDesc::file("bar", "/dev/null")),
                other => panic!("unexpected getnode call: {other:?}"),
            }
        }
        fn getcwd(&mut self) -> JailboxResult<String> {
            Ok("/".to_string())
        }
    }

    let vroot = VNodeDesc::dir("vroot").with_flags(NodeFlags::PROXY);
    let desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![vroot]));
    let mut tree = VfsTree::build(&desc);
    let mut host = RecordingProxyHost { calls: Vec::new() };

    let id = tree.resolve("/vroot/foo/bar", &mut host).unwrap();
    assert_eq!(tree.node(id).name, "bar");
    assert_eq!(tree.node(id).real_path, Some(std::path::PathBuf::from("/dev/null")));
    assert_eq!(host.calls.len(), 2, "one getnode escalation per path component under the proxy node");
    assert_eq!(host.calls[0].0, "vroot");
    assert_eq!(host.calls[1].0, "foo");
}

/// spec.md §8 invariant: resolving a node's own `path_to` output returns
/// that same node.
#[test]
fn invariant_resolve_of_path_to_is_identity() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("sub")).unwrap();
    std::fs::write(tmp.path().join("sub").join("leaf.txt"), b"x").unwrap();

    let data = VNodeDesc::dir("data").with_flags(NodeFlags::RECURSE | NodeFlags::FOLLOW);
    let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![data]));
    desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());
    let mut tree = VfsTree::build(&desc);
    let mut host = NoEscalation;

    let leaf = tree.resolve("/data/sub/leaf.txt", &mut host).unwrap();
    let path = tree.path_to(leaf);
    assert_eq!(path, "/data/sub/leaf.txt");
}

/// spec.md §8 invariant: resolving a path is equivalent to resolving its
/// normalized form (redundant separators and `.` components collapse).
#[test]
fn invariant_resolve_is_insensitive_to_redundant_components() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("hello.txt"), b"hi").unwrap();

    let data = VNodeDesc::dir("data").with_flags(NodeFlags::RECURSE | NodeFlags::FOLLOW);
    let mut desc = VfsDesc::new(VNodeDesc::dir("").with_children(vec![data]));
    desc.root.children[0].real_path = Some(tmp.path().to_string_lossy().to_string());

    let mut a = VfsTree::build(&desc);
    let mut b = VfsTree::build(&desc);
    let mut host = NoEscalation;

    let plain = a.resolve("/data/hello.txt", &mut host).unwrap();
    let messy = b.resolve("/data/./hello.txt", &mut host).unwrap();
    assert_eq!(a.node(plain).name, b.node(messy).name);
    assert_eq!(a.node(plain).real_path, b.node(messy).real_path);
}
