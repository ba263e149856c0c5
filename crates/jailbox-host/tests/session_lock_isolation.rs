//! Validates the session/concurrency bookkeeping `spawn::run_one` relies
//! on: a [`FileLockManager`] hands out distinct slots, and each slot maps
//! to an isolated virtual-fd store under the policy's home directory
//! (spec.md §5, "Concurrency & Resource Model").

use jailbox_host::lock::{FileLockManager, LockManager};
use jailbox_host::policy::HostPolicy;
use jailbox_host::rpc_server::{self, HostSession};
use jailbox_shared::identity::FakeIdentity;
use jailbox_shared::limits::ResourceLimits;
use jailbox_shared::vfs_desc::{VNodeDesc, VfsDesc};
use jailbox_shared::wire::JsonRpcRequest;
use std::io::Cursor;

fn getcwd_response(session: &HostSession) -> String {
    let request = JsonRpcRequest::new("sb.getcwd", serde_json::Value::Array(vec![]), 1);
    let mut line = serde_json::to_string(&request).unwrap();
    line.push('\n');
    let mut out = Vec::new();
    rpc_server::run(session, Cursor::new(line.into_bytes()), &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn test_policy(home: &std::path::Path) -> HostPolicy {
    HostPolicy {
        vfs: VfsDesc::new(VNodeDesc::dir("/")),
        limits: ResourceLimits::default(),
        interpreter_path: "/python3".to_string(),
        identity: FakeIdentity::default(),
        home: home.to_path_buf(),
    }
}

#[test]
fn concurrent_sessions_get_distinct_slots_and_stores() {
    let dir = tempfile::tempdir().unwrap();
    let locks = FileLockManager::new(dir.path().join("locks")).unwrap();

    let slot_a = locks.allocate().unwrap();
    let slot_b = locks.allocate().unwrap();
    assert_ne!(slot_a.0, slot_b.0);

    let session_a = HostSession::new(test_policy(dir.path()), slot_a.0);
    let session_b = HostSession::new(test_policy(dir.path()), slot_b.0);

    // Each session's "getcwd" round trip works independently; more to the
    // point, their virtual-fd stores must not collide on disk (they scope
    // to <home>/sessions/<slot>).
    assert_eq!(getcwd_response(&session_a), getcwd_response(&session_b));

    let store_a = dir.path().join("sessions").join(slot_a.0.to_string());
    let store_b = dir.path().join("sessions").join(slot_b.0.to_string());
    assert_ne!(store_a, store_b);

    locks.free(slot_a).unwrap();
    locks.free(slot_b).unwrap();
}

#[test]
fn freed_slot_is_reallocatable() {
    let dir = tempfile::tempdir().unwrap();
    let locks = FileLockManager::new(dir.path().join("locks")).unwrap();

    let slot = locks.allocate().unwrap();
    locks.free(slot).unwrap();
    let reused = locks.allocate().unwrap();
    assert_eq!(slot.0, reused.0, "freeing a slot should make its id available again");
    locks.free(reused).unwrap();
}
