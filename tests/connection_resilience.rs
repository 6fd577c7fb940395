//! Connection resilience: outage detection, recovery and fail-fast access

use authzd::store::{ConnectionOptions, PoolKind};
use authzd::{
    AuditSink, AuthzError, ConnectionManager, KvAuditSink, KvClient, KvPolicyStore, MemoryKv,
    MemoryKvFactory, PolicyStore,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(50);

fn options() -> ConnectionOptions {
    ConnectionOptions {
        health_check_interval: TICK,
        probe_timeout: Duration::from_millis(200),
    }
}

fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let step = Duration::from_millis(5);
    let mut waited = Duration::ZERO;
    while waited < limit {
        if condition() {
            return true;
        }
        thread::sleep(step);
        waited += step;
    }
    condition()
}

#[test]
fn test_probe_fails_once_then_recovers() {
    let kv = MemoryKv::new();
    kv.fail_next(1);
    let manager = ConnectionManager::new(Arc::new(MemoryKvFactory::new(kv)), options());

    let handle = manager.start().unwrap();
    assert!(!manager.connected());

    assert!(wait_until(TICK * 2, || manager.connected()));
    handle.cancel();
}

#[test]
fn test_outage_and_recovery_observed_by_loop() {
    let kv = MemoryKv::new();
    let factory = Arc::new(MemoryKvFactory::new(kv.clone()));
    let manager = ConnectionManager::new(factory.clone(), options());
    let handle = manager.start().unwrap();
    assert!(manager.connected());

    kv.set_down(true);
    assert!(wait_until(TICK * 3, || !manager.connected()));
    assert!(matches!(
        manager.client(PoolKind::Primary),
        Err(AuthzError::StoreDown)
    ));

    kv.set_down(false);
    assert!(wait_until(TICK * 3, || manager.connected()));
    assert!(factory.connects() > 2, "client handles were not recreated");

    handle.cancel();
}

#[test]
fn test_collaborators_fail_fast_while_down() {
    let kv = MemoryKv::new();
    kv.set_down(true);
    let manager = ConnectionManager::new(Arc::new(MemoryKvFactory::new(kv.clone())), options());
    let handle = manager.start().unwrap();

    let store = KvPolicyStore::new(manager.clone(), "policies", "secrets");
    assert!(matches!(store.list_policies(), Err(AuthzError::StoreDown)));

    kv.set_down(false);
    assert!(wait_until(TICK * 3, || manager.connected()));
    assert!(store.list_policies().unwrap().is_empty());

    let sink = KvAuditSink::new(manager.clone());
    sink.append_batch("audit", &[b"{}".to_vec()]).unwrap();
    assert_eq!(kv.list("audit").len(), 1);

    handle.cancel();
}

#[test]
fn test_cancel_stops_loop() {
    let kv = MemoryKv::new();
    let factory = Arc::new(MemoryKvFactory::new(kv.clone()));
    let manager = ConnectionManager::new(factory, options());
    let handle = manager.start().unwrap();
    handle.cancel();

    // With the loop gone, an outage is no longer noticed
    kv.set_down(true);
    thread::sleep(TICK * 3);
    assert!(manager.connected());
    assert!(kv.get("anything").is_err());
}
