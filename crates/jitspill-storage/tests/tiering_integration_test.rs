//! Integration tests for device/host/disk tiering
//!
//! Tests cover:
//! 1. Every tracked proxy sits in exactly one tier
//! 2. Host and device tallies (including aliased device buffers)
//! 3. LRU eviction: sufficiency, recency order, size tie-break
//! 4. Disk demotion round trip and spill file cleanup
//! 5. Idempotent re-insertion
//! 6. Concurrent tier transitions

use jitspill_core::SpillConfig;
use jitspill_storage::testing::{TestArray, TestProxify, TestValue};
use jitspill_storage::{
    proxy_id, DeviceObject, Proxy, ProxifyHostFile, ProxyManager, ProxyObject, ProxyRef,
    SerializedPayload, SpillDirectory, Tier,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper: manager spilling into a fresh temporary directory
fn create_test_manager(device_limit: u64, host_limit: u64) -> (Arc<ProxyManager>, TempDir) {
    init_tracing();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let spill = SpillDirectory::new(tmp.path(), false).expect("Failed to create spill dir");
    (ProxyManager::new(device_limit, host_limit, spill), tmp)
}

/// Helper: wrap `array` in a proxy tracked by `manager`
fn track(manager: &Arc<ProxyManager>, array: TestArray) -> Arc<ProxyObject<TestArray>> {
    let proxy = ProxyObject::new(array);
    let handle: ProxyRef = proxy.clone();
    handle.attach_manager(Arc::downgrade(manager));
    manager
        .add(&handle, handle.serializer())
        .expect("Failed to track proxy");
    proxy
}

fn as_ref(proxy: &Arc<ProxyObject<TestArray>>) -> ProxyRef {
    proxy.clone()
}

fn tier_of(manager: &ProxyManager, proxy: &Arc<ProxyObject<TestArray>>) -> Option<Tier> {
    manager.locate(proxy.id())
}

fn host_size_sum(manager: &ProxyManager) -> u64 {
    manager
        .registry(Tier::Host)
        .proxies()
        .iter()
        .map(|p| p.size_of())
        .sum()
}

#[test]
fn test_scenario_three_arrays_over_device_limit() {
    // Setup: device limit 100, three distinct 40-byte buffers
    let (manager, _tmp) = create_test_manager(100, 10_000);
    let a = track(&manager, TestArray::new(1, 40));
    let b = track(&manager, TestArray::new(2, 40));
    let c = track(&manager, TestArray::new(3, 40));

    let t0 = Instant::now();
    a.set_last_access(t0);
    b.set_last_access(t0 + Duration::from_millis(1));
    c.set_last_access(t0 + Duration::from_millis(2));
    assert_eq!(manager.usage(Tier::Device), 120);

    manager.maybe_evict(0).expect("Eviction failed");

    // Verify: only the oldest array left the device
    assert_eq!(tier_of(&manager, &a), Some(Tier::Host));
    assert_eq!(tier_of(&manager, &b), Some(Tier::Device));
    assert_eq!(tier_of(&manager, &c), Some(Tier::Device));
    assert_eq!(manager.usage(Tier::Device), 80);
    assert_eq!(manager.usage(Tier::Host), a.size_of());
    assert!(manager.usage(Tier::Host) >= 40);
    manager.validate().expect("Manager state is inconsistent");
}

#[test]
fn test_scenario_aliased_buffer_tally() {
    let (manager, _tmp) = create_test_manager(1000, 1000);
    let base = TestArray::new(7, 50);
    let first = track(&manager, base.clone());
    let second = track(&manager, base.alias());

    // Verify: the shared buffer is counted once
    assert_eq!(manager.usage(Tier::Device), 50);

    manager.remove(&as_ref(&first)).expect("Failed to remove");
    assert_eq!(manager.usage(Tier::Device), 50);

    manager.remove(&as_ref(&second)).expect("Failed to remove");
    assert_eq!(manager.usage(Tier::Device), 0);
    assert!(manager.is_empty());
}

#[test]
fn test_device_tally_counts_distinct_buffers() {
    let (manager, _tmp) = create_test_manager(10_000, 10_000);
    let shared = TestArray::with_buffers(&[(1, 100), (2, 30)]);
    let _a = track(&manager, shared.clone());
    let _b = track(&manager, shared.alias());
    let _c = track(&manager, TestArray::with_buffers(&[(2, 30), (3, 5)]));

    assert_eq!(manager.usage(Tier::Device), 135);
}

#[test]
fn test_host_tally_matches_sizes() {
    let (manager, _tmp) = create_test_manager(10_000, 10_000);
    let proxies: Vec<_> = (0..5)
        .map(|i| track(&manager, TestArray::new(i, 10 + i * 7)))
        .collect();

    for proxy in &proxies[..3] {
        manager
            .demote_to_host(&as_ref(proxy))
            .expect("Failed to demote");
    }

    assert_eq!(manager.registry(Tier::Host).len(), 3);
    assert_eq!(manager.usage(Tier::Host), host_size_sum(&manager));

    let expected_dev: u64 = proxies[3..].iter().map(|p| p.nbytes()).sum();
    assert_eq!(manager.usage(Tier::Device), expected_dev);
    manager.validate().expect("Manager state is inconsistent");
}

#[test]
fn test_eviction_sufficiency() {
    let (manager, _tmp) = create_test_manager(1000, 100_000);
    let proxies: Vec<_> = (0..20)
        .map(|i| track(&manager, TestArray::new(i, 50)))
        .collect();
    let t0 = Instant::now();
    for (i, proxy) in proxies.iter().enumerate() {
        proxy.set_last_access(t0 + Duration::from_millis(i as u64));
    }

    // The device is full and 500 more bytes are about to arrive
    let freed = manager
        .maybe_evict_from_device(500)
        .expect("Eviction failed");

    assert!(freed >= 500);
    assert!(manager.usage(Tier::Device) + 500 <= 1000);
    assert_eq!(manager.registry(Tier::Host).len(), 10);
    for proxy in &proxies[..10] {
        assert_eq!(tier_of(&manager, proxy), Some(Tier::Host));
    }
    manager.validate().expect("Manager state is inconsistent");
}

#[test]
fn test_eviction_stops_when_tier_is_exhausted() {
    let (manager, _tmp) = create_test_manager(100, 10_000);
    let a = track(&manager, TestArray::new(1, 60));
    let b = track(&manager, TestArray::new(2, 30));

    // Nothing could make room for this much
    let freed = manager
        .maybe_evict_from_device(1_000_000)
        .expect("Eviction failed");

    assert_eq!(freed, 90);
    assert_eq!(tier_of(&manager, &a), Some(Tier::Host));
    assert_eq!(tier_of(&manager, &b), Some(Tier::Host));
    assert_eq!(manager.usage(Tier::Device), 0);
}

#[test]
fn test_recency_order_of_eviction() {
    let (manager, _tmp) = create_test_manager(1_000, 10_000);
    let proxies: Vec<_> = (0..3)
        .map(|i| track(&manager, TestArray::new(i, 40)))
        .collect();
    let t0 = Instant::now();
    proxies[0].set_last_access(t0 + Duration::from_millis(2));
    proxies[1].set_last_access(t0);
    proxies[2].set_last_access(t0 + Duration::from_millis(1));

    let mut order = Vec::new();
    manager
        .evict(
            120,
            || manager.access_snapshot(Tier::Device),
            |p| {
                order.push(proxy_id(p));
                manager.demote_to_host(p)
            },
        )
        .expect("Eviction failed");

    let expected: Vec<_> = [1, 2, 0].iter().map(|&i| proxies[i].id()).collect();
    assert_eq!(order, expected);
}

#[test]
fn test_size_tie_break() {
    let (manager, _tmp) = create_test_manager(1_000, 10_000);
    let small = track(&manager, TestArray::new(1, 20));
    let large = track(&manager, TestArray::new(2, 80));
    let t0 = Instant::now();
    small.set_last_access(t0);
    large.set_last_access(t0);

    manager
        .evict(
            1,
            || manager.access_snapshot(Tier::Device),
            |p| manager.demote_to_host(p),
        )
        .expect("Eviction failed");

    // Verify: equally cold, the larger buffer goes first
    assert_eq!(tier_of(&manager, &large), Some(Tier::Host));
    assert_eq!(tier_of(&manager, &small), Some(Tier::Device));
}

#[test]
fn test_disk_round_trip_deletes_file() {
    let (manager, tmp) = create_test_manager(10_000, 10_000);
    let array = TestArray::with_buffers(&[(1, 4096), (2, 100)]);
    let proxy = track(&manager, array.clone());

    // Through host first, so the frames go to disk without re-serializing
    manager
        .demote_to_host(&as_ref(&proxy))
        .expect("Failed to demote to host");
    manager
        .demote_to_disk(&as_ref(&proxy))
        .expect("Failed to demote to disk");

    let path = match proxy.serialized() {
        Some(SerializedPayload::Disk(header)) => header.path,
        other => panic!("Expected a disk payload, got {:?}", other),
    };
    assert!(path.exists());
    assert!(path.starts_with(tmp.path()));
    assert_eq!(manager.usage(Tier::Host), 0);
    assert!(manager.usage(Tier::Disk) > 0);

    let restored = proxy.get().expect("Failed to un-spill");
    assert_eq!(*restored, array);
    assert_eq!(restored.nbytes(), 4196);
    assert!(!path.exists(), "Spill file should be deleted after reading");
    assert_eq!(tier_of(&manager, &proxy), Some(Tier::Device));
    assert_eq!(manager.usage(Tier::Disk), 0);
    manager.validate().expect("Manager state is inconsistent");
}

#[test]
fn test_unspill_evicts_to_make_room() {
    let (manager, _tmp) = create_test_manager(100, 10_000);
    let cold = track(&manager, TestArray::new(1, 80));
    manager
        .demote_to_host(&as_ref(&cold))
        .expect("Failed to demote");
    let hot = track(&manager, TestArray::new(2, 60));

    // Bringing `cold` back needs 80 bytes, only 40 are free
    cold.get().expect("Failed to un-spill");

    assert_eq!(tier_of(&manager, &cold), Some(Tier::Device));
    assert_eq!(tier_of(&manager, &hot), Some(Tier::Host));
    assert_eq!(manager.usage(Tier::Device), 80);
}

#[test]
fn test_idempotent_reinsertion() {
    let (manager, _tmp) = create_test_manager(1000, 1000);
    let proxy = track(&manager, TestArray::new(1, 40));
    let handle = as_ref(&proxy);

    for _ in 0..3 {
        manager
            .add(&handle, handle.serializer())
            .expect("Re-adding should succeed");
    }

    assert_eq!(manager.len(), 1);
    assert_eq!(manager.usage(Tier::Device), 40);
}

#[test]
fn test_cascade_keeps_every_tier_within_limits() {
    init_tracing();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let file: ProxifyHostFile<u64, TestValue, TestProxify> = ProxifyHostFile::with_spill_directory(
        &SpillConfig::with_limits(200, 300),
        SpillDirectory::new(tmp.path(), false).expect("Failed to create spill dir"),
        TestProxify,
    );

    for i in 0..20 {
        file.insert(i, TestValue::Array(TestArray::new(i, 64)))
            .expect("Insert failed");
    }

    let manager = file.manager();
    assert!(manager.usage(Tier::Device) <= 200);
    assert!(manager.usage(Tier::Host) <= 300);
    assert_eq!(manager.len(), 20);
    assert_eq!(
        std::fs::read_dir(tmp.path()).unwrap().count(),
        manager.registry(Tier::Disk).len()
    );
    manager.validate().expect("Manager state is inconsistent");

    // Every value can still be read back
    for i in 0..20 {
        match file.get(&i).expect("Lookup failed") {
            Some(TestValue::Proxy(proxy)) => assert_eq!(proxy.nbytes(), 64),
            other => panic!("Expected a proxy, got {:?}", other),
        }
    }
}

#[test]
fn test_concurrent_transitions_never_lose_a_proxy() {
    let (manager, _tmp) = create_test_manager(1 << 20, 1 << 20);
    let proxies: Arc<Vec<_>> = Arc::new(
        (0..32)
            .map(|i| track(&manager, TestArray::new(i, 256 + i)))
            .collect(),
    );
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let manager = Arc::clone(&manager);
        let proxies = Arc::clone(&proxies);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                for proxy in proxies.iter() {
                    assert!(manager.locate(proxy.id()).is_some());
                }
            }
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let manager = Arc::clone(&manager);
            let proxies = Arc::clone(&proxies);
            thread::spawn(move || {
                for round in 0..5 {
                    for proxy in proxies.iter().skip(w).step_by(4) {
                        let handle: ProxyRef = proxy.clone();
                        manager.demote_to_host(&handle).expect("Failed to demote");
                        if round % 2 == 0 {
                            manager.demote_to_disk(&handle).expect("Failed to spill");
                        }
                        proxy.get().expect("Failed to un-spill");
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("Worker panicked");
    }
    done.store(true, Ordering::Release);
    reader.join().expect("Reader panicked");

    // Verify: everything is back on the device and counted once
    let expected: u64 = proxies.iter().map(|p| p.nbytes()).sum();
    assert_eq!(manager.len(), 32);
    assert_eq!(manager.usage(Tier::Device), expected);
    assert_eq!(manager.usage(Tier::Host), 0);
    assert_eq!(manager.usage(Tier::Disk), 0);
    manager.validate().expect("Manager state is inconsistent");
}

#[test]
fn test_concurrent_disk_demotion_leaves_one_file() {
    for _ in 0..50 {
        let (manager, tmp) = create_test_manager(1 << 20, 1 << 20);
        let proxy = track(&manager, TestArray::new(1, 2048));
        manager
            .demote_to_host(&as_ref(&proxy))
            .expect("Failed to demote to host");

        let barrier = Arc::new(Barrier::new(2));
        let spillers: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let handle = as_ref(&proxy);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.demote_to_disk(&handle).expect("Failed to spill");
                })
            })
            .collect();
        for spiller in spillers {
            spiller.join().expect("Spiller panicked");
        }

        let spilled = std::fs::read_dir(tmp.path())
            .expect("Failed to list spill dir")
            .count();
        assert_eq!(spilled, 1, "Exactly one spill file should survive");
        assert_eq!(tier_of(&manager, &proxy), Some(Tier::Disk));
        assert_eq!(manager.registry(Tier::Disk).len(), 1);
        manager.validate().expect("Manager state is inconsistent");

        drop(proxy);
        let remaining = std::fs::read_dir(tmp.path())
            .expect("Failed to list spill dir")
            .count();
        assert_eq!(remaining, 0, "Dropping the proxy should remove its file");
        assert!(manager.is_empty());
    }
}

#[test]
fn test_concurrent_inserts() {
    init_tracing();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let file: Arc<ProxifyHostFile<(usize, u64), TestValue, TestProxify>> =
        Arc::new(ProxifyHostFile::with_spill_directory(
            &SpillConfig::with_limits(1024, 4096),
            SpillDirectory::new(tmp.path(), false).expect("Failed to create spill dir"),
            TestProxify,
        ));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let file = Arc::clone(&file);
            thread::spawn(move || {
                for i in 0..10 {
                    let buffer = (t * 100 + i) as u64;
                    file.insert((t, i as u64), TestValue::Array(TestArray::new(buffer, 64)))
                        .expect("Insert failed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let manager = file.manager();
    assert_eq!(file.len(), 80);
    assert_eq!(manager.len(), 80);
    assert!(manager.usage(Tier::Device) <= 1024);
    assert!(manager.usage(Tier::Host) <= 4096);
    assert_eq!(manager.usage(Tier::Host), host_size_sum(manager));
    manager.validate().expect("Manager state is inconsistent");
}

#[test]
fn test_dropped_values_release_all_tiers() {
    let (manager, tmp) = create_test_manager(100, 100);
    let proxies: Vec<_> = (0..6)
        .map(|i| track(&manager, TestArray::new(i, 40)))
        .collect();
    manager.maybe_evict(0).expect("Eviction failed");
    assert!(!manager.registry(Tier::Disk).is_empty());

    drop(proxies);

    assert!(manager.is_empty());
    for tier in Tier::ALL {
        assert_eq!(manager.usage(tier), 0, "{} tier should be empty", tier);
    }
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}
