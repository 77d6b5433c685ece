//! Allocation engine tests against the in-memory store.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::device::{Device, DeviceRegistry};
use crate::engine::{
    env, memory_fraction, AllocationDecision, AllocationEngine, AllocationFailure,
    AllocationRequest,
};
use crate::resolver::CandidateResolver;
use crate::store::InMemoryStore;
use crate::units::MemoryUnit;
use crate::workload::{Workload, WorkloadId};
use crate::writer::AssignmentWriter;

const NODE: &str = "node-a";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Three 8 GiB devices, GPU-0..GPU-2
fn registry() -> Arc<DeviceRegistry> {
    let devices = (0..3)
        .map(|i| Device {
            index: i,
            handle: format!("GPU-{i}"),
            capacity_units: 8,
        })
        .collect();
    Arc::new(DeviceRegistry::from_devices(MemoryUnit::GiB, devices).unwrap())
}

fn engine_with_timeout(store: &Arc<InMemoryStore>, timeout: Duration) -> AllocationEngine {
    AllocationEngine::new(
        NODE,
        registry(),
        CandidateResolver::new(store.clone(), timeout),
        AssignmentWriter::new(store.clone(), timeout),
    )
}

fn engine(store: &Arc<InMemoryStore>) -> AllocationEngine {
    engine_with_timeout(store, Duration::from_secs(1))
}

fn candidate(name: &str, units: u64, assumed: i64) -> Workload {
    Workload::new("ml", name, NODE)
        .with_requested_units(units)
        .with_assume_time(at(assumed))
}

fn bound(decision: &AllocationDecision) -> &crate::engine::Binding {
    match decision {
        AllocationDecision::Bound(binding) => binding,
        AllocationDecision::Failed { reason, .. } => panic!("expected a binding, got {reason}"),
    }
}

#[tokio::test]
async fn test_pinned_single_device_binding() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("train-0", 4, 0).with_pinned_devices(&[2]));
    let engine = engine(&store);

    let request = AllocationRequest::new([4]);
    let decision = engine.allocate(&request).await;
    let binding = bound(&decision);

    assert_eq!(binding.workload, WorkloadId::new("ml", "train-0"));
    assert_eq!(binding.device_indices, vec![2]);
    assert_eq!(binding.device_handles, vec!["GPU-2".to_string()]);
    assert_eq!(binding.fraction, 0.5);

    let envs = decision.container_envs(&request, engine.registry());
    assert_eq!(envs.len(), 1);
    assert_eq!(envs[0][env::NVIDIA_VISIBLE_DEVICES], "GPU-2");
    assert_eq!(envs[0][env::CUDA_VISIBLE_DEVICES], "GPU-2");
    assert_eq!(envs[0][env::RESOURCE_INDEX], "2");
    assert_eq!(envs[0][env::RESOURCE_BY_POD], "4");
    assert_eq!(envs[0][env::RESOURCE_BY_CONTAINER], "4");
    assert_eq!(envs[0][env::RESOURCE_BY_DEV], "8");
    assert_eq!(envs[0][env::MEMORY_FRACTION], "0.50");

    let stored = store.workload(&binding.workload).unwrap();
    let assignment = stored.assignment();
    assert!(assignment.assigned);
    assert_eq!(assignment.device_indices, vec![2]);
    assert!(assignment.assign_time.is_some());
    assert_eq!(assignment.assume_time, Some(at(0)));
}

#[tokio::test]
async fn test_multi_device_fraction_uses_summed_capacity() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(
        candidate("train-0", 3, 0)
            .with_containers(2)
            .with_pinned_devices(&[0, 1]),
    );
    let engine = engine(&store);

    let request = AllocationRequest::new([1, 2]);
    let decision = engine.allocate(&request).await;
    let binding = bound(&decision);
    assert_eq!(binding.fraction, 0.19);

    let envs = decision.container_envs(&request, engine.registry());
    assert_eq!(envs.len(), 2);
    for (container, expected_units) in envs.iter().zip(["1", "2"]) {
        assert_eq!(container[env::NVIDIA_VISIBLE_DEVICES], "GPU-0,GPU-1");
        assert_eq!(container[env::RESOURCE_INDEX], "0,1");
        assert_eq!(container[env::RESOURCE_BY_POD], "3");
        assert_eq!(container[env::RESOURCE_BY_CONTAINER], expected_units);
        assert_eq!(container[env::MEMORY_FRACTION], "0.19");
    }
}

#[tokio::test]
async fn test_no_exact_match_yields_sentinel_per_container() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("small", 2, 0));
    store.insert(candidate("large", 6, 1));
    let engine = engine(&store);

    let request = AllocationRequest::new([1, 3]);
    let decision = engine.allocate(&request).await;
    assert_eq!(decision.failure(), Some(&AllocationFailure::Unsatisfiable(4)));

    let envs = decision.container_envs(&request, engine.registry());
    assert_eq!(envs.len(), 2);
    for container in &envs {
        assert_eq!(container[env::NVIDIA_VISIBLE_DEVICES], "no-gpu-has-4GiB-to-run");
        assert_eq!(container[env::CUDA_VISIBLE_DEVICES], "no-gpu-has-4GiB-to-run");
        assert_eq!(container[env::RESOURCE_INDEX], "-1");
        assert_eq!(container[env::MEMORY_FRACTION], "0");
        assert_eq!(container[env::RESOURCE_BY_POD], "4");
    }
    assert_eq!(envs[1][env::RESOURCE_BY_CONTAINER], "3");

    // Nothing was written
    assert_eq!(store.update_calls(), 0);
    assert!(store.workloads().iter().all(|w| !w.assignment().assigned));
}

#[tokio::test]
async fn test_earlier_assumption_wins_a_tie() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(Workload::new("ml", "untimed", NODE).with_requested_units(4));
    store.insert(candidate("later", 4, 10));
    store.insert(candidate("earlier", 4, 5));
    let engine = engine(&store);

    let first = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(bound(&first).workload.name, "earlier");

    let second = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(bound(&second).workload.name, "later");

    let third = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(bound(&third).workload.name, "untimed");
}

#[tokio::test]
async fn test_bound_workloads_are_not_candidates() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("done", 4, 0).with_assignment(&[0], at(1)));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(decision.failure(), Some(&AllocationFailure::Unsatisfiable(4)));
}

#[tokio::test]
async fn test_fresh_choice_skips_full_device() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("resident", 6, 0).with_assignment(&[0], at(1)));
    store.insert(candidate("incoming", 4, 2));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    let binding = bound(&decision);
    assert_eq!(binding.workload.name, "incoming");
    assert_eq!(binding.device_indices, vec![1]);
}

#[tokio::test]
async fn test_fresh_choice_fails_when_every_device_is_full() {
    let store = Arc::new(InMemoryStore::new());
    for (i, name) in ["r0", "r1", "r2"].into_iter().enumerate() {
        store.insert(candidate(name, 6, 0).with_assignment(&[i as u32], at(1)));
    }
    store.insert(candidate("incoming", 4, 2));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(
        decision.failure(),
        Some(&AllocationFailure::NoDeviceCapacity(4))
    );
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn test_pinned_device_over_capacity_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("resident", 6, 0).with_assignment(&[1], at(1)));
    store.insert(candidate("incoming", 4, 2).with_pinned_devices(&[1]));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(
        decision.failure(),
        Some(&AllocationFailure::NoDeviceCapacity(4))
    );
}

#[tokio::test]
async fn test_unknown_pinned_devices() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("lost", 4, 0).with_pinned_devices(&[7]));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(
        decision.failure(),
        Some(&AllocationFailure::DeviceNotFound("7".to_string()))
    );
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn test_unknown_pinned_device_is_skipped_when_others_resolve() {
    let store = Arc::new(InMemoryStore::new());
    let workload = store.insert(candidate("partial", 4, 0).with_pinned_devices(&[1, 7]));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    let binding = bound(&decision);
    assert_eq!(binding.device_indices, vec![1]);
    assert_eq!(binding.fraction, 0.5);

    let stored = store.workload(&workload.id).unwrap();
    assert_eq!(stored.assignment().device_indices, vec![1]);
}

#[tokio::test]
async fn test_unknown_pinned_device_does_not_dilute_the_share() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("resident", 6, 0).with_assignment(&[1], at(1)));
    let workload = store.insert(candidate("partial", 4, 2).with_pinned_devices(&[1, 7]));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(
        decision.failure(),
        Some(&AllocationFailure::NoDeviceCapacity(4))
    );
    assert_eq!(store.update_calls(), 0);
    assert!(!store.workload(&workload.id).unwrap().assignment().assigned);
}

#[tokio::test]
async fn test_repeated_pinned_index_counts_once_against_usage() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("resident", 4, 0).with_assignment(&[0], at(1)));
    store.insert(candidate("doubled", 8, 2).with_pinned_devices(&[0, 0]));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([8])).await;
    assert_eq!(
        decision.failure(),
        Some(&AllocationFailure::NoDeviceCapacity(8))
    );
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn test_repeated_pinned_index_binds_a_single_device() {
    let store = Arc::new(InMemoryStore::new());
    let workload = store.insert(candidate("doubled", 4, 0).with_pinned_devices(&[0, 0]));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    let binding = bound(&decision);
    assert_eq!(binding.device_indices, vec![0]);
    assert_eq!(binding.fraction, 0.5);

    let stored = store.workload(&workload.id).unwrap();
    assert_eq!(stored.assignment().device_indices, vec![0]);
}

#[tokio::test]
async fn test_overflowing_request_degrades_without_store_reads() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("train-0", 4, 0));
    let engine = engine(&store);

    let request = AllocationRequest::new([u64::MAX, 1]);
    assert_eq!(request.total_units(), None);

    let decision = engine.allocate(&request).await;
    assert_eq!(decision.failure(), Some(&AllocationFailure::RequestOverflow));
    assert_eq!(store.list_calls(), 0);

    let envs = decision.container_envs(&request, engine.registry());
    assert_eq!(envs.len(), 2);
    assert!(envs.iter().all(|e| e[env::RESOURCE_INDEX] == "-1"));
}

#[tokio::test]
async fn test_fresh_choice_on_overcommitted_device() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("resident", 12, 0).with_assignment(&[0], at(1)));
    store.insert(candidate("incoming", 2, 2));
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([2])).await;
    assert_eq!(bound(&decision).device_indices, vec![1]);
}

#[tokio::test]
async fn test_store_timeout_degrades_without_commit() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("train-0", 4, 0));
    store.set_latency(Some(Duration::from_millis(200)));
    let engine = engine_with_timeout(&store, Duration::from_millis(20));

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert!(matches!(
        decision.failure(),
        Some(AllocationFailure::StoreTimeout(_))
    ));
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn test_store_unavailable_degrades() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("train-0", 4, 0));
    store.set_unavailable(true);
    let engine = engine(&store);

    let request = AllocationRequest::new([4]);
    let decision = engine.allocate(&request).await;
    assert!(matches!(
        decision.failure(),
        Some(AllocationFailure::StoreUnavailable(_))
    ));
    let envs = decision.container_envs(&request, engine.registry());
    assert_eq!(envs[0][env::RESOURCE_INDEX], "-1");
}

#[tokio::test]
async fn test_single_conflict_is_retried() {
    let store = Arc::new(InMemoryStore::new());
    store.insert(candidate("train-0", 4, 0));
    store.inject_conflicts(1);
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert!(decision.is_bound());
    assert_eq!(store.update_calls(), 2);
}

#[tokio::test]
async fn test_repeated_conflict_fails() {
    let store = Arc::new(InMemoryStore::new());
    let workload = store.insert(candidate("train-0", 4, 0));
    store.inject_conflicts(2);
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([4])).await;
    assert_eq!(
        decision.failure(),
        Some(&AllocationFailure::Conflict(workload.id.to_string()))
    );
    assert_eq!(store.update_calls(), 2);
    assert!(!store.workload(&workload.id).unwrap().assignment().assigned);
}

#[tokio::test]
async fn test_zero_request_is_unsatisfiable_without_store_reads() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store);

    let decision = engine.allocate(&AllocationRequest::new([0, 0])).await;
    assert_eq!(decision.failure(), Some(&AllocationFailure::Unsatisfiable(0)));
    assert_eq!(store.list_calls(), 0);
}

#[test]
fn test_memory_fraction_rounding() {
    assert_eq!(memory_fraction(4, 8), 0.5);
    assert_eq!(memory_fraction(3, 16), 0.19);
    assert_eq!(memory_fraction(1, 3), 0.33);
    assert_eq!(memory_fraction(2, 3), 0.67);
    assert_eq!(memory_fraction(8, 8), 1.0);
    assert_eq!(memory_fraction(5, 0), 0.0);
}
