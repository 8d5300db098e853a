//! Distributor and distributed catchup tests over in-memory lease pools.

#![allow(clippy::unwrap_used, clippy::panic)]

use alluvial_core::aggregator;
use alluvial_core::lease::{Leasable, Lease};
use alluvial_core::partition::{RangePartition, by_range};
use alluvial_core::stream::{PartitionedStream, Query, SharedStream};
use alluvial_core::{TimeDelta, Utc};
use alluvial_runtime::{
    DistributedCatchup, DistributedMultiStreamCatchup, Distributor, DistributorConfig,
    DistributorError, InMemoryLeaseBroker, LeaseRegistry, RetryPolicy, Subscriber,
};
use alluvial_testing::{Event, InMemoryEventLog, ManualClock, init_tracing};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config() -> DistributorConfig {
    DistributorConfig::default()
        .with_wait_interval(Duration::from_millis(1))
        .with_release_retry(RetryPolicy::none())
}

fn names(count: usize) -> Vec<Leasable<String>> {
    (0..count)
        .map(|n| Leasable::new(format!("r{n}"), format!("resource-{n}")))
        .collect()
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_distributors_never_share_a_resource() {
    init_tracing();
    let registry = LeaseRegistry::new();
    let holders: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let grants: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut distributors = Vec::new();
    for _ in 0..3 {
        let broker = InMemoryLeaseBroker::new(&registry, "pool", names(4));
        let distributor =
            Distributor::new(Arc::new(broker), config().with_max_degree_of_parallelism(2)).unwrap();
        let (holders, grants, overlaps) = (
            Arc::clone(&holders),
            Arc::clone(&grants),
            Arc::clone(&overlaps),
        );
        distributor
            .on_receive(move |lease: Lease<String>| {
                let (holders, grants, overlaps) = (
                    Arc::clone(&holders),
                    Arc::clone(&grants),
                    Arc::clone(&overlaps),
                );
                async move {
                    let name = lease.name().to_string();
                    {
                        let mut holders = holders.lock().unwrap();
                        let held = holders.entry(name.clone()).or_default();
                        if *held > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        *held += 1;
                        *grants.lock().unwrap().entry(name.clone()).or_default() += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    *holders.lock().unwrap().get_mut(&name).unwrap() -= 1;
                    Ok(())
                }
            })
            .unwrap();
        distributor.start().await.unwrap();
        distributors.push(distributor);
    }

    eventually("every resource to be granted twice", || {
        let grants = grants.lock().unwrap();
        grants.len() == 4 && grants.values().all(|count| *count >= 2)
    })
    .await;

    for distributor in &distributors {
        distributor.stop().await;
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(distributors.iter().all(|d| !d.is_running() && d.active_leases() == 0));
}

#[tokio::test]
async fn the_least_recently_released_resource_goes_first() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let now = alluvial_core::environment::Clock::now(&*clock);
    let resources = names(10).into_iter().map(|mut resource| {
        resource.lease_last_granted = Some(now - TimeDelta::seconds(2));
        resource.lease_last_released = Some(if resource.name == "r7" {
            now - TimeDelta::milliseconds(1100)
        } else {
            now - TimeDelta::seconds(1)
        });
        resource
    });

    let registry = LeaseRegistry::new();
    let broker = InMemoryLeaseBroker::new(&registry, "pool", resources).with_clock(clock.clone());
    let distributor = Distributor::new(
        Arc::new(broker),
        config().with_wait_interval(Duration::from_millis(10)),
    )
    .unwrap();
    distributor.on_receive(|_lease| async { Ok(()) }).unwrap();

    assert_eq!(distributor.distribute(1).await.unwrap(), vec!["resource-7"]);
    // the rest tie, so pool order decides
    assert_eq!(distributor.distribute(1).await.unwrap(), vec!["resource-0"]);

    let released = registry
        .snapshot("pool")
        .into_iter()
        .find(|resource| resource.name == "r7")
        .unwrap()
        .lease_last_released;
    assert_eq!(released, Some(now));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn an_expired_lease_is_granted_again_while_its_receiver_runs() {
    let registry = LeaseRegistry::new();
    let broker = InMemoryLeaseBroker::new(&registry, "pool", names(1));
    let distributor = Distributor::new(
        Arc::new(broker),
        config().with_lease_duration(Duration::from_millis(50)),
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let slow_running = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let (counter, slow, overlap) = (
        Arc::clone(&calls),
        Arc::clone(&slow_running),
        Arc::clone(&overlapped),
    );
    distributor
        .on_receive(move |_lease: Lease<String>| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            let (slow, overlap) = (Arc::clone(&slow), Arc::clone(&overlap));
            async move {
                if call == 0 {
                    slow.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    slow.store(false, Ordering::SeqCst);
                } else if slow.load(Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
        })
        .unwrap();

    distributor.start().await.unwrap();
    eventually("a second grant", || calls.load(Ordering::SeqCst) >= 2).await;
    distributor.stop().await;

    assert!(overlapped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn a_distributor_accepts_one_receiver() {
    let registry = LeaseRegistry::new();
    let broker = InMemoryLeaseBroker::new(&registry, "pool", names(1));
    let distributor = Distributor::new(Arc::new(broker), config()).unwrap();

    distributor.on_receive(|_lease| async { Ok(()) }).unwrap();
    let error = distributor.on_receive(|_lease| async { Ok(()) }).unwrap_err();

    assert!(matches!(error, DistributorError::ReceiverAlreadySet));
    assert_eq!(
        error.to_string(),
        "OnReceive has already been called. It can only be called once per distributor."
    );
}

fn account_number(aggregate_id: &str) -> i64 {
    aggregate_id.trim_start_matches("account-").parse().unwrap()
}

fn partition_distributor(partitions: &[RangePartition<i64>]) -> Distributor<RangePartition<i64>> {
    let registry = LeaseRegistry::new();
    let broker = InMemoryLeaseBroker::new(
        &registry,
        "accounts",
        partitions
            .iter()
            .map(|partition| Leasable::new(partition.to_string(), partition.clone())),
    );
    Distributor::new(Arc::new(broker), config().with_max_degree_of_parallelism(4)).unwrap()
}

fn deposits(accounts: i64) -> InMemoryEventLog<i64> {
    let log = InMemoryEventLog::new();
    for n in 1..=accounts {
        log.append(format!("account-{n}"), 1_i64);
    }
    log
}

#[tokio::test]
async fn distributed_catchup_covers_every_partition() {
    let log = deposits(100);
    let partitions = by_range(0_i64, 100).unwrap().among(4).unwrap();

    let source = log.clone();
    let stream = PartitionedStream::create_positioned(
        "accounts",
        move |query: Query<i64>, partition: RangePartition<i64>| {
            let after = query.cursor().position().copied().unwrap_or(0);
            let events: Vec<Event<i64>> = source
                .events()
                .into_iter()
                .filter(|event| {
                    event.global_sequence > after && partition.contains(&account_number(&event.aggregate_id))
                })
                .collect();
            async move { Ok(events) }
        },
        |event: &Event<i64>| event.global_sequence,
    );

    let catchup = DistributedCatchup::new(stream, partition_distributor(&partitions));
    let (subscriber, totals) = Subscriber::<i64, Event<i64>, i64>::in_memory(aggregator::fold(
        |total: i64, event: &Event<i64>| total + event.payload,
    ));
    let _ = catchup.subscribe(subscriber);

    let granted = catchup.distribute(4).await.unwrap();
    assert_eq!(granted.len(), 4);

    let entries = totals.entries().await;
    assert_eq!(entries.len(), 4);
    assert_eq!(entries.iter().map(|(_, p)| p.value).sum::<i64>(), 100);
    assert_eq!(totals.find("accounts:(0..25]").await.unwrap().value, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distributed_multi_stream_catchup_keeps_up_with_new_events() {
    let log = deposits(40);
    let partitions = by_range(0_i64, 40).unwrap().among(4).unwrap();

    let source = log.clone();
    let stream = PartitionedStream::create(
        "index",
        move |query: Query<i64>, partition: RangePartition<i64>| {
            let seen = usize::try_from(query.cursor().position().copied().unwrap_or(0)).unwrap();
            let substreams: Vec<SharedStream<Event<i64>, i64>> = source
                .events()
                .into_iter()
                .filter(|event| partition.contains(&account_number(&event.aggregate_id)))
                .skip(seen)
                .map(|event| source.aggregate_stream(&event.aggregate_id))
                .collect();
            async move { Ok(substreams) }
        },
    );

    let catchup = DistributedMultiStreamCatchup::new(stream, partition_distributor(&partitions))
        .with_batch_size(5)
        .with_substream_concurrency(2);
    let (subscriber, balances) = Subscriber::<i64, Event<i64>, i64>::in_memory(aggregator::fold(
        |total: i64, event: &Event<i64>| total + event.payload,
    ));
    let _ = catchup.subscribe(subscriber);

    catchup.start().await.unwrap();
    let total = || {
        let balances = balances.clone();
        async move {
            balances
                .entries()
                .await
                .iter()
                .map(|(_, p)| p.value)
                .sum::<i64>()
        }
    };
    for _ in 0..400 {
        if total().await == 40 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(total().await, 40);

    log.append("account-3", 2);
    for _ in 0..400 {
        if total().await == 42 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    catchup.stop().await;

    assert_eq!(total().await, 42);
    assert_eq!(balances.find("account-3").await.unwrap().value, 3);
    assert_eq!(balances.len().await, 40);
}
