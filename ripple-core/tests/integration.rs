//! Integration Tests for the Computation Cache and Bridge
//!
//! These tests verify that the cache, the publisher, and replicas work
//! together correctly.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ripple_core::bridge::{ApplyOutcome, MemorySubscriber, Notification};
use ripple_core::graph::NodeState;
use ripple_core::reactive::{ComputationCache, ComputationKey, ComputationNode, ComputeContext};
use ripple_core::{ComputeError, ComputeResult, DelayConfig, LoopbackTransport, Publisher, Replicator};
use futures_util::future::BoxFuture;
use tokio::time::{sleep, timeout};

type Key = ComputationKey<()>;

/// `count()` reads the counter; `total()` sums what `count()` returns.
fn count_and_total(
    cache: &ComputationCache<Key, i64>,
    counter: &Arc<AtomicI32>,
    calls: &Arc<AtomicI32>,
) -> impl Fn(Key) -> BoxFuture<'static, ComputeResult<i64>> + Clone + Send + Sync + 'static {
    let cache = cache.clone();
    let counter = counter.clone();
    let calls = calls.clone();

    move |_key: Key| -> BoxFuture<'static, ComputeResult<i64>> {
        let cache = cache.clone();
        let counter = counter.clone();
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let count = cache
                .get_or_compute(Key::unit("count"), move |_| {
                    let counter = counter.clone();
                    async move { Ok(counter.load(Ordering::SeqCst) as i64) }
                })
                .await?;
            Ok::<_, ComputeError>(count)
        })
    }
}

fn zero_delay() -> Publisher {
    Publisher::new(DelayConfig::default().with_default(Duration::ZERO)).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Test that concurrent readers of one key share a single computation.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_compute_once() {
    let cache: ComputationCache<ComputationKey<(u64,)>, String> = ComputationCache::new();
    let calls = Arc::new(AtomicI32::new(0));

    let mut handles = Vec::new();
    for _ in 0..64 {
        let cache = cache.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute(ComputationKey::new("user", (7,)), move |key| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(25)).await;
                        Ok(format!("user-{}", key.args.0))
                    }
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok("user-7".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Test that invalidation reaches transitive dependents and nothing else.
#[tokio::test]
async fn invalidation_is_transitive_and_contained() {
    let cache: ComputationCache<Key, i64> = ComputationCache::new();
    let counter = Arc::new(AtomicI32::new(0));
    let total_calls = Arc::new(AtomicI32::new(0));
    let total = count_and_total(&cache, &counter, &total_calls);

    assert_eq!(cache.get_or_compute(Key::unit("total"), total.clone()).await, Ok(0));
    assert_eq!(cache.get_or_compute(Key::unit("unrelated"), |_| async { Ok(42) }).await, Ok(42));

    counter.store(4, Ordering::SeqCst);
    assert_eq!(cache.invalidate(&Key::unit("count")), 2);

    let unrelated = cache.get(&Key::unit("unrelated")).unwrap();
    assert_eq!(unrelated.state(), NodeState::Consistent);
    assert_eq!(unrelated.version(), 1);

    // Invalidating again changes nothing.
    assert_eq!(cache.invalidate(&Key::unit("count")), 0);
    assert_eq!(cache.invalidate(&Key::unit("total")), 0);

    assert_eq!(cache.get_or_compute(Key::unit("total"), total).await, Ok(4));
    assert_eq!(total_calls.load(Ordering::SeqCst), 2);
}

/// Test the count/total scenario: a write to `count()` marks `total()` stale
/// without recomputing it, and the next read refreshes both.
#[tokio::test]
async fn count_and_total_scenario() {
    let cache: ComputationCache<Key, i64> = ComputationCache::new();
    let counter = Arc::new(AtomicI32::new(0));
    let total_calls = Arc::new(AtomicI32::new(0));
    let total = count_and_total(&cache, &counter, &total_calls);

    // Caller A
    let count = cache
        .get_or_compute(Key::unit("count"), {
            let counter = counter.clone();
            move |_| {
                let counter = counter.clone();
                async move { Ok(counter.load(Ordering::SeqCst) as i64) }
            }
        })
        .await;
    assert_eq!(count, Ok(0));
    assert_eq!(cache.get_or_compute(Key::unit("total"), total.clone()).await, Ok(0));

    // External write
    counter.store(1, Ordering::SeqCst);
    cache.invalidate(&Key::unit("count"));

    let count_node = cache.get(&Key::unit("count")).unwrap();
    let total_node = cache.get(&Key::unit("total")).unwrap();
    assert_eq!(total_node.state(), NodeState::Invalidated);
    assert_eq!(total_calls.load(Ordering::SeqCst), 1);

    // Caller B
    assert_eq!(cache.get_or_compute(Key::unit("total"), total).await, Ok(1));
    assert_eq!(total_calls.load(Ordering::SeqCst), 2);

    assert_eq!(count_node.state(), NodeState::Consistent);
    assert_eq!(count_node.version(), 2);
    assert_eq!(total_node.state(), NodeState::Consistent);
    assert_eq!(total_node.version(), 2);
}

/// Test the end-to-end flow: a write on the server reaches a client-side
/// computation that depends on a replica.
#[tokio::test]
async fn write_propagates_to_replica_and_its_dependents() {
    let cache: ComputationCache<Key, i64> = ComputationCache::new();
    let counter = Arc::new(AtomicI32::new(0));
    let total_calls = Arc::new(AtomicI32::new(0));
    let total_node = cache.node(Key::unit("total"), count_and_total(&cache, &counter, &total_calls));

    let publisher = zero_delay();
    let channel = publisher.publish(&total_node);

    let (transport, frames) = LoopbackTransport::connect(&publisher);
    let replicator = Replicator::new(transport);
    let pump = {
        let replicator = replicator.clone();
        tokio::spawn(async move { replicator.run(frames).await })
    };

    let replica = replicator.replica::<i64>(channel.id()).unwrap();
    assert_eq!(replica.resolve().await, Ok(0));

    let client: ComputationCache<&'static str, String> = ComputationCache::new();
    let render = {
        let replica = replica.clone();
        move |_: &'static str| {
            let replica = replica.clone();
            async move { Ok::<_, ComputeError>(format!("total = {}", replica.resolve().await?)) }
        }
    };
    assert_eq!(client.get_or_compute("view", render.clone()).await, Ok("total = 0".to_string()));
    assert_eq!(replica.dependent_count(), 1);

    counter.fetch_add(1, Ordering::SeqCst);
    cache.invalidate(&Key::unit("count"));

    wait_until(|| replica.version() == 2).await;

    let count_node = cache.get(&Key::unit("count")).unwrap();
    assert_eq!(count_node.state(), NodeState::Consistent);
    assert_eq!(count_node.version(), 2);
    assert_eq!(total_node.state(), NodeState::Consistent);
    assert_eq!(total_node.version(), 2);

    let view = client.get(&"view").unwrap();
    assert_eq!(view.state(), NodeState::Invalidated);
    assert_eq!(client.get_or_compute("view", render).await, Ok("total = 1".to_string()));

    pump.abort();
}

/// Test that writes inside one delay window produce a single push carrying
/// the latest value.
#[tokio::test(start_paused = true)]
async fn writes_within_a_window_coalesce() {
    let config = DelayConfig::default().with_category("composer", Duration::from_millis(500));
    let publisher = Publisher::new(config).unwrap();
    let source = Arc::new(AtomicI32::new(0));
    let node = {
        let source = source.clone();
        ComputationNode::new("draft", move |_| {
            let source = source.clone();
            async move { Ok(source.load(Ordering::SeqCst)) }
        })
    };
    let channel = publisher.publish_in(&node, Some("composer"));

    let (subscriber, mut frames) = MemorySubscriber::channel();
    publisher.subscribe(channel.id(), subscriber).unwrap();
    node.get_or_await_value().await.unwrap();

    for value in 1..=3 {
        source.store(value, Ordering::SeqCst);
        node.invalidate();
        // A local reader refreshes the node, so the next write invalidates
        // it again inside the same window.
        node.get_or_await_value().await.unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    assert!(frames.try_recv().is_err());

    sleep(Duration::from_millis(500)).await;

    let pushed = Notification::decode(&frames.try_recv().unwrap()).unwrap();
    assert_eq!(pushed.output::<i32>(), Some(Ok(3)));
    assert_eq!(pushed.version, 4);
    assert!(frames.try_recv().is_err());
    assert_eq!(channel.push_count(), 1);
}

/// Test that a zero delay pushes once per write.
#[tokio::test(start_paused = true)]
async fn zero_delay_pushes_every_write() {
    let publisher = zero_delay();
    let source = Arc::new(AtomicI32::new(0));
    let node = {
        let source = source.clone();
        ComputationNode::new("cursor", move |_| {
            let source = source.clone();
            async move { Ok(source.load(Ordering::SeqCst)) }
        })
    };
    let channel = publisher.publish(&node);
    let (subscriber, mut frames) = MemorySubscriber::channel();
    publisher.subscribe(channel.id(), subscriber).unwrap();
    node.get_or_await_value().await.unwrap();

    for value in 1..=3 {
        source.store(value, Ordering::SeqCst);
        node.invalidate();
        sleep(Duration::from_millis(1)).await;
    }

    let values: Vec<i32> = std::iter::from_fn(|| frames.try_recv().ok())
        .map(|frame| Notification::decode(&frame).unwrap().output::<i32>().unwrap().unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}

/// Test that out-of-order pushes never move a replica backwards.
#[tokio::test]
async fn replica_versions_only_increase() {
    let publisher = zero_delay();
    let node: Arc<ComputationNode<&str, i32>> = ComputationNode::new("n", |_| async { Ok(0) });
    let channel = publisher.publish(&node);
    let (transport, _frames) = LoopbackTransport::connect(&publisher);
    let replicator = Replicator::new(transport);
    let replica = replicator.replica::<i32>(channel.id()).unwrap();

    let outcomes: Vec<ApplyOutcome> = [3_u64, 1, 4]
        .into_iter()
        .map(|version| {
            let update = Notification::value(channel.id(), version, &(version as i32)).unwrap();
            replicator.dispatch(update)
        })
        .collect();

    assert_eq!(
        outcomes,
        vec![ApplyOutcome::Accepted, ApplyOutcome::Ignored, ApplyOutcome::Accepted]
    );
    assert_eq!(replica.version(), 4);
    assert_eq!(replica.resolve().await, Ok(4));
}

/// Test that a replica resumes after its connection is replaced.
#[tokio::test]
async fn replica_recovers_after_reconnect() {
    let publisher = zero_delay();
    let source = Arc::new(AtomicI32::new(10));
    let node = {
        let source = source.clone();
        ComputationNode::new("price", move |_| {
            let source = source.clone();
            async move { Ok(source.load(Ordering::SeqCst)) }
        })
    };
    let channel = publisher.publish(&node);

    let (transport, old_frames) = LoopbackTransport::connect(&publisher);
    let replicator = Replicator::new(transport.clone());
    let replica = replicator.replica::<i32>(channel.id()).unwrap();
    assert_eq!(replica.resolve().await, Ok(10));

    drop(old_frames);
    let mut frames = transport.reconnect();
    replicator.reconnected();
    assert_eq!(replica.state(), NodeState::Invalidated);
    assert_eq!(replica.resolve().await, Ok(10));

    source.store(11, Ordering::SeqCst);
    node.invalidate();

    let frame = frames.recv().await.unwrap();
    assert_eq!(replicator.dispatch_frame(&frame), Ok(ApplyOutcome::Accepted));
    assert_eq!(replica.resolve().await, Ok(11));

    // The dead subscriber was dropped on the failed push.
    assert_eq!(channel.subscriber_count(), 1);
}

/// Test that a computation can schedule its own invalidation.
#[tokio::test(start_paused = true)]
async fn computations_can_expire_themselves() {
    let cache: ComputationCache<&'static str, u32> = ComputationCache::new();
    let calls = Arc::new(AtomicI32::new(0));
    let clock = {
        let calls = calls.clone();
        move |_: &'static str| {
            let calls = calls.clone();
            async move {
                let handle = ComputeContext::current().expect("running inside a computation");
                tokio::spawn(async move {
                    sleep(Duration::from_secs(1)).await;
                    handle.invalidate();
                });
                Ok(calls.fetch_add(1, Ordering::SeqCst) as u32)
            }
        }
    };

    assert_eq!(cache.get_or_compute("now", clock.clone()).await, Ok(0));
    assert_eq!(cache.get_or_compute("now", clock.clone()).await, Ok(0));

    sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.get(&"now").unwrap().state(), NodeState::Invalidated);
    assert_eq!(cache.get_or_compute("now", clock).await, Ok(1));
}
