//! Integration tests for `QueryOptimizer::batch_read`.

use std::sync::Arc;
use std::time::Duration;

use tally_core::{DataType, ManualClock, OptimizationConfig, RemoteError, SessionId};
use tally_monitor::{event_names, PerformanceTracker};
use tally_query::{Query, QueryOptimizer, ReadRequest};
use tally_test_utils::assertions::{
    assert_cache_hit, assert_remote, assert_stale, assert_timeout, doc_ids,
};
use tally_test_utils::fixtures::{fast_config, ids, seeded_store, test_cache};
use tally_test_utils::{MockRemoteStore, RecordedCall, RecordingSink};

fn optimizer(
    store: Arc<MockRemoteStore>,
    config: OptimizationConfig,
) -> (QueryOptimizer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let optimizer = QueryOptimizer::new(store, test_cache(clock.clone()), config).unwrap();
    (optimizer, clock)
}

fn novel_requests(count: usize) -> Vec<ReadRequest> {
    ids("n", count)
        .into_iter()
        .map(|id| ReadRequest::document("novels", id))
        .collect()
}

#[tokio::test]
async fn test_twelve_reads_take_at_most_two_calls() {
    let store = Arc::new(seeded_store(12));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    let outcomes = optimizer.batch_read(novel_requests(12)).await;

    assert_eq!(outcomes.len(), 12);
    assert!(store.call_count() <= 2);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_remote(outcome);
        assert_eq!(doc_ids(outcome), vec![format!("n{i}")]);
    }
}

#[tokio::test]
async fn test_second_batch_is_served_from_cache() {
    let store = Arc::new(seeded_store(5));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    optimizer.batch_read(novel_requests(5)).await;
    store.reset_counters();

    let outcomes = optimizer.batch_read(novel_requests(5)).await;
    outcomes.iter().for_each(assert_cache_hit);
    assert_eq!(store.call_count(), 0);

    let metrics = optimizer.metrics();
    assert_eq!(metrics.cache_hits, 5);
    assert_eq!(metrics.cache_misses, 5);
    assert_eq!(metrics.total_reads, 5);
    assert_eq!(metrics.naive_reads, 10);
    assert!((metrics.optimization_ratio() - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_only_misses_reach_the_store() {
    let store = Arc::new(seeded_store(4));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    optimizer
        .batch_read(vec![ReadRequest::document("novels", "n0")])
        .await;
    store.reset_counters();

    let outcomes = optimizer.batch_read(novel_requests(4)).await;
    assert_cache_hit(&outcomes[0]);
    outcomes[1..].iter().for_each(assert_remote);
    assert_eq!(
        store.calls(),
        vec![RecordedCall::Fetch {
            collection: "novels".to_string(),
            ids: vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
        }]
    );
}

#[tokio::test]
async fn test_duplicate_ids_are_fetched_once() {
    let store = Arc::new(seeded_store(3));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    let outcomes = optimizer
        .batch_read(vec![
            ReadRequest::documents("novels", vec!["n0".into(), "n1".into()]),
            ReadRequest::documents("novels", vec!["n1".into(), "n2".into()]),
            ReadRequest::document("novels", "n1"),
        ])
        .await;

    assert_eq!(store.call_count(), 1);
    assert_eq!(store.documents_read(), 3);
    assert_eq!(doc_ids(&outcomes[0]), vec!["n0", "n1"]);
    assert_eq!(doc_ids(&outcomes[1]), vec!["n1", "n2"]);
    assert_eq!(doc_ids(&outcomes[2]), vec!["n1"]);
}

#[tokio::test]
async fn test_mixed_batch_is_index_aligned() {
    let store = Arc::new(seeded_store(3));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    let outcomes = optimizer
        .batch_read(vec![
            ReadRequest::document("chapters", "n2-c1"),
            ReadRequest::query(Query::collection("chapters").where_eq("novelId", "n1")),
            ReadRequest::document("novels", "n0"),
            ReadRequest::document("novels", "missing"),
        ])
        .await;

    assert_eq!(doc_ids(&outcomes[0]), vec!["n2-c1"]);
    assert_eq!(doc_ids(&outcomes[1]), vec!["n1-c1", "n1-c2", "n1-c3"]);
    assert_eq!(doc_ids(&outcomes[2]), vec!["n0"]);
    assert!(doc_ids(&outcomes[3]).is_empty());
}

#[tokio::test]
async fn test_failure_is_isolated_to_affected_requests() {
    let store = Arc::new(seeded_store(3));
    store.fail_collection(
        "chapters",
        RemoteError::PermissionDenied {
            collection: "chapters".to_string(),
        },
    );
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    let outcomes = optimizer
        .batch_read(vec![
            ReadRequest::document("novels", "n0"),
            ReadRequest::document("chapters", "n0-c1"),
            ReadRequest::document("novels", "n1"),
        ])
        .await;

    assert_remote(&outcomes[0]);
    assert!(outcomes[1].is_err());
    assert_remote(&outcomes[2]);
    assert_eq!(optimizer.metrics().remote_failures, 1);

    // Failures are not cached.
    store.heal("chapters");
    let retry = optimizer
        .batch_read(vec![ReadRequest::document("chapters", "n0-c1")])
        .await;
    assert_eq!(doc_ids(&retry[0]), vec!["n0-c1"]);
}

#[tokio::test]
async fn test_pass_through_hits_store_once_per_request() {
    let store = Arc::new(seeded_store(12));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::pass_through());

    let mut requests = novel_requests(12);
    requests.push(ReadRequest::document("novels", "n0"));
    let outcomes = optimizer.batch_read(requests).await;

    assert_eq!(outcomes.len(), 13);
    assert_eq!(store.call_count(), 13);
    outcomes.iter().for_each(assert_remote);

    // Repeating the batch still goes to the store.
    optimizer.batch_read(novel_requests(12)).await;
    assert_eq!(store.call_count(), 25);

    let metrics = optimizer.metrics();
    assert_eq!(metrics.cache_hits, 0);
    assert_eq!(metrics.optimization_ratio(), 0.0);
}

#[tokio::test]
async fn test_unbatched_reads_use_one_call_per_request() {
    let store = Arc::new(seeded_store(4));
    let config = OptimizationConfig {
        enable_batch_reads: false,
        ..OptimizationConfig::default()
    };
    let (optimizer, _) = optimizer(store.clone(), config);

    optimizer.batch_read(novel_requests(4)).await;
    assert_eq!(store.call_count(), 4);
}

#[tokio::test]
async fn test_expired_entries_are_refetched() {
    let store = Arc::new(seeded_store(1));
    let (optimizer, clock) = optimizer(store.clone(), OptimizationConfig::default());

    let request = || {
        vec![ReadRequest::document("novels", "n0").with_data_type(DataType::Notification)]
    };
    optimizer.batch_read(request()).await;
    clock.advance(Duration::from_secs(59));
    assert_cache_hit(&optimizer.batch_read(request()).await[0]);

    clock.advance(Duration::from_secs(1));
    assert_remote(&optimizer.batch_read(request()).await[0]);
    assert_eq!(store.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_falls_back_to_stale_value() {
    let store = Arc::new(seeded_store(2));
    let (optimizer, clock) = optimizer(store.clone(), fast_config());

    optimizer.batch_read(novel_requests(1)).await;
    clock.advance(DataType::Novel.default_ttl() + Duration::from_secs(1));
    store.set_delay(Some(Duration::from_millis(500)));

    let outcomes = optimizer.batch_read(novel_requests(2)).await;
    assert_stale(&outcomes[0]);
    assert_eq!(doc_ids(&outcomes[0]), vec!["n0"]);
    assert_timeout(&outcomes[1]);
    assert_eq!(optimizer.metrics().stale_served, 1);
}

#[tokio::test]
async fn test_invalidate_document_forces_refetch() {
    let store = Arc::new(seeded_store(2));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    optimizer.batch_read(novel_requests(2)).await;
    assert!(optimizer.invalidate_document("novels", "n0").await >= 1);
    store.reset_counters();

    let outcomes = optimizer.batch_read(novel_requests(2)).await;
    assert_remote(&outcomes[0]);
    assert_cache_hit(&outcomes[1]);
    assert_eq!(store.call_count(), 1);
}

#[tokio::test]
async fn test_get_document() {
    let store = Arc::new(seeded_store(1));
    let (optimizer, _) = optimizer(store, OptimizationConfig::default());

    assert_eq!(optimizer.get_document("novels", "n0").await.unwrap().unwrap().id, "n0");
    assert!(optimizer.get_document("novels", "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reads_are_reported_to_tracker() {
    let store = Arc::new(seeded_store(3));
    let sink = Arc::new(RecordingSink::new());
    let tracker = Arc::new(PerformanceTracker::new(SessionId::generate()).with_sink(sink.clone()));
    let clock = Arc::new(ManualClock::starting_now());
    let optimizer = QueryOptimizer::new(store, test_cache(clock), OptimizationConfig::default())
        .unwrap()
        .with_tracker(tracker.clone());

    optimizer.batch_read(novel_requests(3)).await;
    optimizer.batch_read(novel_requests(3)).await;

    let usage = tracker.usage_over(Duration::from_secs(60));
    assert_eq!(usage.billed_reads, 3);
    assert_eq!(usage.cached_reads, 3);
    assert_eq!(usage.rule_evaluations, 3);
    assert_eq!(sink.events_named(event_names::QUERY_PERFORMANCE).len(), 1);
    assert_eq!(sink.events_named(event_names::CACHE_PERFORMANCE).len(), 6);
}

#[test]
fn test_invalid_config_fails_fast() {
    let store = Arc::new(MockRemoteStore::new());
    let config = OptimizationConfig {
        max_batch_size: 0,
        ..OptimizationConfig::default()
    };
    let clock = Arc::new(ManualClock::starting_now());
    assert!(QueryOptimizer::new(store, test_cache(clock), config).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_still_populates_cache() {
    let store = Arc::new(seeded_store(1));
    store.set_delay(Some(Duration::from_millis(100)));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());

    let gave_up = tokio::time::timeout(
        Duration::from_millis(10),
        optimizer.batch_read(novel_requests(1)),
    )
    .await;
    assert!(gave_up.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(optimizer.cache().get("novels/n0").await.is_some());
    assert_eq!(store.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_call_populates_cache_in_background() {
    let store = Arc::new(seeded_store(1));
    store.set_delay(Some(Duration::from_millis(500)));
    let (optimizer, _) = optimizer(store.clone(), fast_config());

    assert_timeout(&optimizer.batch_read(novel_requests(1)).await[0]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let outcomes = optimizer.batch_read(novel_requests(1)).await;
    assert_cache_hit(&outcomes[0]);
    assert_eq!(store.call_count(), 1);
    assert_eq!(optimizer.metrics().total_reads, 1);
}

#[tokio::test]
async fn test_pass_through_chunks_long_id_lists() {
    let store = Arc::new(seeded_store(25));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::pass_through());

    let outcomes = optimizer
        .batch_read(vec![ReadRequest::documents("novels", ids("n", 25))])
        .await;

    assert_eq!(store.call_count(), 3);
    assert_eq!(doc_ids(&outcomes[0]), ids("n", 25));
    for call in store.calls() {
        let RecordedCall::Fetch { ids, .. } = call else {
            panic!("expected a fetch call");
        };
        assert!(ids.len() <= 10);
    }
}

#[tokio::test]
async fn test_invalidate_collection_leaves_other_collections_cached() {
    let store = Arc::new(seeded_store(2));
    let (optimizer, _) = optimizer(store.clone(), OptimizationConfig::default());
    let requests = || {
        vec![
            ReadRequest::document("novels", "n0"),
            ReadRequest::query(Query::collection("novels").where_eq("authorId", "a1")),
            ReadRequest::document("chapters", "n0-c1"),
        ]
    };

    optimizer.batch_read(requests()).await;
    assert_eq!(optimizer.invalidate_collection("novels").await, 2);
    store.reset_counters();

    let outcomes = optimizer.batch_read(requests()).await;
    assert_remote(&outcomes[0]);
    assert_remote(&outcomes[1]);
    assert_cache_hit(&outcomes[2]);
    assert_eq!(doc_ids(&outcomes[1]), vec!["n1"]);
}
