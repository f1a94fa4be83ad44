//! Integration tests for the parsing worker: classified retries, proxy
//! lease reporting, and result publication.

use std::{sync::Arc, time::Duration};

use steamwatch::{
    bus::{memory::InMemoryBus, Delivery, MessageBus, CHECK_REQUESTS_QUEUE, CHECK_RESULTS_QUEUE},
    config::{JitterSetting, RetryPolicy},
    fetcher::{FetchError, MockFetcher},
    filters::FilterDoc,
    models::messages::{CheckFailureKind, CheckRequest, CheckResult},
    persistence::Store,
    proxies::ProxyManager,
    test_helpers::{add_proxy, test_store, ListingBuilder},
    worker::{CheckWorker, WorkerConfig},
};
use tokio::sync::mpsc;

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        fetch_retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: Duration::from_millis(10),
            factor: 2,
            max_delay_secs: Duration::from_secs(1),
            jitter: JitterSetting::None,
        },
        publish_retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: Duration::from_millis(10),
            factor: 2,
            max_delay_secs: Duration::from_millis(100),
            jitter: JitterSetting::None,
        },
        proxy_wait_delay: Duration::from_millis(10),
        prefetch: 1,
    }
}

fn worker_over(store: &Store, bus: &InMemoryBus, fetcher: MockFetcher) -> CheckWorker {
    let proxies = Arc::new(ProxyManager::new(store.clone(), Duration::from_secs(300)));
    CheckWorker::new(
        Arc::new(bus.clone()),
        proxies,
        Arc::new(fetcher),
        fast_worker_config(),
    )
}

fn request() -> CheckRequest {
    CheckRequest::new(
        1,
        "https://steamcommunity.com/market/listings/730/AK-47".to_string(),
        FilterDoc::default(),
    )
}

async fn recv_result(deliveries: &mut mpsc::Receiver<Delivery>) -> CheckResult {
    let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
        .await
        .expect("timed out waiting for a check result")
        .expect("result queue closed");
    let result = serde_json::from_slice(&delivery.payload).expect("valid check result");
    delivery.ack().await.unwrap();
    result
}

async fn recv_request(deliveries: &mut mpsc::Receiver<Delivery>) -> CheckRequest {
    let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
        .await
        .expect("timed out waiting for a requeued request")
        .expect("request queue closed");
    let request = serde_json::from_slice(&delivery.payload).expect("valid check request");
    delivery.ack().await.unwrap();
    request
}

#[tokio::test]
async fn successful_fetch_publishes_listings_and_reports_success() {
    let (store, _dir) = test_store().await;
    let proxy = add_proxy(&store, "http://proxy-1:3128").await;

    let mut fetcher = MockFetcher::new();
    let listing = ListingBuilder::new().price_cents(900).build();
    let returned = listing.clone();
    fetcher
        .expect_fetch_listings()
        .times(1)
        .returning(move |_, _| Ok(vec![returned.clone()]));

    let bus = InMemoryBus::new();
    let mut results = bus.consume(CHECK_RESULTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    let request = request();
    worker.process_request(&request).await.unwrap();

    let result = recv_result(&mut results).await;
    assert!(result.ok);
    assert_eq!(result.task_id, request.task_id);
    assert_eq!(result.correlation_id, request.correlation_id);
    assert_eq!(result.listings, vec![listing]);

    let mut session = store.session().await.unwrap();
    let row = session.fetch_proxy(proxy.id).await.unwrap().unwrap();
    assert_eq!(row.successes, 1);
    assert_eq!(row.failures, 0);
}

#[tokio::test]
async fn rate_limit_blocks_the_proxy_and_requeues_with_backoff() {
    let (store, _dir) = test_store().await;
    let proxy = add_proxy(&store, "http://proxy-1:3128").await;

    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch_listings()
        .times(1)
        .returning(|_, _| Err(FetchError::RateLimited));

    let bus = InMemoryBus::new();
    let mut requests = bus.consume(CHECK_REQUESTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    let request = request();
    worker.process_request(&request).await.unwrap();

    // The proxy carries a block deadline; an operator querying right away
    // must see it.
    let mut session = store.session().await.unwrap();
    let row = session.fetch_proxy(proxy.id).await.unwrap().unwrap();
    assert!(row.blocked_until.unwrap() > chrono::Utc::now());
    assert_eq!(row.failures, 1);
    let stats = session.proxy_stats(chrono::Utc::now()).await.unwrap();
    assert!(stats.active_blocked >= 1);
    drop(session);

    // The message comes back with attempt+1 after the delay.
    let retried = recv_request(&mut requests).await;
    assert_eq!(retried.attempt, 1);
    assert_eq!(retried.correlation_id, request.correlation_id);
}

#[tokio::test]
async fn exhausted_rate_limit_budget_publishes_a_failed_result() {
    let (store, _dir) = test_store().await;
    add_proxy(&store, "http://proxy-1:3128").await;

    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch_listings()
        .times(1)
        .returning(|_, _| Err(FetchError::RateLimited));

    let bus = InMemoryBus::new();
    let mut results = bus.consume(CHECK_RESULTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    // Attempt 3 with a budget of 3 retries: no further requeue.
    let mut exhausted = request();
    exhausted.attempt = 3;
    worker.process_request(&exhausted).await.unwrap();

    let result = recv_result(&mut results).await;
    assert!(!result.ok);
    assert_eq!(result.kind, Some(CheckFailureKind::RateLimited));
    assert_eq!(bus.depth(CHECK_REQUESTS_QUEUE), 0);
}

#[tokio::test]
async fn parse_errors_fail_immediately_without_retry() {
    let (store, _dir) = test_store().await;
    let proxy = add_proxy(&store, "http://proxy-1:3128").await;

    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch_listings()
        .times(1)
        .returning(|_, _| Err(FetchError::Parse("truncated body".to_string())));

    let bus = InMemoryBus::new();
    let mut results = bus.consume(CHECK_RESULTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    worker.process_request(&request()).await.unwrap();

    let result = recv_result(&mut results).await;
    assert!(!result.ok);
    assert_eq!(result.kind, Some(CheckFailureKind::Parse));
    // No requeue for parse failures.
    assert_eq!(bus.depth(CHECK_REQUESTS_QUEUE), 0);

    // The egress path worked, so the proxy keeps a clean record.
    let mut session = store.session().await.unwrap();
    let row = session.fetch_proxy(proxy.id).await.unwrap().unwrap();
    assert_eq!(row.successes, 1);
    assert!(row.blocked_until.is_none());
}

#[tokio::test]
async fn transport_failures_count_against_the_proxy_without_blocking() {
    let (store, _dir) = test_store().await;
    let proxy = add_proxy(&store, "http://proxy-1:3128").await;

    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch_listings()
        .times(1)
        .returning(|_, _| Err(FetchError::Transport("connection reset".to_string())));

    let bus = InMemoryBus::new();
    let mut requests = bus.consume(CHECK_REQUESTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    worker.process_request(&request()).await.unwrap();

    let mut session = store.session().await.unwrap();
    let row = session.fetch_proxy(proxy.id).await.unwrap().unwrap();
    assert_eq!(row.failures, 1);
    assert!(row.blocked_until.is_none());
    drop(session);

    let retried = recv_request(&mut requests).await;
    assert_eq!(retried.attempt, 1);
}

#[tokio::test]
async fn upstream_errors_retry_without_touching_the_proxy_record() {
    let (store, _dir) = test_store().await;
    let proxy = add_proxy(&store, "http://proxy-1:3128").await;

    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch_listings()
        .times(1)
        .returning(|_, _| Err(FetchError::Upstream(502)));

    let bus = InMemoryBus::new();
    let mut requests = bus.consume(CHECK_REQUESTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    worker.process_request(&request()).await.unwrap();

    let mut session = store.session().await.unwrap();
    let row = session.fetch_proxy(proxy.id).await.unwrap().unwrap();
    assert_eq!(row.failures, 0);
    assert!(row.blocked_until.is_none());
    drop(session);

    let retried = recv_request(&mut requests).await;
    assert_eq!(retried.attempt, 1);
}

#[tokio::test]
async fn missing_proxy_requeues_with_a_short_delay() {
    let (store, _dir) = test_store().await;
    // Empty pool.
    let fetcher = MockFetcher::new();

    let bus = InMemoryBus::new();
    let mut requests = bus.consume(CHECK_REQUESTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    worker.process_request(&request()).await.unwrap();

    let retried = recv_request(&mut requests).await;
    assert_eq!(retried.attempt, 1);
}

#[tokio::test]
async fn missing_proxy_at_the_cap_fails_the_check() {
    let (store, _dir) = test_store().await;
    let fetcher = MockFetcher::new();

    let bus = InMemoryBus::new();
    let mut results = bus.consume(CHECK_RESULTS_QUEUE, 4).await.unwrap();
    let worker = worker_over(&store, &bus, fetcher);

    let mut exhausted = request();
    exhausted.attempt = 3;
    worker.process_request(&exhausted).await.unwrap();

    let result = recv_result(&mut results).await;
    assert!(!result.ok);
    assert_eq!(result.kind, Some(CheckFailureKind::Transport));
}

#[tokio::test]
async fn malformed_requests_are_dropped_not_requeued() {
    let (store, _dir) = test_store().await;
    let fetcher = MockFetcher::new();

    let bus = InMemoryBus::new();
    let worker = worker_over(&store, &bus, fetcher);

    bus.publish(CHECK_REQUESTS_QUEUE, b"not json").await.unwrap();
    let mut requests = bus.consume(CHECK_REQUESTS_QUEUE, 4).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .unwrap()
        .unwrap();

    worker.handle_delivery(delivery).await.unwrap();
    assert_eq!(bus.depth(CHECK_REQUESTS_QUEUE), 0);
}
