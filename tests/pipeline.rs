//! End-to-end pipeline test: scheduler -> bus -> worker -> bus -> result
//! processor, over the in-memory bus and a mocked fetcher.

use std::{sync::Arc, time::Duration};

use steamwatch::{
    bus::memory::InMemoryBus,
    config::{JitterSetting, RetryPolicy},
    fetcher::MockFetcher,
    filters::FilterDoc,
    notifier::MockNotifier,
    processor::ResultProcessor,
    proxies::ProxyManager,
    scheduler::{MonitoringScheduler, SchedulerConfig},
    test_helpers::{add_proxy, test_store, ListingBuilder, TaskBuilder},
    worker::{CheckWorker, WorkerConfig},
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn one_tick_flows_from_schedule_to_notification() {
    let (store, _dir) = test_store().await;
    add_proxy(&store, "http://proxy-1:3128").await;

    let task = TaskBuilder::new()
        .interval_secs(3600)
        .filters(FilterDoc {
            max_price: Some(1_000),
            ..Default::default()
        })
        .insert(&store)
        .await;

    let bus = Arc::new(InMemoryBus::new());

    // Fetcher yields one listing inside the price bound and one outside.
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch_listings().returning(|_, _| {
        Ok(vec![
            ListingBuilder::new().listing_id("L-900").price_cents(900).build(),
            ListingBuilder::new().listing_id("L-1500").price_cents(1_500).build(),
        ])
    });

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify_match()
        .times(1)
        .withf(|event| event.price_cents == 900)
        .returning(|_| Ok(()));

    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: Duration::from_millis(10),
        factor: 2,
        max_delay_secs: Duration::from_secs(1),
        jitter: JitterSetting::None,
    };

    let worker = CheckWorker::new(
        bus.clone(),
        Arc::new(ProxyManager::new(store.clone(), Duration::from_secs(300))),
        Arc::new(fetcher),
        WorkerConfig {
            fetch_retry: retry.clone(),
            publish_retry: retry.clone(),
            proxy_wait_delay: Duration::from_millis(10),
            prefetch: 1,
        },
    );
    let processor = ResultProcessor::new(store.clone(), bus.clone(), Arc::new(notifier), 1);

    let cancel = CancellationToken::new();
    let worker_token = cancel.clone();
    let worker_handle = tokio::spawn(async move { worker.run(worker_token).await });
    let processor_token = cancel.clone();
    let processor_handle = tokio::spawn(async move { processor.run(processor_token).await });

    let scheduler = MonitoringScheduler::new(
        store.clone(),
        bus.clone(),
        SchedulerConfig {
            min_check_interval: Duration::ZERO,
            max_consecutive_errors: 5,
            error_backoff: Duration::from_millis(20),
            recovery: retry.clone(),
            publish_retry: retry,
        },
    );
    scheduler.start().await.unwrap();

    // Wait for the match to land.
    let settled = async {
        loop {
            let mut session = store.session().await.unwrap();
            if session.count_found_items(task.id).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), settled)
        .await
        .expect("pipeline did not record the match in time");

    let mut session = store.session().await.unwrap();
    let row = session.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(row.total_checks, 1);
    assert_eq!(session.count_found_items(task.id).await.unwrap(), 1);
    // next_check advanced by the interval.
    assert!(row.next_check > chrono::Utc::now() + chrono::Duration::seconds(3000));
    drop(session);

    scheduler.stop(Duration::from_secs(5)).await;
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), processor_handle).await;
}
