//! Integration tests for the result processor: counters, filter
//! evaluation, de-duplication, and at-most-once notification.

use std::{sync::Arc, time::Duration};

use steamwatch::{
    bus::{memory::InMemoryBus, MessageBus, CHECK_RESULTS_QUEUE},
    filters::FilterDoc,
    models::messages::{CheckFailureKind, CheckRequest, CheckResult},
    notifier::MockNotifier,
    persistence::Store,
    processor::ResultProcessor,
    test_helpers::{test_store, ListingBuilder, TaskBuilder},
};

fn processor_over(store: &Store, notifier: MockNotifier) -> ResultProcessor {
    ResultProcessor::new(
        store.clone(),
        Arc::new(InMemoryBus::new()),
        Arc::new(notifier),
        4,
    )
}

fn request_for(task_id: i64) -> CheckRequest {
    CheckRequest::new(task_id, "https://example.test/listings".to_string(), FilterDoc::default())
}

#[tokio::test]
async fn happy_path_records_one_match_and_notifies_once() {
    let (store, _dir) = test_store().await;
    let task = TaskBuilder::new()
        .filters(FilterDoc {
            max_price: Some(1_000),
            ..Default::default()
        })
        .insert(&store)
        .await;

    let cheap = ListingBuilder::new().listing_id("L-900").price_cents(900).build();
    let expensive = ListingBuilder::new()
        .listing_id("L-1500")
        .price_cents(1_500)
        .build();

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify_match()
        .times(1)
        .withf(move |event| event.price_cents == 900 && event.owner_id == 1)
        .returning(|_| Ok(()));
    let processor = processor_over(&store, notifier);

    let result = CheckResult::success(&request_for(task.id), vec![cheap, expensive]);
    processor.apply_result(&result).await.unwrap();

    let mut session = store.session().await.unwrap();
    let row = session.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(row.total_checks, 1);
    assert_eq!(session.count_found_items(task.id).await.unwrap(), 1);

    let items = session.list_found_items(task.id, 10).await.unwrap();
    assert_eq!(items[0].price_cents, 900);
}

#[tokio::test]
async fn duplicate_delivery_notifies_at_most_once() {
    let (store, _dir) = test_store().await;
    let task = TaskBuilder::new().insert(&store).await;
    let listing = ListingBuilder::new().listing_id("L-1").price_cents(500).build();

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_match().times(1).returning(|_| Ok(()));
    let processor = processor_over(&store, notifier);

    let result = CheckResult::success(&request_for(task.id), vec![listing]);
    // The same message delivered twice: same found_items rows, one
    // notification in total.
    processor.apply_result(&result).await.unwrap();
    processor.apply_result(&result).await.unwrap();

    let mut session = store.session().await.unwrap();
    assert_eq!(session.count_found_items(task.id).await.unwrap(), 1);
    // Both deliveries count as completed checks.
    let row = session.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(row.total_checks, 2);
}

#[tokio::test]
async fn failed_results_advance_the_counter_without_items() {
    let (store, _dir) = test_store().await;
    let task = TaskBuilder::new().insert(&store).await;

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_match().times(0);
    let processor = processor_over(&store, notifier);

    let result = CheckResult::failure(&request_for(task.id), CheckFailureKind::RateLimited);
    processor.apply_result(&result).await.unwrap();

    let mut session = store.session().await.unwrap();
    let row = session.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(row.total_checks, 1);
    assert_eq!(session.count_found_items(task.id).await.unwrap(), 0);
}

#[tokio::test]
async fn results_for_inactive_tasks_are_dropped() {
    let (store, _dir) = test_store().await;
    let task = TaskBuilder::new().insert(&store).await;

    let mut session = store.session().await.unwrap();
    session.set_task_active(task.id, false).await.unwrap();
    drop(session);

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_match().times(0);
    let processor = processor_over(&store, notifier);

    let listing = ListingBuilder::new().price_cents(100).build();
    let result = CheckResult::success(&request_for(task.id), vec![listing]);
    processor.apply_result(&result).await.unwrap();

    let mut session = store.session().await.unwrap();
    let row = session.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(row.total_checks, 0);
    assert_eq!(session.count_found_items(task.id).await.unwrap(), 0);
}

#[tokio::test]
async fn results_for_deleted_tasks_are_dropped() {
    let (store, _dir) = test_store().await;

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_match().times(0);
    let processor = processor_over(&store, notifier);

    let listing = ListingBuilder::new().build();
    let result = CheckResult::success(&request_for(424242), vec![listing]);
    processor.apply_result(&result).await.unwrap();
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_message() {
    let (store, _dir) = test_store().await;
    let task = TaskBuilder::new().insert(&store).await;
    let listing = ListingBuilder::new().listing_id("L-1").build();

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_match().times(1).returning(|_| {
        Err(steamwatch::notifier::NotificationError::Request(
            "endpoint down".to_string(),
        ))
    });
    let processor = processor_over(&store, notifier);

    let result = CheckResult::success(&request_for(task.id), vec![listing]);
    // Fire-and-forget: the match is recorded even though delivery failed.
    processor.apply_result(&result).await.unwrap();

    let mut session = store.session().await.unwrap();
    assert_eq!(session.count_found_items(task.id).await.unwrap(), 1);
}

#[tokio::test]
async fn non_matching_listings_are_not_recorded() {
    let (store, _dir) = test_store().await;
    let task = TaskBuilder::new()
        .filters(FilterDoc {
            max_price: Some(100),
            name_contains: Some("redline".to_string()),
            ..Default::default()
        })
        .insert(&store)
        .await;

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_match().times(0);
    let processor = processor_over(&store, notifier);

    // Price matches, name does not.
    let wrong_name = ListingBuilder::new()
        .item_name("M4A4 | Asiimov (Field-Tested)")
        .price_cents(50)
        .build();
    let result = CheckResult::success(&request_for(task.id), vec![wrong_name]);
    processor.apply_result(&result).await.unwrap();

    let mut session = store.session().await.unwrap();
    assert_eq!(session.count_found_items(task.id).await.unwrap(), 0);
    let row = session.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(row.total_checks, 1);
}

#[tokio::test]
async fn malformed_results_are_acked_and_dropped() {
    let (store, _dir) = test_store().await;
    let bus = InMemoryBus::new();

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_match().times(0);
    let processor = ResultProcessor::new(
        store.clone(),
        Arc::new(bus.clone()),
        Arc::new(notifier),
        4,
    );

    bus.publish(CHECK_RESULTS_QUEUE, b"{broken").await.unwrap();
    let mut deliveries = bus.consume(CHECK_RESULTS_QUEUE, 4).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
        .await
        .unwrap()
        .unwrap();

    processor.handle_delivery(delivery).await.unwrap();
    assert_eq!(bus.depth(CHECK_RESULTS_QUEUE), 0);
}
