//! Integration tests for the proxy manager: leasing policy, temporal
//! blocks, and stat snapshots.

use std::time::Duration;

use steamwatch::{
    proxies::ProxyManager,
    test_helpers::{add_proxy, test_store},
};

#[tokio::test]
async fn acquire_on_an_empty_pool_is_a_signal_not_a_crash() {
    let (store, _dir) = test_store().await;
    let manager = ProxyManager::new(store, Duration::from_secs(300));
    assert!(manager.acquire().await.unwrap().is_none());
}

#[tokio::test]
async fn acquire_rotates_least_recently_used_first() {
    let (store, _dir) = test_store().await;
    let first = add_proxy(&store, "http://proxy-1:3128").await;
    let second = add_proxy(&store, "http://proxy-2:3128").await;
    let manager = ProxyManager::new(store, Duration::from_secs(300));

    // Never-used proxies lease first, in registration order.
    let lease_a = manager.acquire().await.unwrap().unwrap();
    assert_eq!(lease_a.proxy_id, first.id);
    let lease_b = manager.acquire().await.unwrap().unwrap();
    assert_eq!(lease_b.proxy_id, second.id);

    // With both stamped, the older lease rotates back in.
    let lease_c = manager.acquire().await.unwrap().unwrap();
    assert_eq!(lease_c.proxy_id, first.id);
}

#[tokio::test]
async fn rate_limit_blocks_until_the_deadline_passes() {
    let (store, _dir) = test_store().await;
    add_proxy(&store, "http://proxy-1:3128").await;
    // Tiny cool-off so the implicit unblock is observable.
    let manager = ProxyManager::new(store.clone(), Duration::from_millis(150));

    let lease = manager.acquire().await.unwrap().unwrap();
    manager.report_rate_limit(&lease).await.unwrap();

    // Blocked: not leasable, visible in the stats snapshot immediately.
    assert!(manager.acquire().await.unwrap().is_none());
    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.active_blocked, 1);
    assert_eq!(stats.blocked, 1);

    let mut session = store.session().await.unwrap();
    let blocked = session.fetch_proxy(lease.proxy_id).await.unwrap().unwrap();
    assert!(blocked.blocked_until.is_some());
    assert_eq!(blocked.failures, 1);

    // The unblock is a predicate on blocked_until, not a sweep: once the
    // deadline passes the proxy leases again with no other write.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let again = manager.acquire().await.unwrap().unwrap();
    assert_eq!(again.proxy_id, lease.proxy_id);

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.active_blocked, 0);
}

#[tokio::test]
async fn transport_failures_do_not_block() {
    let (store, _dir) = test_store().await;
    add_proxy(&store, "http://proxy-1:3128").await;
    let manager = ProxyManager::new(store.clone(), Duration::from_secs(300));

    let lease = manager.acquire().await.unwrap().unwrap();
    manager.report_transport_failure(&lease).await.unwrap();

    let mut session = store.session().await.unwrap();
    let proxy = session.fetch_proxy(lease.proxy_id).await.unwrap().unwrap();
    assert_eq!(proxy.failures, 1);
    assert!(proxy.blocked_until.is_none());

    // Still leasable right away.
    assert!(manager.acquire().await.unwrap().is_some());
}

#[tokio::test]
async fn success_reports_accumulate() {
    let (store, _dir) = test_store().await;
    add_proxy(&store, "http://proxy-1:3128").await;
    let manager = ProxyManager::new(store.clone(), Duration::from_secs(300));

    let lease = manager.acquire().await.unwrap().unwrap();
    manager.report_success(&lease).await.unwrap();
    manager.report_success(&lease).await.unwrap();

    let mut session = store.session().await.unwrap();
    let proxy = session.fetch_proxy(lease.proxy_id).await.unwrap().unwrap();
    assert_eq!(proxy.successes, 2);
    assert_eq!(proxy.failures, 0);
}

#[tokio::test]
async fn inactive_proxies_are_never_leased() {
    let (store, _dir) = test_store().await;
    let proxy = add_proxy(&store, "http://proxy-1:3128").await;

    let mut session = store.session().await.unwrap();
    assert!(session.set_proxy_active(proxy.id, false).await.unwrap());
    drop(session);

    let manager = ProxyManager::new(store.clone(), Duration::from_secs(300));
    assert!(manager.acquire().await.unwrap().is_none());

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.inactive, 1);
}

#[tokio::test]
async fn stats_match_a_manual_count_of_the_snapshot() {
    let (store, _dir) = test_store().await;
    add_proxy(&store, "http://proxy-1:3128").await;
    add_proxy(&store, "http://proxy-2:3128").await;
    let disabled = add_proxy(&store, "http://proxy-3:3128").await;

    let manager = ProxyManager::new(store.clone(), Duration::from_secs(300));

    let mut session = store.session().await.unwrap();
    session.set_proxy_active(disabled.id, false).await.unwrap();
    drop(session);

    let lease = manager.acquire().await.unwrap().unwrap();
    manager.report_rate_limit(&lease).await.unwrap();

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.inactive, 1);
    assert_eq!(stats.blocked, 1);
    assert_eq!(stats.active_blocked, 1);
}

#[tokio::test]
async fn operator_unblock_clears_the_deadline() {
    let (store, _dir) = test_store().await;
    add_proxy(&store, "http://proxy-1:3128").await;
    let manager = ProxyManager::new(store.clone(), Duration::from_secs(3600));

    let lease = manager.acquire().await.unwrap().unwrap();
    manager.report_rate_limit(&lease).await.unwrap();
    assert!(manager.acquire().await.unwrap().is_none());

    let mut session = store.session().await.unwrap();
    assert!(session.clear_proxy_block(lease.proxy_id).await.unwrap());
    drop(session);

    assert!(manager.acquire().await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_endpoints_collapse_after_normalization() {
    let (store, _dir) = test_store().await;
    let first = add_proxy(&store, "203.0.113.4:3128").await;
    let second = add_proxy(&store, "http://203.0.113.4:3128:refresh").await;
    assert_eq!(first.id, second.id);

    let mut session = store.session().await.unwrap();
    assert_eq!(session.list_proxies().await.unwrap().len(), 1);
}
