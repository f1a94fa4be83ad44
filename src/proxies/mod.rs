//! Proxy pool management.
//!
//! The manager arbitrates all proxy mutation. Selection runs inside a short
//! critical section so two callers cannot lease the same least-recently-used
//! proxy simultaneously, and every selection opens a fresh session so blocks
//! committed by other workers (or other processes) are observed. Block
//! state lives in the relational store, never in volatile memory, so leases
//! and blocks survive process restarts.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    models::proxy::{ProxyLease, ProxyStats},
    persistence::{PersistenceError, Store},
};

/// Allocates proxies to callers and records lease outcomes.
pub struct ProxyManager {
    store: Store,
    cool_off: Duration,
    selection_lock: Mutex<()>,
    none_streak: AtomicU32,
}

impl ProxyManager {
    /// Creates a manager with the given rate-limit cool-off window.
    pub fn new(store: Store, cool_off: Duration) -> Self {
        Self {
            store,
            cool_off,
            selection_lock: Mutex::new(()),
            none_streak: AtomicU32::new(0),
        }
    }

    /// Leases the next proxy under the fair policy, or `None` when the pool
    /// is exhausted. `None` is a signal the caller must handle, never a
    /// crash.
    pub async fn acquire(&self) -> Result<Option<ProxyLease>, PersistenceError> {
        let _guard = self.selection_lock.lock().await;
        let mut session = self.store.session().await?;
        let now = Utc::now();

        let Some(proxy) = session.select_leasable_proxy(now).await? else {
            let streak = self.none_streak.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                consecutive_misses = streak,
                "no leasable proxy available, pool is degraded"
            );
            return Ok(None);
        };

        session.touch_proxy_lease(proxy.id, now).await?;
        self.none_streak.store(0, Ordering::Relaxed);
        tracing::debug!(proxy_id = proxy.id, "leased proxy");
        Ok(Some(ProxyLease {
            proxy_id: proxy.id,
            endpoint: proxy.endpoint,
        }))
    }

    /// Records a successful use of the leased proxy.
    pub async fn report_success(&self, lease: &ProxyLease) -> Result<(), PersistenceError> {
        let mut session = self.store.session().await?;
        session.record_proxy_success(lease.proxy_id, Utc::now()).await
    }

    /// Records a rate-limit signal: the proxy is blocked until the cool-off
    /// deadline passes.
    pub async fn report_rate_limit(&self, lease: &ProxyLease) -> Result<(), PersistenceError> {
        let blocked_until = Utc::now()
            + chrono::Duration::from_std(self.cool_off)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut session = self.store.session().await?;
        session
            .record_proxy_rate_limit(lease.proxy_id, blocked_until)
            .await?;
        tracing::warn!(
            proxy_id = lease.proxy_id,
            blocked_until = %blocked_until,
            "proxy rate limited, applying temporal block"
        );
        Ok(())
    }

    /// Records a transient transport failure. The proxy stays leasable.
    pub async fn report_transport_failure(
        &self,
        lease: &ProxyLease,
    ) -> Result<(), PersistenceError> {
        let mut session = self.store.session().await?;
        session
            .record_proxy_transport_failure(lease.proxy_id)
            .await?;
        tracing::debug!(proxy_id = lease.proxy_id, "proxy transport failure recorded");
        Ok(())
    }

    /// Returns pool counters from a fresh snapshot read.
    pub async fn stats(&self) -> Result<ProxyStats, PersistenceError> {
        let mut session = self.store.session().await?;
        session.proxy_stats(Utc::now()).await
    }
}
