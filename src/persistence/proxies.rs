//! Proxy-pool operations on a [`Session`].
//!
//! Leasability is a pure predicate over the row (`is_active` and the block
//! deadline), never a scheduled job: a proxy whose `blocked_until` has
//! passed becomes leasable again simply by being read.

use chrono::{DateTime, Utc};

use super::{timed, PersistenceError, Session};
use crate::models::proxy::{normalize_endpoint, Proxy, ProxyStats};

#[derive(sqlx::FromRow)]
struct ProxyRow {
    proxy_id: i64,
    endpoint: String,
    is_active: bool,
    blocked_until: Option<DateTime<Utc>>,
    successes: i64,
    failures: i64,
    last_used_at: Option<DateTime<Utc>>,
}

impl From<ProxyRow> for Proxy {
    fn from(row: ProxyRow) -> Self {
        Proxy {
            id: row.proxy_id,
            endpoint: row.endpoint,
            is_active: row.is_active,
            blocked_until: row.blocked_until,
            successes: row.successes,
            failures: row.failures,
            last_used_at: row.last_used_at,
        }
    }
}

const PROXY_COLUMNS: &str =
    "proxy_id, endpoint, is_active, blocked_until, successes, failures, last_used_at";

impl Session {
    /// Registers a proxy endpoint, normalizing it first. Returns the stored
    /// proxy and whether it was newly created.
    pub async fn insert_proxy(&mut self, raw_endpoint: &str) -> Result<(Proxy, bool), PersistenceError> {
        let endpoint = normalize_endpoint(raw_endpoint);
        let now = Utc::now();
        let timeout = self.timeout();
        let result = timed(
            timeout,
            "insert proxy",
            sqlx::query(
                "INSERT INTO proxies (endpoint, is_active, created_at) VALUES (?, 1, ?) \
                 ON CONFLICT (endpoint) DO NOTHING",
            )
            .bind(&endpoint)
            .bind(now)
            .execute(self.executor()),
        )
        .await?;
        let created = result.rows_affected() > 0;

        let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE endpoint = ?");
        let timeout = self.timeout();
        let row = timed(
            timeout,
            "fetch proxy by endpoint",
            sqlx::query_as::<_, ProxyRow>(&sql)
                .bind(&endpoint)
                .fetch_one(self.executor()),
        )
        .await?;
        Ok((row.into(), created))
    }

    /// Reads a proxy by id.
    pub async fn fetch_proxy(&mut self, proxy_id: i64) -> Result<Option<Proxy>, PersistenceError> {
        let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE proxy_id = ?");
        let timeout = self.timeout();
        let row = timed(
            timeout,
            "fetch proxy",
            sqlx::query_as::<_, ProxyRow>(&sql)
                .bind(proxy_id)
                .fetch_optional(self.executor()),
        )
        .await?;
        Ok(row.map(Proxy::from))
    }

    /// Lists the whole pool in id order.
    pub async fn list_proxies(&mut self) -> Result<Vec<Proxy>, PersistenceError> {
        let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies ORDER BY proxy_id");
        let timeout = self.timeout();
        let rows = timed(
            timeout,
            "list proxies",
            sqlx::query_as::<_, ProxyRow>(&sql).fetch_all(self.executor()),
        )
        .await?;
        Ok(rows.into_iter().map(Proxy::from).collect())
    }

    /// Selects the next leasable proxy at `now`: least recently used first
    /// (never-used proxies win), ties broken by highest success ratio.
    ///
    /// The read is always fresh (this session sees blocks committed by
    /// other workers' sessions) and leasability is evaluated against the
    /// snapshot, so an expired block simply stops filtering the row out.
    pub async fn select_leasable_proxy(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<Proxy>, PersistenceError> {
        let mut candidates: Vec<Proxy> = self
            .list_proxies()
            .await?
            .into_iter()
            .filter(|proxy| proxy.is_leasable(now))
            .collect();

        candidates.sort_by(|a, b| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| {
                    b.success_ratio()
                        .partial_cmp(&a.success_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(candidates.into_iter().next())
    }

    /// Stamps the lease time so the LRU policy rotates away from this proxy.
    pub async fn touch_proxy_lease(
        &mut self,
        proxy_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let timeout = self.timeout();
        timed(
            timeout,
            "touch proxy lease",
            sqlx::query("UPDATE proxies SET last_used_at = ? WHERE proxy_id = ?")
                .bind(now)
                .bind(proxy_id)
                .execute(self.executor()),
        )
        .await?;
        Ok(())
    }

    /// Records a successful use.
    pub async fn record_proxy_success(
        &mut self,
        proxy_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let timeout = self.timeout();
        timed(
            timeout,
            "record proxy success",
            sqlx::query(
                "UPDATE proxies SET successes = successes + 1, last_used_at = ? WHERE proxy_id = ?",
            )
            .bind(now)
            .bind(proxy_id)
            .execute(self.executor()),
        )
        .await?;
        Ok(())
    }

    /// Records a rate-limit signal: advances the block deadline and counts
    /// the failure.
    pub async fn record_proxy_rate_limit(
        &mut self,
        proxy_id: i64,
        blocked_until: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let timeout = self.timeout();
        timed(
            timeout,
            "record proxy rate limit",
            sqlx::query(
                "UPDATE proxies SET failures = failures + 1, blocked_until = ? WHERE proxy_id = ?",
            )
            .bind(blocked_until)
            .bind(proxy_id)
            .execute(self.executor()),
        )
        .await?;
        Ok(())
    }

    /// Records a transient transport failure. No block: the proxy may well
    /// work on the next lease.
    pub async fn record_proxy_transport_failure(
        &mut self,
        proxy_id: i64,
    ) -> Result<(), PersistenceError> {
        let timeout = self.timeout();
        timed(
            timeout,
            "record proxy transport failure",
            sqlx::query("UPDATE proxies SET failures = failures + 1 WHERE proxy_id = ?")
                .bind(proxy_id)
                .execute(self.executor()),
        )
        .await?;
        Ok(())
    }

    /// Clears a block deadline (operator unblock).
    pub async fn clear_proxy_block(&mut self, proxy_id: i64) -> Result<bool, PersistenceError> {
        let timeout = self.timeout();
        let result = timed(
            timeout,
            "clear proxy block",
            sqlx::query("UPDATE proxies SET blocked_until = NULL WHERE proxy_id = ?")
                .bind(proxy_id)
                .execute(self.executor()),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flips the operator kill switch.
    pub async fn set_proxy_active(
        &mut self,
        proxy_id: i64,
        active: bool,
    ) -> Result<bool, PersistenceError> {
        let timeout = self.timeout();
        let result = timed(
            timeout,
            "set proxy active",
            sqlx::query("UPDATE proxies SET is_active = ? WHERE proxy_id = ?")
                .bind(active)
                .bind(proxy_id)
                .execute(self.executor()),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Derives the pool counters from one fresh snapshot read, so blocks
    /// just committed by other processes are visible.
    pub async fn proxy_stats(&mut self, now: DateTime<Utc>) -> Result<ProxyStats, PersistenceError> {
        let proxies = self.list_proxies().await?;
        let total = proxies.len() as i64;
        let active = proxies.iter().filter(|p| p.is_active).count() as i64;
        let blocked = proxies
            .iter()
            .filter(|p| p.blocked_until.is_some_and(|until| until > now))
            .count() as i64;
        let active_blocked = proxies
            .iter()
            .filter(|p| p.is_active && p.blocked_until.is_some_and(|until| until > now))
            .count() as i64;
        Ok(ProxyStats {
            total,
            active,
            inactive: total - active,
            blocked,
            active_blocked,
        })
    }
}
