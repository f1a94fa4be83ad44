//! Found-item operations on a [`Session`].

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{timed, PersistenceError, Session};
use crate::models::found_item::FoundItem;

#[derive(sqlx::FromRow)]
struct FoundItemRow {
    item_id: i64,
    task_id: i64,
    fingerprint: String,
    price_cents: i64,
    first_seen_at: DateTime<Utc>,
    raw: String,
}

impl FoundItemRow {
    fn into_item(self) -> Result<FoundItem, PersistenceError> {
        Ok(FoundItem {
            id: self.item_id,
            task_id: self.task_id,
            fingerprint: self.fingerprint,
            price_cents: self.price_cents,
            first_seen_at: self.first_seen_at,
            raw: serde_json::from_str(&self.raw)?,
        })
    }
}

impl Session {
    /// Inserts a found-item record unless the `(task_id, fingerprint)` pair
    /// already exists. Returns whether a row was inserted; true means
    /// "newly seen" and is the caller's license to notify.
    pub async fn record_found_item(
        &mut self,
        task_id: i64,
        fingerprint: &str,
        price_cents: i64,
        raw: &Value,
    ) -> Result<bool, PersistenceError> {
        let payload = serde_json::to_string(raw)?;
        let now = Utc::now();
        let timeout = self.timeout();
        let result = timed(
            timeout,
            "record found item",
            sqlx::query(
                "INSERT INTO found_items (task_id, fingerprint, price_cents, first_seen_at, raw) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (task_id, fingerprint) DO NOTHING",
            )
            .bind(task_id)
            .bind(fingerprint)
            .bind(price_cents)
            .bind(now)
            .bind(&payload)
            .execute(self.executor()),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts recorded matches for a task.
    pub async fn count_found_items(&mut self, task_id: i64) -> Result<i64, PersistenceError> {
        #[derive(sqlx::FromRow)]
        struct CountRow {
            count: i64,
        }
        let timeout = self.timeout();
        let row = timed(
            timeout,
            "count found items",
            sqlx::query_as::<_, CountRow>(
                "SELECT COUNT(*) AS count FROM found_items WHERE task_id = ?",
            )
            .bind(task_id)
            .fetch_one(self.executor()),
        )
        .await?;
        Ok(row.count)
    }

    /// Lists the most recent matches for a task.
    pub async fn list_found_items(
        &mut self,
        task_id: i64,
        limit: i64,
    ) -> Result<Vec<FoundItem>, PersistenceError> {
        let timeout = self.timeout();
        let rows = timed(
            timeout,
            "list found items",
            sqlx::query_as::<_, FoundItemRow>(
                "SELECT item_id, task_id, fingerprint, price_cents, first_seen_at, raw \
                 FROM found_items WHERE task_id = ? \
                 ORDER BY first_seen_at DESC, item_id DESC LIMIT ?",
            )
            .bind(task_id)
            .bind(limit)
            .fetch_all(self.executor()),
        )
        .await?;
        rows.into_iter().map(FoundItemRow::into_item).collect()
    }
}
