//! Builders and fixtures shared by the crate's tests.

use std::time::Duration;

use tempfile::TempDir;

use crate::{
    filters::FilterDoc,
    models::{
        listing::Listing,
        proxy::Proxy,
        task::{MonitoringTask, TaskConfig},
    },
    persistence::Store,
};

/// Opens a migrated file-backed store in a fresh temporary directory.
///
/// File-backed rather than `sqlite::memory:` because every session takes its
/// own pooled connection, and separate connections to an in-memory database
/// see separate databases.
pub async fn test_store() -> (Store, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let url = format!("sqlite://{}", dir.path().join("steamwatch.db").display());
    let store = Store::connect(&url, Duration::from_secs(5))
        .await
        .expect("connect to test db");
    store.run_migrations().await.expect("run migrations");
    (store, dir)
}

/// Builder for monitoring tasks.
pub struct TaskBuilder {
    config: TaskConfig,
}

impl TaskBuilder {
    /// Starts from a plausible default task.
    pub fn new() -> Self {
        Self {
            config: TaskConfig {
                owner_id: 1,
                name: "test task".to_string(),
                url: "https://steamcommunity.com/market/listings/730/AK-47%20%7C%20Redline"
                    .to_string(),
                filters: FilterDoc::default(),
                check_interval_secs: 60,
            },
        }
    }

    /// Sets the owner.
    pub fn owner(mut self, owner_id: i64) -> Self {
        self.config.owner_id = owner_id;
        self
    }

    /// Sets the name.
    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    /// Sets the filters.
    pub fn filters(mut self, filters: FilterDoc) -> Self {
        self.config.filters = filters;
        self
    }

    /// Sets the check interval in seconds.
    pub fn interval_secs(mut self, secs: i64) -> Self {
        self.config.check_interval_secs = secs;
        self
    }

    /// Returns the config without persisting it.
    pub fn build(self) -> TaskConfig {
        self.config
    }

    /// Persists the task and returns the stored row.
    pub async fn insert(self, store: &Store) -> MonitoringTask {
        let mut session = store.session().await.expect("open session");
        session
            .insert_task(&self.config)
            .await
            .expect("insert task")
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for listings.
pub struct ListingBuilder {
    listing: Listing,
}

impl ListingBuilder {
    /// Starts from a plausible default listing.
    pub fn new() -> Self {
        Self {
            listing: Listing {
                listing_id: None,
                item_name: "AK-47 | Redline (Field-Tested)".to_string(),
                price_cents: 900,
                wear: None,
                pattern_seed: None,
                stickers: Vec::new(),
                seller_opaque_id: None,
                raw: None,
            },
        }
    }

    /// Sets the external listing id.
    pub fn listing_id(mut self, id: &str) -> Self {
        self.listing.listing_id = Some(id.to_string());
        self
    }

    /// Sets the item name.
    pub fn item_name(mut self, name: &str) -> Self {
        self.listing.item_name = name.to_string();
        self
    }

    /// Sets the price in cents.
    pub fn price_cents(mut self, price: i64) -> Self {
        self.listing.price_cents = price;
        self
    }

    /// Sets the wear value.
    pub fn wear(mut self, wear: f64) -> Self {
        self.listing.wear = Some(wear);
        self
    }

    /// Sets the pattern seed.
    pub fn pattern_seed(mut self, seed: i64) -> Self {
        self.listing.pattern_seed = Some(seed);
        self
    }

    /// Adds a sticker.
    pub fn sticker(mut self, name: &str) -> Self {
        self.listing.stickers.push(name.to_string());
        self
    }

    /// Returns the listing.
    pub fn build(self) -> Listing {
        self.listing
    }
}

impl Default for ListingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers a proxy endpoint and returns the stored row.
pub async fn add_proxy(store: &Store, endpoint: &str) -> Proxy {
    let mut session = store.session().await.expect("open session");
    let (proxy, _) = session.insert_proxy(endpoint).await.expect("insert proxy");
    proxy
}
