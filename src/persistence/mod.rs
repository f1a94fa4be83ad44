//! Persistent state: the store, its sessions, and typed operations per
//! aggregate.
//!
//! The cardinal rule of this layer is that a [`Session`] is affine to a
//! single logical unit of work. Every control loop, message handler, and
//! recovery attempt opens its own session (a dedicated pooled connection)
//! and drops it on every exit path; no two concurrent activities may share
//! one. Cross-session freshness is obtained by opening a fresh session, not
//! by caching rows.

pub mod error;
mod found_items;
mod proxies;
mod tasks;

pub use error::PersistenceError;
pub use tasks::TaskCounts;

use std::{future::Future, str::FromStr, time::Duration};

use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool,
};

/// Owner of the connection pool and the migration runner.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    statement_timeout: Duration,
}

impl Store {
    /// Connects to the database, creating the file if missing.
    #[tracing::instrument(level = "info", skip_all, fields(database_url))]
    pub async fn connect(
        database_url: &str,
        statement_timeout: Duration,
    ) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PersistenceError::InvalidInput(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(statement_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .map_err(|e| PersistenceError::from_sqlx("connect", e))?;

        tracing::info!(database_url, "connected to database");
        Ok(Self { pool, statement_timeout })
    }

    /// Applies the embedded numbered migrations. Re-application of
    /// already-recorded migrations is a no-op.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "database migration failed");
                PersistenceError::Migration(e.to_string())
            })?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    /// Opens a new session: an independent handle with its own connection
    /// lease, affine to exactly one concurrent activity.
    pub async fn session(&self) -> Result<Session, PersistenceError> {
        let conn = timed(self.statement_timeout, "acquire session", async {
            self.pool.acquire().await
        })
        .await?;
        Ok(Session {
            conn,
            timeout: self.statement_timeout,
        })
    }

    /// Closes the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("database pool closed");
    }
}

/// An independent transactional handle on the store.
///
/// Dropping the session returns its connection to the pool, rolling back any
/// statement left incomplete by a failure.
pub struct Session {
    conn: PoolConnection<Sqlite>,
    timeout: Duration,
}

impl Session {
    fn executor(&mut self) -> &mut sqlx::SqliteConnection {
        &mut self.conn
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Bounds a driver call with the statement timeout and classifies failures.
async fn timed<T, F>(
    timeout: Duration,
    operation: &'static str,
    query: F,
) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, query).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(PersistenceError::from_sqlx(operation, error)),
        Err(_) => Err(PersistenceError::Timeout { operation }),
    }
}
