use anyhow::{Context, Result};
use perp_core::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{info, warn};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BASE_DELAY_MS: u64 = 500;

/// Pooled Postgres client shared by the store and audit repositories.
#[derive(Clone)]
pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Connects with bounded exponential backoff. Connections are recycled
    /// at `max_connection_age_secs` so long runs survive server-side
    /// connection churn.
    ///
    /// # Errors
    /// Returns an error when the database is unreachable after all attempts.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .max_lifetime(Duration::from_secs(config.max_connection_age_secs))
            .acquire_timeout(Duration::from_secs(10));

        let mut delay = Duration::from_millis(CONNECT_BASE_DELAY_MS);
        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match options.clone().connect(&config.url).await {
                Ok(pool) => {
                    info!(attempt, "database connected");
                    return Ok(Self { pool });
                }
                Err(err) => {
                    warn!(attempt, error = %err, "database connect failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("no connection attempt made")))
        .context("database unreachable")
    }

    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Applies the bundled schema. Idempotent; every statement is
    /// `CREATE ... IF NOT EXISTS`.
    ///
    /// # Errors
    /// Returns an error if any schema statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../schema.sql"))
            .execute(&self.pool)
            .await
            .context("applying schema")?;
        Ok(())
    }
}
