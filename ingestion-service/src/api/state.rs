use std::{sync::Arc, time::Duration, time::SystemTime};

use sqlx::{postgres::PgPoolOptions, PgPool};
use time::{Date, UtcOffset};
use water_client::{
    db,
    domain::{DailyUsage, HistoricalUsage, UsageIncrement, UsageTotals},
    StoreError,
};

use crate::config::DatabaseConfig;
use crate::sinks::connection::bounded;
use crate::transform::local_date;

/// Storage operations the usage API needs.
#[async_trait::async_trait]
pub trait UsageRepository: Send + Sync {
    async fn accumulate_daily(&self, increment: &UsageIncrement) -> Result<(), StoreError>;

    async fn today(&self, device_id: &str, date: Date) -> Result<Option<DailyUsage>, StoreError>;

    async fn recent_history(&self, device_id: &str, limit: i64) -> Result<Vec<HistoricalUsage>, StoreError>;

    async fn lifetime_totals(&self, device_id: &str, today: Date) -> Result<UsageTotals, StoreError>;
}

/// Pool for the API and schema bootstrap. No connection is made until first
/// use, so an unreachable database only fails the requests that need it.
pub fn lazy_pool(cfg: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(cfg.operation_timeout())
        .connect_lazy(&cfg.uri)?;
    Ok(pool)
}

pub struct PgUsageRepository {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgUsageRepository {
    pub fn new(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }
}

#[async_trait::async_trait]
impl UsageRepository for PgUsageRepository {
    async fn accumulate_daily(&self, increment: &UsageIncrement) -> Result<(), StoreError> {
        bounded(self.op_timeout, db::accumulate_daily(&self.pool, increment)).await?;
        Ok(())
    }

    async fn today(&self, device_id: &str, date: Date) -> Result<Option<DailyUsage>, StoreError> {
        bounded(self.op_timeout, db::today(&self.pool, device_id, date)).await
    }

    async fn recent_history(&self, device_id: &str, limit: i64) -> Result<Vec<HistoricalUsage>, StoreError> {
        bounded(self.op_timeout, db::recent_history(&self.pool, device_id, limit)).await
    }

    async fn lifetime_totals(&self, device_id: &str, today: Date) -> Result<UsageTotals, StoreError> {
        bounded(self.op_timeout, db::lifetime_totals(&self.pool, device_id, today)).await
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub repo: Arc<dyn UsageRepository>,
    /// Every route reads and writes this device.
    pub device_id: String,
    pub utc_offset: UtcOffset,
}

impl ApiState {
    pub fn new(repo: Arc<dyn UsageRepository>, device_id: String, utc_offset: UtcOffset) -> Self {
        Self {
            repo,
            device_id,
            utc_offset,
        }
    }

    pub fn today(&self) -> Date {
        local_date(SystemTime::now(), self.utc_offset)
    }
}
