use sqlx::PgPool;

use crate::StoreError;

const USAGE_TABLES: &str = include_str!("../../../sql/schema/01_usage_tables.sql");

/// Create `daily_usage` and `historical_usage` if they do not exist yet.
///
/// Production deployments normally apply `sql/schema/*.sql` out-of-band; this is
/// for local setups and integration tests.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(USAGE_TABLES).execute(pool).await?;
    Ok(())
}
