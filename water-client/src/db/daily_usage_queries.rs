use sqlx::PgExecutor;
use time::Date;

use crate::domain::{DailyUsage, HistoricalUsage, UsageIncrement, UsageTotals};
use crate::StoreError;

/// Fold one increment into its (device, day) row.
///
/// A single `INSERT .. ON CONFLICT DO UPDATE`, so two writers racing on a brand
/// new key both land without a duplicate-key error.
pub async fn accumulate_daily<'e, E>(executor: E, increment: &UsageIncrement) -> Result<u64, StoreError>
where
    E: PgExecutor<'e>,
{
    let res = sqlx::query(
        r#"
        INSERT INTO daily_usage (device_id, usage_date, counter_increase, liter_count)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (device_id, usage_date) DO UPDATE
        SET counter_increase = daily_usage.counter_increase + EXCLUDED.counter_increase,
            liter_count      = daily_usage.liter_count + EXCLUDED.liter_count
        "#,
    )
    .bind(&increment.device_id)
    .bind(increment.usage_date)
    .bind(i64::from(increment.counter_increase))
    .bind(increment.liters)
    .execute(executor)
    .await?;

    Ok(res.rows_affected())
}

/// The running row for `device_id` on `date`, if any increment has landed yet.
pub async fn today<'e, E>(executor: E, device_id: &str, date: Date) -> Result<Option<DailyUsage>, StoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, DailyUsage>(
        r#"
        SELECT
            device_id,
            usage_date,
            counter_increase::BIGINT       AS counter_increase,
            liter_count::DOUBLE PRECISION  AS liter_count
        FROM daily_usage
        WHERE device_id = $1
          AND usage_date = $2
        "#,
    )
    .bind(device_id)
    .bind(date)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

/// Most recent `limit` finalized days for a device, newest first.
pub async fn recent_history<'e, E>(
    executor: E,
    device_id: &str,
    limit: i64,
) -> Result<Vec<HistoricalUsage>, StoreError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, HistoricalUsage>(
        r#"
        SELECT
            device_id,
            usage_date,
            total_activations::BIGINT       AS total_activations,
            total_liters::DOUBLE PRECISION  AS total_liters
        FROM historical_usage
        WHERE device_id = $1
        ORDER BY usage_date DESC
        LIMIT $2
        "#,
    )
    .bind(device_id)
    .bind(limit)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Sum of every finalized day for a device. Zero when there is no history.
pub async fn historical_totals<'e, E>(executor: E, device_id: &str) -> Result<UsageTotals, StoreError>
where
    E: PgExecutor<'e>,
{
    // SUM over BIGINT yields NUMERIC in Postgres; cast back so it decodes as i64.
    let totals = sqlx::query_as::<_, UsageTotals>(
        r#"
        SELECT
            COALESCE(SUM(total_activations), 0)::BIGINT          AS total_activations,
            COALESCE(SUM(total_liters), 0)::DOUBLE PRECISION     AS total_liters
        FROM historical_usage
        WHERE device_id = $1
        "#,
    )
    .bind(device_id)
    .fetch_one(executor)
    .await?;

    Ok(totals)
}

/// Lifetime totals: finalized history plus the running total for `today_date`.
pub async fn lifetime_totals<'c, A>(conn: A, device_id: &str, today_date: Date) -> Result<UsageTotals, StoreError>
where
    A: sqlx::Acquire<'c, Database = sqlx::Postgres>,
{
    let mut conn = conn.acquire().await?;
    let historical = historical_totals(&mut *conn, device_id).await?;
    let running = today(&mut *conn, device_id, today_date)
        .await?
        .map(|row| UsageTotals::from(&row))
        .unwrap_or_default();

    Ok(historical + running)
}
