use std::ops::Add;

use time::Date;

/// Running totals for one device on one calendar day (`daily_usage`).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DailyUsage {
    pub device_id: String,
    pub usage_date: Date,
    pub counter_increase: i64,
    pub liter_count: f64,
}

/// Finalized totals for a past day (`historical_usage`), written by the rollup job.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct HistoricalUsage {
    pub device_id: String,
    pub usage_date: Date,
    pub total_activations: i64,
    pub total_liters: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, sqlx::FromRow)]
pub struct UsageTotals {
    pub total_activations: i64,
    pub total_liters: f64,
}

impl Add for UsageTotals {
    type Output = UsageTotals;

    fn add(self, rhs: UsageTotals) -> UsageTotals {
        UsageTotals {
            total_activations: self.total_activations + rhs.total_activations,
            total_liters: self.total_liters + rhs.total_liters,
        }
    }
}

impl From<&DailyUsage> for UsageTotals {
    fn from(row: &DailyUsage) -> Self {
        UsageTotals {
            total_activations: row.counter_increase,
            total_liters: row.liter_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn totals_add_fieldwise() {
        let a = UsageTotals { total_activations: 3, total_liters: 0.5 };
        let b = UsageTotals { total_activations: 2, total_liters: 1.25 };
        assert_eq!(a + b, UsageTotals { total_activations: 5, total_liters: 1.75 });
    }

    #[test]
    fn totals_from_daily_row() {
        let row = DailyUsage {
            device_id: "1".to_string(),
            usage_date: date!(2026 - 02 - 26),
            counter_increase: 4,
            liter_count: 0.64,
        };
        assert_eq!(
            UsageTotals::from(&row),
            UsageTotals { total_activations: 4, total_liters: 0.64 }
        );
    }
}
