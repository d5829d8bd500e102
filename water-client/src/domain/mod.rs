pub mod daily_usage;
pub mod usage_increment;

pub use daily_usage::{DailyUsage, HistoricalUsage, UsageTotals};
pub use usage_increment::UsageIncrement;
