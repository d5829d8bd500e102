pub mod daily_usage_queries;
pub mod schema;

pub use daily_usage_queries::{
    accumulate_daily, historical_totals, lifetime_totals, recent_history, today,
};
pub use schema::ensure_schema;
