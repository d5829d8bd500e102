use time::Date;

/// One decoded sensor message, ready to be folded into its day's row.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageIncrement {
    pub device_id: String,
    pub usage_date: Date,
    pub counter_increase: u32,
    pub liters: f64,
}
