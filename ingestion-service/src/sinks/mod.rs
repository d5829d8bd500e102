pub mod connection;
pub mod daily_usage;

pub use connection::{Connector, PgConnector, PgStoreConnection, StoreConnection, WorkerConnection};
pub use daily_usage::DailyUsageSink;
