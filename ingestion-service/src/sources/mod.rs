pub mod mqtt;

pub use mqtt::{MqttSource, RawMessage};
