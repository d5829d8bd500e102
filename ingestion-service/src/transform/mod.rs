pub mod payload;

use std::time::SystemTime;

use time::{macros::date, Date, OffsetDateTime, UtcOffset};
use water_client::domain::UsageIncrement;

use crate::pipeline::{Envelope, PipelineError, Transform};
use crate::sources::RawMessage;

pub use payload::{parse_payload, PayloadDefaults, PayloadError};

/// Calendar date of `at` in the configured offset.
pub fn local_date(at: SystemTime, offset: UtcOffset) -> Date {
    OffsetDateTime::from(at).to_offset(offset).date()
}

/// Turns raw broker messages into increments. "Today" is the day the message was
/// received, in the configured offset.
pub struct PayloadDecoder {
    defaults: PayloadDefaults,
    utc_offset: UtcOffset,
}

impl PayloadDecoder {
    pub fn new(defaults: PayloadDefaults, utc_offset: UtcOffset) -> Self {
        Self { defaults, utc_offset }
    }
}

#[async_trait::async_trait]
impl Transform<RawMessage, UsageIncrement> for PayloadDecoder {
    async fn apply(&self, input: Envelope<RawMessage>) -> Result<Envelope<UsageIncrement>, PipelineError> {
        let today = local_date(input.received_at, self.utc_offset);

        match parse_payload(&input.payload.payload, &self.defaults, today) {
            Ok(inc) => {
                tracing::debug!(
                    topic = %input.payload.topic,
                    device_id = %inc.device_id,
                    usage_date = %inc.usage_date,
                    counter_increase = inc.counter_increase,
                    liters = inc.liters,
                    "decoded usage message"
                );
                Ok(Envelope::new(inc, input.received_at).with_ack(input.ack))
            }
            Err(e) => {
                metrics::counter!("payload_decode_errors_total").increment(1);
                Err(PipelineError::Decode(e))
            }
        }
    }
}

/// Pure validation of a `UsageIncrement`.
///
/// Rules:
/// - liters must be finite and non-negative.
/// - usage_date must be within a broad sanity window [2000-01-01, 2100-01-01).
pub fn validate_usage_increment(env: Envelope<UsageIncrement>) -> Result<Envelope<UsageIncrement>, PipelineError> {
    let inc = &env.payload;

    if !inc.liters.is_finite() || inc.liters < 0.0 {
        return Err(PipelineError::Transform("liters must be non-negative".to_string()));
    }

    let min_date = date!(2000 - 01 - 01);
    let max_date = date!(2100 - 01 - 01);

    if inc.usage_date < min_date || inc.usage_date >= max_date {
        return Err(PipelineError::Transform(format!(
            "usage_date {} out of allowed range",
            inc.usage_date
        )));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct UsageIncrementValidation;

#[async_trait::async_trait]
impl Transform<UsageIncrement, UsageIncrement> for UsageIncrementValidation {
    async fn apply(&self, input: Envelope<UsageIncrement>) -> Result<Envelope<UsageIncrement>, PipelineError> {
        match validate_usage_increment(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_usage_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn envelope(usage_date: Date, liters: f64) -> Envelope<UsageIncrement> {
        Envelope::new(
            UsageIncrement {
                device_id: "1".to_string(),
                usage_date,
                counter_increase: 1,
                liters,
            },
            SystemTime::now(),
        )
    }

    #[test]
    fn validation_accepts_valid_increment() {
        assert!(validate_usage_increment(envelope(date!(2026 - 02 - 26), 0.25)).is_ok());
    }

    #[test]
    fn validation_rejects_negative_liters() {
        let res = validate_usage_increment(envelope(date!(2026 - 02 - 26), -0.1));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn validation_rejects_out_of_range_date() {
        let res = validate_usage_increment(envelope(date!(1999 - 12 - 31), 1.0));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
        let res = validate_usage_increment(envelope(date!(2100 - 01 - 01), 1.0));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn local_date_honours_offset() {
        // 2026-02-26T23:30:00Z
        let at = UNIX_EPOCH + Duration::from_secs(1_772_148_600);
        assert_eq!(local_date(at, UtcOffset::UTC), date!(2026 - 02 - 26));
        let plus_one = UtcOffset::from_hms(1, 0, 0).unwrap();
        assert_eq!(local_date(at, plus_one), date!(2026 - 02 - 27));
    }

    #[tokio::test]
    async fn decoder_uses_receipt_day_for_undated_payloads() {
        let decoder = PayloadDecoder::new(
            PayloadDefaults {
                device_id: "1".to_string(),
                liters: 0.16,
            },
            UtcOffset::UTC,
        );
        let received_at = UNIX_EPOCH + Duration::from_secs(1_772_148_600);
        let env = Envelope::new(
            RawMessage {
                topic: "water/usage".to_string(),
                payload: b"0.5".to_vec(),
            },
            received_at,
        );

        let out = decoder.apply(env).await.expect("decoded");
        assert_eq!(out.payload.usage_date, date!(2026 - 02 - 26));
        assert_eq!(out.payload.liters, 0.5);
        assert_eq!(out.received_at, received_at);
    }

    #[tokio::test]
    async fn decoder_surfaces_payload_errors() {
        let decoder = PayloadDecoder::new(
            PayloadDefaults {
                device_id: "1".to_string(),
                liters: 0.16,
            },
            UtcOffset::UTC,
        );
        let env = Envelope::new(
            RawMessage {
                topic: "water/usage".to_string(),
                payload: b"[1]".to_vec(),
            },
            SystemTime::now(),
        );

        let res = decoder.apply(env).await;
        assert!(matches!(res, Err(PipelineError::Decode(PayloadError::UnsupportedType("array")))));
    }
}
