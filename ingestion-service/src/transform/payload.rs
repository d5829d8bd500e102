//! Decoding of sensor payloads into [`UsageIncrement`]s.
//!
//! The firmware sends one of:
//! - nothing at all (one activation, default volume),
//! - a JSON object such as
//!   `{"device_id":"x","liters":0.25,"counter_increase":1,"ts":"2026-02-26T12:34:56"}`,
//! - a bare number, either as JSON or as plain text (`0.25`), taken as liters.

use serde_json::{Map, Number, Value};
use time::{format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime, Time, UtcOffset};
use water_client::domain::UsageIncrement;

/// Substituted for fields a payload leaves out.
#[derive(Debug, Clone)]
pub struct PayloadDefaults {
    pub device_id: String,
    pub liters: f64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("unparseable payload: {0:?}")]
    Unparseable(String),
    #[error("unsupported JSON payload type: {0}")]
    UnsupportedType(&'static str),
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> PayloadError {
    PayloadError::InvalidField {
        field,
        reason: reason.into(),
    }
}

/// Decode `raw` into exactly one increment. `today` is used unless the payload
/// carries a parseable timestamp.
pub fn parse_payload(raw: &[u8], defaults: &PayloadDefaults, today: Date) -> Result<UsageIncrement, PayloadError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();

    let mut increment = UsageIncrement {
        device_id: defaults.device_id.clone(),
        usage_date: today,
        counter_increase: 1,
        liters: defaults.liters,
    };

    if text.is_empty() {
        return Ok(increment);
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            // Not JSON; the only other accepted form is a plain decimal volume.
            let liters: f64 = text
                .parse()
                .map_err(|_| PayloadError::Unparseable(text.to_string()))?;
            increment.liters = checked_liters("liters", liters)?;
            return Ok(increment);
        }
    };

    match value {
        Value::Number(n) => {
            increment.liters = liters_from_number("liters", &n)?;
            Ok(increment)
        }
        Value::Object(fields) => {
            apply_fields(&mut increment, &fields)?;
            Ok(increment)
        }
        other => Err(PayloadError::UnsupportedType(json_type_name(&other))),
    }
}

fn apply_fields(increment: &mut UsageIncrement, fields: &Map<String, Value>) -> Result<(), PayloadError> {
    match fields.get("device_id") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => increment.device_id = s.clone(),
        Some(Value::Number(n)) => increment.device_id = n.to_string(),
        Some(other) => {
            return Err(invalid(
                "device_id",
                format!("expected string or number, got {}", json_type_name(other)),
            ))
        }
    }

    if let Some((field, value)) = first_present(fields, &["counter_increase", "inc"]) {
        increment.counter_increase = counter_from_value(field, value)?;
    }

    if let Some((field, value)) = first_present(fields, &["liters", "liter_count"]) {
        increment.liters = liters_from_value(field, value)?;
    }

    // `ts` wins over `timestamp` unless it is empty-ish; a bad timestamp is not fatal.
    let ts = ["ts", "timestamp"]
        .iter()
        .filter_map(|k| fields.get(*k))
        .find(|v| is_truthy(v));
    if let Some(Value::String(s)) = ts {
        if let Some(date) = parse_timestamp_date(s) {
            increment.usage_date = date;
        }
    }

    Ok(())
}

fn first_present<'a>(fields: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter().find_map(|k| fields.get(*k).map(|v| (*k, v)))
}

fn counter_from_value(field: &'static str, value: &Value) -> Result<u32, PayloadError> {
    let n: i128 = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i128::from(i)
            } else if let Some(u) = n.as_u64() {
                i128::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if !f.is_finite() {
                    return Err(invalid(field, "not a finite number"));
                }
                // Fractional counts truncate toward zero.
                f.trunc() as i128
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(i128::from)
            .map_err(|_| invalid(field, format!("not an integer: {s:?}")))?,
        other => {
            return Err(invalid(
                field,
                format!("expected integer, got {}", json_type_name(other)),
            ))
        }
    };

    if n < 0 {
        return Err(invalid(field, "must not be negative"));
    }
    u32::try_from(n).map_err(|_| invalid(field, "out of range"))
}

fn liters_from_value(field: &'static str, value: &Value) -> Result<f64, PayloadError> {
    match value {
        Value::Number(n) => liters_from_number(field, n),
        Value::String(s) => {
            let liters: f64 = s
                .trim()
                .parse()
                .map_err(|_| invalid(field, format!("not a number: {s:?}")))?;
            checked_liters(field, liters)
        }
        other => Err(invalid(
            field,
            format!("expected number, got {}", json_type_name(other)),
        )),
    }
}

fn liters_from_number(field: &'static str, n: &Number) -> Result<f64, PayloadError> {
    let liters = n.as_f64().ok_or_else(|| invalid(field, "not representable as f64"))?;
    checked_liters(field, liters)
}

fn checked_liters(field: &'static str, liters: f64) -> Result<f64, PayloadError> {
    if !liters.is_finite() {
        return Err(invalid(field, "not a finite number"));
    }
    if liters < 0.0 {
        return Err(invalid(field, "must not be negative"));
    }
    Ok(liters)
}

/// Calendar date of an ISO-8601 timestamp, as written (no zone conversion).
///
/// Accepts RFC 3339 (`2026-02-26T12:34:56Z`, `...+02:00`), a date and time
/// separated by `T` or a space with optional seconds, fraction and zone
/// (`Z`, `+02:00`, `+0200`, `+02`), and a bare `2026-02-26`.
pub fn parse_timestamp_date(s: &str) -> Option<Date> {
    let s = s.trim();

    if let Ok(t) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(t.date());
    }

    if !s.is_char_boundary(10) {
        return None;
    }
    let (date_part, rest) = s.split_at(10);
    let date = Date::parse(date_part, format_description!("[year]-[month]-[day]")).ok()?;
    if rest.is_empty() {
        return Some(date);
    }

    let time_part = rest.strip_prefix(['T', 't', ' '])?;
    let (clock, zone) = match time_part.find(['+', '-']) {
        Some(idx) => time_part.split_at(idx),
        None => match time_part.strip_suffix(['Z', 'z']) {
            Some(clock) => (clock, ""),
            None => (time_part, ""),
        },
    };

    let clock_format = format_description!(
        "[hour]:[minute][optional [:[second][optional [.[subsecond]]]]]"
    );
    Time::parse(clock, clock_format).ok()?;
    if !zone.is_empty() && !is_utc_offset(zone) {
        return None;
    }
    Some(date)
}

fn is_utc_offset(s: &str) -> bool {
    let colon = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    let compact = format_description!("[offset_hour sign:mandatory][offset_minute]");
    let hours = format_description!("[offset_hour sign:mandatory]");
    UtcOffset::parse(s, colon).is_ok() || UtcOffset::parse(s, compact).is_ok() || UtcOffset::parse(s, hours).is_ok()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    const TODAY: Date = date!(2026 - 10 - 18);

    fn defaults() -> PayloadDefaults {
        PayloadDefaults {
            device_id: "1".to_string(),
            liters: 0.16,
        }
    }

    fn parse(raw: &str) -> Result<UsageIncrement, PayloadError> {
        parse_payload(raw.as_bytes(), &defaults(), TODAY)
    }

    fn defaulted(liters: f64) -> UsageIncrement {
        UsageIncrement {
            device_id: "1".to_string(),
            usage_date: TODAY,
            counter_increase: 1,
            liters,
        }
    }

    #[test]
    fn empty_payload_is_one_default_activation() {
        assert_eq!(parse("").unwrap(), defaulted(0.16));
        assert_eq!(parse("  \n").unwrap(), defaulted(0.16));
    }

    #[test]
    fn bare_numbers_are_liters() {
        assert_eq!(parse("0.5").unwrap(), defaulted(0.5));
        assert_eq!(parse("3").unwrap(), defaulted(3.0));
        // Not valid JSON, still a plain decimal.
        assert_eq!(parse(".25").unwrap(), defaulted(0.25));
        assert_eq!(parse(" 2. ").unwrap(), defaulted(2.0));
    }

    #[test]
    fn full_structured_payload_is_taken_verbatim() {
        let inc = parse(r#"{"device_id":"x","liters":0.25,"counter_increase":1,"ts":"2026-02-26T12:34:56"}"#).unwrap();
        assert_eq!(
            inc,
            UsageIncrement {
                device_id: "x".to_string(),
                usage_date: date!(2026 - 02 - 26),
                counter_increase: 1,
                liters: 0.25,
            }
        );
    }

    #[test]
    fn structured_payload_defaults_missing_fields() {
        assert_eq!(parse("{}").unwrap(), defaulted(0.16));

        let inc = parse(r#"{"counter_increase":4}"#).unwrap();
        assert_eq!(inc.counter_increase, 4);
        assert_eq!(inc.liters, 0.16);
        assert_eq!(inc.device_id, "1");
        assert_eq!(inc.usage_date, TODAY);
    }

    #[test]
    fn alternate_field_names_are_accepted() {
        let inc = parse(r#"{"inc":2,"liter_count":1.5,"timestamp":"2026-01-02T00:00:00Z"}"#).unwrap();
        assert_eq!(inc.counter_increase, 2);
        assert_eq!(inc.liters, 1.5);
        assert_eq!(inc.usage_date, date!(2026 - 01 - 02));
    }

    #[test]
    fn primary_field_names_win_over_alternates() {
        let inc = parse(r#"{"counter_increase":3,"inc":9,"liters":0.1,"liter_count":9.0}"#).unwrap();
        assert_eq!(inc.counter_increase, 3);
        assert_eq!(inc.liters, 0.1);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let inc = parse(r#"{"liters":1,"rssi":-70,"fw":"1.2.0"}"#).unwrap();
        assert_eq!(inc, defaulted(1.0));
    }

    #[test]
    fn numeric_device_id_is_stringified() {
        assert_eq!(parse(r#"{"device_id":7}"#).unwrap().device_id, "7");
        assert_eq!(parse(r#"{"device_id":null}"#).unwrap().device_id, "1");
    }

    #[test]
    fn numeric_strings_and_fractional_counts_are_coerced() {
        let inc = parse(r#"{"counter_increase":"5","liters":"0.75"}"#).unwrap();
        assert_eq!(inc.counter_increase, 5);
        assert_eq!(inc.liters, 0.75);

        assert_eq!(parse(r#"{"inc":2.9}"#).unwrap().counter_increase, 2);
    }

    #[test]
    fn bad_timestamp_falls_back_to_today() {
        let inc = parse(r#"{"ts":"not-a-date","liters":1}"#).unwrap();
        assert_eq!(inc.usage_date, TODAY);
        assert_eq!(inc.liters, 1.0);

        assert_eq!(parse(r#"{"ts":1700000000}"#).unwrap().usage_date, TODAY);
    }

    #[test]
    fn empty_ts_defers_to_timestamp() {
        let inc = parse(r#"{"ts":"","timestamp":"2026-03-01"}"#).unwrap();
        assert_eq!(inc.usage_date, date!(2026 - 03 - 01));
    }

    #[test]
    fn timestamp_date_is_taken_as_written() {
        assert_eq!(parse_timestamp_date("2026-02-26T23:30:00-05:00"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26T12:34Z"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26T12:34"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26T12:34:56.250"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26 12:34:56"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26t12:34"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26T12:34:56+0000"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26 23:30:00-0500"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26T12:34:56+02"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-26"), Some(date!(2026 - 02 - 26)));
        assert_eq!(parse_timestamp_date("2026-02-30"), None);
        assert_eq!(parse_timestamp_date("2026-02-26X12:34"), None);
        assert_eq!(parse_timestamp_date("2026-02-26T25:00"), None);
        assert_eq!(parse_timestamp_date("2026-02-26T12:34+99"), None);
    }

    #[test]
    fn strftime_style_timestamp_keeps_its_date() {
        let inc = parse(r#"{"ts":"2026-02-26 12:34:56","liters":1}"#).expect("parsed");
        assert_eq!(inc.usage_date, date!(2026 - 02 - 26));
        let inc = parse(r#"{"timestamp":"2026-02-26T12:34:56+0000","liters":1}"#).expect("parsed");
        assert_eq!(inc.usage_date, date!(2026 - 02 - 26));
    }

    #[test]
    fn unsupported_json_shapes_are_rejected() {
        assert_eq!(parse("[1,2]"), Err(PayloadError::UnsupportedType("array")));
        assert_eq!(parse(r#""0.5""#), Err(PayloadError::UnsupportedType("string")));
        assert_eq!(parse("true"), Err(PayloadError::UnsupportedType("boolean")));
        assert_eq!(parse("null"), Err(PayloadError::UnsupportedType("null")));
    }

    #[test]
    fn garbage_is_rejected() {
        for raw in ["hello", "{liters: 1}", "0.5 liters", "NaN", "inf"] {
            assert!(parse(raw).is_err(), "expected {raw:?} to be rejected");
        }
        assert!(matches!(parse("hello"), Err(PayloadError::Unparseable(_))));
        assert!(parse_payload(&[0xff, 0xfe], &defaults(), TODAY).is_err());
    }

    #[test]
    fn negative_or_malformed_fields_are_rejected() {
        assert!(matches!(
            parse("-1"),
            Err(PayloadError::InvalidField { field: "liters", .. })
        ));
        assert!(matches!(
            parse(r#"{"counter_increase":-2}"#),
            Err(PayloadError::InvalidField { field: "counter_increase", .. })
        ));
        assert!(matches!(
            parse(r#"{"inc":null}"#),
            Err(PayloadError::InvalidField { field: "inc", .. })
        ));
        assert!(matches!(
            parse(r#"{"liter_count":"lots"}"#),
            Err(PayloadError::InvalidField { field: "liter_count", .. })
        ));
        assert!(matches!(
            parse(r#"{"device_id":["a"]}"#),
            Err(PayloadError::InvalidField { field: "device_id", .. })
        ));
    }
}
