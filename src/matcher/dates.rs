use serde_json::Value;
use time::{
    Date, OffsetDateTime, PrimitiveDateTime, UtcOffset,
    format_description::{BorrowedFormatItem, well_known::Rfc3339},
    macros::format_description,
};

const NAIVE_DATETIME_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]/[month]/[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]"),
];

const OFFSET_DATETIME_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond][offset_hour sign:mandatory][offset_minute]"
    ),
    format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]"
    ),
    format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
    ),
];

const DATE_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]"),
    format_description!("[year]/[month]/[day]"),
];

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// Parses a resource timestamp. Naive values are taken as UTC.
pub fn parse_date(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::Number(number) => number.as_f64().and_then(from_epoch),
        Value::String(text) => parse_date_str(text),
        _ => None,
    }
}

pub fn parse_date_str(text: &str) -> Option<OffsetDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(number) = text.parse::<f64>() {
        return from_epoch(number);
    }
    if let Ok(parsed) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(parsed);
    }
    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(parsed) = OffsetDateTime::parse(text, format) {
            return Some(parsed);
        }
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(parsed) = PrimitiveDateTime::parse(text, format) {
            return Some(parsed.assume_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(parsed) = Date::parse(text, format) {
            return Some(parsed.midnight().assume_offset(UtcOffset::UTC));
        }
    }
    None
}

fn from_epoch(epoch: f64) -> Option<OffsetDateTime> {
    if !epoch.is_finite() {
        return None;
    }
    let nanos_per_unit = if epoch.abs() > EPOCH_MILLIS_THRESHOLD {
        1_000_000i128
    } else {
        1_000_000_000i128
    };
    let nanos = if epoch.fract() == 0.0 {
        (epoch as i128).checked_mul(nanos_per_unit)?
    } else {
        (epoch * nanos_per_unit as f64) as i128
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::{parse_date, parse_date_str};

    #[test]
    fn parses_common_cloud_timestamp_shapes() {
        let expected = datetime!(2024-03-04 05:06:07 UTC);
        assert_eq!(parse_date_str("2024-03-04T05:06:07Z"), Some(expected));
        assert_eq!(parse_date_str("2024-03-04T05:06:07.000Z"), Some(expected));
        assert_eq!(parse_date_str("2024-03-04T05:06:07+0000"), Some(expected));
        assert_eq!(parse_date_str("2024-03-04 05:06:07"), Some(expected));
        assert_eq!(
            parse_date_str("2024-03-04T07:06:07+02:00").map(|d| d.unix_timestamp()),
            Some(expected.unix_timestamp())
        );
        assert_eq!(
            parse_date_str("2024/03/04"),
            Some(datetime!(2024-03-04 00:00:00 UTC))
        );
    }

    #[test]
    fn parses_epoch_seconds_and_millis() {
        let expected = datetime!(2024-03-04 05:06:07 UTC);
        assert_eq!(parse_date(&json!(1709528767)), Some(expected));
        assert_eq!(parse_date(&json!(1709528767000u64)), Some(expected));
        assert_eq!(parse_date(&json!(1e300)), None);
        assert_eq!(parse_date_str("-1e300"), None);
        assert_eq!(parse_date(&json!("1709528767")), Some(expected));
    }

    #[test]
    fn rejects_non_dates() {
        assert_eq!(parse_date(&json!("yesterday")), None);
        assert_eq!(parse_date(&json!(null)), None);
        assert_eq!(parse_date(&json!(["2024-03-04"])), None);
    }
}
