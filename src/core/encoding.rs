use std::borrow::Cow;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::core::{LinkError, LinkResult, Value, ValueType, errors::DecodeError};

/// Characters that may not appear verbatim in a path component.
/// `:` separates components, `%` starts an escape.
const PATH_UNSAFE: &AsciiSet = &CONTROLS.add(b'%').add(b' ').add(b':');

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Percent-encodes a name so it can be embedded into a colon-delimited physical path.
pub fn escape_name(name: &str) -> Cow<'_, str> {
    utf8_percent_encode(name, PATH_UNSAFE).into()
}

/// Reverses [`escape_name`].
pub fn unescape_name(name: &str) -> Result<Cow<'_, str>, DecodeError> {
    Ok(percent_decode_str(name).decode_utf8()?)
}

/// Returns the `(type-tag, encoded-value)` pair used for secondary-index membership.
///
/// A missing value maps to `("null", "null")`, which can never collide with a string
/// value `"null"`, as that is tagged `"string"`.
pub fn index_keys(value_type: ValueType, value: Option<&Value>) -> LinkResult<(&'static str, String)> {
    let Some(value) = value else {
        return Ok(("null", "null".to_owned()));
    };
    if value_type.is_collection() {
        return Err(LinkError::unsupported(format!(
            "cannot index values of type {}",
            value_type
        )));
    }
    if value.value_type() != value_type {
        return Err(LinkError::shape_mismatch(value_type, value.value_type()));
    }

    let tag: &'static str = value_type.into();
    let encoded = match value {
        Value::String(s) => escape_name(s).into_owned(),
        // whole seconds only: index buckets do not distinguish sub-second differences
        Value::Timestamp(t) => t.timestamp().to_string(),
        Value::Boolean(b) => b.to_string(),
        other => escape_name(&other.encode_scalar()?).into_owned(),
    };
    Ok((tag, encoded))
}

/// Encodes a timestamp as exact decimal epoch seconds, e.g. `1700000000.5` or `-0.25`.
pub(crate) fn encode_timestamp(t: &DateTime<Utc>) -> String {
    let total = t.timestamp() as i128 * NANOS_PER_SEC + t.timestamp_subsec_nanos() as i128;
    let sign = if total < 0 { "-" } else { "" };
    let abs = total.unsigned_abs();
    let secs = abs / NANOS_PER_SEC as u128;
    let nanos = abs % NANOS_PER_SEC as u128;
    if nanos == 0 {
        return format!("{sign}{secs}");
    }
    let fraction = format!("{nanos:09}");
    format!("{sign}{secs}.{}", fraction.trim_end_matches('0'))
}

/// Decodes decimal epoch seconds. Digits beyond nanosecond precision are truncated.
pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    let invalid = || DecodeError::InvalidTimestamp(raw.to_owned());

    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let secs: i128 = int_part.parse().map_err(|_| invalid())?;
    let mut nanos: i128 = 0;
    for (pos, b) in frac_part.bytes().take(9).enumerate() {
        nanos += (b - b'0') as i128 * 10i128.pow(8 - pos as u32);
    }

    let mut total = secs * NANOS_PER_SEC + nanos;
    if negative {
        total = -total;
    }
    let secs = i64::try_from(total.div_euclid(NANOS_PER_SEC)).map_err(|_| invalid())?;
    let nanos = total.rem_euclid(NANOS_PER_SEC) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_escape_unescape_names() {
        let names = [
            "",
            "plain",
            "with space",
            "with:colon",
            "100%",
            "%3A",
            "%%20: :%",
            "ünïcödé : names",
        ];
        for name in names {
            let escaped = escape_name(name);
            assert!(!escaped.contains(':'), "escaped name must not contain ':'");
            assert!(!escaped.contains(' '), "escaped name must not contain ' '");
            assert_eq!(unescape_name(&escaped).unwrap(), name);
        }
    }

    #[test]
    fn test_escape_leaves_safe_names_untouched() {
        assert!(matches!(escape_name("players_ids"), Cow::Borrowed("players_ids")));
        assert_eq!(escape_name("a b:c%d"), "a%20b%3Ac%25d");
    }

    #[test]
    fn test_unescape_rejects_invalid_utf8() {
        assert!(unescape_name("%FF%FE").is_err());
    }

    #[test]
    fn test_index_keys() {
        assert_eq!(
            index_keys(ValueType::String, None).unwrap(),
            ("null", "null".to_owned())
        );
        assert_eq!(
            index_keys(ValueType::String, Some(&Value::from("null"))).unwrap(),
            ("string", "null".to_owned())
        );
        assert_eq!(
            index_keys(ValueType::String, Some(&Value::from("a b"))).unwrap(),
            ("string", "a%20b".to_owned())
        );
        assert_eq!(
            index_keys(ValueType::Integer, Some(&Value::Integer(-42))).unwrap(),
            ("integer", "-42".to_owned())
        );
        assert_eq!(
            index_keys(ValueType::Float, Some(&Value::Float(1.5))).unwrap(),
            ("float", "1.5".to_owned())
        );
        assert_eq!(
            index_keys(
                ValueType::Timestamp,
                Some(&Value::Timestamp(Utc.timestamp_opt(1_000, 999).unwrap()))
            )
            .unwrap(),
            ("timestamp", "1000".to_owned())
        );
        assert_eq!(
            index_keys(ValueType::Boolean, Some(&Value::Boolean(false))).unwrap(),
            ("boolean", "false".to_owned())
        );
    }

    #[test]
    fn test_index_keys_rejects_mismatches() {
        assert!(matches!(
            index_keys(ValueType::Integer, Some(&Value::from("1"))),
            Err(LinkError::Validation(_))
        ));
        assert!(matches!(
            index_keys(ValueType::Set, Some(&Value::from("1"))),
            Err(LinkError::Unsupported(_))
        ));
    }

    #[test]
    fn test_timestamp_text_form() {
        assert_eq!(encode_timestamp(&DateTime::UNIX_EPOCH), "0");
        assert_eq!(
            encode_timestamp(&Utc.timestamp_opt(12, 500_000_000).unwrap()),
            "12.5"
        );
        // -0.25s is stored as -1s + 750ms internally
        assert_eq!(
            encode_timestamp(&Utc.timestamp_opt(-1, 750_000_000).unwrap()),
            "-0.25"
        );
        assert_eq!(
            decode_timestamp("1700000000.123").unwrap(),
            Utc.timestamp_opt(1_700_000_000, 123_000_000).unwrap()
        );
        assert!(decode_timestamp("").is_err());
        assert!(decode_timestamp("-").is_err());
        assert!(decode_timestamp("1e3").is_err());
    }
}
