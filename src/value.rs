//! Native value representation (C1) and text-protocol decoding.
//!
//! Every field the server sends back in a result row is, in the text
//! protocol, just a length-encoded byte string (or the NULL marker). This
//! module turns those bytes into a typed [`Value`] once the column's
//! declared `type_code` (and charset, for the binary/text string split) is
//! known, and the reverse: rendering a [`Value`] back into a SQL literal for
//! client-side parameter substitution.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use rust_decimal::Decimal;

use crate::constant::ColumnType;
use crate::error::{Error, Result};
use crate::protocol::column::ColumnDefinition;

/// A decoded field. `Float`/`Double` are kept distinct (rather than folded
/// into one) so that `SELECT` on a `FLOAT` column reproduces MySQL's lossy
/// 32-bit rounding rather than silently upgrading to `f64` precision.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// MySQL `TIME`: a signed duration, not a time-of-day — it can exceed 24h.
    Duration(TimeDelta),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A caller-supplied decoder for one server type code, overriding the
/// built-in decode in [`decode_field`]. Boxed as `Arc` so a single table can
/// be cheaply shared across every connection a pool opens.
pub type DecoderFn = Arc<dyn Fn(&ColumnDefinition, &[u8]) -> Result<Value> + Send + Sync>;

/// Type-code → decoder override map (`Opts::conv`). Columns whose type isn't
/// present here fall back to [`decode_field`]'s built-in table.
pub type ConvTable = HashMap<ColumnType, DecoderFn>;

/// Decode one field of a text-protocol row. `raw` is `None` for SQL NULL
/// (the `0xFB` marker already stripped out by [`crate::protocol::row`]).
pub fn decode_field(column: &ColumnDefinition, raw: Option<&[u8]>, conv: Option<&ConvTable>) -> Result<Value> {
    let Some(bytes) = raw else {
        return Ok(Value::Null);
    };

    if let Some(decoder) = conv.and_then(|c| c.get(&column.column_type)) {
        return decoder(column, bytes);
    }

    default_decode(column, bytes)
}

fn ascii(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::Data(format!("non-utf8 field: {e}")))
}

fn default_decode(column: &ColumnDefinition, bytes: &[u8]) -> Result<Value> {
    use ColumnType::*;

    match column.column_type {
        MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT | MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG
        | MYSQL_TYPE_LONGLONG | MYSQL_TYPE_YEAR => {
            let s = ascii(bytes)?;
            if column.is_unsigned() {
                s.parse::<u64>()
                    .map(Value::UInt)
                    .map_err(|e| Error::Data(format!("invalid unsigned integer '{s}': {e}")))
            } else {
                s.parse::<i64>()
                    .map(Value::Int)
                    .map_err(|e| Error::Data(format!("invalid integer '{s}': {e}")))
            }
        }

        MYSQL_TYPE_FLOAT => ascii(bytes)?
            .parse::<f32>()
            .map(Value::Float)
            .map_err(|e| Error::Data(format!("invalid float '{}': {e}", ascii(bytes)?))),

        MYSQL_TYPE_DOUBLE => ascii(bytes)?
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|e| Error::Data(format!("invalid double '{}': {e}", ascii(bytes)?))),

        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => {
            let s = ascii(bytes)?;
            Decimal::from_str_exact(s)
                .or_else(|_| Decimal::from_str_exact(s.trim_start_matches('+')))
                .map(Value::Decimal)
                .map_err(|e| Error::Data(format!("invalid decimal '{s}': {e}")))
        }

        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => {
            let s = ascii(bytes)?;
            parse_date(s).map(Value::Date)
        }

        MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2 | MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_TIMESTAMP2 => {
            let s = ascii(bytes)?;
            parse_datetime(s).map(Value::DateTime)
        }

        MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => {
            let s = ascii(bytes)?;
            parse_time(s).map(Value::Duration)
        }

        MYSQL_TYPE_JSON => serde_json::from_slice(bytes)
            .map(Value::Json)
            .map_err(|e| Error::Data(format!("invalid JSON: {e}"))),

        MYSQL_TYPE_VARCHAR
        | MYSQL_TYPE_VAR_STRING
        | MYSQL_TYPE_STRING
        | MYSQL_TYPE_ENUM
        | MYSQL_TYPE_SET => {
            if column.is_binary() {
                Ok(Value::Bytes(bytes.to_vec()))
            } else {
                Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
            }
        }

        MYSQL_TYPE_BLOB
        | MYSQL_TYPE_TINY_BLOB
        | MYSQL_TYPE_MEDIUM_BLOB
        | MYSQL_TYPE_LONG_BLOB
        | MYSQL_TYPE_GEOMETRY
        | MYSQL_TYPE_BIT
        | MYSQL_TYPE_TYPED_ARRAY => Ok(Value::Bytes(bytes.to_vec())),

        MYSQL_TYPE_NULL => Ok(Value::Null),
    }
}

/// `YYYY-MM-DD`. The all-zero date (`0000-00-00`, which MySQL allows unless
/// `NO_ZERO_DATE` is set) has no `NaiveDate` representation; it decodes to
/// the earliest representable date instead of failing the whole row.
fn parse_date(s: &str) -> Result<NaiveDate> {
    if s == "0000-00-00" {
        return NaiveDate::from_ymd_opt(1, 1, 1).ok_or_else(|| Error::Data("zero date".into()));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::Data(format!("invalid date '{s}': {e}")))
}

/// `YYYY-MM-DD HH:MM:SS` optionally followed by `.ffffff`.
fn parse_datetime(s: &str) -> Result<NaiveDateTime> {
    if s.starts_with("0000-00-00") {
        return Ok(parse_date("0000-00-00")?.and_hms_opt(0, 0, 0).unwrap());
    }
    let fmt = if s.contains('.') {
        "%Y-%m-%d %H:%M:%S%.f"
    } else {
        "%Y-%m-%d %H:%M:%S"
    };
    NaiveDateTime::parse_from_str(s, fmt).map_err(|e| Error::Data(format!("invalid datetime '{s}': {e}")))
}

/// `[-][HHH:]MM:SS[.ffffff]`. MySQL `TIME` is a signed duration that can
/// exceed 24 hours (`-838:59:59` .. `838:59:59`), so it is modeled as a
/// [`TimeDelta`] rather than a time-of-day.
fn parse_time(s: &str) -> Result<TimeDelta> {
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let (whole, micros) = match rest.split_once('.') {
        Some((whole, frac)) => {
            let frac_padded = format!("{frac:0<6}");
            let micros: i64 = frac_padded[..6]
                .parse()
                .map_err(|_| Error::Data(format!("invalid time '{s}'")))?;
            (whole, micros)
        }
        None => (rest, 0),
    };

    let parts: Vec<&str> = whole.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (
            h.parse::<i64>().map_err(|_| Error::Data(format!("invalid time '{s}'")))?,
            m.parse::<i64>().map_err(|_| Error::Data(format!("invalid time '{s}'")))?,
            s.parse::<i64>().map_err(|_| Error::Data(format!("invalid time '{s}'")))?,
        ),
        _ => return Err(Error::Data(format!("invalid time '{s}'"))),
    };

    let magnitude = TimeDelta::hours(hours)
        + TimeDelta::minutes(minutes)
        + TimeDelta::seconds(seconds)
        + TimeDelta::microseconds(micros);

    Ok(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::ColumnFlags;

    fn column(column_type: ColumnType, flags: ColumnFlags, charset: u16) -> ColumnDefinition {
        ColumnDefinition {
            catalog: "def".into(),
            schema: String::new(),
            table: String::new(),
            original_table: String::new(),
            name: "col".into(),
            original_name: "col".into(),
            charset,
            column_length: 0,
            column_type,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn decodes_signed_and_unsigned_integers() {
        let signed = column(ColumnType::MYSQL_TYPE_LONG, ColumnFlags::empty(), 45);
        assert_eq!(decode_field(&signed, Some(b"-42"), None).unwrap(), Value::Int(-42));

        let unsigned = column(ColumnType::MYSQL_TYPE_LONG, ColumnFlags::UNSIGNED_FLAG, 45);
        assert_eq!(decode_field(&unsigned, Some(b"42"), None).unwrap(), Value::UInt(42));
    }

    #[test]
    fn decodes_null() {
        let col = column(ColumnType::MYSQL_TYPE_LONG, ColumnFlags::empty(), 45);
        assert_eq!(decode_field(&col, None, None).unwrap(), Value::Null);
    }

    #[test]
    fn decodes_binary_column_as_bytes() {
        let col = column(
            ColumnType::MYSQL_TYPE_VAR_STRING,
            ColumnFlags::empty(),
            crate::charset::COLLATION_BINARY,
        );
        match decode_field(&col, Some(&[0xDE, 0xAD]), None).unwrap() {
            Value::Bytes(b) => assert_eq!(b, vec![0xDE, 0xAD]),
            other => panic!("expected Bytes, got {other:?}"),
        }
    }

    #[test]
    fn decodes_date_and_datetime() {
        let col = column(ColumnType::MYSQL_TYPE_DATE, ColumnFlags::empty(), 45);
        assert_eq!(
            decode_field(&col, Some(b"2024-12-25"), None).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 12, 25).unwrap())
        );

        let col = column(ColumnType::MYSQL_TYPE_DATETIME, ColumnFlags::empty(), 45);
        let value = decode_field(&col, Some(b"2024-12-25 15:30:45"), None).unwrap();
        assert_eq!(
            value,
            Value::DateTime(
                NaiveDate::from_ymd_opt(2024, 12, 25)
                    .unwrap()
                    .and_hms_opt(15, 30, 45)
                    .unwrap()
            )
        );
    }

    #[test]
    fn decodes_negative_time_beyond_24_hours() {
        let col = column(ColumnType::MYSQL_TYPE_TIME, ColumnFlags::empty(), 45);
        let value = decode_field(&col, Some(b"-838:59:59"), None).unwrap();
        assert_eq!(value, Value::Duration(-(TimeDelta::hours(838) + TimeDelta::minutes(59) + TimeDelta::seconds(59))));
    }

    #[test]
    fn decodes_json() {
        let col = column(ColumnType::MYSQL_TYPE_JSON, ColumnFlags::empty(), 45);
        let value = decode_field(&col, Some(br#"{"a":1}"#), None).unwrap();
        assert_eq!(value, Value::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn conv_override_takes_priority() {
        let col = column(ColumnType::MYSQL_TYPE_LONG, ColumnFlags::empty(), 45);
        let mut conv: ConvTable = HashMap::new();
        conv.insert(
            ColumnType::MYSQL_TYPE_LONG,
            Arc::new(|_col, _bytes| Ok(Value::String("overridden".into()))),
        );
        assert_eq!(
            decode_field(&col, Some(b"42"), Some(&conv)).unwrap(),
            Value::String("overridden".into())
        );
    }
}
