//! Parameter substitution and SQL-literal escaping (client-side — this
//! driver has no prepared-statement/binary protocol, so every `%s`
//! placeholder is rendered into the query text before it is sent).

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::value::Value;

/// One bound parameter. `Null` renders as the `NULL` keyword; everything
/// else renders as a MySQL literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Param::Null,
            Value::Int(v) => Param::Int(v),
            Value::UInt(v) => Param::UInt(v),
            Value::Float(v) => Param::Float(v as f64),
            Value::Double(v) => Param::Float(v),
            Value::Decimal(v) => Param::String(v.to_string()),
            Value::String(v) => Param::String(v),
            Value::Bytes(v) => Param::Bytes(v),
            Value::Date(v) => Param::String(v.format("%Y-%m-%d").to_string()),
            Value::DateTime(v) => Param::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Value::Duration(v) => Param::String(format_duration(v)),
            Value::Json(v) => Param::String(v.to_string()),
        }
    }
}

fn format_duration(d: chrono::TimeDelta) -> String {
    let negative = d < chrono::TimeDelta::zero();
    let d = if negative { -d } else { d };
    let total_secs = d.num_seconds();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let micros = d.subsec_nanos() / 1000;
    if micros == 0 {
        format!("{}{:02}:{:02}:{:02}", if negative { "-" } else { "" }, hours, minutes, seconds)
    } else {
        format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if negative { "-" } else { "" },
            hours,
            minutes,
            seconds,
            micros
        )
    }
}

macro_rules! impl_from_int {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Self { Param::$variant(v as _) }
        })*
    };
}
impl_from_int!(i8 => Int, i16 => Int, i32 => Int, i64 => Int, isize => Int);
impl_from_int!(u8 => UInt, u16 => UInt, u32 => UInt, u64 => UInt, usize => UInt);
impl_from_int!(f32 => Float, f64 => Float);

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::String(v.to_string())
    }
}
impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::String(v)
    }
}
impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Bytes(v)
    }
}
impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map_or(Param::Null, Into::into)
    }
}

/// The bound-parameter set for one `execute` call: positional (`%s`) or
/// named (`%(key)s`).
#[derive(Debug, Clone)]
pub enum Params {
    Positional(Vec<Param>),
    Named(HashMap<String, Param>),
}

impl Params {
    pub fn positional_len(&self) -> Option<usize> {
        match self {
            Params::Positional(v) => Some(v.len()),
            Params::Named(_) => None,
        }
    }
}

impl From<Vec<Param>> for Params {
    fn from(v: Vec<Param>) -> Self {
        Params::Positional(v)
    }
}
impl From<HashMap<String, Param>> for Params {
    fn from(v: HashMap<String, Param>) -> Self {
        Params::Named(v)
    }
}

fn escape_string_literal(out: &mut String, s: &str, no_backslash_escapes: bool) {
    out.push('\'');
    for c in s.chars() {
        if no_backslash_escapes {
            match c {
                '\'' => out.push_str("''"),
                other => out.push(other),
            }
        } else {
            match c {
                '\0' => out.push_str("\\0"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\\' => out.push_str("\\\\"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                '\x1a' => out.push_str("\\Z"),
                other => out.push(other),
            }
        }
    }
    out.push('\'');
}

fn escape_bytes_literal(out: &mut String, bytes: &[u8]) {
    out.push_str("_binary'");
    for &b in bytes {
        match b {
            0 => out.push_str("\\0"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'"' => out.push_str("\\\""),
            0x1a => out.push_str("\\Z"),
            b if b.is_ascii() && !b.is_ascii_control() => out.push(b as char),
            b => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push('\'');
}

/// Render one parameter as a SQL literal.
pub fn render_param(out: &mut String, param: &Param, no_backslash_escapes: bool) {
    match param {
        Param::Null => out.push_str("NULL"),
        Param::Int(v) => {
            let _ = write!(out, "{v}");
        }
        Param::UInt(v) => {
            let _ = write!(out, "{v}");
        }
        Param::Float(v) => {
            let _ = write!(out, "{v}");
        }
        Param::String(s) => escape_string_literal(out, s, no_backslash_escapes),
        Param::Bytes(b) => escape_bytes_literal(out, b),
    }
}

/// Substitute every `%s` / `%(name)s` placeholder in `template` with its
/// escaped, rendered [`Param`]. `%%` is a literal percent sign.
pub fn render(template: &str, params: &Params, no_backslash_escapes: bool) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let bytes = template.as_bytes();
    let mut i = 0;
    let mut positional_index = 0;
    let positional_count = params.positional_len();

    // `%` (0x25) is pure ASCII and cannot appear as part of a multi-byte
    // UTF-8 sequence (continuation bytes are >= 0x80), so scanning for it
    // byte-by-byte is safe. Runs of non-placeholder bytes are copied verbatim
    // via `push_str` on a validated `&str` slice instead of casting
    // individual bytes to `char`, which would otherwise mangle any
    // multi-byte character in the template.
    while i < bytes.len() {
        if bytes[i] != b'%' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'%' {
                i += 1;
            }
            out.push_str(std::str::from_utf8(&bytes[start..i]).expect("slice boundaries fall on ASCII '%' bytes only"));
            continue;
        }

        match bytes.get(i + 1) {
            Some(b'%') => {
                out.push('%');
                i += 2;
            }
            Some(b's') => {
                let param = match params {
                    Params::Positional(v) => v.get(positional_index).ok_or_else(|| {
                        Error::Programming(format!(
                            "not enough parameters: placeholder {} has no matching argument",
                            positional_index + 1
                        ))
                    })?,
                    Params::Named(_) => {
                        return Err(Error::Programming(
                            "positional placeholder '%s' used with named parameters".into(),
                        ));
                    }
                };
                render_param(&mut out, param, no_backslash_escapes);
                positional_index += 1;
                i += 2;
            }
            Some(b'(') => {
                let close = bytes[i + 2..]
                    .iter()
                    .position(|&b| b == b')')
                    .ok_or_else(|| Error::Programming("unterminated '%(' placeholder".into()))?;
                let name_start = i + 2;
                let name_end = name_start + close;
                let name = std::str::from_utf8(&bytes[name_start..name_end])
                    .map_err(|_| Error::Programming("non-utf8 placeholder name".into()))?;
                if bytes.get(name_end + 1) != Some(&b's') {
                    return Err(Error::Programming(format!("malformed named placeholder '%({name})'")));
                }
                let param = match params {
                    Params::Named(map) => map
                        .get(name)
                        .ok_or_else(|| Error::Programming(format!("missing named parameter '{name}'")))?,
                    Params::Positional(_) => {
                        return Err(Error::Programming(
                            "named placeholder '%(...)s' used with positional parameters".into(),
                        ));
                    }
                };
                render_param(&mut out, param, no_backslash_escapes);
                i = name_end + 2;
            }
            _ => {
                return Err(Error::Programming(format!(
                    "unsupported placeholder at byte offset {i}; only '%s', '%(name)s' and '%%' are recognized"
                )));
            }
        }
    }

    if let (Params::Positional(_), Some(expected)) = (params, positional_count) {
        if positional_index != expected {
            return Err(Error::Programming(format!(
                "parameter count mismatch: template uses {positional_index} placeholder(s), {expected} argument(s) given"
            )));
        }
    }

    Ok(out)
}

/// Split an `INSERT ... VALUES (...)[, (...)...] [ON DUPLICATE KEY UPDATE ...]`
/// statement into `(prefix_up_to_and_including_VALUES, single_row_template, tail)`,
/// for `executemany`'s batching optimization. Returns `None` if `sql` doesn't
/// match that shape (case-insensitive on `VALUES`).
pub fn split_insert_values(sql: &str) -> Option<(&str, &str, &str)> {
    let upper = sql.to_ascii_uppercase();
    let values_pos = find_values_keyword(&upper)?;
    let after_values = sql[values_pos + "VALUES".len()..].trim_start();
    if !after_values.starts_with('(') {
        return None;
    }
    let row_end = matching_paren(after_values.as_bytes(), 0)?;
    let prefix = &sql[..values_pos + "VALUES".len()];
    let row_template = &after_values[..=row_end];
    let tail = after_values[row_end + 1..].trim_start();
    Some((prefix, row_template, tail))
}

fn find_values_keyword(upper: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(rel) = upper[search_from..].find("VALUES") {
        let pos = search_from + rel;
        let before_ok = pos == 0 || !upper.as_bytes()[pos - 1].is_ascii_alphanumeric();
        let after_idx = pos + "VALUES".len();
        let after_ok = upper.as_bytes().get(after_idx).is_none_or(|b| !b.is_ascii_alphanumeric());
        if before_ok && after_ok {
            return Some(pos);
        }
        search_from = pos + "VALUES".len();
    }
    None
}

fn matching_paren(bytes: &[u8], open: usize) -> Option<usize> {
    debug_assert_eq!(bytes[open], b'(');
    let mut depth = 0i32;
    let mut in_string: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        match in_string {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    in_string = None;
                }
            }
            None => match b {
                b'\'' | b'"' => in_string = Some(b),
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Pack as many rendered `(...)` row tuples as fit under `max_allowed_packet`
/// into successive multi-row `INSERT`s. Each returned string is one complete
/// statement ready to send as `COM_QUERY`.
pub fn batch_insert_statements(prefix: &str, rendered_rows: &[String], tail: &str, max_allowed_packet: usize) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for row in rendered_rows {
        let additional = row.len() + 1; // separating comma or trailing space
        let would_be = prefix.len() + 1 + current.len() + additional + tail.len();
        if !current.is_empty() && would_be > max_allowed_packet {
            statements.push(format!("{prefix} {current}{tail}"));
            current.clear();
        }
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(row);
    }

    if !current.is_empty() {
        statements.push(format!("{prefix} {current}{tail}"));
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_positional_placeholders() {
        let params = Params::Positional(vec![Param::Int(42), Param::String("o'brien".into()), Param::Null]);
        let rendered = render("SELECT %s, %s, %s", &params, false).unwrap();
        assert_eq!(rendered, "SELECT 42, 'o\\'brien', NULL");
    }

    #[test]
    fn no_backslash_escapes_doubles_quotes_instead() {
        let params = Params::Positional(vec![Param::String("o'brien".into())]);
        let rendered = render("SELECT %s", &params, true).unwrap();
        assert_eq!(rendered, "SELECT 'o''brien'");
    }

    #[test]
    fn renders_named_placeholders() {
        let mut map = HashMap::new();
        map.insert("name".to_string(), Param::String("abc".into()));
        let params = Params::Named(map);
        let rendered = render("SELECT %(name)s", &params, false).unwrap();
        assert_eq!(rendered, "SELECT 'abc'");
    }

    #[test]
    fn literal_percent_is_preserved() {
        let params = Params::Positional(vec![]);
        let rendered = render("SELECT '100%%'", &params, false).unwrap();
        assert_eq!(rendered, "SELECT '100%'");
    }

    #[test]
    fn mismatched_placeholder_count_is_programming_error() {
        let params = Params::Positional(vec![Param::Int(1)]);
        let err = render("SELECT %s, %s", &params, false).unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
    }

    #[test]
    fn renders_bytes_as_binary_literal() {
        let params = Params::Positional(vec![Param::Bytes(vec![0xDE, 0xAD])]);
        let rendered = render("SELECT %s", &params, false).unwrap();
        assert_eq!(rendered, "SELECT _binary'\\xde\\xad'");
    }

    #[test]
    fn splits_simple_insert_values() {
        let (prefix, row, tail) = split_insert_values("INSERT INTO t(v) VALUES(%s)").unwrap();
        assert_eq!(prefix, "INSERT INTO t(v) VALUES");
        assert_eq!(row, "(%s)");
        assert_eq!(tail, "");
    }

    #[test]
    fn splits_insert_with_on_duplicate_key_tail() {
        let (prefix, row, tail) =
            split_insert_values("INSERT INTO t(v) VALUES (%s) ON DUPLICATE KEY UPDATE v=%s").unwrap();
        assert_eq!(prefix, "INSERT INTO t(v) VALUES");
        assert_eq!(row, "(%s)");
        assert_eq!(tail, "ON DUPLICATE KEY UPDATE v=%s");
    }

    #[test]
    fn non_insert_statement_does_not_split() {
        assert!(split_insert_values("SELECT * FROM t WHERE v IN (%s)").is_none());
    }

    #[test]
    fn batches_rows_under_packet_limit() {
        let rows = vec!["(1)".to_string(), "(2)".to_string(), "(3)".to_string()];
        let statements = batch_insert_statements("INSERT INTO t VALUES", &rows, "", 30);
        assert!(statements.len() >= 2);
        for stmt in &statements {
            assert!(stmt.len() <= 30 || stmt.matches('(').count() == 1);
        }
    }

    #[test]
    fn single_batch_when_everything_fits() {
        let rows = vec!["(1)".to_string(), "(2)".to_string()];
        let statements = batch_insert_statements("INSERT INTO t VALUES", &rows, "", 1024);
        assert_eq!(statements, vec!["INSERT INTO t VALUES (1),(2)".to_string()]);
    }
}
