//! Text-protocol row decoding (`COM_QUERY` result rows).
//!
//! Every field of a text-protocol row is either the NULL marker `0xFB` or a
//! length-encoded string; [`crate::value`] is responsible for parsing that
//! string into a typed [`crate::value::Value`] once the column's declared
//! type is known.

use crate::error::Result;
use crate::protocol::primitive::{read_int_lenenc, read_string_fix};

const NULL_MARKER: u8 = 0xFB;

/// One row's raw fields: `None` for SQL NULL, `Some(bytes)` otherwise.
pub fn parse_text_row(payload: &[u8], column_count: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let mut data = payload;
    let mut fields = Vec::with_capacity(column_count);

    for _ in 0..column_count {
        if data.first() == Some(&NULL_MARKER) {
            fields.push(None);
            data = &data[1..];
            continue;
        }

        let (len, rest) = read_int_lenenc(data)?;
        let (field, rest) = read_string_fix(rest, len as usize)?;
        fields.push(Some(field.to_vec()));
        data = rest;
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::primitive::write_bytes_lenenc;

    #[test]
    fn parses_mixed_null_and_value_fields() {
        let mut payload = Vec::new();
        write_bytes_lenenc(&mut payload, b"42");
        payload.push(NULL_MARKER);
        write_bytes_lenenc(&mut payload, b"hello");

        let fields = parse_text_row(&payload, 3).unwrap();
        assert_eq!(fields[0], Some(b"42".to_vec()));
        assert_eq!(fields[1], None);
        assert_eq!(fields[2], Some(b"hello".to_vec()));
    }
}
