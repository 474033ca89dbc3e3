//! Column definition packets.
//!
//! Cursors hold these for the lifetime of a result set (to drive row
//! decoding and to answer `description`-style introspection), so fields are
//! owned rather than borrowed from the packet buffer they were parsed from.

use crate::constant::{ColumnFlags, ColumnType};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
struct ColumnDefinitionTail {
    charset: U16LE,
    column_length: U32LE,
    column_type: u8,
    flags: U16LE,
    decimals: u8,
    reserved: U16LE,
}

/// One column of a result set.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub original_table: String,
    pub name: String,
    pub original_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }

    pub fn is_binary(&self) -> bool {
        self.charset == crate::charset::COLLATION_BINARY
    }
}

/// Parse one `Protocol::ColumnDefinition41` packet.
pub fn parse_column_definition(payload: &[u8]) -> Result<ColumnDefinition> {
    let (catalog, data) = read_string_lenenc(payload)?;
    let (schema, data) = read_string_lenenc(data)?;
    let (table_alias, data) = read_string_lenenc(data)?;
    let (table_original, data) = read_string_lenenc(data)?;
    let (name_alias, data) = read_string_lenenc(data)?;
    let (name_original, data) = read_string_lenenc(data)?;
    let (_length, data) = read_int_lenenc(data)?;

    if data.len() < 12 {
        return Err(Error::Interface("truncated column definition".into()));
    }
    let tail = ColumnDefinitionTail::ref_from_bytes(&data[..12])
        .map_err(|_| Error::Interface("malformed column definition tail".into()))?;

    let column_type = ColumnType::from_u8(tail.column_type)
        .ok_or_else(|| Error::Interface(format!("unknown column type 0x{:02X}", tail.column_type)))?;
    let flags = ColumnFlags::from_bits_truncate(tail.flags.get());

    Ok(ColumnDefinition {
        catalog: String::from_utf8_lossy(catalog).to_string(),
        schema: String::from_utf8_lossy(schema).to_string(),
        table: String::from_utf8_lossy(table_alias).to_string(),
        original_table: String::from_utf8_lossy(table_original).to_string(),
        name: String::from_utf8_lossy(name_alias).to_string(),
        original_name: String::from_utf8_lossy(name_original).to_string(),
        charset: tail.charset.get(),
        column_length: tail.column_length.get(),
        column_type,
        flags,
        decimals: tail.decimals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenenc_str(out: &mut Vec<u8>, s: &str) {
        write_bytes_lenenc(out, s.as_bytes());
    }

    #[test]
    fn parses_a_varchar_column() {
        let mut payload = Vec::new();
        lenenc_str(&mut payload, "def");
        lenenc_str(&mut payload, "mydb");
        lenenc_str(&mut payload, "users");
        lenenc_str(&mut payload, "users");
        lenenc_str(&mut payload, "name");
        lenenc_str(&mut payload, "name");
        write_int_lenenc(&mut payload, 0x0c);
        write_int_2(&mut payload, 45); // charset
        write_int_4(&mut payload, 255); // column_length
        payload.push(0x0f); // MYSQL_TYPE_VARCHAR
        write_int_2(&mut payload, 0); // flags
        payload.push(0); // decimals
        write_int_2(&mut payload, 0); // reserved

        let column = parse_column_definition(&payload).unwrap();
        assert_eq!(column.name, "name");
        assert_eq!(column.column_type, ColumnType::MYSQL_TYPE_VARCHAR);
        assert!(!column.is_unsigned());
    }
}
