//! Handshake packets: `Protocol::HandshakeV10`, `HandshakeResponse41`, and
//! the auth-switch-request re-negotiation.

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::response::{ErrPayload, ErrPayloadBytes};

/// Initial handshake packet sent by the server right after the TCP/Unix
/// socket connects (`Protocol::HandshakeV10`).
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

pub fn read_initial_handshake(payload: &[u8]) -> Result<InitialHandshake> {
    let (protocol_version, data) = read_int_1(payload)?;

    if protocol_version == 0xFF {
        let err = ErrPayload::try_from(ErrPayloadBytes(&payload[1..]))?;
        return Err(err.into());
    }

    let (server_version_bytes, data) = read_string_null(data)?;
    let server_version = String::from_utf8_lossy(server_version_bytes).to_string();

    let (connection_id, data) = read_int_4(data)?;
    let (auth_data_1, data) = read_string_fix(data, 8)?;
    let (_filler, data) = read_int_1(data)?;
    let (cap_lower, data) = read_int_2(data)?;
    let (charset, data) = read_int_1(data)?;
    let (status_flags, data) = read_int_2(data)?;
    let (cap_upper, data) = read_int_2(data)?;

    let cap_bits = ((cap_upper as u32) << 16) | (cap_lower as u32);
    let capability_flags = CapabilityFlags::from_bits_truncate(cap_bits);

    let (auth_data_len, data) = read_int_1(data)?;
    let (_reserved, data) = read_string_fix(data, 10)?;

    let auth_data_2_len = (auth_data_len as usize).saturating_sub(8).max(13);
    let take = auth_data_2_len.min(data.len());
    let (auth_data_2, data) = read_string_fix(data, take)?;

    let mut auth_plugin_data = Vec::with_capacity(8 + auth_data_2.len());
    auth_plugin_data.extend_from_slice(auth_data_1);
    auth_plugin_data.extend_from_slice(auth_data_2);
    // the combined buffer carries a trailing NUL that read_string_null below strips
    while auth_plugin_data.last() == Some(&0) {
        auth_plugin_data.pop();
    }

    let (auth_plugin_name, _rest) = read_string_null(data).unwrap_or((b"mysql_native_password", &[]));
    let auth_plugin_name = String::from_utf8_lossy(auth_plugin_name).to_string();

    Ok(InitialHandshake {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data,
        capability_flags,
        charset,
        status_flags,
        auth_plugin_name,
    })
}

/// Client response to the initial handshake (`HandshakeResponse41`).
#[derive(Debug, Clone)]
pub struct HandshakeResponse41<'a> {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin_name: Option<&'a str>,
}

pub fn write_handshake_response(out: &mut Vec<u8>, response: &HandshakeResponse41) {
    write_int_4(out, response.capability_flags.bits());
    write_int_4(out, response.max_packet_size);
    write_int_1(out, response.charset);
    out.extend_from_slice(&[0u8; 23]);
    write_string_null(out, response.username);

    if response
        .capability_flags
        .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
    {
        write_bytes_lenenc(out, response.auth_response);
    } else {
        write_int_1(out, response.auth_response.len() as u8);
        out.extend_from_slice(response.auth_response);
    }

    if let Some(db) = response.database {
        write_string_null(out, db);
    }

    if response
        .capability_flags
        .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
    {
        if let Some(plugin) = response.auth_plugin_name {
            write_string_null(out, plugin);
        }
    }
}

/// Server request to switch to a different auth plugin mid-handshake.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

pub fn read_auth_switch_request(payload: &[u8]) -> Result<AuthSwitchRequest> {
    let (header, data) = read_int_1(payload)?;
    if header != 0xFE {
        return Err(Error::Interface("expected auth switch request".into()));
    }

    let (plugin_name, data) = read_string_null(data)?;

    let plugin_data = if data.last() == Some(&0) {
        data[..data.len() - 1].to_vec()
    } else {
        data.to_vec()
    };

    Ok(AuthSwitchRequest {
        plugin_name: String::from_utf8_lossy(plugin_name).to_string(),
        plugin_data,
    })
}

pub fn write_auth_switch_response(out: &mut Vec<u8>, auth_data: &[u8]) {
    out.extend_from_slice(auth_data);
}
