//! The connection state machine: handshake, authentication, `COM_QUERY`
//! dispatch, result-set reading, and the transaction/utility commands built
//! on top of them.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UnixStream};
use tracing::instrument;

use crate::constant::{CAPABILITIES_ALWAYS_ENABLED, CapabilityFlags, CommandByte, ServerStatusFlags};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::auth::{
    CachingSha2FastAuthResult, clear_password_payload, encrypt_password_rsa, read_caching_sha2_fast_auth_result,
    scramble_native_password, scramble_sha2_password,
};
use crate::protocol::column::{ColumnDefinition, parse_column_definition};
use crate::protocol::handshake::{
    HandshakeResponse41, read_auth_switch_request, read_initial_handshake, write_handshake_response,
};
use crate::protocol::packet;
use crate::protocol::primitive::{read_int_lenenc, write_int_1, write_int_4};
use crate::protocol::response::{EofPacket, ErrPayload, ErrPayloadBytes, OkPayload, OkPayloadBytes, read_eof_packet};
use crate::protocol::row::parse_text_row;
use crate::value::ConvTable;

use super::stream::Stream;

/// What a command's response turned out to be: a terminal OK, or the start
/// of a result set whose rows the caller reads one at a time via
/// [`Conn::read_row`].
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Ok(OkPayload),
    ResultSet(Vec<ColumnDefinition>),
}

/// A single authenticated MySQL/MariaDB connection.
///
/// Invariant: at most one command is ever in flight; between commands the
/// stream holds no unread bytes. Callers that need that invariant enforced
/// across cancellation (pool checkout) should track it externally — `Conn`
/// itself assumes its caller drives it to completion.
pub struct Conn {
    stream: Stream,
    sequence_id: u8,
    capability_flags: CapabilityFlags,
    protocol_version: u8,
    server_version: String,
    connection_id: u32,
    collation: u16,
    database: Option<String>,
    autocommit: bool,
    server_status: ServerStatusFlags,
    affected_rows: u64,
    last_insert_id: u64,
    warning_count: u16,
    savepoint_depth: u32,
    local_infile_enabled: bool,
    max_allowed_packet: u32,
    conv: Option<Arc<ConvTable>>,
    /// Doubles as a drop-bomb: [`Self::write_command`] arms it before
    /// writing a single byte, and [`Self::read_command_response`] /
    /// [`Self::read_row`] disarm it only once the true outcome (no more
    /// results, or a fully-drained result set) is known. If the future
    /// driving a command is dropped anywhere in between — a cancelled
    /// write, a cancelled header read, a cancelled row fetch — this is left
    /// set, which is exactly what should poison the connection: its wire
    /// state is now indeterminate. [`Self::write_command`] also refuses to
    /// start a new command while this is set (the "no pipelining"
    /// invariant); the pool's check-in path closes rather than recycles a
    /// connection handed back with this still set.
    pending_result: bool,
}

impl Conn {
    /// Open a TCP or Unix socket connection, complete the handshake and
    /// authentication, and apply the startup options (`sql_mode`,
    /// `init_command`, `autocommit`).
    #[instrument(skip_all, fields(host = opts.host.as_deref().unwrap_or("")))]
    pub async fn connect(opts: &Opts) -> Result<Self> {
        let mut stream = Self::open_stream(opts).await?;
        let (seq, payload) = packet::read_payload(&mut stream).await?;
        let handshake = read_initial_handshake(&payload)?;

        let mut client_capabilities = CAPABILITIES_ALWAYS_ENABLED | (opts.capabilities & crate::constant::CAPABILITIES_CONFIGURABLE);
        if opts.db.is_some() {
            client_capabilities |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        if opts.tls {
            client_capabilities |= CapabilityFlags::CLIENT_SSL;
        }
        if opts.local_infile {
            client_capabilities |= CapabilityFlags::CLIENT_LOCAL_FILES;
        }
        let negotiated = client_capabilities & handshake.capability_flags;

        let mut sequence_id = seq.wrapping_add(1);
        let collation = opts.collation();

        let tls_active = if opts.tls {
            if !negotiated.contains(CapabilityFlags::CLIENT_SSL) {
                return Err(Error::BadConfig("server does not support TLS".into()));
            }
            let ssl_request = partial_handshake_response(negotiated, collation);
            packet::write_payload(&mut stream, &mut sequence_id, &ssl_request).await?;
            let host = opts.host.as_deref().unwrap_or("localhost");
            stream = stream
                .upgrade_to_tls(host)
                .await
                .map_err(|e| Error::Interface(format!("TLS upgrade failed: {e}")))?;
            true
        } else {
            false
        };

        let mut conn = Self {
            stream,
            sequence_id,
            capability_flags: negotiated,
            protocol_version: handshake.protocol_version,
            server_version: handshake.server_version.clone(),
            connection_id: handshake.connection_id,
            collation,
            database: opts.db.clone(),
            autocommit: opts.autocommit,
            server_status: ServerStatusFlags::empty(),
            affected_rows: 0,
            last_insert_id: 0,
            warning_count: 0,
            savepoint_depth: 0,
            local_infile_enabled: opts.local_infile,
            max_allowed_packet: opts.max_allowed_packet,
            conv: opts.conv.clone(),
            pending_result: false,
        };

        let mut plugin = if handshake.auth_plugin_name.is_empty() {
            "mysql_native_password".to_string()
        } else {
            handshake.auth_plugin_name.clone()
        };
        let challenge = handshake.auth_plugin_data.clone();
        let password = opts.password.as_deref().unwrap_or("");
        let initial_response = Self::compute_initial_auth_response(&plugin, &challenge, password)?;

        let response = HandshakeResponse41 {
            capability_flags: negotiated,
            max_packet_size: 0x0100_0000,
            charset: collation as u8,
            username: &opts.user,
            auth_response: &initial_response,
            database: opts.db.as_deref(),
            auth_plugin_name: Some(&plugin),
        };
        let mut buf = Vec::new();
        write_handshake_response(&mut buf, &response);
        packet::write_payload(&mut conn.stream, &mut conn.sequence_id, &buf).await?;

        conn.authenticate(opts, tls_active, &mut plugin, challenge).await?;

        if let Some(sql_mode) = &opts.sql_mode {
            conn.query(&format!("SET sql_mode = '{sql_mode}'")).await?;
        }
        if let Some(init) = &opts.init_command {
            conn.query(init).await?;
        }
        conn.set_autocommit(opts.autocommit).await?;

        Ok(conn)
    }

    async fn open_stream(opts: &Opts) -> Result<Stream> {
        if let Some(socket) = &opts.socket {
            let stream = UnixStream::connect(socket).await?;
            return Ok(Stream::unix(stream));
        }

        let host = opts.host.as_deref().ok_or_else(|| Error::BadConfig("missing host".into()))?;
        let addr = format!("{host}:{}", opts.port);
        let tcp = match opts.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| Error::Interface(format!("connect to {addr} timed out after {timeout:?}")))??,
            None => TcpStream::connect(&addr).await?,
        };
        tcp.set_nodelay(opts.tcp_nodelay)?;
        Ok(Stream::tcp(tcp))
    }

    fn compute_initial_auth_response(plugin: &str, challenge: &[u8], password: &str) -> Result<Vec<u8>> {
        match plugin {
            "mysql_native_password" => Ok(scramble_native_password(password, challenge).to_vec()),
            "caching_sha2_password" => Ok(scramble_sha2_password(password, challenge).to_vec()),
            // sha256_password never has a cached fast path; send nothing and
            // let the full-auth exchange run unconditionally.
            "sha256_password" => Ok(Vec::new()),
            "mysql_clear_password" => Ok(clear_password_payload(password)),
            other => Err(Error::NotSupported(format!("unsupported auth plugin '{other}'"))),
        }
    }

    async fn authenticate(&mut self, opts: &Opts, tls_active: bool, plugin: &mut String, challenge: Vec<u8>) -> Result<()> {
        let mut challenge = challenge;

        if plugin == "sha256_password" {
            self.full_auth_sha2(opts, tls_active, &challenge).await?;
        }

        loop {
            let payload = self.read_packet().await?;

            match payload.first() {
                Some(0x00) => {
                    let ok = OkPayload::try_from(OkPayloadBytes(&payload))?;
                    self.apply_ok(&ok);
                    return Ok(());
                }
                Some(0xFF) => return Err(ErrPayload::try_from(ErrPayloadBytes(&payload))?.into()),
                Some(0xFE) if payload.len() > 1 => {
                    let req = read_auth_switch_request(&payload)?;
                    *plugin = req.plugin_name;
                    challenge = req.plugin_data;
                    let password = opts.password.as_deref().unwrap_or("");
                    let response = Self::compute_initial_auth_response(plugin, &challenge, password)?;
                    packet::write_payload(&mut self.stream, &mut self.sequence_id, &response).await?;
                    if plugin == "sha256_password" {
                        self.full_auth_sha2(opts, tls_active, &challenge).await?;
                    }
                }
                Some(0x01) => match read_caching_sha2_fast_auth_result(&payload)? {
                    CachingSha2FastAuthResult::Success => {}
                    CachingSha2FastAuthResult::FullAuthRequired => {
                        self.full_auth_sha2(opts, tls_active, &challenge).await?;
                    }
                },
                _ => return Err(Error::Interface("unexpected packet during authentication".into())),
            }
        }
    }

    /// `caching_sha2_password` / `sha256_password` full-auth path: cleartext
    /// over an already-secure channel (TLS or a Unix socket), otherwise
    /// RSA-encrypted using the server's public key (pre-shared or fetched).
    async fn full_auth_sha2(&mut self, opts: &Opts, tls_active: bool, challenge: &[u8]) -> Result<()> {
        let password = opts.password.as_deref().unwrap_or("");

        if tls_active || matches!(self.stream, Stream::Unix(_)) {
            let payload = clear_password_payload(password);
            packet::write_payload(&mut self.stream, &mut self.sequence_id, &payload).await?;
            return Ok(());
        }

        let pem = if let Some(key) = &opts.server_public_key {
            key.clone()
        } else {
            packet::write_payload(&mut self.stream, &mut self.sequence_id, &[0x02]).await?;
            let payload = self.read_packet().await?;
            String::from_utf8(payload).map_err(|_| Error::Interface("invalid RSA public key from server".into()))?
        };

        let encrypted = encrypt_password_rsa(password, challenge, &pem)?;
        packet::write_payload(&mut self.stream, &mut self.sequence_id, &encrypted).await?;
        Ok(())
    }

    fn apply_ok(&mut self, ok: &OkPayload) {
        self.server_status = ok.status_flags;
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warning_count = ok.warnings;
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn capability_flags(&self) -> CapabilityFlags {
        self.capability_flags
    }

    pub fn server_status(&self) -> ServerStatusFlags {
        self.server_status
    }

    pub fn in_transaction(&self) -> bool {
        self.server_status.contains(ServerStatusFlags::SERVER_STATUS_IN_TRANS)
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn max_allowed_packet(&self) -> u32 {
        self.max_allowed_packet
    }

    pub fn conv(&self) -> Option<&Arc<ConvTable>> {
        self.conv.as_ref()
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.server_status.contains(ServerStatusFlags::SERVER_STATUS_NO_BACKSLASH_ESCAPES)
    }

    /// Read the next physical packet, verifying its sequence id matches the
    /// one this connection expects next. A mismatch means the connection's
    /// framing has desynchronized and can no longer be trusted.
    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let (seq, payload) = packet::read_payload(&mut self.stream).await?;
        if seq != self.sequence_id {
            return Err(Error::Interface(format!(
                "protocol error: expected sequence id {}, got {seq}",
                self.sequence_id
            )));
        }
        self.sequence_id = seq.wrapping_add(1);
        Ok(payload)
    }

    /// Whether the current result set (or a chain of them, via
    /// `MORE_RESULTS_EXISTS`) has been fully consumed yet.
    pub(crate) fn has_pending_result(&self) -> bool {
        self.pending_result
    }

    async fn write_command(&mut self, command: CommandByte, rest: &[u8]) -> Result<()> {
        if self.pending_result {
            return Err(Error::Programming(
                "a second command was issued before the previous result set was fully consumed".into(),
            ));
        }
        // Armed before the first byte goes out; disarmed by whichever
        // branch of read_command_response/read_row discovers the real
        // outcome. A cancellation anywhere in between leaves it armed.
        self.pending_result = true;
        let mut payload = Vec::with_capacity(1 + rest.len());
        payload.push(command as u8);
        payload.extend_from_slice(rest);
        self.sequence_id = 0;
        packet::write_payload(&mut self.stream, &mut self.sequence_id, &payload).await
    }

    /// Dispatch a `COM_QUERY` and read the first response packet: either a
    /// terminal OK or the header of a result set.
    #[instrument(skip_all)]
    pub async fn query(&mut self, sql: &str) -> Result<CommandOutcome> {
        self.write_command(CommandByte::Query, sql.as_bytes()).await?;
        self.read_command_response().await
    }

    pub(crate) async fn read_command_response(&mut self) -> Result<CommandOutcome> {
        let payload = self.read_packet().await?;

        match payload.first() {
            Some(0x00) => {
                let ok = OkPayload::try_from(OkPayloadBytes(&payload))?;
                self.pending_result = ok.status_flags.contains(ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS);
                self.apply_ok(&ok);
                Ok(CommandOutcome::Ok(ok))
            }
            Some(0xFF) => {
                self.pending_result = false;
                Err(ErrPayload::try_from(ErrPayloadBytes(&payload))?.into())
            }
            Some(0xFB) => {
                let filename = String::from_utf8_lossy(&payload[1..]).into_owned();
                let ok = self.handle_local_infile(&filename).await?;
                Ok(CommandOutcome::Ok(ok))
            }
            Some(_) => {
                let (column_count, _) = read_int_lenenc(&payload)?;
                let columns = self.read_column_definitions(column_count).await?;
                self.pending_result = true;
                Ok(CommandOutcome::ResultSet(columns))
            }
            None => Err(Error::UnexpectedEof),
        }
    }

    async fn read_column_definitions(&mut self, count: u64) -> Result<Vec<ColumnDefinition>> {
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let payload = self.read_packet().await?;
            columns.push(parse_column_definition(&payload)?);
        }

        if !self.capability_flags.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            let payload = self.read_packet().await?;
            let eof: &EofPacket = read_eof_packet(&payload)?;
            self.server_status = eof.status_flags();
        }

        Ok(columns)
    }

    /// Read the next row of the current result set, or `None` once the
    /// terminator (OK or legacy EOF) is reached.
    pub async fn read_row(&mut self, column_count: usize) -> Result<Option<Vec<Option<Vec<u8>>>>> {
        let payload = self.read_packet().await?;

        let is_terminator = match payload.first() {
            Some(0xFE) if self.capability_flags.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) => true,
            // Legacy EOF packets are always shorter than 9 bytes; a row
            // field large enough to start with the 0xFE lenenc marker would
            // need a much longer payload, so this length check disambiguates.
            Some(0xFE) if payload.len() < 9 => true,
            _ => false,
        };

        if is_terminator {
            let ok = OkPayload::try_from(OkPayloadBytes(&payload))?;
            self.apply_ok(&ok);
            self.pending_result = ok.status_flags.contains(ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS);
            return Ok(None);
        }

        if payload.first() == Some(&0xFF) {
            self.pending_result = false;
            return Err(ErrPayload::try_from(ErrPayloadBytes(&payload))?.into());
        }

        Ok(Some(parse_text_row(&payload, column_count)?))
    }

    /// Discard every remaining row of the current result set.
    pub async fn drain_result_set(&mut self, column_count: usize) -> Result<()> {
        while self.read_row(column_count).await?.is_some() {}
        Ok(())
    }

    pub fn more_results_exists(&self) -> bool {
        self.server_status.contains(ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS)
    }

    /// Advance to the next result set of a multi-result-set command (a
    /// stored procedure call, or multiple statements). Returns `None` once
    /// there is nothing left.
    pub async fn next_result_set(&mut self) -> Result<Option<CommandOutcome>> {
        if !self.more_results_exists() {
            return Ok(None);
        }
        Ok(Some(self.read_command_response().await?))
    }

    async fn handle_local_infile(&mut self, filename: &str) -> Result<OkPayload> {
        if !self.local_infile_enabled {
            self.write_raw_packet(&[]).await?;
        } else {
            match tokio::fs::File::open(filename).await {
                Ok(mut file) => {
                    let mut buf = vec![0u8; (self.max_allowed_packet as usize).min(1 << 20).max(1)];
                    loop {
                        let n = file.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        self.write_raw_packet(&buf[..n]).await?;
                    }
                    self.write_raw_packet(&[]).await?;
                }
                Err(e) => {
                    self.write_raw_packet(&[]).await?;
                    return Err(Error::Interface(format!("LOCAL INFILE: failed to open '{filename}': {e}")));
                }
            }
        }

        let payload = self.read_packet().await?;
        match payload.first() {
            Some(0x00) | Some(0xFE) => {
                let ok = OkPayload::try_from(OkPayloadBytes(&payload))?;
                self.pending_result = ok.status_flags.contains(ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS);
                self.apply_ok(&ok);
                Ok(ok)
            }
            Some(0xFF) => {
                self.pending_result = false;
                Err(ErrPayload::try_from(ErrPayloadBytes(&payload))?.into())
            }
            _ => Err(Error::Interface("expected OK/ERR after LOCAL INFILE transfer".into())),
        }
    }

    async fn write_raw_packet(&mut self, payload: &[u8]) -> Result<()> {
        packet::write_payload(&mut self.stream, &mut self.sequence_id, payload).await
    }

    /// `COM_PING`: confirm the server is reachable without folding
    /// reconnect logic into this layer — a failed ping just returns an
    /// error and leaves reconnection to the caller.
    pub async fn ping(&mut self) -> Result<()> {
        self.write_command(CommandByte::Ping, &[]).await?;
        match self.read_command_response().await? {
            CommandOutcome::Ok(_) => Ok(()),
            CommandOutcome::ResultSet(_) => Err(Error::Interface("unexpected result set in response to ping".into())),
        }
    }

    pub async fn select_db(&mut self, db: &str) -> Result<()> {
        self.write_command(CommandByte::InitDb, db.as_bytes()).await?;
        self.read_command_response().await?;
        self.database = Some(db.to_string());
        Ok(())
    }

    pub async fn set_autocommit(&mut self, value: bool) -> Result<()> {
        self.query(if value { "SET autocommit = 1" } else { "SET autocommit = 0" }).await?;
        self.autocommit = value;
        Ok(())
    }

    pub async fn show_warnings(&mut self) -> Result<Vec<(String, u16, String)>> {
        match self.query("SHOW WARNINGS").await? {
            CommandOutcome::Ok(_) => Ok(Vec::new()),
            CommandOutcome::ResultSet(columns) => {
                let column_count = columns.len();
                let mut warnings = Vec::new();
                while let Some(fields) = self.read_row(column_count).await? {
                    let level = field_as_string(&fields, 0);
                    let code = field_as_string(&fields, 1).parse().unwrap_or(0);
                    let message = field_as_string(&fields, 2);
                    warnings.push((level, code, message));
                }
                Ok(warnings)
            }
        }
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.query("BEGIN").await.map(|_| ())
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.query("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.query("ROLLBACK").await.map(|_| ())
    }

    pub(crate) async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.query(&format!("SAVEPOINT {name}")).await.map(|_| ())
    }

    pub(crate) async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.query(&format!("RELEASE SAVEPOINT {name}")).await.map(|_| ())
    }

    pub(crate) async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.query(&format!("ROLLBACK TO SAVEPOINT {name}")).await.map(|_| ())
    }

    pub(crate) fn push_savepoint_name(&mut self) -> String {
        self.savepoint_depth += 1;
        format!("sp_{}", self.savepoint_depth)
    }

    pub(crate) fn pop_savepoint_name(&mut self) {
        self.savepoint_depth = self.savepoint_depth.saturating_sub(1);
    }

    /// `XA START/END/PREPARE/COMMIT/ROLLBACK` with a caller-supplied xid,
    /// issued verbatim — this driver does no xid parsing of its own.
    pub(crate) async fn xa(&mut self, clause: &str) -> Result<()> {
        self.query(&format!("XA {clause}")).await.map(|_| ())
    }

    /// Graceful disconnect: `COM_QUIT` has no response, the server simply
    /// closes its side; dropping `self` closes ours.
    pub async fn quit(mut self) -> Result<()> {
        self.write_command(CommandByte::Quit, &[]).await
    }

    /// Start a flat transaction scoped to this connection.
    pub async fn begin_transaction(&mut self) -> Result<super::transaction::Transaction<'_>> {
        super::transaction::Transaction::begin(self).await
    }

    /// Start a two-phase transaction identified by `xid`.
    pub async fn xa_start(&mut self, xid: impl Into<String>) -> Result<super::transaction::XaTransaction<'_>> {
        super::transaction::XaTransaction::begin(self, xid).await
    }

    /// Open a cursor of the given row mode (see [`super::cursor::CursorMode`])
    /// bound to this connection. The cursor borrows `self` for its lifetime.
    pub fn cursor<M: super::cursor::CursorMode>(&mut self) -> super::cursor::Cursor<'_, M> {
        super::cursor::Cursor::new(self)
    }
}

fn field_as_string(fields: &[Option<Vec<u8>>], index: usize) -> String {
    fields
        .get(index)
        .and_then(|f| f.as_ref())
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}

fn partial_handshake_response(capability_flags: CapabilityFlags, collation: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    write_int_4(&mut out, capability_flags.bits());
    write_int_4(&mut out, 0x0100_0000);
    write_int_1(&mut out, collation as u8);
    out.extend_from_slice(&[0u8; 23]);
    out
}
