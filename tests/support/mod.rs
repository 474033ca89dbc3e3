//! An in-process fake MySQL server speaking just enough of the wire
//! protocol (handshake, `mysql_native_password` auth accepted
//! unconditionally, `COM_QUERY`/`COM_PING`/`COM_QUIT`) to drive the
//! connection, cursor, pool and transaction state machines without a real
//! server.

#![allow(dead_code)]

use myaio::Opts;
use myaio::constant::{CAPABILITIES_ALWAYS_ENABLED, CapabilityFlags, ColumnType, ServerStatusFlags};
use myaio::protocol::packet::{read_payload, write_payload};
use myaio::protocol::primitive::*;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

static TRACING: std::sync::Once = std::sync::Once::new();

/// Install a `tracing-subscriber` writer once per test process, so the
/// `#[instrument]`/`tracing::warn!` calls the driver makes are actually
/// exercised (and visible with `cargo test -- --nocapture`) rather than
/// going to a no-op default subscriber.
fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

pub struct FakeColumn {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub unsigned: bool,
}

pub fn col(name: &'static str, column_type: ColumnType) -> FakeColumn {
    FakeColumn { name, column_type, unsigned: false }
}

pub fn ucol(name: &'static str, column_type: ColumnType) -> FakeColumn {
    FakeColumn { name, column_type, unsigned: true }
}

/// One of a command's replies; several in a row model the
/// `SERVER_MORE_RESULTS_EXISTS` chaining a stored-procedure call or a
/// multi-statement query produces.
pub enum SingleReply {
    Ok { affected_rows: u64, last_insert_id: u64 },
    ResultSet { columns: Vec<FakeColumn>, rows: Vec<Vec<Option<&'static str>>> },
    Err { code: u16, message: &'static str },
}

pub fn ok(affected_rows: u64, last_insert_id: u64) -> Vec<SingleReply> {
    vec![SingleReply::Ok { affected_rows, last_insert_id }]
}

pub fn result_set(columns: Vec<FakeColumn>, rows: Vec<Vec<Option<&'static str>>>) -> Vec<SingleReply> {
    vec![SingleReply::ResultSet { columns, rows }]
}

pub fn err(code: u16, message: &'static str) -> Vec<SingleReply> {
    vec![SingleReply::Err { code, message }]
}

pub struct FakeServer {
    pub addr: std::net::SocketAddr,
    handle: JoinHandle<()>,
}

impl FakeServer {
    /// `Opts` pointed at this server, with a harmless default user/charset.
    pub fn opts(&self) -> Opts {
        Opts {
            host: Some("127.0.0.1".to_string()),
            port: self.addr.port(),
            user: "test".to_string(),
            autocommit: true,
            ..Opts::default()
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Accept exactly one connection and answer each `COM_QUERY` after the
/// implicit startup `SET autocommit` with the next entry of `script`, in
/// order. For tests that drive a single [`myaio::tokio::Conn`] directly.
pub async fn spawn_scripted_server(script: Vec<Vec<SingleReply>>) -> FakeServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        if let Err(e) = serve_scripted(stream, script).await {
            eprintln!("fake server error: {e}");
        }
    });
    FakeServer { addr, handle }
}

/// Accept any number of connections, each served by `generic_responder`:
/// handshake, then OK to everything (`SET autocommit`, `COM_PING`, any
/// query). For pool tests that exercise connection bookkeeping rather than
/// specific query results.
pub async fn spawn_pool_server() -> FakeServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                if let Err(e) = generic_responder(stream).await {
                    eprintln!("fake server connection error: {e}");
                }
            });
        }
    });
    FakeServer { addr, handle }
}

/// Accept any number of connections, each tracking `SERVER_STATUS_IN_TRANS`
/// the way a real server would, by inspecting every `COM_QUERY`'s SQL text:
/// `BEGIN` sets it, a bare `COMMIT`/`ROLLBACK` clears it, everything else
/// (savepoint and XA statements included) leaves it as-is. For tests that
/// assert on [`myaio::tokio::Conn::in_transaction`] without scripting exact
/// replies, including pool tests where a discarded connection means a
/// second physical connection gets opened.
pub async fn spawn_transactional_server() -> FakeServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                if let Err(e) = serve_transactional(stream).await {
                    eprintln!("fake server connection error: {e}");
                }
            });
        }
    });
    FakeServer { addr, handle }
}

async fn serve_transactional(mut stream: TcpStream) -> myaio::Result<()> {
    handshake_and_auth(&mut stream).await?;

    let mut in_trans = false;

    loop {
        let (seq, payload) = match read_payload(&mut stream).await {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        let Some(&command) = payload.first() else { return Ok(()) };
        let mut seq = seq.wrapping_add(1);

        match command {
            0x01 => return Ok(()),
            0x0e => write_ok_packet(&mut stream, &mut seq, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, false).await?,
            0x03 => {
                let sql = String::from_utf8_lossy(&payload[1..]);
                let sql = sql.trim();
                if sql.eq_ignore_ascii_case("BEGIN") {
                    in_trans = true;
                } else if sql.eq_ignore_ascii_case("COMMIT") || sql.eq_ignore_ascii_case("ROLLBACK") {
                    in_trans = false;
                }
                let mut status = ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT;
                if in_trans {
                    status |= ServerStatusFlags::SERVER_STATUS_IN_TRANS;
                }
                write_ok_packet(&mut stream, &mut seq, 0, 0, status, false).await?;
            }
            _ => write_ok_packet(&mut stream, &mut seq, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, false).await?,
        }
    }
}

async fn handshake_and_auth(stream: &mut TcpStream) -> myaio::Result<()> {
    let mut payload = Vec::new();
    payload.push(10u8); // protocol version
    payload.extend_from_slice(b"8.0.34-fake\0");
    payload.extend_from_slice(&1u32.to_le_bytes()); // connection id
    payload.extend_from_slice(b"AAAAAAAA"); // auth data part 1 (8 bytes)
    payload.push(0); // filler

    let caps = CAPABILITIES_ALWAYS_ENABLED | CapabilityFlags::CLIENT_CONNECT_WITH_DB | CapabilityFlags::CLIENT_LOCAL_FILES;
    let bits = caps.bits();
    write_int_2(&mut payload, bits as u16);
    payload.push(45); // charset
    write_int_2(&mut payload, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT.bits());
    write_int_2(&mut payload, (bits >> 16) as u16);
    payload.push(21); // auth plugin data length
    payload.extend_from_slice(&[0u8; 10]); // reserved
    payload.extend_from_slice(b"BBBBBBBBBBBB\0"); // auth data part 2 (12 bytes + nul)
    payload.extend_from_slice(b"mysql_native_password\0");

    let mut seq = 0u8;
    write_payload(stream, &mut seq, &payload).await?;

    let (resp_seq, _handshake_response) = read_payload(stream).await?;
    let mut seq = resp_seq.wrapping_add(1);
    write_ok_packet(stream, &mut seq, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, false).await
}

async fn write_ok_packet(
    stream: &mut TcpStream,
    seq: &mut u8,
    affected_rows: u64,
    last_insert_id: u64,
    status: ServerStatusFlags,
    more_results: bool,
) -> myaio::Result<()> {
    let mut payload = vec![0x00u8];
    write_int_lenenc(&mut payload, affected_rows);
    write_int_lenenc(&mut payload, last_insert_id);
    let status = if more_results { status | ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS } else { status };
    write_int_2(&mut payload, status.bits());
    write_int_2(&mut payload, 0); // warnings
    write_payload(stream, seq, &payload).await
}

async fn write_err_packet(stream: &mut TcpStream, seq: &mut u8, code: u16, message: &str) -> myaio::Result<()> {
    let mut payload = vec![0xFFu8];
    write_int_2(&mut payload, code);
    payload.push(b'#');
    payload.extend_from_slice(b"HY000");
    payload.extend_from_slice(message.as_bytes());
    write_payload(stream, seq, &payload).await
}

async fn write_result_set(
    stream: &mut TcpStream,
    seq: &mut u8,
    columns: &[FakeColumn],
    rows: &[Vec<Option<&str>>],
    more_results: bool,
) -> myaio::Result<()> {
    let mut header = Vec::new();
    write_int_lenenc(&mut header, columns.len() as u64);
    write_payload(stream, seq, &header).await?;

    for column in columns {
        let mut def = Vec::new();
        write_string_lenenc(&mut def, "def");
        write_string_lenenc(&mut def, "");
        write_string_lenenc(&mut def, "");
        write_string_lenenc(&mut def, "");
        write_string_lenenc(&mut def, column.name);
        write_string_lenenc(&mut def, column.name);
        write_int_lenenc(&mut def, 0x0c);
        write_int_2(&mut def, 45); // charset
        write_int_4(&mut def, 0); // column_length
        write_int_1(&mut def, column.column_type as u8);
        write_int_2(&mut def, if column.unsigned { 0x0020 } else { 0 });
        write_int_1(&mut def, 0); // decimals
        write_int_2(&mut def, 0); // reserved
        write_payload(stream, seq, &def).await?;
    }

    for row in rows {
        let mut payload = Vec::new();
        for field in row {
            match field {
                Some(s) => write_bytes_lenenc(&mut payload, s.as_bytes()),
                None => payload.push(0xFB),
            }
        }
        write_payload(stream, seq, &payload).await?;
    }

    let mut terminator = vec![0xFEu8];
    let status = if more_results {
        ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT | ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS
    } else {
        ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT
    };
    write_int_lenenc(&mut terminator, 0);
    write_int_lenenc(&mut terminator, 0);
    write_int_2(&mut terminator, status.bits());
    write_int_2(&mut terminator, 0);
    write_payload(stream, seq, &terminator).await
}

async fn write_chain(stream: &mut TcpStream, seq: &mut u8, chain: Vec<SingleReply>) -> myaio::Result<()> {
    let len = chain.len();
    for (i, reply) in chain.into_iter().enumerate() {
        let more = i + 1 < len;
        match reply {
            SingleReply::Ok { affected_rows, last_insert_id } => {
                write_ok_packet(stream, seq, affected_rows, last_insert_id, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, more).await?;
            }
            SingleReply::ResultSet { columns, rows } => {
                write_result_set(stream, seq, &columns, &rows, more).await?;
            }
            SingleReply::Err { code, message } => {
                write_err_packet(stream, seq, code, message).await?;
            }
        }
    }
    Ok(())
}

async fn serve_scripted(mut stream: TcpStream, script: Vec<Vec<SingleReply>>) -> myaio::Result<()> {
    handshake_and_auth(&mut stream).await?;

    let mut autocommit_seen = false;
    let mut script = script.into_iter();

    loop {
        let (seq, payload) = match read_payload(&mut stream).await {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        let Some(&command) = payload.first() else { return Ok(()) };
        let mut seq = seq.wrapping_add(1);

        match command {
            0x01 => return Ok(()), // COM_QUIT
            0x0e => write_ok_packet(&mut stream, &mut seq, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, false).await?,
            0x03 if !autocommit_seen => {
                autocommit_seen = true;
                write_ok_packet(&mut stream, &mut seq, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, false).await?;
            }
            0x03 => {
                let chain = script.next().unwrap_or_else(|| vec![SingleReply::Ok { affected_rows: 0, last_insert_id: 0 }]);
                write_chain(&mut stream, &mut seq, chain).await?;
            }
            _ => write_ok_packet(&mut stream, &mut seq, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, false).await?,
        }
    }
}

async fn generic_responder(mut stream: TcpStream) -> myaio::Result<()> {
    handshake_and_auth(&mut stream).await?;

    loop {
        let (seq, payload) = match read_payload(&mut stream).await {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        let Some(&command) = payload.first() else { return Ok(()) };
        let mut seq = seq.wrapping_add(1);

        match command {
            0x01 => return Ok(()), // COM_QUIT
            _ => write_ok_packet(&mut stream, &mut seq, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, false).await?,
        }
    }
}
