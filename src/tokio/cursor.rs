//! The cursor family: buffered and streaming row iteration, parameter
//! substitution, `executemany` batching, and stored-procedure calls, all
//! built on top of [`Conn`]'s command/result-set primitives.

use std::collections::HashMap;
use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::escape::{Param, Params, batch_insert_statements, render, split_insert_values};
use crate::protocol::column::ColumnDefinition;
use crate::value::{ConvTable, Value, decode_field};

use super::conn::{CommandOutcome, Conn};

/// Whether a cursor reads its whole result set eagerly or one row at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    Buffered,
    Streaming,
}

/// How `scroll`'s `value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMode {
    Relative,
    Absolute,
}

/// A cursor's row shape and buffering strategy. The four cursor classes
/// (`TupleCursor`, `DictCursor`, `SSCursor`, `SSDictCursor`) are all
/// `Cursor<'_, M>` for one of the four marker types below — this trait is
/// the only thing that varies between them.
pub trait CursorMode {
    type Row;
    const BUFFERING: Buffering;

    fn decode_row(
        columns: &[ColumnDefinition],
        raw: &[Option<Vec<u8>>],
        conv: Option<&ConvTable>,
    ) -> Result<Self::Row>;
}

fn decode_tuple(columns: &[ColumnDefinition], raw: &[Option<Vec<u8>>], conv: Option<&ConvTable>) -> Result<Vec<Value>> {
    columns
        .iter()
        .zip(raw)
        .map(|(column, field)| decode_field(column, field.as_deref(), conv))
        .collect()
}

fn decode_dict(
    columns: &[ColumnDefinition],
    raw: &[Option<Vec<u8>>],
    conv: Option<&ConvTable>,
) -> Result<HashMap<String, Value>> {
    let mut row = HashMap::with_capacity(columns.len());
    for (column, field) in columns.iter().zip(raw) {
        // A later column with a duplicate name overwrites the earlier one,
        // since that's the order `insert` is called in.
        row.insert(column.name.clone(), decode_field(column, field.as_deref(), conv)?);
    }
    Ok(row)
}

/// Marker for a buffered cursor yielding `Vec<Value>` rows.
pub enum TupleMode {}
/// Marker for a buffered cursor yielding name → value rows.
pub enum DictMode {}
/// Marker for a server-side (streaming) cursor yielding `Vec<Value>` rows.
pub enum StreamingTupleMode {}
/// Marker for a server-side (streaming) cursor yielding name → value rows.
pub enum StreamingDictMode {}

impl CursorMode for TupleMode {
    type Row = Vec<Value>;
    const BUFFERING: Buffering = Buffering::Buffered;

    fn decode_row(columns: &[ColumnDefinition], raw: &[Option<Vec<u8>>], conv: Option<&ConvTable>) -> Result<Self::Row> {
        decode_tuple(columns, raw, conv)
    }
}

impl CursorMode for DictMode {
    type Row = HashMap<String, Value>;
    const BUFFERING: Buffering = Buffering::Buffered;

    fn decode_row(columns: &[ColumnDefinition], raw: &[Option<Vec<u8>>], conv: Option<&ConvTable>) -> Result<Self::Row> {
        decode_dict(columns, raw, conv)
    }
}

impl CursorMode for StreamingTupleMode {
    type Row = Vec<Value>;
    const BUFFERING: Buffering = Buffering::Streaming;

    fn decode_row(columns: &[ColumnDefinition], raw: &[Option<Vec<u8>>], conv: Option<&ConvTable>) -> Result<Self::Row> {
        decode_tuple(columns, raw, conv)
    }
}

impl CursorMode for StreamingDictMode {
    type Row = HashMap<String, Value>;
    const BUFFERING: Buffering = Buffering::Streaming;

    fn decode_row(columns: &[ColumnDefinition], raw: &[Option<Vec<u8>>], conv: Option<&ConvTable>) -> Result<Self::Row> {
        decode_dict(columns, raw, conv)
    }
}

pub type TupleCursor<'c> = Cursor<'c, TupleMode>;
pub type DictCursor<'c> = Cursor<'c, DictMode>;
pub type SSCursor<'c> = Cursor<'c, StreamingTupleMode>;
pub type SSDictCursor<'c> = Cursor<'c, StreamingDictMode>;

/// A cursor bound to a connection. Holds the current result set (buffered
/// rows, or a streaming position), the most recent command's affected-row
/// count, and introspection fields mirroring the generic DB-client
/// convention (`rowcount`, `rownumber`, `lastrowid`, `description`).
///
/// The back-reference to `Conn` is a plain borrow: a cursor simply cannot
/// outlive the connection it reads from, which is exactly the "invalid
/// after the connection closes" guarantee this family is meant to provide.
pub struct Cursor<'c, M: CursorMode> {
    conn: &'c mut Conn,
    columns: Vec<ColumnDefinition>,
    buffered_rows: Vec<Vec<Option<Vec<u8>>>>,
    position: usize,
    rowcount: i64,
    rownumber: i64,
    lastrowid: u64,
    arraysize: usize,
    closed: bool,
    _mode: PhantomData<M>,
}

impl<'c, M: CursorMode> Cursor<'c, M> {
    pub(crate) fn new(conn: &'c mut Conn) -> Self {
        Cursor {
            conn,
            columns: Vec::new(),
            buffered_rows: Vec::new(),
            position: 0,
            rowcount: -1,
            rownumber: 0,
            lastrowid: 0,
            arraysize: 1,
            closed: false,
            _mode: PhantomData,
        }
    }

    pub fn description(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    pub fn rownumber(&self) -> i64 {
        self.rownumber
    }

    pub fn lastrowid(&self) -> u64 {
        self.lastrowid
    }

    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, n: usize) {
        self.arraysize = n.max(1);
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Programming("cursor is closed".into()));
        }
        Ok(())
    }

    /// Render `sql` against `params` (if any) and dispatch it, returning the
    /// affected-row count. A `None` parameter set sends `sql` unmodified.
    pub async fn execute(&mut self, sql: &str, params: Option<Params>) -> Result<u64> {
        self.ensure_open()?;
        let rendered = match params {
            Some(params) => render(sql, &params, self.conn.no_backslash_escapes())?,
            None => sql.to_string(),
        };
        self.dispatch(&rendered).await
    }

    /// For an `INSERT ... VALUES (...)` statement, pack as many rendered
    /// rows as fit under `max_allowed_packet` into successive multi-row
    /// INSERTs; otherwise run `rows.len()` sequential executes. Returns the
    /// total affected-row count.
    pub async fn executemany(&mut self, sql: &str, rows: &[Params]) -> Result<u64> {
        self.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }

        let no_backslash_escapes = self.conn.no_backslash_escapes();

        if let Some((prefix, row_template, tail)) = split_insert_values(sql) {
            let mut rendered_rows = Vec::with_capacity(rows.len());
            for params in rows {
                rendered_rows.push(render(row_template, params, no_backslash_escapes)?);
            }
            let max_allowed_packet = self.conn.max_allowed_packet() as usize;
            let statements = batch_insert_statements(prefix, &rendered_rows, tail, max_allowed_packet);

            let mut total = 0u64;
            for statement in statements {
                total += self.dispatch(&statement).await?;
            }
            Ok(total)
        } else {
            let mut total = 0u64;
            for params in rows {
                let rendered = render(sql, params, no_backslash_escapes)?;
                total += self.dispatch(&rendered).await?;
            }
            Ok(total)
        }
    }

    /// Bind each argument into a server variable `@_<name>_<i>`, then run
    /// `CALL name(@_name_0, ...)`. Returns the original arguments unchanged;
    /// retrieving OUT/INOUT values is left to the caller via a follow-up
    /// `SELECT @_name_i`.
    pub async fn callproc(&mut self, name: &str, args: &[Param]) -> Result<Vec<Param>> {
        self.ensure_open()?;
        let no_backslash_escapes = self.conn.no_backslash_escapes();

        for (i, arg) in args.iter().enumerate() {
            let template = format!("SET @_{name}_{i}=%s");
            let params = Params::Positional(vec![arg.clone()]);
            let rendered = render(&template, &params, no_backslash_escapes)?;
            self.dispatch(&rendered).await?;
        }

        let var_list = (0..args.len()).map(|i| format!("@_{name}_{i}")).collect::<Vec<_>>().join(",");
        let call_sql = format!("CALL {name}({var_list})");
        self.dispatch(&call_sql).await?;

        Ok(args.to_vec())
    }

    async fn dispatch(&mut self, sql: &str) -> Result<u64> {
        let outcome = self.conn.query(sql).await?;
        self.consume_outcome(outcome).await
    }

    async fn consume_outcome(&mut self, outcome: CommandOutcome) -> Result<u64> {
        match outcome {
            CommandOutcome::Ok(ok) => {
                self.columns.clear();
                self.buffered_rows.clear();
                self.position = 0;
                self.rownumber = 0;
                self.rowcount = ok.affected_rows as i64;
                self.lastrowid = ok.last_insert_id;
                Ok(ok.affected_rows)
            }
            CommandOutcome::ResultSet(columns) => {
                let column_count = columns.len();
                self.columns = columns;
                self.position = 0;
                self.rownumber = 0;
                self.lastrowid = 0;

                if M::BUFFERING == Buffering::Buffered {
                    self.buffered_rows.clear();
                    while let Some(row) = self.conn.read_row(column_count).await? {
                        self.buffered_rows.push(row);
                    }
                    self.rowcount = self.buffered_rows.len() as i64;
                } else {
                    self.buffered_rows.clear();
                    self.rowcount = -1;
                }
                Ok(0)
            }
        }
    }

    pub async fn fetchone(&mut self) -> Result<Option<M::Row>> {
        self.ensure_open()?;
        match M::BUFFERING {
            Buffering::Buffered => {
                let Some(raw) = self.buffered_rows.get(self.position) else {
                    return Ok(None);
                };
                let row = M::decode_row(&self.columns, raw, self.conn.conv().map(AsRef::as_ref))?;
                self.position += 1;
                self.rownumber += 1;
                Ok(Some(row))
            }
            Buffering::Streaming => {
                if self.columns.is_empty() {
                    return Ok(None);
                }
                match self.conn.read_row(self.columns.len()).await? {
                    Some(raw) => {
                        let row = M::decode_row(&self.columns, &raw, self.conn.conv().map(AsRef::as_ref))?;
                        self.rownumber += 1;
                        Ok(Some(row))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    pub async fn fetchmany(&mut self, size: Option<usize>) -> Result<Vec<M::Row>> {
        let size = size.unwrap_or(self.arraysize);
        let mut rows = Vec::with_capacity(size);
        for _ in 0..size {
            match self.fetchone().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub async fn fetchall(&mut self) -> Result<Vec<M::Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetchone().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Move the cursor's position. Buffered cursors move an in-memory
    /// index; streaming cursors only support non-negative `Relative`
    /// motion, implemented by reading and discarding rows.
    pub async fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<()> {
        self.ensure_open()?;
        match M::BUFFERING {
            Buffering::Buffered => {
                let base = self.position as i64;
                let target = match mode {
                    ScrollMode::Relative => base + value,
                    ScrollMode::Absolute => value,
                };
                if target < 0 || target as usize > self.buffered_rows.len() {
                    return Err(Error::Index("scroll target is out of range".into()));
                }
                self.position = target as usize;
                self.rownumber = self.position as i64;
                Ok(())
            }
            Buffering::Streaming => {
                if mode == ScrollMode::Absolute || value < 0 {
                    return Err(Error::NotSupported(
                        "backward scroll is not supported on a streaming cursor".into(),
                    ));
                }
                for _ in 0..value {
                    if self.fetchone().await?.is_none() {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    /// Advance to the next result set of a multi-result-set command,
    /// discarding any rows of the current one that were never fetched.
    /// Returns `false` once there is nothing left.
    pub async fn nextset(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if M::BUFFERING == Buffering::Streaming && !self.columns.is_empty() {
            self.conn.drain_result_set(self.columns.len()).await?;
        }

        match self.conn.next_result_set().await? {
            Some(outcome) => {
                self.consume_outcome(outcome).await?;
                Ok(true)
            }
            None => {
                self.columns.clear();
                self.buffered_rows.clear();
                self.position = 0;
                Ok(false)
            }
        }
    }

    /// Drain any unread rows and result sets, then mark the cursor closed.
    /// Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if M::BUFFERING == Buffering::Streaming && !self.columns.is_empty() {
            self.conn.drain_result_set(self.columns.len()).await?;
        }

        while let Some(outcome) = self.conn.next_result_set().await? {
            if let CommandOutcome::ResultSet(columns) = outcome {
                self.conn.drain_result_set(columns.len()).await?;
            }
        }

        self.columns.clear();
        self.buffered_rows.clear();
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::{ColumnFlags, ColumnType};

    fn column(name: &str, column_type: ColumnType) -> ColumnDefinition {
        ColumnDefinition {
            catalog: "def".into(),
            schema: String::new(),
            table: String::new(),
            original_table: String::new(),
            name: name.into(),
            original_name: name.into(),
            charset: 45,
            column_length: 0,
            column_type,
            flags: ColumnFlags::empty(),
            decimals: 0,
        }
    }

    #[test]
    fn tuple_decode_preserves_column_order() {
        let columns = vec![column("a", ColumnType::MYSQL_TYPE_LONG), column("b", ColumnType::MYSQL_TYPE_LONG)];
        let raw = vec![Some(b"1".to_vec()), Some(b"2".to_vec())];
        let row = decode_tuple(&columns, &raw, None).unwrap();
        assert_eq!(row, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn dict_decode_last_duplicate_name_wins() {
        let columns = vec![column("v", ColumnType::MYSQL_TYPE_LONG), column("v", ColumnType::MYSQL_TYPE_LONG)];
        let raw = vec![Some(b"1".to_vec()), Some(b"2".to_vec())];
        let row = decode_dict(&columns, &raw, None).unwrap();
        assert_eq!(row.get("v"), Some(&Value::Int(2)));
    }
}
