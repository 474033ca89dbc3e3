//! The transaction-object family: flat, nested (`SAVEPOINT`), and two-phase
//! (`XA`). All three implement the same small [`TransactionHandle`] surface
//! rather than sharing a base class.

use tracing::warn;

use crate::error::Result;

use super::Conn;

/// Common surface of every transaction flavor. `close` defaults to a
/// rollback, matching the cursor/connection convention that `close` means
/// "give up the remaining work", not "decide an outcome for me".
pub trait TransactionHandle: Sized {
    async fn commit(self) -> Result<()>;
    async fn rollback(self) -> Result<()>;

    async fn close(self) -> Result<()> {
        self.rollback().await
    }
}

/// A flat `BEGIN` / `COMMIT` / `ROLLBACK` transaction.
///
/// Async code can't run in `Drop`, so a transaction dropped without calling
/// `commit`/`rollback`/`close` only logs a warning; it does not touch the
/// server. The pool's check-in path is what actually guards against a
/// leaked transaction, by rolling back any connection still
/// `in_transaction()` when it's returned.
pub struct Transaction<'c> {
    conn: &'c mut Conn,
    closed: bool,
}

impl<'c> Transaction<'c> {
    pub(crate) async fn begin(conn: &'c mut Conn) -> Result<Transaction<'c>> {
        conn.begin().await?;
        Ok(Transaction { conn, closed: false })
    }

    /// Borrow the connection to run statements inside the transaction.
    pub fn conn(&mut self) -> &mut Conn {
        self.conn
    }

    /// Open a nested transaction scoped to this one. The outer transaction
    /// cannot be committed or rolled back until the returned handle is
    /// dropped, since both borrow the same connection.
    pub async fn savepoint(&mut self) -> Result<SavepointTransaction<'_>> {
        SavepointTransaction::begin(self.conn).await
    }
}

impl TransactionHandle for Transaction<'_> {
    async fn commit(mut self) -> Result<()> {
        self.conn.commit().await?;
        self.closed = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.conn.rollback().await?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!("transaction dropped without commit or rollback");
        }
    }
}

/// A `SAVEPOINT sp_N` / `ROLLBACK TO SAVEPOINT sp_N` / `RELEASE SAVEPOINT sp_N`
/// nested transaction. Committing releases only this savepoint; the
/// outermost [`Transaction`] still decides whether a real `COMMIT` happens.
pub struct SavepointTransaction<'c> {
    conn: &'c mut Conn,
    name: String,
    closed: bool,
}

impl<'c> SavepointTransaction<'c> {
    pub(crate) async fn begin(conn: &'c mut Conn) -> Result<SavepointTransaction<'c>> {
        let name = conn.push_savepoint_name();
        if let Err(e) = conn.savepoint(&name).await {
            conn.pop_savepoint_name();
            return Err(e);
        }
        Ok(SavepointTransaction { conn, name, closed: false })
    }

    pub fn conn(&mut self) -> &mut Conn {
        self.conn
    }

    /// Open a savepoint nested inside this one.
    pub async fn savepoint(&mut self) -> Result<SavepointTransaction<'_>> {
        SavepointTransaction::begin(self.conn).await
    }
}

impl TransactionHandle for SavepointTransaction<'_> {
    async fn commit(mut self) -> Result<()> {
        self.conn.release_savepoint(&self.name).await?;
        self.conn.pop_savepoint_name();
        self.closed = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.conn.rollback_to_savepoint(&self.name).await?;
        self.conn.pop_savepoint_name();
        self.closed = true;
        Ok(())
    }
}

impl Drop for SavepointTransaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(savepoint = %self.name, "nested transaction dropped without commit or rollback");
        }
    }
}

/// A two-phase `XA START/END/PREPARE/COMMIT/ROLLBACK` transaction, driven by
/// a caller-supplied xid. This driver does no xid parsing of its own; the
/// xid is issued back to the server verbatim.
pub struct XaTransaction<'c> {
    conn: &'c mut Conn,
    xid: String,
    closed: bool,
}

impl<'c> XaTransaction<'c> {
    pub(crate) async fn begin(conn: &'c mut Conn, xid: impl Into<String>) -> Result<XaTransaction<'c>> {
        let xid = xid.into();
        conn.xa(&format!("START '{xid}'")).await?;
        Ok(XaTransaction { conn, xid, closed: false })
    }

    pub fn conn(&mut self) -> &mut Conn {
        self.conn
    }

    pub fn xid(&self) -> &str {
        &self.xid
    }
}

impl TransactionHandle for XaTransaction<'_> {
    async fn commit(mut self) -> Result<()> {
        self.conn.xa(&format!("END '{}'", self.xid)).await?;
        self.conn.xa(&format!("PREPARE '{}'", self.xid)).await?;
        self.conn.xa(&format!("COMMIT '{}'", self.xid)).await?;
        self.closed = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.conn.xa(&format!("END '{}'", self.xid)).await?;
        self.conn.xa(&format!("ROLLBACK '{}'", self.xid)).await?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for XaTransaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(xid = %self.xid, "XA transaction dropped without commit or rollback");
        }
    }
}
