//! The bounded connection pool: min/max sizing, FIFO waiter queueing,
//! age-based recycling, a liveness ping before handing out a reused
//! connection, and graceful vs. immediate shutdown.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::opts::Opts;

use super::Conn;

/// Pool-level knobs, kept separate from [`Opts`] since they describe the
/// pool's own bookkeeping rather than anything sent to the server.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened eagerly at construction time, before the first
    /// `acquire`.
    pub minsize: usize,
    /// Ceiling on connections that may exist at once (free + acquired).
    pub maxsize: usize,
    /// Log each acquire at debug level, mirroring the source driver's
    /// `echo` flag.
    pub echo: bool,
    /// Maximum age of an idle connection before it is closed instead of
    /// reused. Checked at acquire time only; `None` disables recycling.
    pub pool_recycle: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { minsize: 1, maxsize: 10, echo: false, pool_recycle: None }
    }
}

struct Idle {
    conn: Conn,
    checked_in_at: Instant,
}

/// A connection handed to a waiter by [`Pool::release`], or a signal that
/// it should retry from scratch because a slot freed up without a
/// connection attached to it (a concurrent connect attempt claimed the
/// slot and then failed), or that the pool is shutting down.
enum Delivery {
    Conn(Conn),
    Retry,
    Closed,
}

struct Shared {
    opts: Opts,
    config: PoolConfig,
    free: VecDeque<Idle>,
    /// Connections currently alive, whether idle in `free` or checked out.
    /// Always `<= config.maxsize`.
    total: usize,
    closing: bool,
    waiters: VecDeque<oneshot::Sender<Delivery>>,
}

/// A bounded pool of [`Conn`]s shared across tasks via `Arc<Pool>`.
pub struct Pool {
    shared: Mutex<Shared>,
    closed_notify: Notify,
}

impl Pool {
    /// Build a pool and eagerly open `config.minsize` connections so that
    /// `freesize >= minsize` before the first `acquire` (the natural
    /// reading of `minsize`, which the acquire algorithm itself never
    /// consults). Best-effort: if opening one of the `minsize` connections
    /// fails, filling stops early rather than failing pool construction —
    /// later `acquire` calls will simply open connections as needed.
    pub async fn new(opts: Opts, config: PoolConfig) -> Result<Arc<Pool>> {
        let mut free = VecDeque::with_capacity(config.minsize);
        for _ in 0..config.minsize {
            match Conn::connect(&opts).await {
                Ok(conn) => free.push_back(Idle { conn, checked_in_at: Instant::now() }),
                Err(e) => {
                    warn!(error = %e, "pool pre-fill stopped early");
                    break;
                }
            }
        }
        let total = free.len();

        Ok(Arc::new(Pool {
            shared: Mutex::new(Shared { opts, config, free, total, closing: false, waiters: VecDeque::new() }),
            closed_notify: Notify::new(),
        }))
    }

    pub async fn size(&self) -> usize {
        self.shared.lock().await.total
    }

    pub async fn freesize(&self) -> usize {
        self.shared.lock().await.free.len()
    }

    pub async fn minsize(&self) -> usize {
        self.shared.lock().await.config.minsize
    }

    pub async fn maxsize(&self) -> usize {
        self.shared.lock().await.config.maxsize
    }

    pub async fn echo(&self) -> bool {
        self.shared.lock().await.config.echo
    }

    fn is_stale(idle: &Idle, recycle: Option<Duration>) -> bool {
        match recycle {
            Some(max_age) => idle.checked_in_at.elapsed() > max_age,
            None => false,
        }
    }

    /// `acquire` algorithm: reuse an idle connection (closing it and
    /// trying again if it's too old or fails a liveness ping), else open a
    /// new one if under `maxsize`, else wait in FIFO order for a release.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConn> {
        loop {
            enum Obtained {
                Idle(Idle),
                NewSlot,
                Wait(oneshot::Receiver<Delivery>),
            }

            let obtained = {
                let mut shared = self.shared.lock().await;
                if shared.closing {
                    return Err(Error::Interface("pool is closing".into()));
                }

                // Fairness: a fresh acquirer may only take the fast paths
                // (reuse an idle connection, or open a new one) when no one
                // is already waiting in line; otherwise it joins the back
                // of the same queue.
                if shared.waiters.is_empty() {
                    if let Some(idle) = shared.free.pop_front() {
                        Obtained::Idle(idle)
                    } else if shared.total < shared.config.maxsize {
                        shared.total += 1;
                        Obtained::NewSlot
                    } else {
                        let (tx, rx) = oneshot::channel();
                        shared.waiters.push_back(tx);
                        Obtained::Wait(rx)
                    }
                } else {
                    let (tx, rx) = oneshot::channel();
                    shared.waiters.push_back(tx);
                    Obtained::Wait(rx)
                }
            };

            let conn = match obtained {
                Obtained::Idle(idle) => {
                    let recycle = self.shared.lock().await.config.pool_recycle;
                    if Self::is_stale(&idle, recycle) {
                        self.drop_one(idle.conn).await;
                        continue;
                    }
                    let mut conn = idle.conn;
                    if conn.ping().await.is_err() {
                        self.drop_one(conn).await;
                        continue;
                    }
                    conn
                }
                Obtained::NewSlot => {
                    let opts = self.shared.lock().await.opts.clone();
                    match Conn::connect(&opts).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            // The slot this acquirer reserved never became a
                            // connection. Give it back and let the oldest
                            // waiter (if any) try for themselves — this is
                            // the one path where strict FIFO order isn't
                            // preserved (see DESIGN.md).
                            let mut shared = self.shared.lock().await;
                            shared.total -= 1;
                            if let Some(tx) = shared.waiters.pop_front() {
                                let _ = tx.send(Delivery::Retry);
                            }
                            return Err(e);
                        }
                    }
                }
                Obtained::Wait(rx) => match rx.await {
                    Ok(Delivery::Conn(conn)) => conn,
                    Ok(Delivery::Retry) => continue,
                    Ok(Delivery::Closed) | Err(_) => {
                        return Err(Error::Interface("pool is closing".into()));
                    }
                },
            };

            if self.shared.lock().await.config.echo {
                debug!("pool: connection acquired");
            }
            return Ok(PooledConn { pool: Arc::clone(self), conn: Some(conn) });
        }
    }

    /// `release(conn)`: never blocks the caller (the real work happens on
    /// a spawned task, since `Drop` can't be async) — discard a
    /// connection that is poisoned (unread result set, or left inside a
    /// transaction) or surplus to a closing pool; otherwise return it to
    /// the free list or hand it directly to the oldest waiter.
    async fn release(self: &Arc<Self>, conn: Conn) {
        let must_discard = conn.has_pending_result() || conn.in_transaction();

        let mut shared = self.shared.lock().await;
        if shared.closing || must_discard {
            drop(shared);
            self.drop_one(conn).await;
            return;
        }

        if let Some(tx) = shared.waiters.pop_front() {
            drop(shared);
            if let Err(Delivery::Conn(conn)) = tx.send(Delivery::Conn(conn)) {
                // The waiter already gave up; don't lose the connection.
                let mut shared = self.shared.lock().await;
                shared.free.push_back(Idle { conn, checked_in_at: Instant::now() });
            }
        } else {
            shared.free.push_back(Idle { conn, checked_in_at: Instant::now() });
        }
    }

    /// Close one connection and account for it leaving `total`. Used for
    /// stale/dead idle connections and for any connection release decides
    /// not to keep.
    async fn drop_one(self: &Arc<Self>, conn: Conn) {
        let _ = conn.quit().await;
        let mut shared = self.shared.lock().await;
        shared.total -= 1;
        let now_empty = shared.total == 0 && shared.closing;
        drop(shared);
        if now_empty {
            self.closed_notify.notify_waiters();
        }
    }

    /// `clear()`: close every free connection; acquired ones are untouched.
    pub async fn clear(self: &Arc<Self>) {
        let idle: Vec<Idle> = {
            let mut shared = self.shared.lock().await;
            shared.free.drain(..).collect()
        };
        for idle in idle {
            self.drop_one(idle.conn).await;
        }
    }

    /// `close()`: stop accepting new acquirers, close every free
    /// connection now, and close each acquired connection as it is
    /// released instead of recycling it.
    pub async fn close(self: &Arc<Self>) {
        let (idle, waiters) = {
            let mut shared = self.shared.lock().await;
            shared.closing = true;
            let idle: Vec<Idle> = shared.free.drain(..).collect();
            let waiters: Vec<_> = shared.waiters.drain(..).collect();
            (idle, waiters)
        };
        for tx in waiters {
            let _ = tx.send(Delivery::Closed);
        }
        for idle in idle {
            self.drop_one(idle.conn).await;
        }
        if self.shared.lock().await.total == 0 {
            self.closed_notify.notify_waiters();
        }
    }

    /// `terminate()`: like `close()`, but acquired connections are torn
    /// down from under their owners too.
    ///
    /// Rust's ownership model is the honest limit here: a `PooledConn`
    /// holds its `Conn` exclusively, so the pool cannot reach in and close
    /// the socket out from under a task the way the source driver can grab
    /// a raw socket reference and call `close()` on it from outside.
    /// `close()` already arranges for every acquired connection to be
    /// discarded rather than recycled once its owner actually returns it;
    /// `terminate()` is therefore the same operation here. A caller that
    /// needs a hard, immediate stop should drop the `Arc<Pool>` (and its
    /// `PooledConn`s) and let socket teardown at the OS level do the rest.
    /// See DESIGN.md for the open-question record.
    pub async fn terminate(self: &Arc<Self>) {
        self.close().await;
    }

    /// `wait_closed()`: suspend until `size == 0`.
    pub async fn wait_closed(&self) {
        loop {
            if self.shared.lock().await.total == 0 {
                return;
            }
            self.closed_notify.notified().await;
        }
    }
}

/// An acquired connection on loan from a [`Pool`]. Dereferences to [`Conn`]
/// for the duration of the loan; dropping it returns the connection to the
/// pool (or discards it, per [`Pool::release`]'s rules) on a spawned task,
/// since `Drop` cannot run async code.
pub struct PooledConn {
    pool: Arc<Pool>,
    conn: Option<Conn>,
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        self.conn.as_ref().expect("PooledConn used after release")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("PooledConn used after release")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.release(conn).await });
            }
            Err(_) => {
                // No runtime to spawn on (e.g. dropped during shutdown):
                // best effort is to just let the socket close itself.
            }
        }
    }
}
