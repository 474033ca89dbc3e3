mod conn;
pub mod cursor;
mod pool;
mod stream;
mod transaction;

pub use conn::{CommandOutcome, Conn};
pub use cursor::{
    Buffering, Cursor, CursorMode, DictCursor, DictMode, ScrollMode, SSCursor, SSDictCursor, StreamingDictMode,
    StreamingTupleMode, TupleCursor, TupleMode,
};
pub use pool::{Pool, PoolConfig, PooledConn};
pub use stream::Stream;
pub use transaction::{SavepointTransaction, Transaction, TransactionHandle, XaTransaction};
