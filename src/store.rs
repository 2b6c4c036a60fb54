//! The embedded-store adapter.
//!
//! Wraps a `rusqlite::Connection` with the transaction discipline the rest
//! of the crate assumes: `begin_immediate` for public, mutating calls, and
//! savepoints for helpers composed inside an already-open transaction. One
//! connection is opened per thread per store path, matching the reference
//! implementation's `threading.local()` slot (collapsed here into a single
//! thread-local registry keyed by path rather than one slot per bucket
//! object, since `rusqlite::Connection` is `Send` but not `Sync` and there
//! is no reason to pay for a second file handle when two buckets in the
//! same thread share a store).

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use rusqlite::{Connection, Savepoint, Transaction, TransactionBehavior};

use crate::error::Result;

/// SQLite's busy-wait bound before a locked database surfaces as an error.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema for both bucket variants. Created on every freshly opened
/// connection regardless of which bucket variant triggered the open —
/// it's append-only and shared, so there's no harm in always ensuring both
/// tables exist.
const SCHEMA: &str = "
create table if not exists tbf (
    key text primary key,
    tokens float not null,
    last float not null
);
create table if not exists ts_token_bucket (
    key text not null,
    time float not null
);
create index if not exists ts_token_bucket_key_time on ts_token_bucket (key, time);
";

thread_local! {
    static CONNECTIONS: RefCell<HashMap<PathBuf, Rc<RefCell<Connection>>>> =
        RefCell::new(HashMap::new());
}

/// A handle to a bucket's thread-local connection.
///
/// Cheap to clone: it's just an `Rc` bump. Every bucket value constructed
/// against the same `path` in the same thread shares the underlying
/// connection.
#[derive(Clone)]
pub(crate) struct Store {
    conn: Rc<RefCell<Connection>>,
}

impl Store {
    /// Opens (or reuses) the calling thread's connection for `path`.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        CONNECTIONS.with(|cell| {
            let mut registry = cell.borrow_mut();
            if let Some(conn) = registry.get(path) {
                return Ok(Store {
                    conn: Rc::clone(conn),
                });
            }
            let conn = open_connection(path)?;
            let conn = Rc::new(RefCell::new(conn));
            registry.insert(path.to_path_buf(), Rc::clone(&conn));
            Ok(Store { conn })
        })
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits on `Ok`, rolls back on `Err` (and on panic, via
    /// `Transaction`'s own `Drop`). This is the scope every public,
    /// mutating bucket operation uses.
    pub(crate) fn with_immediate<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.borrow_mut();
        let mut txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&mut txn)?;
        txn.commit()?;
        Ok(result)
    }
}

/// Runs `f` inside a savepoint nested within an already-open transaction.
///
/// Used by internal helpers (`_peek`, `_record`, ...) that need to be
/// composable both as the sole body of a `begin_immediate` scope and as a
/// step inside a larger operation (`mutate`'s read-then-write).
pub(crate) fn with_savepoint<T>(
    txn: &mut Transaction<'_>,
    f: impl FnOnce(&Savepoint<'_>) -> Result<T>,
) -> Result<T> {
    let sp = txn.savepoint()?;
    let result = f(&sp)?;
    sp.commit()?;
    Ok(result)
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}
