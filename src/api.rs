//! # Database Client
//!
//! The facade over the pool, table engine, and journal. A [`Db`] is built
//! once with its record types registered, opened (which materializes the
//! schema), and then shared freely: it is a cheap clone over shared state.
//!
//! ```no_run
//! use shelfdb::{Db, ListOptions};
//! # use serde::{Deserialize, Serialize};
//! # use std::sync::OnceLock;
//! # use shelfdb::{ColumnKind, Record, TableDef};
//! # #[derive(Clone, Debug, Default, Serialize, Deserialize)]
//! # struct Vm { pk: String, name: String }
//! # impl Record for Vm {
//! #     fn table() -> &'static TableDef {
//! #         static DEF: OnceLock<TableDef> = OnceLock::new();
//! #         DEF.get_or_init(|| TableDef::new("Vm")
//! #             .field("pk", ColumnKind::Text, "pk(name)")
//! #             .field("name", ColumnKind::Text, "key"))
//! #     }
//! # }
//!
//! let db = Db::builder("/tmp/inventory.db").model::<Vm>().build();
//! db.open(true)?;
//!
//! let mut vm = Vm { name: "vm-1".to_string(), ..Vm::default() };
//! db.insert(&mut vm)?;
//!
//! let mut tx = db.begin()?;
//! tx.delete(&mut vm)?;
//! tx.commit()?;
//!
//! db.close(true)?;
//! # Ok::<(), shelfdb::Error>(())
//! ```
//!
//! Writes serialize on the single writer slot; reads run concurrently on
//! reader slots. Every write also records an event, and committed events
//! flow to watches (see [`Db::watch`]).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::Connection;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::journal::{Action, Envelope, EventHandler, Journal, Watch};
use crate::model::{Document, Label, Record, TableDef, Value};
use crate::pool::{Pool, Session, DEFAULT_READERS};
use crate::predicate::{and, eq, Predicate};
use crate::spill::{self, Iter, List, TypedIter};
use crate::table::{ListOptions, Table};

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`Db`] with its record types registered.
///
/// Registration replaces runtime reflection: the schema for every registered
/// type (plus [`Label`]) is materialized at [`Db::open`].
pub struct DbBuilder {
    path: PathBuf,
    readers: usize,
    work_dir: Option<PathBuf>,
    tables: Vec<&'static TableDef>,
}

impl DbBuilder {
    /// Registers a record type.
    pub fn model<M: Record>(mut self) -> Self {
        self.tables.push(M::table());
        self
    }

    /// Sets the number of reader slots (default 4).
    pub fn readers(mut self, readers: usize) -> Self {
        self.readers = readers;
        self
    }

    /// Sets the working directory for spill files.
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Finishes the build. The database is not yet open.
    pub fn build(mut self) -> Db {
        // Label bookkeeping rides along with every registration set.
        if !self
            .tables
            .iter()
            .any(|def| def.name() == Label::table().name())
        {
            self.tables.push(Label::table());
        }
        Db {
            inner: Arc::new(DbInner {
                path: self.path,
                readers: self.readers,
                work_dir: self.work_dir,
                tables: self.tables,
                pool: RwLock::new(None),
                journal: Journal::default(),
            }),
        }
    }
}

// =============================================================================
// Db
// =============================================================================

struct DbInner {
    path: PathBuf,
    readers: usize,
    work_dir: Option<PathBuf>,
    tables: Vec<&'static TableDef>,
    pool: RwLock<Option<Arc<Pool>>>,
    journal: Journal,
}

/// The database client.
///
/// Cloning shares the underlying pool and journal; handlers that write back
/// from watch callbacks hold their own clone.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Starts a builder for the database at `path`.
    pub fn builder(path: impl Into<PathBuf>) -> DbBuilder {
        DbBuilder {
            path: path.into(),
            readers: DEFAULT_READERS,
            work_dir: None,
            tables: Vec::new(),
        }
    }

    /// Opens the database and materializes the schema for every registered
    /// record type. Optionally purges (deletes) the file first.
    ///
    /// Any DDL failure tears the pool back down and surfaces as
    /// [`Error::Schema`]. Opening an already-open database is a no-op.
    pub fn open(&self, purge: bool) -> Result<()> {
        let mut slot = self.inner.pool.write();
        if slot.is_some() {
            return Ok(());
        }
        if purge {
            remove_db_files(&self.inner.path);
        }
        if let Some(dir) = &self.inner.work_dir {
            spill::set_work_dir(dir.clone());
        }
        let pool = Arc::new(Pool::open(&self.inner.path, self.inner.readers)?);
        {
            let writer = pool.writer()?;
            for def in &self.inner.tables {
                for stmt in Table::ddl(def)? {
                    if let Err(err) = writer.execute_batch(&stmt) {
                        error!(ddl = stmt.as_str(), %err, "DDL failed");
                        return Err(Error::Schema(format!("DDL failed: {err} ({stmt})")));
                    }
                    trace!(ddl = stmt.as_str(), "DDL executed");
                }
            }
        }
        *slot = Some(pool);
        debug!(path = %self.inner.path.display(), "db opened");
        Ok(())
    }

    /// Closes the journal (ending all watches), then the pool, then
    /// optionally deletes the file. Idempotent.
    pub fn close(&self, purge: bool) -> Result<()> {
        self.inner.journal.close();
        let pool = self.inner.pool.write().take();
        drop(pool);
        if purge {
            remove_db_files(&self.inner.path);
            debug!(path = %self.inner.path.display(), "db deleted");
        }
        debug!(path = %self.inner.path.display(), "db closed");
        Ok(())
    }

    fn pool(&self) -> Result<Arc<Pool>> {
        self.inner.pool.read().as_ref().cloned().ok_or(Error::Closed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetches the record by primary key, populating all fields.
    pub fn get<M: Record>(&self, record: &mut M) -> Result<()> {
        let pool = self.pool()?;
        let session = pool.reader()?;
        Table {
            conn: session.conn(),
        }
        .get(record)
    }

    /// Lists records qualified by the options.
    pub fn list<M: Record>(&self, options: &ListOptions) -> Result<Vec<M>> {
        let pool = self.pool()?;
        let session = pool.reader()?;
        Table {
            conn: session.conn(),
        }
        .list(options)
    }

    /// Like [`list`](Db::list), but streams rows through a spill list to
    /// bound memory on large result sets.
    pub fn find<M: Record>(&self, options: &ListOptions) -> Result<TypedIter<M>> {
        let pool = self.pool()?;
        let session = pool.reader()?;
        Table {
            conn: session.conn(),
        }
        .find(options)
    }

    /// Counts records matching the predicate.
    pub fn count<M: Record>(&self, predicate: Option<&Predicate>) -> Result<i64> {
        let pool = self.pool()?;
        let session = pool.reader()?;
        Table {
            conn: session.conn(),
        }
        .count::<M>(predicate)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Begins a transaction, holding the writer slot until commit or end.
    pub fn begin(&self) -> Result<Tx> {
        let pool = self.pool()?;
        let session = pool.writer()?;
        session.execute_batch("BEGIN IMMEDIATE")?;
        debug!("tx begin");
        Ok(Tx {
            session: Some(session),
            journal: self.inner.journal.clone(),
            staged: List::new(),
            ended: false,
        })
    }

    /// Inserts the record in its own transaction.
    ///
    /// A unique-constraint collision silently becomes an update of the same
    /// row.
    pub fn insert<M: Record>(&self, record: &mut M) -> Result<()> {
        self.auto_commit(|tx| tx.insert(record))
    }

    /// Updates the record in its own transaction.
    pub fn update<M: Record>(&self, record: &mut M) -> Result<()> {
        self.auto_commit(|tx| tx.update(record))
    }

    /// Deletes the record in its own transaction. An absent row is not an
    /// error.
    pub fn delete<M: Record>(&self, record: &mut M) -> Result<()> {
        self.auto_commit(|tx| tx.delete(record))
    }

    fn auto_commit(&self, op: impl FnOnce(&mut Tx) -> Result<()>) -> Result<()> {
        let mut tx = self.begin()?;
        match op(&mut tx) {
            Ok(()) => tx.commit(),
            Err(err) => {
                let _ = tx.end();
                Err(err)
            }
        }
    }

    // =========================================================================
    // Watches
    // =========================================================================

    /// Subscribes a handler to events for `M`.
    ///
    /// When the handler wants a snapshot (the default), every writer slot is
    /// parked first so no commit can interleave between the snapshot read
    /// and the registration. The handler then sees every record existing at
    /// subscription time as `created`, one `parity`, and every later commit
    /// in order.
    pub fn watch<M: Record, H: EventHandler<M>>(&self, handler: H) -> Result<Watch> {
        let options = handler.options();
        let pool = self.pool()?;
        let (watch, dispatcher, snapshot) = if options.snapshot {
            let writer = pool.writer()?;
            let snapshot = self.snapshot::<M>(&pool)?;
            let (watch, dispatcher) = self.inner.journal.subscribe::<M, H>(handler);
            drop(writer);
            (watch, dispatcher, snapshot)
        } else {
            let (watch, dispatcher) = self.inner.journal.subscribe::<M, H>(handler);
            (watch, dispatcher, Iter::empty())
        };
        if let Err(err) = dispatcher.start(snapshot) {
            watch.end();
            return Err(err);
        }
        debug!(watch = watch.id(), kind = M::kind(), "watch started");
        Ok(watch)
    }

    /// Ends a watch. Equivalent to [`Watch::end`].
    pub fn end_watch(&self, watch: &Watch) {
        watch.end();
        debug!(watch = watch.id(), "watch ended");
    }

    /// Reads the current records of `M` into an envelope/model spill list.
    fn snapshot<M: Record>(&self, pool: &Pool) -> Result<Iter> {
        let session = pool.reader()?;
        let rows = Table {
            conn: session.conn(),
        }
        .find::<M>(&ListOptions {
            detail: 1,
            ..ListOptions::default()
        })?;
        drop(session);
        let mut list = List::new();
        for row in rows {
            let model = row?;
            let envelope = Envelope {
                id: self.inner.journal.next_event_id(),
                action: Action::Created,
                kind: M::kind().to_string(),
            };
            list.append(&envelope)?;
            list.append(&model)?;
        }
        Ok(list.iter())
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A transaction: buffered writes plus staged events.
///
/// Holds the writer slot for its whole life. Events staged by writes become
/// visible to watches only on [`commit`](Tx::commit); [`end`](Tx::end) (or
/// drop) rolls back and discards them. Both are safe to call twice.
pub struct Tx {
    session: Option<Session>,
    journal: Journal,
    staged: List,
    ended: bool,
}

impl Tx {
    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(Error::Closed)
    }

    /// Fetches the record by primary key within the transaction.
    pub fn get<M: Record>(&self, record: &mut M) -> Result<()> {
        let session = self.session()?;
        Table {
            conn: session.conn(),
        }
        .get(record)
    }

    /// Lists records within the transaction.
    pub fn list<M: Record>(&self, options: &ListOptions) -> Result<Vec<M>> {
        let session = self.session()?;
        Table {
            conn: session.conn(),
        }
        .list(options)
    }

    /// Streams records within the transaction.
    pub fn find<M: Record>(&self, options: &ListOptions) -> Result<TypedIter<M>> {
        let session = self.session()?;
        Table {
            conn: session.conn(),
        }
        .find(options)
    }

    /// Counts records within the transaction.
    pub fn count<M: Record>(&self, predicate: Option<&Predicate>) -> Result<i64> {
        let session = self.session()?;
        Table {
            conn: session.conn(),
        }
        .count::<M>(predicate)
    }

    /// Inserts the record and its labels; stages a `created` event.
    pub fn insert<M: Record>(&mut self, record: &mut M) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::Closed)?;
        let table = Table {
            conn: session.conn(),
        };
        table.insert(record)?;
        Labeler {
            conn: session.conn(),
        }
        .insert(record)?;
        if self.journal.has_watch(M::kind()) {
            let envelope = Envelope {
                id: self.journal.next_event_id(),
                action: Action::Created,
                kind: M::kind().to_string(),
            };
            self.staged.append(&envelope)?;
            self.staged.append(&*record)?;
        }
        debug!(kind = M::kind(), "record inserted");
        Ok(())
    }

    /// Updates the record and replaces its labels; stages an `updated`
    /// event carrying the pre- and post-image.
    ///
    /// When a matching watch exists and the row is missing, the update is a
    /// no-op (the pre-image read discovers the absence first).
    pub fn update<M: Record>(&mut self, record: &mut M) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::Closed)?;
        let table = Table {
            conn: session.conn(),
        };
        let watched = self.journal.has_watch(M::kind());
        let mut current = record.clone();
        if watched {
            match table.get(&mut current) {
                Ok(()) => {}
                Err(Error::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        table.update(record)?;
        Labeler {
            conn: session.conn(),
        }
        .replace(record)?;
        if watched {
            let envelope = Envelope {
                id: self.journal.next_event_id(),
                action: Action::Updated,
                kind: M::kind().to_string(),
            };
            self.staged.append(&envelope)?;
            self.staged.append(&current)?;
            self.staged.append(&*record)?;
        }
        debug!(kind = M::kind(), "record updated");
        Ok(())
    }

    /// Deletes the record and its labels; stages a `deleted` event.
    ///
    /// An absent row is a no-op.
    pub fn delete<M: Record>(&mut self, record: &mut M) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::Closed)?;
        let table = Table {
            conn: session.conn(),
        };
        let watched = self.journal.has_watch(M::kind());
        if watched {
            match table.get(record) {
                Ok(()) => {}
                Err(Error::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        table.delete(record)?;
        Labeler {
            conn: session.conn(),
        }
        .delete(record)?;
        if watched {
            let envelope = Envelope {
                id: self.journal.next_event_id(),
                action: Action::Deleted,
                kind: M::kind().to_string(),
            };
            self.staged.append(&envelope)?;
            self.staged.append(&*record)?;
        }
        debug!(kind = M::kind(), "record deleted");
        Ok(())
    }

    /// Commits buffered writes and hands staged events to the journal.
    ///
    /// The hand-off happens while the writer slot is still held, so watches
    /// observe staged lists in commit order. A second call is a no-op.
    pub fn commit(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        let session = self.session.take().ok_or(Error::Closed)?;
        session.execute_batch("COMMIT")?;
        let staged = std::mem::take(&mut self.staged);
        self.journal.report(staged);
        drop(session);
        debug!("tx committed");
        Ok(())
    }

    /// Rolls back buffered writes and discards staged events.
    ///
    /// A second call (or a call after commit) is a no-op.
    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        let session = self.session.take().ok_or(Error::Closed)?;
        session.execute_batch("ROLLBACK")?;
        self.staged.close();
        debug!("tx ended");
        Ok(())
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.end();
        }
    }
}

// =============================================================================
// Labels
// =============================================================================

/// Keeps label rows in lockstep with their owning record.
struct Labeler<'a> {
    conn: &'a Connection,
}

impl Labeler<'_> {
    fn table(&self) -> Table<'_> {
        Table { conn: self.conn }
    }

    fn insert<M: Record>(&self, record: &M) -> Result<()> {
        let labels = record.labels();
        if labels.is_empty() {
            return Ok(());
        }
        let parent = primary_key(record)?;
        for (name, value) in labels {
            let mut label = Label {
                pk: String::new(),
                parent: parent.clone(),
                kind: M::kind().to_string(),
                name,
                value,
            };
            self.table().insert(&mut label)?;
            trace!(kind = M::kind(), parent = parent.as_str(), "label inserted");
        }
        Ok(())
    }

    fn delete<M: Record>(&self, record: &M) -> Result<()> {
        let parent = primary_key(record)?;
        let rows: Vec<Label> = self.table().list(&ListOptions {
            predicate: Some(and([
                eq("kind", M::kind()),
                eq("parent", parent.as_str()),
            ])),
            ..ListOptions::default()
        })?;
        for mut label in rows {
            self.table().delete(&mut label)?;
            trace!(kind = M::kind(), parent = parent.as_str(), "label deleted");
        }
        Ok(())
    }

    fn replace<M: Record>(&self, record: &M) -> Result<()> {
        self.delete(record)?;
        self.insert(record)
    }
}

/// The record's primary key as a string, generating it when declared
/// generated and unset.
fn primary_key<M: Record>(record: &M) -> Result<String> {
    let def = M::table();
    let mut doc = Document::read(record)?;
    doc.ensure_pk(def)?;
    let pk = def.pk_field()?;
    match doc.pull(pk)? {
        Value::Text(text) => Ok(text),
        Value::Int(n) => Ok(n.to_string()),
    }
}

fn remove_db_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnKind;
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Disk {
        pk: String,
        id: i64,
        name: String,
    }

    impl Record for Disk {
        fn table() -> &'static TableDef {
            static DEF: OnceLock<TableDef> = OnceLock::new();
            DEF.get_or_init(|| {
                TableDef::new("Disk")
                    .field("pk", ColumnKind::Text, "pk(id)")
                    .field("id", ColumnKind::Int, "key")
                    .field("name", ColumnKind::Text, "")
            })
        }
    }

    fn scratch(name: &str) -> (tempfile::TempDir, Db) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let db = Db::builder(dir.path().join(name)).model::<Disk>().build();
        db.open(true).expect("open");
        (dir, db)
    }

    #[test]
    fn test_open_close_idempotent() {
        let (_dir, db) = scratch("a.db");
        db.open(false).expect("reopen is a no-op");
        db.close(false).expect("close");
        db.close(true).expect("close again");
        let mut disk = Disk::default();
        assert!(matches!(db.get(&mut disk), Err(Error::Closed)));
    }

    #[test]
    fn test_auto_commit_insert_visible() {
        let (_dir, db) = scratch("b.db");
        let mut disk = Disk {
            id: 1,
            name: "d1".to_string(),
            ..Disk::default()
        };
        db.insert(&mut disk).expect("insert");
        assert!(!disk.pk.is_empty());

        let mut fetched = Disk {
            id: 1,
            ..Disk::default()
        };
        db.get(&mut fetched).expect("get");
        assert_eq!(fetched.name, "d1");
        assert_eq!(db.count::<Disk>(None).expect("count"), 1);
        db.close(true).expect("close");
    }

    #[test]
    fn test_tx_drop_rolls_back() {
        let (_dir, db) = scratch("c.db");
        {
            let mut tx = db.begin().expect("begin");
            let mut disk = Disk {
                id: 9,
                name: "staged".to_string(),
                ..Disk::default()
            };
            tx.insert(&mut disk).expect("insert");
            // Dropped without commit.
        }
        assert_eq!(db.count::<Disk>(None).expect("count"), 0);
        db.close(true).expect("close");
    }

    #[test]
    fn test_double_commit_and_end_are_safe() {
        let (_dir, db) = scratch("d.db");
        let mut tx = db.begin().expect("begin");
        let mut disk = Disk {
            id: 2,
            name: "d2".to_string(),
            ..Disk::default()
        };
        tx.insert(&mut disk).expect("insert");
        tx.commit().expect("commit");
        tx.commit().expect("second commit is a no-op");
        tx.end().expect("end after commit is a no-op");
        assert_eq!(db.count::<Disk>(None).expect("count"), 1);
        db.close(true).expect("close");
    }
}
