//! # Session Pool
//!
//! Access to the storage file is gated by slots: one writer and N readers,
//! each slot a pre-opened connection parked in a bounded channel. Acquiring
//! blocks until a slot frees; a [`Session`] returns its slot on drop.
//!
//! Writes therefore serialize on the single writer slot while reads proceed
//! concurrently; WAL mode keeps readers unblocked by the writer. Parking
//! every writer slot (there is one) is the write barrier the watch snapshot
//! path relies on.

use std::path::Path;

use crossbeam_channel::{bounded, Receiver, Sender};
use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};

/// Default number of reader slots.
pub(crate) const DEFAULT_READERS: usize = 4;

// =============================================================================
// Session
// =============================================================================

/// An acquired slot. Derefs to the connection; the slot is returned when the
/// session drops.
pub(crate) struct Session {
    conn: Option<Connection>,
    home: Sender<Connection>,
}

impl Session {
    /// The underlying connection.
    pub(crate) fn conn(&self) -> &Connection {
        // Present from acquisition until drop.
        self.conn.as_ref().expect("session holds its connection")
    }
}

impl std::ops::Deref for Session {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // The pool may already be closed; the connection just drops.
            let _ = self.home.send(conn);
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

struct SlotQueue {
    tx: Sender<Connection>,
    rx: Receiver<Connection>,
}

impl SlotQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    fn park(&self, conn: Connection) {
        let _ = self.tx.send(conn);
    }

    fn acquire(&self) -> Result<Session> {
        let conn = self.rx.recv().map_err(|_| Error::Closed)?;
        Ok(Session {
            conn: Some(conn),
            home: self.tx.clone(),
        })
    }
}

/// One writer slot and N reader slots over a single database file.
pub(crate) struct Pool {
    writers: SlotQueue,
    readers: SlotQueue,
}

impl Pool {
    /// Opens the file and parks the slot connections.
    ///
    /// The writer connection is opened first so the file exists before the
    /// read-only connections attach.
    pub(crate) fn open(path: &Path, readers: usize) -> Result<Pool> {
        let writers = SlotQueue::new(1);
        writers.park(writer_conn(path)?);
        let pool = SlotQueue::new(readers.max(1));
        for _ in 0..readers.max(1) {
            pool.park(reader_conn(path)?);
        }
        debug!(path = %path.display(), readers = readers.max(1), "pool opened");
        Ok(Pool {
            writers,
            readers: pool,
        })
    }

    /// Acquires the writer slot; blocks while another write is in flight.
    pub(crate) fn writer(&self) -> Result<Session> {
        self.writers.acquire()
    }

    /// Acquires a reader slot.
    pub(crate) fn reader(&self) -> Result<Session> {
        self.readers.acquire()
    }
}

fn writer_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

fn reader_conn(path: &Path) -> Result<Connection> {
    // query_only rather than a read-only open: reader connections must still
    // be able to initialize the WAL side files on a fresh database.
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;\n\
         PRAGMA query_only = ON;",
    )?;
    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================
