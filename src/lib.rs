//! # ShelfDB - Embedded Inventory Database
//!
//! ShelfDB is an embedded, single-process inventory database with a live
//! change-notification journal, built on SQLite. It stores typed records
//! reflected from an external source of truth, answers queries with
//! predicates, sorting, pagination, and field-detail selection, and lets
//! subscribers receive a snapshot of current records followed by an ordered
//! stream of create/update/delete events.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Db (facade)                            │
//! │           get / list / find / count / begin / watch             │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐  ┌─────────────────────────────┐
//! │         Session Pool          │  │          Journal            │
//! │  1 writer slot, N reader slots│  │  staged spill lists fan out │
//! │       over one SQLite file    │  │  to per-watch queues (250)  │
//! └───────────────┬───────────────┘  └──────────────┬──────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐  ┌─────────────────────────────┐
//! │         Table Engine          │  │   Watch Dispatch Threads    │
//! │  DDL synthesis, CRUD,         │  │   started → snapshot →      │
//! │  predicates, detail levels    │  │   parity → live → end       │
//! └───────────────────────────────┘  └─────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Label consistency**: after a committed insert/update a record's
//!    label rows equal its `labels()` map; after a delete none remain.
//! 2. **Snapshot parity**: a watch sees exactly one `parity`, only after
//!    all snapshot events and before any live event.
//! 3. **Event ordering**: journal event ids strictly increase; each watch
//!    receives committed events in commit order with no gaps or duplicates
//!    (except an observable queue-overflow drop).
//! 4. **Transaction isolation**: staged events become visible to watches
//!    only on successful commit; rollback discards them.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`spill`]: spill-to-disk event list (staging and result iteration)
//! - [`model`]: record trait, table/field descriptors, labels
//! - [`predicate`]: predicate tree and SQL compilation
//! - [`table`]: schema synthesis and parameterized CRUD
//! - [`journal`]: watches and the event dispatch machinery
//! - [`api`]: the client facade and transactions

/// Error types for shelfdb operations.
pub mod error;

/// Spill-to-disk event list: the append-only, file-backed typed sequence
/// used for event staging and bounded-memory result iteration.
pub mod spill;

/// Records, table definitions, and the field annotation grammar.
pub mod model;

/// Predicates over a record type's columns and labels.
pub mod predicate;

/// Schema synthesis and CRUD over one table per record kind.
pub mod table;

/// The transactional journal and watch dispatcher.
pub mod journal;

/// The database client facade, sessions, and transactions.
pub mod api;

mod pool;

pub use api::{Db, DbBuilder, Tx};
pub use error::{Error, Result};
pub use journal::{Action, Event, EventHandler, Watch, WatchOptions};
pub use model::{ColumnKind, FieldDef, ForeignKey, Label, Labels, Record, TableDef, Value, MAX_DETAIL};
pub use predicate::{and, eq, field, gt, labeled, lt, neq, or, CompareOp, Operand, Predicate};
pub use spill::{List, StoredValue, TypedIter};
pub use table::{ListOptions, Page};
