//! # Error Handling
//!
//! One error enum covers the whole crate. Most operations fail in the same
//! handful of ways (SQLite errors, missing rows, bad predicates), and a single
//! enum keeps signatures uniform for callers that want to log-and-propagate.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Absent row | [`Error::NotFound`] | expected; branch on it |
//! | Caller mistake | `PredicateRef`, `PredicateType`, `PredicateValue` | fix the query |
//! | Fatal at open | [`Error::Schema`] | fix the model definitions |
//! | Delivery loss | [`Error::QueueOverflow`] | resubscribe or accept the gap |
//! | Environment | `Sqlite`, `Io`, `Encode`, `Decode` | log and investigate |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors produced by shelfdb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested row does not exist.
    ///
    /// Returned by `get` and by `update` when zero rows are affected.
    /// `delete` treats an absent row as success.
    #[error("record not found")]
    NotFound,

    /// Schema synthesis or DDL execution failed at open.
    ///
    /// Fatal for [`Db::open`](crate::Db::open): the pool is torn down and the
    /// database is unusable until the model definitions are corrected.
    #[error("schema error: {0}")]
    Schema(String),

    /// A predicate referenced a field the table does not have.
    #[error("predicate referenced unknown field '{0}'")]
    PredicateRef(String),

    /// A predicate is not supported for the referenced field's column type.
    #[error("predicate not valid for field '{0}'")]
    PredicateType(String),

    /// A predicate literal could not be coerced to the field's column type.
    #[error("predicate value not valid for field '{0}'")]
    PredicateValue(String),

    /// A watch's inbound queue was full at commit fan-out.
    ///
    /// The delivery for that commit was dropped. This is the only point at
    /// which event loss is permitted; the subscriber observes it through
    /// [`EventHandler::error`](crate::EventHandler::error).
    #[error("watch queue full, events discarded")]
    QueueOverflow,

    /// A value could not be JSON-encoded for storage.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored value could not be decoded back into its type.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// A spill-list entry carried a kind absent from the catalog.
    ///
    /// Readers can only rebuild values whose types have been appended (and
    /// thereby registered) in this process.
    #[error("kind {0} not registered in the catalog")]
    UnknownKind(u16),

    /// A spill stream violated its own framing (e.g. an event envelope with
    /// no model entry after it).
    #[error("spill list corrupted: {0}")]
    Spill(String),

    /// A session was requested after the database was closed.
    #[error("database closed")]
    Closed,

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File or pool I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is [`Error::NotFound`].
    ///
    /// Convenience for callers that treat an absent row as a normal branch.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// A `Result` alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
