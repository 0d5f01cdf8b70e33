//! # Spill-To-Disk Event List
//!
//! A write-once, append-only list of heterogeneous typed values, backed by a
//! file so that large event batches and result sets never have to fit in
//! memory. Transactions stage their events in one, `find` streams result rows
//! through one, and the journal fans readers over one out to every watch.
//!
//! ## File Format
//!
//! ```text
//! header:  count    u64 LE          number of values written so far
//! entry:   kind     u16 LE          catalog kind of the value's type
//!          length   u64 LE          encoded payload length in bytes
//!          payload  length bytes    JSON-encoded value
//! ```
//!
//! The header is rewritten after every append, so a reader opened mid-write
//! sees a consistent prefix. Payloads are self-describing JSON; the catalog
//! maps the `kind` tag back to a concrete Rust type for untyped readers.
//!
//! ## Ownership
//!
//! The writer owns the original file and deletes it on close. Each reader is
//! handed a hardlinked copy taken after an fsync, owns that copy, and unlinks
//! it on close, so readers survive the writer and each other. `Drop` closes
//! both, which is the safety net for forgotten closes; explicit `close` is
//! the contract.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// File extension for spill files.
pub const EXTENSION: &str = ".spill";

// =============================================================================
// Working Directory
// =============================================================================

static WORK_DIR: OnceLock<RwLock<PathBuf>> = OnceLock::new();

fn work_dir_lock() -> &'static RwLock<PathBuf> {
    WORK_DIR.get_or_init(|| RwLock::new(std::env::temp_dir()))
}

/// Sets the process-wide directory for spill files.
///
/// Lists created with [`List::new`] after this call land in `path`.
/// [`List::in_dir`] overrides it per list.
pub fn set_work_dir(path: impl Into<PathBuf>) {
    *work_dir_lock().write() = path.into();
}

/// Returns the current spill working directory.
pub fn work_dir() -> PathBuf {
    work_dir_lock().read().clone()
}

fn new_path(dir: &std::path::Path) -> PathBuf {
    dir.join(format!("{}{}", Uuid::new_v4(), EXTENSION))
}

// =============================================================================
// Catalog
// =============================================================================

/// Marker for types that can be stored in a spill list.
///
/// Blanket-implemented for anything serde can round-trip. A type is assigned
/// a catalog kind the first time a value of it is appended in this process;
/// kinds are dense from 0 in first-appearance order.
pub trait Stored: Serialize + DeserializeOwned + Send + Any {}

impl<T> Stored for T where T: Serialize + DeserializeOwned + Send + Any {}

struct Prototype {
    type_name: &'static str,
    decode: fn(&[u8]) -> Result<Box<dyn Any + Send>>,
}

fn decode_boxed<T: Stored>(payload: &[u8]) -> Result<Box<dyn Any + Send>> {
    let value: T = serde_json::from_slice(payload).map_err(Error::Decode)?;
    Ok(Box::new(value))
}

#[derive(Default)]
struct Catalog {
    by_type: HashMap<TypeId, u16>,
    prototypes: Vec<Prototype>,
}

impl Catalog {
    fn assign<T: Stored>(&mut self) -> u16 {
        let id = TypeId::of::<T>();
        if let Some(kind) = self.by_type.get(&id) {
            return *kind;
        }
        let kind = self.prototypes.len() as u16;
        self.prototypes.push(Prototype {
            type_name: std::any::type_name::<T>(),
            decode: decode_boxed::<T>,
        });
        self.by_type.insert(id, kind);
        kind
    }

    fn build(&self, kind: u16, payload: &[u8]) -> Result<StoredValue> {
        let proto = self
            .prototypes
            .get(kind as usize)
            .ok_or(Error::UnknownKind(kind))?;
        Ok(StoredValue {
            kind,
            type_name: proto.type_name,
            value: (proto.decode)(payload)?,
        })
    }
}

static CATALOG: OnceLock<Mutex<Catalog>> = OnceLock::new();

fn catalog() -> &'static Mutex<Catalog> {
    CATALOG.get_or_init(|| Mutex::new(Catalog::default()))
}

/// A value decoded from a spill list without knowing its type up front.
///
/// Carries the catalog kind and the type name; consumers switch on kind or
/// [`downcast`](StoredValue::downcast) to the concrete type.
pub struct StoredValue {
    kind: u16,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl StoredValue {
    /// The catalog kind tag this value was stored under.
    pub fn kind(&self) -> u16 {
        self.kind
    }

    /// The Rust type name of the stored value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the stored value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Consumes the wrapper, returning the value if it is a `T`.
    pub fn downcast<T: Any>(self) -> Option<T> {
        self.value.downcast::<T>().ok().map(|boxed| *boxed)
    }
}

impl std::fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredValue")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .finish()
    }
}

// =============================================================================
// Writer
// =============================================================================

struct Writer {
    dir: PathBuf,
    path: Option<PathBuf>,
    file: Option<File>,
    length: u64,
}

impl Writer {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            path: None,
            file: None,
            length: 0,
        }
    }

    /// Opens the backing file on first use and writes the zero header.
    fn handle(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let path = new_path(&self.dir);
            let mut file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(&0u64.to_le_bytes())?;
            self.path = Some(path);
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(Error::Spill("writer closed".to_string())),
        }
    }

    fn append(&mut self, kind: u16, payload: &[u8]) -> Result<()> {
        let length = self.length + 1;
        let file = self.handle()?;
        file.write_all(&kind.to_le_bytes())?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(payload)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&length.to_le_bytes())?;
        file.seek(SeekFrom::End(0))?;
        self.length = length;
        Ok(())
    }

    /// Hardlinks the current file for an independent reader.
    fn reader(&self) -> Result<Iter> {
        let (path, file) = match (&self.path, &self.file) {
            (Some(path), Some(file)) => (path, file),
            _ => return Ok(Iter::empty()),
        };
        file.sync_all()?;
        let copy = new_path(&self.dir);
        std::fs::hard_link(path, &copy)?;
        Ok(Iter {
            path: Some(copy),
            file: None,
            error: None,
            failed: false,
        })
    }

    fn close(&mut self) {
        self.file = None;
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// List
// =============================================================================

/// A file-backed, append-only list of typed values.
///
/// ```no_run
/// use shelfdb::spill::List;
///
/// let mut list = List::new();
/// list.append(&42i64)?;
/// list.append(&"hello".to_string())?;
/// let mut iter = list.iter();
/// while let Some(value) = iter.next()? {
///     println!("{}", value.type_name());
/// }
/// # Ok::<(), shelfdb::Error>(())
/// ```
pub struct List {
    writer: Writer,
}

impl List {
    /// Creates an empty list in the process working directory.
    ///
    /// The backing file is created lazily at first append.
    pub fn new() -> Self {
        Self {
            writer: Writer::new(work_dir()),
        }
    }

    /// Creates an empty list in an explicit directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            writer: Writer::new(dir.into()),
        }
    }

    /// Appends a value, assigning its type a catalog kind if new.
    pub fn append<T: Stored>(&mut self, value: &T) -> Result<()> {
        let kind = catalog().lock().assign::<T>();
        let payload = serde_json::to_vec(value).map_err(Error::Encode)?;
        self.writer.append(kind, &payload)
    }

    /// Number of values appended.
    pub fn len(&self) -> u64 {
        self.writer.length
    }

    /// Whether nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.writer.length == 0
    }

    /// Returns an independent reader over the values appended so far.
    ///
    /// The reader owns a hardlinked copy of the file and survives the list's
    /// close. A linking failure is latched into the returned iterator and
    /// surfaces through [`Iter::error`].
    pub fn iter(&self) -> Iter {
        if self.is_empty() {
            return Iter::empty();
        }
        match self.writer.reader() {
            Ok(iter) => iter,
            Err(err) => Iter::failed(err),
        }
    }

    /// Closes the list and deletes the backing file.
    ///
    /// Readers taken earlier keep their own copies.
    pub fn close(&mut self) {
        self.writer.close();
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Iter
// =============================================================================

/// Stateful reader over a spill list.
///
/// The first read failure is returned once and latched; subsequent calls
/// yield no data and [`error`](Iter::error) reports the cause. Closing is
/// idempotent and unlinks the reader's file copy.
pub struct Iter {
    path: Option<PathBuf>,
    file: Option<File>,
    error: Option<String>,
    failed: bool,
}

impl Iter {
    /// An iterator over nothing.
    pub fn empty() -> Self {
        Self {
            path: None,
            file: None,
            error: None,
            failed: false,
        }
    }

    fn failed(err: Error) -> Self {
        Self {
            path: None,
            file: None,
            error: Some(err.to_string()),
            failed: true,
        }
    }

    /// The latched read error, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of values in the list, read from the header without
    /// disturbing the cursor. Zero for empty or failed iterators.
    pub fn len(&mut self) -> u64 {
        if self.failed {
            return 0;
        }
        match self.read_len() {
            Ok(length) => length,
            Err(_) => 0,
        }
    }

    /// Decodes the next value through the catalog.
    ///
    /// Returns `Ok(None)` at end of stream.
    pub fn next(&mut self) -> Result<Option<StoredValue>> {
        if self.failed {
            return Ok(None);
        }
        let outcome = self.next_inner();
        self.latch(outcome)
    }

    /// Decodes the next value as a `T`, skipping the catalog lookup.
    ///
    /// The caller asserts the type; a mismatched entry fails decode.
    pub fn next_as<T: Stored>(&mut self) -> Result<Option<T>> {
        if self.failed {
            return Ok(None);
        }
        let outcome = self.next_as_inner::<T>();
        self.latch(outcome)
    }

    /// Advances past one entry without decoding it.
    ///
    /// Returns whether an entry was present.
    pub(crate) fn skip(&mut self) -> Result<bool> {
        if self.failed {
            return Ok(false);
        }
        let outcome = self.skip_inner();
        match self.latch(outcome.map(Some)) {
            Ok(skipped) => Ok(skipped.unwrap_or(false)),
            Err(err) => Err(err),
        }
    }

    /// Closes the iterator and deletes its file copy. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }

    fn latch<T>(&mut self, outcome: Result<Option<T>>) -> Result<Option<T>> {
        if let Err(err) = &outcome {
            self.error = Some(err.to_string());
            self.failed = true;
        }
        outcome
    }

    fn next_inner(&mut self) -> Result<Option<StoredValue>> {
        let entry = self.read_entry()?;
        match entry {
            Some((kind, payload)) => {
                let value = catalog().lock().build(kind, &payload)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn next_as_inner<T: Stored>(&mut self) -> Result<Option<T>> {
        let entry = self.read_entry()?;
        match entry {
            Some((_, payload)) => {
                let value = serde_json::from_slice(&payload).map_err(Error::Decode)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn skip_inner(&mut self) -> Result<bool> {
        let Some(file) = self.open_lazy()? else {
            return Ok(false);
        };
        let mut kind = [0u8; 2];
        if !read_or_eof(file, &mut kind)? {
            return Ok(false);
        }
        let mut length = [0u8; 8];
        if !read_or_eof(file, &mut length)? {
            return Ok(false);
        }
        file.seek(SeekFrom::Current(u64::from_le_bytes(length) as i64))?;
        Ok(true)
    }

    /// Reads one framed entry; `None` at end of stream.
    fn read_entry(&mut self) -> Result<Option<(u16, Vec<u8>)>> {
        let Some(file) = self.open_lazy()? else {
            return Ok(None);
        };
        let mut kind = [0u8; 2];
        if !read_or_eof(file, &mut kind)? {
            return Ok(None);
        }
        let mut length = [0u8; 8];
        if !read_or_eof(file, &mut length)? {
            return Ok(None);
        }
        let mut payload = vec![0u8; u64::from_le_bytes(length) as usize];
        if !read_or_eof(file, &mut payload)? {
            return Ok(None);
        }
        Ok(Some((u16::from_le_bytes(kind), payload)))
    }

    /// Opens the file copy on first use, positioned past the header.
    /// `None` means the iterator is empty.
    fn open_lazy(&mut self) -> Result<Option<&mut File>> {
        if self.file.is_none() {
            let Some(path) = &self.path else {
                return Ok(None);
            };
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(8))?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut())
    }

    fn read_len(&mut self) -> Result<u64> {
        let Some(file) = self.open_lazy()? else {
            return Ok(0);
        };
        let mark = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 8];
        let length = if read_or_eof(file, &mut header)? {
            u64::from_le_bytes(header)
        } else {
            0
        };
        file.seek(SeekFrom::Start(mark))?;
        Ok(length)
    }
}

impl Drop for Iter {
    fn drop(&mut self) {
        self.close();
    }
}

/// `read_exact` with end-of-stream mapped to `Ok(false)`.
fn read_or_eof(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

// =============================================================================
// Typed Iteration
// =============================================================================

/// Iterator adapter yielding values of a single known type.
///
/// Returned by `find`: result rows spill to disk and stream back out with
/// bounded memory.
pub struct TypedIter<T> {
    iter: Iter,
    _marker: PhantomData<T>,
}

impl<T: Stored> TypedIter<T> {
    pub(crate) fn new(iter: Iter) -> Self {
        Self {
            iter,
            _marker: PhantomData,
        }
    }

    /// Number of values in the underlying list.
    pub fn len(&mut self) -> u64 {
        self.iter.len()
    }

    /// The latched read error, if any.
    pub fn error(&self) -> Option<&str> {
        self.iter.error()
    }
}

impl<T: Stored> Iterator for TypedIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.iter.next_as::<T>() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
