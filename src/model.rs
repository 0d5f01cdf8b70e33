//! # Records and Table Descriptors
//!
//! A record is a typed aggregate persisted as one row in its kind's table.
//! Since record types are registered at open time rather than reflected at
//! runtime, each type carries a [`TableDef`]: an ordered list of fields with
//! column kinds and storage options. The serde data model does the rest:
//! records flow through a JSON [`Document`] on their way to and from SQL
//! parameters.
//!
//! ## Field Options
//!
//! Options are a comma-separated tag per field, mirroring how the columns
//! behave in storage:
//!
//! | Option | Meaning |
//! |--------|---------|
//! | `pk` | primary key column |
//! | `pk(a;b)` | primary key generated from the listed fields when unset |
//! | `key` | natural key; covered by the table's key index |
//! | `unique(g)` | member of composite unique constraint `g` |
//! | `index(g)` | member of composite non-unique index `g` |
//! | `fk:<table>(field)` | foreign key, ON DELETE CASCADE |
//! | `const` | never updated after insert |
//! | `virtual` | read-only, provided by the storage layer (e.g. `rowid`) |
//! | `incremented` | integer bumped by the storage layer on each write |
//! | `d<N>` | column belongs to detail level N (0..=10) |
//! | `-` | not a column |
//!
//! Unknown options are ignored. Detail defaults to 0 for pk/key fields and
//! 1 otherwise.

use std::collections::BTreeMap;

use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Maximum detail level.
pub const MAX_DETAIL: u8 = 10;

// =============================================================================
// Record Trait
// =============================================================================

/// Named string labels attached to a record.
pub type Labels = BTreeMap<String, String>;

/// A typed aggregate persisted as one row in its kind's table.
///
/// The table name doubles as the record's *kind*, the unit of watch
/// filtering. Implementations describe their columns once:
///
/// ```
/// use std::sync::OnceLock;
/// use serde::{Deserialize, Serialize};
/// use shelfdb::{ColumnKind, Record, TableDef};
///
/// #[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// struct Volume {
///     pk: String,
///     name: String,
///     capacity: i64,
/// }
///
/// impl Record for Volume {
///     fn table() -> &'static TableDef {
///         static DEF: OnceLock<TableDef> = OnceLock::new();
///         DEF.get_or_init(|| {
///             TableDef::new("Volume")
///                 .field("pk", ColumnKind::Text, "pk(name)")
///                 .field("name", ColumnKind::Text, "key")
///                 .field("capacity", ColumnKind::Int, "")
///         })
///     }
/// }
/// ```
///
/// Field names must match the serde field names; fields of the struct that
/// are not declared in the table definition are not stored.
pub trait Record:
    Clone + Default + std::fmt::Debug + Send + Serialize + DeserializeOwned + 'static
{
    /// The table definition for this record type.
    fn table() -> &'static TableDef;

    /// The record kind (the table name).
    fn kind() -> &'static str {
        Self::table().name()
    }

    /// Labels maintained in lockstep with the record's row.
    fn labels(&self) -> Labels {
        Labels::new()
    }
}

// =============================================================================
// Column Values
// =============================================================================

/// A staged column value on its way to or from a SQL parameter.
///
/// Strings and JSON encodings travel as `Text`; integers and booleans
/// travel as `Int` (booleans as 0/1).
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Int(n) => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Integer(*n))),
            Value::Text(s) => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Text(s.clone()))),
        }
    }
}

/// How a field maps to its column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    /// Integer column (INTEGER).
    Int,
    /// Boolean stored as INTEGER 0/1.
    Bool,
    /// String column (TEXT).
    Text,
    /// Compound value (struct, sequence, map) JSON-encoded into TEXT.
    Json,
}

impl ColumnKind {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Int | ColumnKind::Bool => "INTEGER",
            ColumnKind::Text | ColumnKind::Json => "TEXT",
        }
    }
}

// =============================================================================
// Field Definition
// =============================================================================

/// A foreign-key reference parsed from `fk:<table>(field)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub field: String,
}

impl ForeignKey {
    /// Constraint DDL for the owning field.
    pub(crate) fn ddl(&self, field: &FieldDef) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
            field.name, self.table, self.field
        )
    }
}

/// One field of a table definition with its parsed storage options.
#[derive(Clone, Debug)]
pub struct FieldDef {
    name: &'static str,
    kind: ColumnKind,
    pk: bool,
    pk_source: Vec<String>,
    key: bool,
    unique: Vec<String>,
    index: Vec<String>,
    fk: Option<ForeignKey>,
    constant: bool,
    virtual_: bool,
    incremented: bool,
    detail: u8,
}

impl FieldDef {
    fn parse(name: &'static str, kind: ColumnKind, tag: &str) -> FieldDef {
        let mut pk = false;
        let mut pk_source = Vec::new();
        let mut key = false;
        let mut unique = Vec::new();
        let mut index = Vec::new();
        let mut fk = None;
        let mut constant = false;
        let mut virtual_ = false;
        let mut incremented = false;
        let mut detail = None;

        for opt in tag.split(',').map(str::trim).filter(|opt| !opt.is_empty()) {
            if opt == "pk" {
                pk = true;
            } else if let Some(inner) = strip_call(opt, "pk") {
                pk = true;
                pk_source = inner
                    .split(';')
                    .map(|part| part.trim().to_ascii_lowercase())
                    .filter(|part| !part.is_empty())
                    .collect();
            } else if opt == "key" {
                key = true;
            } else if let Some(group) = strip_call(opt, "unique") {
                unique.push(group.to_string());
            } else if let Some(group) = strip_call(opt, "index") {
                index.push(group.to_string());
            } else if let Some(rest) = opt.strip_prefix("fk:") {
                if let Some((table, field)) = rest.split_once('(') {
                    if let Some(field) = field.strip_suffix(')') {
                        fk = Some(ForeignKey {
                            table: table.trim().to_string(),
                            field: field.trim().to_string(),
                        });
                    }
                }
            } else if opt == "const" {
                constant = true;
            } else if opt == "virtual" {
                virtual_ = true;
            } else if opt == "incremented" {
                incremented = true;
            } else if let Some(level) = opt.strip_prefix('d') {
                if let Ok(level) = level.parse::<u8>() {
                    if level <= MAX_DETAIL {
                        detail = Some(level);
                    }
                }
            }
            // Unknown options are tolerated.
        }

        let detail = detail.unwrap_or(if pk || key { 0 } else { 1 });
        FieldDef {
            name,
            kind,
            pk,
            pk_source,
            key,
            unique,
            index,
            fk,
            constant,
            virtual_,
            incremented,
            detail,
        }
    }

    /// Field (and column) name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Column mapping kind.
    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    /// Whether this is the primary key column.
    pub fn is_pk(&self) -> bool {
        self.pk
    }

    /// Lower-cased names of the fields a generated pk is hashed from.
    /// Empty when the pk is not generated.
    pub fn pk_source(&self) -> &[String] {
        &self.pk_source
    }

    /// Whether this is a natural-key column.
    pub fn is_key(&self) -> bool {
        self.key
    }

    /// Unique-constraint groups this field participates in.
    pub fn unique_groups(&self) -> &[String] {
        &self.unique
    }

    /// Index groups this field participates in.
    pub fn index_groups(&self) -> &[String] {
        &self.index
    }

    /// Foreign-key reference, if declared.
    pub fn fk(&self) -> Option<&ForeignKey> {
        self.fk.as_ref()
    }

    /// Whether the column is read-only and provided by the storage layer.
    pub fn is_virtual(&self) -> bool {
        self.virtual_
    }

    /// Whether the storage layer bumps the value on each write.
    pub fn is_incremented(&self) -> bool {
        self.incremented
    }

    /// Whether updates touch this column.
    pub fn is_mutable(&self) -> bool {
        !self.pk && !self.key && !self.virtual_ && !self.constant
    }

    /// The detail level this column belongs to.
    pub fn detail(&self) -> u8 {
        self.detail
    }

    /// Whether this column is selected at the given detail level.
    pub fn matches_detail(&self, level: u8) -> bool {
        self.detail <= level
    }

    /// Column DDL fragment.
    pub(crate) fn ddl(&self) -> String {
        let constraint = if self.pk { "PRIMARY KEY" } else { "NOT NULL" };
        format!("{} {} {}", self.name, self.kind.sql_type(), constraint)
    }

    fn validate(&self) -> Result<()> {
        if self.pk {
            match self.kind {
                ColumnKind::Text => {}
                ColumnKind::Int => {
                    if !self.pk_source.is_empty() {
                        return Err(Error::Schema(format!(
                            "pk field '{}' must be text when generated",
                            self.name
                        )));
                    }
                }
                _ => {
                    return Err(Error::Schema(format!(
                        "pk field '{}' must be int or text",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn strip_call<'a>(opt: &'a str, name: &str) -> Option<&'a str> {
    opt.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

// =============================================================================
// Table Definition
// =============================================================================

/// The relational shape of a record type: table name plus ordered fields.
#[derive(Clone, Debug)]
pub struct TableDef {
    name: &'static str,
    fields: Vec<FieldDef>,
}

impl TableDef {
    /// Starts a definition for the named table.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
        }
    }

    /// Declares a field. A tag of `-` leaves the field out of storage.
    pub fn field(mut self, name: &'static str, kind: ColumnKind, tag: &str) -> Self {
        if tag.trim() == "-" {
            return self;
        }
        self.fields.push(FieldDef::parse(name, kind, tag));
        self
    }

    /// Table (and kind) name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// All declared fields, in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// The primary key field.
    pub(crate) fn pk_field(&self) -> Result<&FieldDef> {
        self.fields
            .iter()
            .find(|field| field.pk)
            .ok_or_else(|| Error::Schema(format!("table '{}' must have a pk field", self.name)))
    }

    /// Field lookup by name, case-insensitive.
    pub(crate) fn field_named(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
    }

    /// Fields with real columns (non-virtual).
    pub(crate) fn real_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|field| !field.virtual_)
    }

    /// Natural-key fields.
    pub(crate) fn key_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|field| field.key)
    }

    /// Fields updates touch.
    pub(crate) fn mutable_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|field| field.is_mutable())
    }

    /// Fields selected at a detail level.
    pub(crate) fn selected(&self, detail: u8) -> Vec<&FieldDef> {
        self.fields
            .iter()
            .filter(|field| field.matches_detail(detail))
            .collect()
    }

    /// Validates the definition; run once at open.
    pub(crate) fn validate(&self) -> Result<()> {
        self.pk_field()?;
        for field in &self.fields {
            field.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Staging Document
// =============================================================================

/// A record flattened into its serde object form.
///
/// Reads go `column value → document → record`, writes go
/// `record → document → parameter`. The document owns pk generation and
/// the reflection of incremented columns back into the record.
pub(crate) struct Document {
    map: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub(crate) fn read<M: Record>(record: &M) -> Result<Self> {
        match serde_json::to_value(record).map_err(Error::Encode)? {
            serde_json::Value::Object(map) => Ok(Self { map }),
            _ => Err(Error::Schema(format!(
                "{} does not serialize to an object",
                M::kind()
            ))),
        }
    }

    pub(crate) fn write<M: Record>(&self) -> Result<M> {
        serde_json::from_value(serde_json::Value::Object(self.map.clone())).map_err(Error::Decode)
    }

    /// Stages a field out of the document as a column value.
    pub(crate) fn pull(&self, field: &FieldDef) -> Result<Value> {
        let value = self.map.get(field.name()).ok_or_else(|| {
            Error::Schema(format!("field '{}' missing from record", field.name()))
        })?;
        match field.kind() {
            ColumnKind::Int => value.as_i64().map(Value::Int).ok_or_else(|| {
                Error::Schema(format!("field '{}' is not an integer", field.name()))
            }),
            ColumnKind::Bool => value
                .as_bool()
                .map(|flag| Value::Int(i64::from(flag)))
                .ok_or_else(|| {
                    Error::Schema(format!("field '{}' is not a boolean", field.name()))
                }),
            ColumnKind::Text => value
                .as_str()
                .map(|text| Value::Text(text.to_string()))
                .ok_or_else(|| Error::Schema(format!("field '{}' is not a string", field.name()))),
            ColumnKind::Json => Ok(Value::Text(
                serde_json::to_string(value).map_err(Error::Encode)?,
            )),
        }
    }

    /// Pushes a column value back into the document.
    pub(crate) fn push(&mut self, field: &FieldDef, value: Value) -> Result<()> {
        let staged = match (field.kind(), value) {
            (ColumnKind::Int, Value::Int(n)) => serde_json::Value::from(n),
            (ColumnKind::Bool, Value::Int(n)) => serde_json::Value::Bool(n != 0),
            (ColumnKind::Text, Value::Text(s)) => serde_json::Value::String(s),
            (ColumnKind::Json, Value::Text(s)) => {
                if s.is_empty() {
                    return Ok(());
                }
                serde_json::from_str(&s).map_err(Error::Decode)?
            }
            (_, staged) => {
                return Err(Error::Schema(format!(
                    "field '{}' cannot accept {:?}",
                    field.name(),
                    staged
                )));
            }
        };
        self.map.insert(field.name().to_string(), staged);
        Ok(())
    }

    /// Generates the primary key when declared generated and unset.
    ///
    /// The hash is SHA-1 over the source fields in declaration order: text
    /// fields as raw bytes, int and bool fields as big-endian `i64`. JSON
    /// fields contribute nothing.
    pub(crate) fn ensure_pk(&mut self, table: &TableDef) -> Result<()> {
        let pk = table.pk_field()?;
        if pk.pk_source().is_empty() || pk.kind() != ColumnKind::Text {
            return Ok(());
        }
        match self.pull(pk)? {
            Value::Text(current) if current.is_empty() => {}
            _ => return Ok(()),
        }
        let mut hasher = Sha1::new();
        for field in table.fields() {
            let name = field.name().to_ascii_lowercase();
            if !pk.pk_source().iter().any(|source| *source == name) {
                continue;
            }
            match (field.kind(), self.pull(field)?) {
                (ColumnKind::Text, Value::Text(text)) => hasher.update(text.as_bytes()),
                (ColumnKind::Int | ColumnKind::Bool, Value::Int(n)) => {
                    hasher.update(n.to_be_bytes())
                }
                _ => {}
            }
        }
        self.push(pk, Value::Text(hex::encode(hasher.finalize())))
    }
}

// =============================================================================
// Label
// =============================================================================

/// A label row: one `(name, value)` pair owned by a record.
///
/// Labels are created, replaced, and deleted in lockstep with the owning
/// record. The pk is generated from `(parent, kind, name)`, which also
/// carries a composite unique constraint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    /// Generated primary key.
    pub pk: String,
    /// Owning record's primary key.
    pub parent: String,
    /// Owning record's kind.
    pub kind: String,
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Record for Label {
    fn table() -> &'static TableDef {
        static DEF: std::sync::OnceLock<TableDef> = std::sync::OnceLock::new();
        DEF.get_or_init(|| {
            TableDef::new("Label")
                .field("pk", ColumnKind::Text, "pk(parent;kind;name)")
                .field("parent", ColumnKind::Text, "unique(label)")
                .field("kind", ColumnKind::Text, "unique(label)")
                .field("name", ColumnKind::Text, "unique(label)")
                .field("value", ColumnKind::Text, "")
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
