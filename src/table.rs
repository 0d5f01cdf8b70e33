//! # Table Engine
//!
//! One logical table per record kind. The engine synthesizes DDL from a
//! [`TableDef`], then drives parameterized CRUD through the staging
//! [`Document`]: reads scan columns into the document and decode the record,
//! writes pull staged values out of the document into named parameters.
//!
//! ## Statement Shapes
//!
//! ```text
//! CREATE TABLE IF NOT EXISTS Vm (pk TEXT PRIMARY KEY, name TEXT NOT NULL, ...)
//! CREATE INDEX IF NOT EXISTS VmIndex ON Vm (id)              -- natural keys
//! CREATE INDEX IF NOT EXISTS VmaIndex ON Vm (name,age)       -- index group "a"
//! INSERT INTO Vm (pk,name,...) VALUES (:pk,:name,...)
//! UPDATE Vm SET name = :name,... WHERE pk = :pk
//! DELETE FROM Vm WHERE pk = :pk
//! SELECT pk,name,... FROM Vm WHERE <predicate> ORDER BY 2 LIMIT 10 OFFSET 0
//! ```
//!
//! Virtual columns are selected (SQLite resolves `rowid` itself) but never
//! created, inserted, or updated.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::trace;

use crate::error::{Error, Result};
use crate::model::{ColumnKind, Document, FieldDef, Record, TableDef, Value, MAX_DETAIL};
use crate::predicate::{ParamList, Predicate};
use crate::spill::{List, TypedIter};

// =============================================================================
// List Options
// =============================================================================

/// Pagination window rendered as `LIMIT/OFFSET`.
#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

/// Qualifies `list`, `find`, and `count`.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Optional pagination.
    pub page: Option<Page>,
    /// Sort criteria: 1-based positions over the selected column set.
    pub sort: Vec<usize>,
    /// Field detail level; only fields with `detail <= Detail` are selected.
    /// Unselected fields keep their `Default` values on returned records.
    pub detail: u8,
    /// Row filter.
    pub predicate: Option<Predicate>,
}

// =============================================================================
// Table
// =============================================================================

/// The table engine, borrowed over a connection (or transaction's
/// connection) for the duration of one operation.
pub(crate) struct Table<'a> {
    pub conn: &'a Connection,
}

impl Table<'_> {
    // =========================================================================
    // Schema Synthesis
    // =========================================================================

    /// Create-table and index DDL for a record type.
    pub(crate) fn ddl(def: &TableDef) -> Result<Vec<String>> {
        def.validate()?;
        let mut statements = vec![Self::table_ddl(def)];
        statements.extend(Self::key_index_ddl(def));
        statements.extend(Self::group_index_ddl(def));
        Ok(statements)
    }

    fn table_ddl(def: &TableDef) -> String {
        let mut columns: Vec<String> = def.real_fields().map(|field| field.ddl()).collect();
        let mut unique: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for field in def.real_fields() {
            for group in field.unique_groups() {
                unique.entry(group.as_str()).or_default().push(field.name());
            }
        }
        for members in unique.values() {
            columns.push(format!("UNIQUE ({})", members.join(",")));
        }
        for field in def.real_fields() {
            if let Some(fk) = field.fk() {
                columns.push(fk.ddl(field));
            }
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            def.name(),
            columns.join(",")
        )
    }

    fn key_index_ddl(def: &TableDef) -> Option<String> {
        let keys: Vec<&str> = def
            .key_fields()
            .filter(|field| !field.is_virtual())
            .map(|field| field.name())
            .collect();
        if keys.is_empty() {
            return None;
        }
        Some(format!(
            "CREATE INDEX IF NOT EXISTS {}Index ON {} ({})",
            def.name(),
            def.name(),
            keys.join(",")
        ))
    }

    fn group_index_ddl(def: &TableDef) -> Vec<String> {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for field in def.real_fields() {
            for group in field.index_groups() {
                groups.entry(group.as_str()).or_default().push(field.name());
            }
        }
        groups
            .iter()
            .map(|(group, members)| {
                format!(
                    "CREATE INDEX IF NOT EXISTS {}{}Index ON {} ({})",
                    def.name(),
                    group,
                    def.name(),
                    members.join(",")
                )
            })
            .collect()
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Inserts the record, generating the pk if needed.
    ///
    /// A unique-constraint collision falls back to [`update`](Self::update)
    /// on the same row. Incremented columns are reflected back into the
    /// record.
    pub(crate) fn insert<M: Record>(&self, record: &mut M) -> Result<()> {
        let def = M::table();
        let mut doc = Document::read(record)?;
        doc.ensure_pk(def)?;
        Self::bump_incremented(&mut doc, def.real_fields())?;

        let mut params = ParamList::new();
        let mut names = Vec::new();
        let mut tokens = Vec::new();
        for field in def.real_fields() {
            let token = format!(":{}", field.name());
            params.add_named(&token, doc.pull(field)?);
            names.push(field.name());
            tokens.push(token);
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            def.name(),
            names.join(","),
            tokens.join(",")
        );
        match self.conn.execute(&sql, params.bindings().as_slice()) {
            Ok(_) => {}
            Err(err) if is_constraint(&err) => {
                trace!(table = def.name(), "insert collided, updating");
                return self.update(record);
            }
            Err(err) => return Err(err.into()),
        }
        *record = doc.write()?;
        trace!(table = def.name(), sql = sql.as_str(), "row inserted");
        Ok(())
    }

    /// Updates the record's mutable columns by pk.
    ///
    /// Zero affected rows fails with [`Error::NotFound`].
    pub(crate) fn update<M: Record>(&self, record: &mut M) -> Result<()> {
        let def = M::table();
        let mut doc = Document::read(record)?;
        doc.ensure_pk(def)?;
        let pk = def.pk_field()?;
        let mutable: Vec<&FieldDef> = def.mutable_fields().collect();
        if mutable.is_empty() {
            return Ok(());
        }
        Self::bump_incremented(&mut doc, mutable.iter().copied())?;

        let mut params = ParamList::new();
        let mut sets = Vec::new();
        for field in &mutable {
            let token = format!(":{}", field.name());
            params.add_named(&token, doc.pull(field)?);
            sets.push(format!("{} = {}", field.name(), token));
        }
        let pk_token = format!(":{}", pk.name());
        params.add_named(&pk_token, doc.pull(pk)?);
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            def.name(),
            sets.join(","),
            pk.name(),
            pk_token
        );
        let affected = self.conn.execute(&sql, params.bindings().as_slice())?;
        if affected == 0 {
            return Err(Error::NotFound);
        }
        *record = doc.write()?;
        trace!(table = def.name(), sql = sql.as_str(), "row updated");
        Ok(())
    }

    /// Deletes the record's row by pk. An absent row is not an error.
    pub(crate) fn delete<M: Record>(&self, record: &mut M) -> Result<()> {
        let def = M::table();
        let mut doc = Document::read(record)?;
        doc.ensure_pk(def)?;
        let pk = def.pk_field()?;
        let mut params = ParamList::new();
        let pk_token = format!(":{}", pk.name());
        params.add_named(&pk_token, doc.pull(pk)?);
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            def.name(),
            pk.name(),
            pk_token
        );
        self.conn.execute(&sql, params.bindings().as_slice())?;
        *record = doc.write()?;
        trace!(table = def.name(), sql = sql.as_str(), "row deleted");
        Ok(())
    }

    /// Fetches the record's row by pk and populates all columns.
    pub(crate) fn get<M: Record>(&self, record: &mut M) -> Result<()> {
        let def = M::table();
        let mut doc = Document::read(record)?;
        doc.ensure_pk(def)?;
        let pk = def.pk_field()?;
        let fields: Vec<&FieldDef> = def.fields().iter().collect();
        let mut params = ParamList::new();
        let pk_token = format!(":{}", pk.name());
        params.add_named(&pk_token, doc.pull(pk)?);
        let names: Vec<&str> = fields.iter().map(|field| field.name()).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            names.join(","),
            def.name(),
            pk.name(),
            pk_token
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params.bindings().as_slice())?;
        let row = rows.next()?.ok_or(Error::NotFound)?;
        Self::scan(row, &fields, &mut doc)?;
        *record = doc.write()?;
        Ok(())
    }

    /// Lists records qualified by the options.
    pub(crate) fn list<M: Record>(&self, options: &ListOptions) -> Result<Vec<M>> {
        let (sql, params, fields) = Self::list_sql::<M>(options, false)?;
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params.bindings().as_slice())?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut doc = Document::read(&M::default())?;
            Self::scan(row, &fields, &mut doc)?;
            records.push(doc.write()?);
        }
        trace!(
            table = M::kind(),
            sql = sql.as_str(),
            matched = records.len(),
            "list"
        );
        Ok(records)
    }

    /// Same query as [`list`](Self::list), but rows stream through a spill
    /// list so large result sets never sit in memory.
    pub(crate) fn find<M: Record>(&self, options: &ListOptions) -> Result<TypedIter<M>> {
        let (sql, params, fields) = Self::list_sql::<M>(options, false)?;
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params.bindings().as_slice())?;
        let mut spilled = List::new();
        let mut matched = 0u64;
        while let Some(row) = rows.next()? {
            let mut doc = Document::read(&M::default())?;
            Self::scan(row, &fields, &mut doc)?;
            let record: M = doc.write()?;
            spilled.append(&record)?;
            matched += 1;
        }
        trace!(table = M::kind(), sql = sql.as_str(), matched, "find");
        Ok(TypedIter::new(spilled.iter()))
    }

    /// Counts rows matching the predicate.
    pub(crate) fn count<M: Record>(&self, predicate: Option<&Predicate>) -> Result<i64> {
        let options = ListOptions {
            predicate: predicate.cloned(),
            ..ListOptions::default()
        };
        let (sql, params, _) = Self::list_sql::<M>(&options, true)?;
        let count =
            self.conn
                .query_row(&sql, params.bindings().as_slice(), |row| row.get(0))?;
        trace!(table = M::kind(), sql = sql.as_str(), count, "count");
        Ok(count)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn list_sql<M: Record>(
        options: &ListOptions,
        count: bool,
    ) -> Result<(String, ParamList, Vec<&'static FieldDef>)> {
        let def = M::table();
        let detail = options.detail.min(MAX_DETAIL);
        let fields = def.selected(detail);
        let mut params = ParamList::new();
        let mut sql = if count {
            format!("SELECT COUNT(*) FROM {}", def.name())
        } else {
            let names: Vec<&str> = fields.iter().map(|field| field.name()).collect();
            format!("SELECT {} FROM {}", names.join(","), def.name())
        };
        if let Some(predicate) = &options.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate.build(def, &mut params)?);
        }
        if !count {
            if !options.sort.is_empty() {
                let positions: Vec<String> =
                    options.sort.iter().map(|position| position.to_string()).collect();
                sql.push_str(" ORDER BY ");
                sql.push_str(&positions.join(","));
            }
            if let Some(page) = &options.page {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset));
            }
        }
        Ok((sql, params, fields))
    }

    /// Scans one row's columns into the document.
    fn scan(row: &rusqlite::Row<'_>, fields: &[&FieldDef], doc: &mut Document) -> Result<()> {
        for (index, field) in fields.iter().enumerate() {
            let value = match field.kind() {
                ColumnKind::Int | ColumnKind::Bool => Value::Int(row.get::<_, i64>(index)?),
                ColumnKind::Text | ColumnKind::Json => Value::Text(row.get::<_, String>(index)?),
            };
            doc.push(field, value)?;
        }
        Ok(())
    }

    /// Stages `value + 1` for incremented columns ahead of a write.
    fn bump_incremented<'f>(
        doc: &mut Document,
        fields: impl Iterator<Item = &'f FieldDef>,
    ) -> Result<()> {
        for field in fields.filter(|field| field.is_incremented()) {
            if let Value::Int(n) = doc.pull(field)? {
                doc.push(field, Value::Int(n + 1))?;
            }
        }
        Ok(())
    }
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// =============================================================================
// Tests
// =============================================================================
