//! # Predicates
//!
//! A predicate is a compiled expression over a record type's columns and
//! labels. Trees are built from free-function constructors and compiled
//! against a [`TableDef`] into a SQL expression plus named parameters:
//!
//! ```
//! use shelfdb::{and, eq, gt, neq, Predicate};
//!
//! let even_adults: Predicate = and([
//!     neq("id", 1),
//!     neq("id", 3),
//!     gt("age", 17),
//! ]);
//! let by_name = eq("name", "Elmer");
//! ```
//!
//! Literals are coerced to the referenced column's kind the way the storage
//! layer stages them (bools into text as `"true"`/`"false"`, ints parsed out
//! of strings, and so on); values that cannot coerce fail compilation with
//! [`Error::PredicateValue`]. Unknown fields fail with
//! [`Error::PredicateRef`]; JSON columns cannot be compared and fail with
//! [`Error::PredicateType`].

use rusqlite::ToSql;

use crate::error::{Error, Result};
use crate::model::{ColumnKind, FieldDef, Labels, TableDef, Value};

// =============================================================================
// Parameter List
// =============================================================================

/// Named parameters accumulated while compiling a statement.
///
/// Parameter names are `:{field}{ordinal}` so repeated references to one
/// field stay distinct.
#[derive(Default)]
pub(crate) struct ParamList {
    params: Vec<(String, Value)>,
}

impl ParamList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a value and returns its parameter token.
    pub(crate) fn add(&mut self, name: &str, value: Value) -> String {
        let param = format!(":{}{}", name, self.params.len());
        self.params.push((param.clone(), value));
        param
    }

    /// Adds a parameter with an exact name (no ordinal suffix).
    pub(crate) fn add_named(&mut self, param: &str, value: Value) {
        self.params.push((param.to_string(), value));
    }

    /// Binding slice for rusqlite.
    pub(crate) fn bindings(&self) -> Vec<(&str, &dyn ToSql)> {
        self.params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect()
    }
}

// =============================================================================
// Predicate Tree
// =============================================================================

/// Comparison operator of a leaf predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Gt,
}

impl CompareOp {
    fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
        }
    }
}

/// Right-hand side of a comparison: a literal or another field.
#[derive(Clone, Debug)]
pub enum Operand {
    Int(i64),
    Bool(bool),
    Text(String),
    /// Reference to another column of the same table.
    Field(String),
}

impl From<i64> for Operand {
    fn from(n: i64) -> Self {
        Operand::Int(n)
    }
}

impl From<i32> for Operand {
    fn from(n: i32) -> Self {
        Operand::Int(n as i64)
    }
}

impl From<bool> for Operand {
    fn from(flag: bool) -> Self {
        Operand::Bool(flag)
    }
}

impl From<&str> for Operand {
    fn from(text: &str) -> Self {
        Operand::Text(text.to_string())
    }
}

impl From<String> for Operand {
    fn from(text: String) -> Self {
        Operand::Text(text)
    }
}

/// References another column as a comparison operand.
pub fn field(name: impl Into<String>) -> Operand {
    Operand::Field(name.into())
}

/// A compiled expression over a record type's columns and labels.
#[derive(Clone, Debug)]
pub enum Predicate {
    /// All children must hold.
    And(Vec<Predicate>),
    /// Any child must hold.
    Or(Vec<Predicate>),
    /// Leaf comparison between a field and an operand.
    Compare(CompareOp, String, Operand),
    /// The record owns every listed label pair.
    Labeled(Labels),
}

/// Field equals operand.
pub fn eq(field: impl Into<String>, value: impl Into<Operand>) -> Predicate {
    Predicate::Compare(CompareOp::Eq, field.into(), value.into())
}

/// Field does not equal operand.
pub fn neq(field: impl Into<String>, value: impl Into<Operand>) -> Predicate {
    Predicate::Compare(CompareOp::Neq, field.into(), value.into())
}

/// Field is less than operand.
pub fn lt(field: impl Into<String>, value: impl Into<Operand>) -> Predicate {
    Predicate::Compare(CompareOp::Lt, field.into(), value.into())
}

/// Field is greater than operand.
pub fn gt(field: impl Into<String>, value: impl Into<Operand>) -> Predicate {
    Predicate::Compare(CompareOp::Gt, field.into(), value.into())
}

/// All of the given predicates hold.
pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Predicate {
    Predicate::And(predicates.into_iter().collect())
}

/// Any of the given predicates holds.
pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Predicate {
    Predicate::Or(predicates.into_iter().collect())
}

/// The record owns every listed label pair.
pub fn labeled(labels: Labels) -> Predicate {
    Predicate::Labeled(labels)
}

impl Predicate {
    /// Compiles to a SQL expression, appending parameters to `params`.
    pub(crate) fn build(&self, table: &TableDef, params: &mut ParamList) -> Result<String> {
        match self {
            Predicate::And(children) => combine(children, " AND ", table, params),
            Predicate::Or(children) => combine(children, " OR ", table, params),
            Predicate::Compare(op, name, operand) => {
                let column = table
                    .field_named(name)
                    .ok_or_else(|| Error::PredicateRef(name.clone()))?;
                match operand {
                    Operand::Field(other) => {
                        let other = table
                            .field_named(other)
                            .ok_or_else(|| Error::PredicateRef(other.clone()))?;
                        Ok(format!("{} {} {}", column.name(), op.sql(), other.name()))
                    }
                    literal => {
                        let value = coerce(column, literal)?;
                        let param = params.add(column.name(), value);
                        Ok(format!("{} {} {}", column.name(), op.sql(), param))
                    }
                }
            }
            Predicate::Labeled(labels) => {
                if labels.is_empty() {
                    return Err(Error::PredicateValue("labels".to_string()));
                }
                let pk = table.pk_field()?;
                let mut parts = Vec::with_capacity(labels.len());
                for (name, value) in labels {
                    let kind = params.add("labelKind", Value::Text(table.name().to_string()));
                    let label = params.add("labelName", Value::Text(name.clone()));
                    let wanted = params.add("labelValue", Value::Text(value.clone()));
                    parts.push(format!(
                        "{} IN (SELECT parent FROM Label WHERE kind = {} AND name = {} AND value = {})",
                        pk.name(),
                        kind,
                        label,
                        wanted
                    ));
                }
                Ok(format!("({})", parts.join(" AND ")))
            }
        }
    }
}

fn combine(
    children: &[Predicate],
    joint: &str,
    table: &TableDef,
    params: &mut ParamList,
) -> Result<String> {
    if children.is_empty() {
        return Err(Error::PredicateValue("empty predicate".to_string()));
    }
    let mut parts = Vec::with_capacity(children.len());
    for child in children {
        parts.push(child.build(table, params)?);
    }
    Ok(format!("({})", parts.join(joint)))
}

/// Coerces a literal to the column's staged representation.
fn coerce(column: &FieldDef, operand: &Operand) -> Result<Value> {
    let invalid = || Error::PredicateValue(column.name().to_string());
    match column.kind() {
        ColumnKind::Text => match operand {
            Operand::Text(text) => Ok(Value::Text(text.clone())),
            Operand::Bool(flag) => Ok(Value::Text(flag.to_string())),
            Operand::Int(n) => Ok(Value::Text(n.to_string())),
            Operand::Field(_) => Err(invalid()),
        },
        ColumnKind::Bool => match operand {
            Operand::Text(text) => text
                .parse::<bool>()
                .map(|flag| Value::Int(i64::from(flag)))
                .map_err(|_| invalid()),
            Operand::Bool(flag) => Ok(Value::Int(i64::from(*flag))),
            Operand::Int(n) => Ok(Value::Int(i64::from(*n != 0))),
            Operand::Field(_) => Err(invalid()),
        },
        ColumnKind::Int => match operand {
            Operand::Text(text) => text
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| invalid()),
            Operand::Bool(flag) => Ok(Value::Int(i64::from(*flag))),
            Operand::Int(n) => Ok(Value::Int(*n)),
            Operand::Field(_) => Err(invalid()),
        },
        ColumnKind::Json => Err(Error::PredicateType(column.name().to_string())),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnKind;

    fn table() -> TableDef {
        TableDef::new("Vm")
            .field("pk", ColumnKind::Text, "pk")
            .field("id", ColumnKind::Int, "key")
            .field("name", ColumnKind::Text, "")
            .field("running", ColumnKind::Bool, "")
            .field("disks", ColumnKind::Json, "")
    }

    #[test]
    fn test_compare_renders_param() {
        let table = table();
        let mut params = ParamList::new();
        let sql = eq("id", 4).build(&table, &mut params).expect("build");
        assert_eq!(sql, "id = :id0");
        assert_eq!(params.bindings().len(), 1);
    }

    #[test]
    fn test_case_insensitive_field_lookup() {
        let table = table();
        let mut params = ParamList::new();
        let sql = eq("Name", "x").build(&table, &mut params).expect("build");
        assert_eq!(sql, "name = :name0");
    }

    #[test]
    fn test_and_or_nesting() {
        let table = table();
        let mut params = ParamList::new();
        let sql = or([eq("id", 0), and([gt("id", 5), lt("id", 9)])])
            .build(&table, &mut params)
            .expect("build");
        assert_eq!(sql, "(id = :id0 OR (id > :id1 AND id < :id2))");
        assert_eq!(params.bindings().len(), 3);
    }

    #[test]
    fn test_field_operand() {
        let table = table();
        let mut params = ParamList::new();
        let sql = neq("id", field("running"))
            .build(&table, &mut params)
            .expect("build");
        assert_eq!(sql, "id != running");
        assert!(params.bindings().is_empty());
    }

    #[test]
    fn test_coercions() {
        let table = table();
        let mut params = ParamList::new();
        // Int into text column renders as a text parameter.
        assert!(eq("name", 7).build(&table, &mut params).is_ok());
        // Text into int column parses.
        assert!(eq("id", "42").build(&table, &mut params).is_ok());
        // Garbage into int column fails.
        assert!(matches!(
            eq("id", "many").build(&table, &mut params),
            Err(Error::PredicateValue(_))
        ));
        // Int into bool column maps through non-zero.
        assert!(eq("running", 1).build(&table, &mut params).is_ok());
    }

    #[test]
    fn test_unknown_field() {
        let table = table();
        let mut params = ParamList::new();
        assert!(matches!(
            eq("bogus", 1).build(&table, &mut params),
            Err(Error::PredicateRef(_))
        ));
        assert!(matches!(
            eq("id", field("bogus")).build(&table, &mut params),
            Err(Error::PredicateRef(_))
        ));
    }

    #[test]
    fn test_json_column_rejected() {
        let table = table();
        let mut params = ParamList::new();
        assert!(matches!(
            eq("disks", "x").build(&table, &mut params),
            Err(Error::PredicateType(_))
        ));
    }

    #[test]
    fn test_empty_combinator() {
        let table = table();
        let mut params = ParamList::new();
        assert!(matches!(
            and([]).build(&table, &mut params),
            Err(Error::PredicateValue(_))
        ));
    }

    #[test]
    fn test_label_subquery() {
        let table = table();
        let mut params = ParamList::new();
        let labels = Labels::from([("env".to_string(), "prod".to_string())]);
        let sql = labeled(labels).build(&table, &mut params).expect("build");
        assert_eq!(
            sql,
            "(pk IN (SELECT parent FROM Label WHERE kind = :labelKind0 AND name = :labelName1 AND value = :labelValue2))"
        );
        assert_eq!(params.bindings().len(), 3);
    }

    #[test]
    fn test_label_pairs_intersect() {
        let table = table();
        let mut params = ParamList::new();
        let labels = Labels::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let sql = labeled(labels).build(&table, &mut params).expect("build");
        assert_eq!(sql.matches(" IN (SELECT parent FROM Label").count(), 2);
        assert!(sql.contains(") AND pk IN ("));
    }
}
