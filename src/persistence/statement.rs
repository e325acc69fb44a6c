// ============================================================================
// Statements
// ============================================================================
//
// Table-level statements executed outside per-object flush tracking. The
// instrumentation layer sees the statement kind, the target table, the
// literal rows of an insert and the filter of an update/delete.
//
// ============================================================================

use crate::core::{Row, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    StartsWith(String, String),
    In(String, Vec<Value>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::Eq(column.to_string(), value.into())
    }

    pub fn starts_with(column: &str, prefix: &str) -> Self {
        Self::StartsWith(column.to_string(), prefix.to_string())
    }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let column = |name: &str| row.get(name).unwrap_or(&Value::Null);
        match self {
            Self::All => true,
            Self::Eq(name, value) => column(name) == value,
            Self::StartsWith(name, prefix) => column(name)
                .as_str()
                .is_some_and(|text| text.starts_with(prefix.as_str())),
            Self::In(name, values) => values.contains(column(name)),
            Self::And(parts) => parts.iter().all(|part| part.matches(row)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatementKind::Insert => write!(f, "INSERT"),
            StatementKind::Update => write!(f, "UPDATE"),
            StatementKind::Delete => write!(f, "DELETE"),
            StatementKind::Select => write!(f, "SELECT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert { table: String, rows: Vec<Row> },
    Update { table: String, filter: Filter, values: Row },
    Delete { table: String, filter: Filter },
    Select { table: String, filter: Filter },
}

impl Statement {
    pub fn insert(table: &str, rows: Vec<Row>) -> Self {
        Self::Insert {
            table: table.to_string(),
            rows,
        }
    }

    pub fn update(table: &str, filter: Filter, values: Row) -> Self {
        Self::Update {
            table: table.to_string(),
            filter,
            values,
        }
    }

    pub fn delete(table: &str, filter: Filter) -> Self {
        Self::Delete {
            table: table.to_string(),
            filter,
        }
    }

    pub fn select(table: &str, filter: Filter) -> Self {
        Self::Select {
            table: table.to_string(),
            filter,
        }
    }

    pub fn kind(&self) -> StatementKind {
        match self {
            Self::Insert { .. } => StatementKind::Insert,
            Self::Update { .. } => StatementKind::Update,
            Self::Delete { .. } => StatementKind::Delete,
            Self::Select { .. } => StatementKind::Select,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::Select { table, .. } => table,
        }
    }

    /// Row filter of an update, delete or select.
    pub fn filter(&self) -> Option<&Filter> {
        match self {
            Self::Insert { .. } => None,
            Self::Update { filter, .. } | Self::Delete { filter, .. } | Self::Select { filter, .. } => {
                Some(filter)
            }
        }
    }

    pub fn is_dml(&self) -> bool {
        !matches!(self, Self::Select { .. })
    }
}
