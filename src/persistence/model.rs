// ============================================================================
// Model Definitions
// ============================================================================
//
// Describes an entity class: its name, backing table, primary-key column,
// mapped columns and relationships. Shared as `Arc<ModelDef>` by entities,
// the backend and the change tracker's model index.
//
// ============================================================================

use crate::core::{Row, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    ManyToOne,
    OneToMany,
    ManyToMany,
}

/// A named relationship from one model to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    name: String,
    target: String,
    kind: RelationshipKind,
    back_populates: Option<String>,
}

impl Relationship {
    pub fn new(name: &str, target: &str, kind: RelationshipKind) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind,
            back_populates: None,
        }
    }

    pub fn many_to_many(name: &str, target: &str) -> Self {
        Self::new(name, target, RelationshipKind::ManyToMany)
    }

    /// Names the relationship on `target` that mirrors this one.
    pub fn back_populates(mut self, name: &str) -> Self {
        self.back_populates = Some(name.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> RelationshipKind {
        self.kind
    }

    pub fn mirror(&self) -> Option<&str> {
        self.back_populates.as_deref()
    }

    pub fn is_many_to_many(&self) -> bool {
        self.kind == RelationshipKind::ManyToMany
    }
}

/// Entity class descriptor.
///
/// # Examples
///
/// ```
/// use webcontext::persistence::{ModelDef, Relationship};
///
/// let item = ModelDef::new("Item", "item")
///     .columns(["name", "container_id"])
///     .relationship(Relationship::many_to_many("other_items", "OtherItem"))
///     .build();
/// assert_eq!(item.primary_key_column(), "id");
/// assert_eq!(item.table(), "item");
/// ```
#[derive(Debug, Clone)]
pub struct ModelDef {
    name: String,
    table: String,
    primary_key: String,
    columns: Vec<String>,
    relationships: Vec<Relationship>,
}

impl ModelDef {
    /// Creates a model keyed by an `id` column.
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            primary_key: "id".to_string(),
            columns: vec!["id".to_string()],
            relationships: Vec::new(),
        }
    }

    /// Replaces the primary-key column.
    pub fn primary_key(mut self, column: &str) -> Self {
        let previous = std::mem::replace(&mut self.primary_key, column.to_string());
        self.columns.retain(|c| c != &previous && c != column);
        self.columns.insert(0, column.to_string());
        self
    }

    pub fn column(mut self, column: &str) -> Self {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
        self
    }

    pub fn columns<'a>(self, columns: impl IntoIterator<Item = &'a str>) -> Self {
        columns.into_iter().fold(self, Self::column)
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key_column(&self) -> &str {
        &self.primary_key
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn find_relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary-key accessor over raw column values.
    pub fn primary_key_of(&self, row: &Row) -> Value {
        row.get(&self.primary_key).cloned().unwrap_or(Value::Null)
    }

    /// Restricts `row` to mapped columns, filling absent ones with `Null`.
    pub fn normalize(&self, mut row: Row) -> Row {
        self.columns
            .iter()
            .map(|c| (c.clone(), row.remove(c).unwrap_or(Value::Null)))
            .collect()
    }
}
