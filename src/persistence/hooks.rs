// ============================================================================
// Instrumentation Points
// ============================================================================
//
// A persistence backend that wants its effects observed calls these hooks
// from the unit of work that owns them:
//
//   flush        -> before_flush(new/dirty/deleted)   before anything is written
//   load         -> after_load(entity)                once per materialized row
//   collection   -> relationship_changed(event)       per append/remove, per side
//   execute      -> before_statement(stmt, reader)    for table-level statements
//   commit       -> after_commit()                    after the commit succeeded
//   rollback     -> after_rollback()                  after pending work is gone
//
// ============================================================================

use super::{Entity, Filter, Relationship, Statement};
use crate::core::{Result, Value};
use async_trait::async_trait;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipOp {
    Add,
    Del,
}

impl RelationshipOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipOp::Add => "add",
            RelationshipOp::Del => "del",
        }
    }
}

impl std::fmt::Display for RelationshipOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a collection append/remove.
///
/// `relationship` is the collection being mutated on `owner`; `initiator` names
/// the relationship the application touched, which differs from
/// `relationship.name()` when the event is the mirrored side of a
/// back-populated pair.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipEvent<'a> {
    pub op: RelationshipOp,
    pub owner: &'a Entity,
    pub relationship: &'a Relationship,
    pub related: &'a Entity,
    pub initiator: &'a str,
}

/// The object sets a unit of work is about to flush.
#[derive(Debug, Clone, Default)]
pub struct FlushSet {
    pub new: HashSet<Entity>,
    pub dirty: HashSet<Entity>,
    pub deleted: HashSet<Entity>,
}

/// Read-only primary-key lookup against the state a statement will run on.
#[async_trait]
pub trait PrimaryKeyQuery: Send + Sync {
    async fn primary_keys(&self, table: &str, primary_key: &str, filter: &Filter) -> Result<Vec<Value>>;
}

/// Hooks a unit of work calls at each observable point of its life.
///
/// All methods default to no-ops so observers implement only what they need.
#[async_trait]
pub trait ChangeHooks: Send + Sync {
    fn before_flush(&self, _flush: &FlushSet) -> Result<()> {
        Ok(())
    }

    fn after_load(&self, _entity: &Entity) {}

    fn relationship_changed(&self, _event: RelationshipEvent<'_>) {}

    async fn before_statement(&self, _statement: &Statement, _reader: &dyn PrimaryKeyQuery) -> Result<()> {
        Ok(())
    }

    fn after_commit(&self) -> Result<()> {
        Ok(())
    }

    fn after_rollback(&self) {}
}
