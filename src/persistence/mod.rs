// ============================================================================
// Persistence Collaborator Contract
// ============================================================================
//
// The context layer does not persist anything itself. It needs a session
// factory that opens units of work, and it observes those units of work
// through the hooks in `hooks`. `memory` is a complete in-process backend
// that honours the contract.
//
// ============================================================================

pub mod entity;
pub mod hooks;
pub mod memory;
pub mod model;
pub mod statement;

pub use entity::Entity;
pub use hooks::{ChangeHooks, FlushSet, PrimaryKeyQuery, RelationshipEvent, RelationshipOp};
pub use memory::{MemoryDatabase, MemorySession};
pub use model::{ModelDef, Relationship, RelationshipKind};
pub use statement::{Filter, Statement, StatementKind};

use crate::core::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A transaction-scoped session against the persistence backend.
#[async_trait]
pub trait UnitOfWork: Send + 'static {
    async fn begin(&mut self) -> Result<()>;

    /// Writes pending object changes without ending the transaction.
    async fn flush(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;
}

/// Opens units of work, wiring in the observer if one is given.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: UnitOfWork;

    fn open(&self, hooks: Option<Arc<dyn ChangeHooks>>) -> Self::Session;
}
