//! Everything a scope body usually needs.
//!
//! ```
//! use webcontext::prelude::*;
//! ```

pub use crate::context::binding::{self, IS_ACTIVE, REQUEST, SESSION, STORE, TOKEN};
pub use crate::context::{
    ContextConfig, ContextManager, LogicalScope, ScopeState, Transaction, transaction,
};
pub use crate::core::{ContextError, Result, Row, Value, row};
pub use crate::persistence::{
    Entity, Filter, MemoryDatabase, MemorySession, ModelDef, Relationship, RelationshipOp,
    SessionFactory, Statement, UnitOfWork,
};
pub use crate::session::{MemorySessionStore, SessionStore, Storage};
pub use crate::tracking::{ChangeTracker, EntityDiff, MutationLedger, RelationshipChange};
