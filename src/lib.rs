// ============================================================================
// webcontext Library
// ============================================================================
//
// Request-scoped context for web applications:
//
//   context      scoped bindings, logical scopes and the manager running them
//   session      session payloads and the stores that keep them
//   persistence  unit-of-work contract plus an in-memory backend
//   tracking     per-scope ledger of what the unit of work changed
//
// ============================================================================

pub mod context;
pub mod core;
pub mod persistence;
pub mod prelude;
pub mod session;
pub mod tracking;

pub use context::{ContextConfig, ContextManager, LogicalScope, ScopeState, ScopedBinding};
pub use core::{ContextError, Result, Row, Value, row};
pub use persistence::{Entity, MemoryDatabase, MemorySession, ModelDef, Relationship};
pub use session::{MemorySessionStore, SessionStore, Storage};
pub use tracking::{ChangeTracker, MutationLedger, RelationshipChange};
