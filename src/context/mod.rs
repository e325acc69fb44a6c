// ============================================================================
// Request Context
// ============================================================================
//
// Scoped bindings plus the manager that enters and leaves logical scopes.
// Application code inside a scope reaches its session payload, request bag
// and unit of work through the well-known bindings in `binding`.
//
// ============================================================================

pub mod binding;
pub mod config;
pub mod manager;
pub mod scope;

pub use binding::{
    Frame, IS_ACTIVE, REQUEST, SESSION, STORE, ScopedBinding, TOKEN, ThreadFrameGuard,
    Transaction, is_active, isolated, spawn, transaction,
};
pub use config::{ContextConfig, MAX_SESSION_TTL};
pub use manager::ContextManager;
pub use scope::{LogicalScope, ScopeState};
