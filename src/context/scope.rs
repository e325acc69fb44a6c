// ============================================================================
// Logical Scope
// ============================================================================
//
// One logical request: an identity token, its session payload, a fresh
// request bag and the unit of work everything inside the scope shares.
//
// State transitions:
//
//   Unbound ──enter──> Entering ──bound──> Active
//                         │                  │
//                         └──fail──> Unbound ├──commit──> Committing ──> Unbound
//                                            │                │
//                                            └──rollback──> RollingBack ──> Unbound
//
// A failed commit passes through RollingBack before the scope unbinds.
//
// ============================================================================

use super::binding::Transaction;
use crate::core::{ContextError, Result};
use crate::persistence::UnitOfWork;
use crate::session::Storage;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Unbound,
    Entering,
    Active,
    Committing,
    RollingBack,
}

impl ScopeState {
    pub fn is_active(&self) -> bool {
        matches!(self, ScopeState::Active)
    }

    fn can_transition_to(&self, next: ScopeState) -> bool {
        use ScopeState::*;
        matches!(
            (self, next),
            (Unbound, Entering)
                | (Entering, Active)
                | (Entering, Unbound)
                | (Active, Committing)
                | (Active, RollingBack)
                | (Committing, RollingBack)
                | (Committing, Unbound)
                | (RollingBack, Unbound)
        )
    }
}

impl std::fmt::Display for ScopeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScopeState::Unbound => "UNBOUND",
            ScopeState::Entering => "ENTERING",
            ScopeState::Active => "ACTIVE",
            ScopeState::Committing => "COMMITTING",
            ScopeState::RollingBack => "ROLLING_BACK",
        };
        f.write_str(name)
    }
}

/// Handle to the running scope, passed to the scope body.
pub struct LogicalScope<S> {
    token: String,
    session: Arc<Storage>,
    request: Arc<Storage>,
    transaction: Arc<Transaction<S>>,
    state: Mutex<ScopeState>,
}

impl<S: UnitOfWork> LogicalScope<S> {
    pub(crate) fn new(token: String, session: Arc<Storage>, transaction: S) -> Self {
        Self {
            token,
            session,
            request: Arc::new(Storage::new()),
            transaction: Arc::new(Transaction::new(transaction)),
            state: Mutex::new(ScopeState::Entering),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn session(&self) -> &Arc<Storage> {
        &self.session
    }

    pub fn request(&self) -> &Arc<Storage> {
        &self.request
    }

    pub fn transaction(&self) -> &Arc<Transaction<S>> {
        &self.transaction
    }

    pub fn state(&self) -> ScopeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition(&self, next: ScopeState) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.can_transition_to(next) {
            return Err(ContextError::InvalidState(format!("{} -> {}", *state, next)));
        }
        *state = next;
        Ok(())
    }
}

impl<S> std::fmt::Debug for LogicalScope<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalScope")
            .field("token", &self.token)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
