use super::binding::{
    self, Frame, IS_ACTIVE, REQUEST, SESSION, STORE, TOKEN, ThreadFrameGuard, bind_transaction,
};
use super::config::ContextConfig;
use super::scope::{LogicalScope, ScopeState};
use crate::core::{ContextError, Result};
use crate::persistence::{ChangeHooks, SessionFactory, UnitOfWork};
use crate::session::SessionStore;
use crate::tracking::MutationLedger;
use crate::tracking::tracker::{ChangeTracker, LEDGER};
use futures::executor::block_on;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Runs logical scopes: resolves the session, opens a unit of work, binds
/// both for the scope body and settles them on exit.
///
/// ```text
/// enter:  token ──connect/create──> payload
///         factory.open(tracker) ──begin──> unit of work
///         bind session / request / store / transaction / ledger
/// exit:   persist payload
///         Ok + auto_commit ──> commit (callback fires)
///         otherwise        ──> rollback
/// ```
///
/// A scope that never reaches exit, because its future was dropped or a
/// blocking body unwound, still persists its payload and rolls back.
pub struct ContextManager<F: SessionFactory> {
    factory: F,
    store: Arc<dyn SessionStore>,
    config: ContextConfig,
    tracker: Option<Arc<ChangeTracker>>,
}

impl<F: SessionFactory> ContextManager<F> {
    /// Builds a manager. `trace_changes` attaches a tracker without a
    /// callback; use [`with_tracker`](Self::with_tracker) to supply one.
    pub fn new(factory: F, store: Arc<dyn SessionStore>, config: ContextConfig) -> Result<Self> {
        config.validate()?;
        let tracker = config
            .trace_changes
            .then(|| Arc::new(ChangeTracker::new(None)));
        Ok(Self {
            factory,
            store,
            config,
            tracker,
        })
    }

    pub fn with_tracker(mut self, tracker: Arc<ChangeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn tracker(&self) -> Option<&Arc<ChangeTracker>> {
        self.tracker.as_ref()
    }

    /// Removes the stored session for `token`.
    pub async fn destroy(&self, token: &str) -> Result<bool> {
        let removed = self.store.destroy(token).await?;
        debug!(token, removed, "session destroyed");
        Ok(removed)
    }

    /// Runs `body` inside a scope for `token`, or for a freshly minted token
    /// when `None`.
    ///
    /// The scope gets its own binding frame seeded from the caller's, so
    /// nested scopes see outer bindings until they shadow them. Entering
    /// with the token of the enclosing scope reuses its session payload.
    ///
    /// If the returned future is dropped before completion the scope is
    /// settled as a failed exit on a task spawned onto the current runtime.
    pub async fn scope<T, E, B, Fut>(&self, token: Option<&str>, body: B) -> std::result::Result<T, E>
    where
        B: FnOnce(Arc<LogicalScope<F::Session>>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<ContextError>,
    {
        let frame = binding::current().unwrap_or_default();
        binding::with_frame(frame, async move {
            let scope = self.enter(token).await?;
            let mut guard = AbandonGuard::arm(&scope, &self.store, true);
            let outcome = body(Arc::clone(&scope)).await;
            let exited = self.exit(&scope, outcome.is_ok()).await;
            guard.disarm();
            settle(outcome, exited)
        })
        .await
    }

    /// Thread-per-request form of [`scope`](Self::scope).
    ///
    /// Bindings live in a thread frame that is removed when the call returns
    /// or unwinds. Must not be called from code being polled by an async
    /// runtime; use `spawn_blocking` or a plain thread.
    pub fn scope_blocking<T, E, B>(&self, token: Option<&str>, body: B) -> std::result::Result<T, E>
    where
        B: FnOnce(&LogicalScope<F::Session>) -> std::result::Result<T, E>,
        E: From<ContextError>,
    {
        let _frame = ThreadFrameGuard::install(binding::current().unwrap_or_default());
        let scope = block_on(self.enter(token))?;
        let mut guard = AbandonGuard::arm(&scope, &self.store, false);
        let outcome = body(&scope);
        let exited = block_on(self.exit(&scope, outcome.is_ok()));
        guard.disarm();
        settle(outcome, exited)
    }

    async fn enter(&self, token: Option<&str>) -> Result<Arc<LogicalScope<F::Session>>> {
        let (token, session) = match token {
            Some(token) => {
                let payload = self.store.connect(token).await?;
                let session = match (TOKEN.resolve(), SESSION.resolve()) {
                    (Some(current), Some(outer)) if current.as_str() == token => {
                        trace!(token, "re-entering scope, reusing payload");
                        outer
                    }
                    _ => Arc::new(payload),
                };
                (token.to_string(), session)
            }
            None => {
                let (token, payload) = self.store.create().await?;
                (token, Arc::new(payload))
            }
        };

        let hooks = self
            .tracker
            .clone()
            .map(|tracker| tracker as Arc<dyn ChangeHooks>);
        let mut unit = self.factory.open(hooks);
        unit.begin().await?;

        let scope = Arc::new(LogicalScope::new(token, session, unit));
        if let Err(err) = self.bind(&scope) {
            scope.transition(ScopeState::Unbound)?;
            return Err(err);
        }
        scope.transition(ScopeState::Active)?;
        debug!(token = scope.token(), "scope entered");
        Ok(scope)
    }

    fn bind(&self, scope: &LogicalScope<F::Session>) -> Result<()> {
        TOKEN.bind(Arc::new(scope.token().to_string()))?;
        SESSION.bind(Arc::clone(scope.session()))?;
        REQUEST.bind(Arc::clone(scope.request()))?;
        STORE.bind(Arc::clone(&self.store))?;
        bind_transaction(Arc::clone(scope.transaction()))?;
        if let Some(tracker) = &self.tracker {
            LEDGER.bind(Arc::new(Mutex::new(MutationLedger::new())))?;
            tracker.start_record()?;
        }
        IS_ACTIVE.bind(Arc::new(true))
    }

    async fn exit(&self, scope: &LogicalScope<F::Session>, succeeded: bool) -> Result<()> {
        let persisted = persist(self.store.as_ref(), scope).await;
        let settled = if succeeded && self.config.auto_commit {
            self.commit(scope).await
        } else {
            rollback(scope).await
        };

        IS_ACTIVE.bind(Arc::new(false))?;
        scope.transition(ScopeState::Unbound)?;
        debug!(token = scope.token(), succeeded, "scope exited");
        settled.and(persisted)
    }

    async fn commit(&self, scope: &LogicalScope<F::Session>) -> Result<()> {
        scope.transition(ScopeState::Committing)?;
        let mut unit = scope.transaction().lock().await;
        match unit.commit().await {
            Ok(()) => {
                debug!(token = scope.token(), "scope committed");
                Ok(())
            }
            Err(err) => {
                scope.transition(ScopeState::RollingBack)?;
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(token = scope.token(), error = %rollback_err, "rollback after failed commit failed");
                }
                Err(err)
            }
        }
    }
}

async fn persist<S: UnitOfWork>(store: &dyn SessionStore, scope: &LogicalScope<S>) -> Result<()> {
    let persisted = store.disconnect(scope.session(), scope.token()).await;
    if let Err(err) = &persisted {
        warn!(token = scope.token(), error = %err, "session payload not persisted");
    }
    persisted
}

async fn rollback<S: UnitOfWork>(scope: &LogicalScope<S>) -> Result<()> {
    if scope.state() != ScopeState::RollingBack {
        scope.transition(ScopeState::RollingBack)?;
    }
    scope.transaction().lock().await.rollback().await?;
    debug!(token = scope.token(), "scope rolled back");
    Ok(())
}

/// Settles a scope that never reached [`ContextManager::exit`].
///
/// Armed right after entry and disarmed once exit returns. On drop while
/// armed it persists the payload and rolls back under the scope's frame:
/// spawned onto the current runtime for async scopes, inline for blocking
/// ones.
struct AbandonGuard<S: UnitOfWork> {
    pending: Option<Abandoned<S>>,
    detach: bool,
}

struct Abandoned<S: UnitOfWork> {
    scope: Arc<LogicalScope<S>>,
    store: Arc<dyn SessionStore>,
    frame: Frame,
}

impl<S: UnitOfWork> AbandonGuard<S> {
    fn arm(scope: &Arc<LogicalScope<S>>, store: &Arc<dyn SessionStore>, detach: bool) -> Self {
        Self {
            pending: Some(Abandoned {
                scope: Arc::clone(scope),
                store: Arc::clone(store),
                frame: binding::current().unwrap_or_default(),
            }),
            detach,
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl<S: UnitOfWork> Drop for AbandonGuard<S> {
    fn drop(&mut self) {
        let Some(abandoned) = self.pending.take() else {
            return;
        };
        warn!(token = abandoned.scope.token(), "scope abandoned before exit");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if self.detach => {
                let _detached = runtime.spawn(abandoned.settle());
            }
            _ => block_on(abandoned.settle()),
        }
    }
}

impl<S: UnitOfWork> Abandoned<S> {
    async fn settle(self) {
        let Abandoned { scope, store, frame } = self;
        binding::with_frame(frame, async move {
            if scope.state() == ScopeState::Unbound {
                return;
            }
            let persisted = persist(store.as_ref(), &scope).await;
            let rolled_back = rollback(&scope).await;
            let unbound = scope.transition(ScopeState::Unbound);
            if let Err(err) = persisted.and(rolled_back).and(unbound) {
                warn!(token = scope.token(), error = %err, "abandoned scope not settled cleanly");
            } else {
                debug!(token = scope.token(), "abandoned scope settled");
            }
        })
        .await
    }
}

/// Body errors win over exit errors; the latter are logged.
fn settle<T, E: From<ContextError>>(
    outcome: std::result::Result<T, E>,
    exited: Result<()>,
) -> std::result::Result<T, E> {
    match (outcome, exited) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(exit_err)) => {
            warn!(error = %exit_err, "scope exit failed after body error");
            Err(err)
        }
    }
}
