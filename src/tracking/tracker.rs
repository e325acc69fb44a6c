use super::ledger::{EntityDiff, MutationLedger, RelationshipChange};
use super::registry::ModelIndex;
use crate::context::binding::ScopedBinding;
use crate::core::{ContextError, Result};
use crate::persistence::{
    ChangeHooks, Entity, FlushSet, ModelDef, PrimaryKeyQuery, RelationshipEvent, Statement,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Receives the ledger after every commit of a traced scope.
pub type ChangeCallback = Arc<dyn Fn(&MutationLedger) -> anyhow::Result<()> + Send + Sync>;

/// Ledger of the scope currently executing.
pub(crate) static LEDGER: ScopedBinding<Mutex<MutationLedger>> = ScopedBinding::new("ledger");

/// Observes units of work and records what they change into the current
/// scope's [`MutationLedger`].
///
/// Registration is process-wide for the tracker; the ledger is per scope.
/// Hooks firing outside any scope are ignored.
pub struct ChangeTracker {
    models: RwLock<ModelIndex>,
    callback: Option<ChangeCallback>,
}

impl ChangeTracker {
    pub fn new(callback: Option<ChangeCallback>) -> Self {
        Self {
            models: RwLock::new(ModelIndex::new()),
            callback,
        }
    }

    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&MutationLedger) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(Some(Arc::new(callback)))
    }

    /// Starts observing `model`. Registering twice is a no-op.
    pub fn register_model(&self, model: &Arc<ModelDef>) -> Result<()> {
        if self.models.write()?.register(model) {
            debug!(entity_type = model.name(), table = model.table(), "model registered");
        }
        Ok(())
    }

    pub fn is_registered(&self, entity_type: &str) -> bool {
        self.models
            .read()
            .map(|models| models.contains(entity_type))
            .unwrap_or(false)
    }

    /// Resets the current scope's ledger, binding a fresh one if the scope
    /// has none yet.
    pub fn start_record(&self) -> Result<()> {
        match LEDGER.resolve() {
            Some(ledger) => ledger.lock()?.clear(),
            None => LEDGER.bind(Arc::new(Mutex::new(MutationLedger::new())))?,
        }
        trace!("ledger reset");
        Ok(())
    }

    /// Hands a copy of the current ledger to the callback.
    ///
    /// The ledger is not reset: it keeps accumulating across commits until
    /// a rollback or a new scope.
    pub fn end_transaction(&self) -> Result<()> {
        let Some(callback) = &self.callback else {
            return Ok(());
        };
        let snapshot = self.ledger().ok_or(ContextError::NoActiveScope)?;
        debug!(summary = %snapshot, "dispatching change callback");
        callback(&snapshot).map_err(ContextError::Callback)
    }

    /// Changed columns of updated entities, relative to their load snapshots.
    pub fn update_diff(&self) -> Result<EntityDiff> {
        let ledger = LEDGER.get()?;
        let ledger = ledger.lock()?;
        Ok(ledger.update_diff())
    }

    /// Copy of the current scope's ledger.
    pub fn ledger(&self) -> Option<MutationLedger> {
        let ledger = LEDGER.resolve()?;
        let guard = ledger.lock().ok()?;
        Some(guard.clone())
    }

    fn record<R>(&self, apply: impl FnOnce(&mut MutationLedger) -> R) -> Result<Option<R>> {
        let Some(ledger) = LEDGER.resolve() else {
            trace!("no ledger bound, change not recorded");
            return Ok(None);
        };
        let mut guard = ledger.lock()?;
        Ok(Some(apply(&mut guard)))
    }

    fn report(&self, outcome: Result<Option<()>>) {
        if let Err(err) = outcome {
            warn!(error = %err, "change not recorded");
        }
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("models", &self.models)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[async_trait]
impl ChangeHooks for ChangeTracker {
    fn before_flush(&self, flush: &FlushSet) -> Result<()> {
        self.record(|ledger| ledger.record_flush(flush)).map(drop)
    }

    fn after_load(&self, entity: &Entity) {
        if !self.is_registered(entity.entity_type()) {
            return;
        }
        self.report(self.record(|ledger| ledger.record_load(entity)));
    }

    fn relationship_changed(&self, event: RelationshipEvent<'_>) {
        if !event.relationship.is_many_to_many() || !self.is_registered(event.owner.entity_type()) {
            return;
        }
        let change = RelationshipChange::new(
            event.op,
            event.related.entity_type(),
            event.initiator,
            event.related.primary_key(),
            event.owner.primary_key(),
        );
        self.report(self.record(|ledger| ledger.record_relationship(change)));
    }

    async fn before_statement(&self, statement: &Statement, reader: &dyn PrimaryKeyQuery) -> Result<()> {
        let registered = self.models.read()?.by_storage(statement.table()).cloned();
        let Some(model) = registered else {
            trace!(table = statement.table(), "statement on unregistered table ignored");
            return Ok(());
        };

        match statement {
            Statement::Insert { rows, .. } => {
                let entities: Vec<Entity> = rows
                    .iter()
                    .map(|row| Entity::new(model.model(), row.clone()))
                    .collect();
                debug!(entity_type = model.entity_type(), count = entities.len(), "bulk insert");
                self.record(|ledger| ledger.record_created(entities))?;
            }
            Statement::Update { filter, .. } => {
                let keys = reader
                    .primary_keys(statement.table(), model.primary_key_column(), filter)
                    .await?;
                debug!(entity_type = model.entity_type(), count = keys.len(), "bulk update");
                self.record(|ledger| ledger.record_invalidated(model.entity_type(), keys))?;
            }
            Statement::Delete { filter, .. } => {
                let keys = reader
                    .primary_keys(statement.table(), model.primary_key_column(), filter)
                    .await?;
                debug!(entity_type = model.entity_type(), count = keys.len(), "bulk delete");
                self.record(|ledger| ledger.record_bulk_deleted(model.entity_type(), keys))?;
            }
            Statement::Select { .. } => {}
        }
        Ok(())
    }

    fn after_commit(&self) -> Result<()> {
        if !LEDGER.is_bound() {
            return Ok(());
        }
        self.end_transaction()
    }

    fn after_rollback(&self) {
        if !LEDGER.is_bound() {
            return;
        }
        if let Err(err) = self.start_record() {
            warn!(error = %err, "ledger reset after rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::binding::isolated;
    use crate::core::{Value, row};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item_model() -> Arc<ModelDef> {
        ModelDef::new("Item", "items").column("name").build()
    }

    #[tokio::test]
    async fn test_hooks_outside_scope_are_ignored() {
        let tracker = ChangeTracker::with_callback(|_| Ok(()));
        tracker.register_model(&item_model()).unwrap();
        assert!(tracker.before_flush(&FlushSet::default()).is_ok());
        assert!(tracker.after_commit().is_ok());
        assert!(tracker.ledger().is_none());
        assert!(matches!(tracker.update_diff(), Err(ContextError::NoActiveScope)));
    }

    #[tokio::test]
    async fn test_unregistered_loads_are_not_snapshotted() {
        let tracker = ChangeTracker::new(None);
        let model = item_model();
        isolated(async {
            tracker.start_record().unwrap();
            tracker.after_load(&Entity::new(&model, row([("id", 1)])));
            assert!(tracker.ledger().unwrap().loaded().is_empty());

            tracker.register_model(&model).unwrap();
            tracker.after_load(&Entity::new(&model, row([("id", 1)])));
            assert!(tracker.ledger().unwrap().loaded()["Item"].contains_key(&Value::from(1)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_callback_errors_propagate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let tracker = ChangeTracker::with_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("sink offline")
        });
        isolated(async {
            tracker.start_record().unwrap();
            let err = tracker.after_commit().unwrap_err();
            assert!(matches!(err, ContextError::Callback(_)));
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rollback_resets_in_place() {
        let tracker = ChangeTracker::new(None);
        let model = item_model();
        isolated(async {
            tracker.start_record().unwrap();
            let entity = Entity::new(&model, row([("id", 1)]));
            tracker
                .before_flush(&FlushSet {
                    new: [entity].into(),
                    ..Default::default()
                })
                .unwrap();
            assert!(!tracker.ledger().unwrap().is_empty());

            tracker.after_rollback();
            assert!(tracker.ledger().unwrap().is_empty());
        })
        .await;
    }
}
