// ============================================================================
// In-Memory Backend
// ============================================================================
//
// A small identity-mapped unit of work over in-process tables.
//
// - Each transaction works on a snapshot of the shared tables (persistent
//   maps, so taking one is O(1)).
// - Every write is recorded as a `Change` and replayed onto the shared
//   tables at commit; rollback (or dropping the session) discards the log.
// - Object changes are staged (`add`, `delete`, `Entity::set`, collection
//   appends) and written by `flush`, which also runs before statements,
//   queries and commits.
//
// ============================================================================

use super::{
    ChangeHooks, Entity, Filter, FlushSet, ModelDef, PrimaryKeyQuery, Relationship,
    RelationshipEvent, RelationshipOp, SessionFactory, Statement, UnitOfWork,
};
use crate::core::{ContextError, Result, Row, Value};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, trace};

type Table = im::OrdMap<Value, Row>;
/// (model name, relationship name)
type LinkKey = (String, String);
type LinkPair = (Value, Value);

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: im::HashMap<String, Table>,
    links: im::HashMap<LinkKey, im::OrdSet<LinkPair>>,
}

/// A reversible write, replayed onto the shared tables at commit.
#[derive(Debug, Clone)]
enum Change {
    Write { table: String, key: Value, row: Row },
    Remove { table: String, key: Value },
    Link { key: LinkKey, pair: LinkPair },
    Unlink { key: LinkKey, pair: LinkPair },
}

impl Tables {
    fn table(&self, name: &str) -> Option<&Table> {
        self.rows.get(name)
    }

    fn contains(&self, table: &str, key: &Value) -> bool {
        self.table(table).is_some_and(|t| t.contains_key(key))
    }

    fn matching(&self, table: &str, filter: &Filter) -> Vec<(Value, Row)> {
        self.table(table)
            .map(|t| {
                t.iter()
                    .filter(|(_, row)| filter.matches(row))
                    .map(|(key, row)| (key.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_key(&self, table: &str) -> Value {
        let max = self
            .table(table)
            .and_then(|t| t.keys().filter_map(Value::as_i64).max())
            .unwrap_or(0);
        Value::Integer(max + 1)
    }

    fn apply(&mut self, change: &Change) {
        match change {
            Change::Write { table, key, row } => {
                self.rows
                    .entry(table.clone())
                    .or_insert_with(Table::new)
                    .insert(key.clone(), row.clone());
            }
            Change::Remove { table, key } => {
                if let Some(t) = self.rows.get_mut(table) {
                    t.remove(key);
                }
            }
            Change::Link { key, pair } => {
                self.links
                    .entry(key.clone())
                    .or_insert_with(im::OrdSet::new)
                    .insert(pair.clone());
            }
            Change::Unlink { key, pair } => {
                if let Some(set) = self.links.get_mut(key) {
                    set.remove(pair);
                }
            }
        }
    }
}

/// Shared in-process database. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

#[derive(Default)]
struct DatabaseInner {
    models: std::sync::RwLock<HashMap<String, Arc<ModelDef>>>,
    tables: RwLock<Tables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a model so statements against its table can be executed.
    pub fn create_table(&self, model: &Arc<ModelDef>) -> Result<()> {
        let mut models = self.inner.models.write()?;
        models.insert(model.name().to_string(), Arc::clone(model));
        Ok(())
    }

    fn model(&self, name: &str) -> Option<Arc<ModelDef>> {
        let models = self.inner.models.read().unwrap_or_else(PoisonError::into_inner);
        models.get(name).cloned()
    }

    fn model_for_table(&self, table: &str) -> Option<Arc<ModelDef>> {
        let models = self.inner.models.read().unwrap_or_else(PoisonError::into_inner);
        models.values().find(|m| m.table() == table).cloned()
    }

    /// Number of committed rows in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.inner.tables.read().await;
        tables.table(table).map_or(0, |t| t.len())
    }

    /// Committed row stored under `key`.
    pub async fn fetch(&self, table: &str, key: &Value) -> Option<Row> {
        let tables = self.inner.tables.read().await;
        tables.table(table).and_then(|t| t.get(key)).cloned()
    }

    async fn snapshot(&self) -> Tables {
        self.inner.tables.read().await.clone()
    }

    async fn apply(&self, log: &[Change]) {
        let mut tables = self.inner.tables.write().await;
        for change in log {
            tables.apply(change);
        }
    }
}

impl SessionFactory for MemoryDatabase {
    type Session = MemorySession;

    fn open(&self, hooks: Option<Arc<dyn ChangeHooks>>) -> MemorySession {
        MemorySession::new(self.clone(), hooks)
    }
}

struct PendingLink {
    op: RelationshipOp,
    owner: Entity,
    relationship: Relationship,
    related: Entity,
}

/// Unit of work over a [`MemoryDatabase`].
pub struct MemorySession {
    db: MemoryDatabase,
    hooks: Option<Arc<dyn ChangeHooks>>,
    active: bool,
    working: Tables,
    log: Vec<Change>,
    identity: HashMap<(String, Value), Entity>,
    // Last flushed state of every persistent instance; the dirty-check baseline.
    committed: HashMap<Entity, Row>,
    pending_new: Vec<Entity>,
    pending_deleted: Vec<Entity>,
    touched: HashSet<Entity>,
    pending_links: Vec<PendingLink>,
}

impl MemorySession {
    fn new(db: MemoryDatabase, hooks: Option<Arc<dyn ChangeHooks>>) -> Self {
        Self {
            db,
            hooks,
            active: false,
            working: Tables::default(),
            log: Vec::new(),
            identity: HashMap::new(),
            committed: HashMap::new(),
            pending_new: Vec::new(),
            pending_deleted: Vec::new(),
            touched: HashSet::new(),
            pending_links: Vec::new(),
        }
    }

    async fn autobegin(&mut self) {
        if !self.active {
            self.working = self.db.snapshot().await;
            self.log.clear();
            self.active = true;
        }
    }

    /// Stages a transient entity for insertion at the next flush.
    pub fn add(&mut self, entity: Entity) {
        if self.committed.contains_key(&entity) || self.pending_new.contains(&entity) {
            return;
        }
        self.pending_new.push(entity);
    }

    pub fn add_all(&mut self, entities: impl IntoIterator<Item = Entity>) {
        for entity in entities {
            self.add(entity);
        }
    }

    /// Stages an entity for deletion at the next flush.
    pub fn delete(&mut self, entity: &Entity) {
        if !self.pending_deleted.contains(entity) {
            self.pending_deleted.push(entity.clone());
        }
    }

    /// Loads by primary key, returning the identity-mapped instance if present.
    pub async fn get(&mut self, model: &Arc<ModelDef>, key: impl Into<Value>) -> Result<Option<Entity>> {
        self.autobegin().await;
        let key = key.into();
        if let Some(entity) = self.identity.get(&(model.name().to_string(), key.clone())) {
            return Ok(Some(entity.clone()));
        }
        let row = self
            .working
            .table(model.table())
            .and_then(|t| t.get(&key))
            .cloned();
        Ok(row.map(|row| self.materialize(model, row)))
    }

    /// Loads every row of `model` matching `filter`.
    pub async fn select(&mut self, model: &Arc<ModelDef>, filter: &Filter) -> Result<Vec<Entity>> {
        self.autobegin().await;
        self.flush_pending()?;
        let rows = self.working.matching(model.table(), filter);
        Ok(rows
            .into_iter()
            .map(|(_, row)| self.materialize(model, row))
            .collect())
    }

    /// Loads the members of a many-to-many collection.
    pub async fn related(&mut self, owner: &Entity, relationship: &str) -> Result<Vec<Entity>> {
        self.autobegin().await;
        self.flush_pending()?;
        let rel = collection(owner, relationship)?;
        let target = self.db.model(rel.target()).ok_or_else(|| {
            ContextError::StorageError(format!("Model '{}' not found", rel.target()))
        })?;
        let owner_key = owner.primary_key();
        let link_key = (owner.entity_type().to_string(), relationship.to_string());
        let keys: Vec<Value> = self
            .working
            .links
            .get(&link_key)
            .map(|set| {
                set.iter()
                    .filter(|(o, _)| *o == owner_key)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut members = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entity) = self.get(&target, key).await? {
                members.push(entity);
            }
        }
        Ok(members)
    }

    pub fn append_related(&mut self, owner: &Entity, relationship: &str, related: &Entity) -> Result<()> {
        self.relink(RelationshipOp::Add, owner, relationship, related)
    }

    pub fn remove_related(&mut self, owner: &Entity, relationship: &str, related: &Entity) -> Result<()> {
        self.relink(RelationshipOp::Del, owner, relationship, related)
    }

    fn relink(&mut self, op: RelationshipOp, owner: &Entity, name: &str, related: &Entity) -> Result<()> {
        let relationship = collection(owner, name)?.clone();
        if related.entity_type() != relationship.target() {
            return Err(ContextError::StorageError(format!(
                "'{}.{}' holds {}, not {}",
                owner.entity_type(),
                name,
                relationship.target(),
                related.entity_type()
            )));
        }

        self.touched.insert(owner.clone());
        self.touched.insert(related.clone());

        if let Some(hooks) = &self.hooks {
            hooks.relationship_changed(RelationshipEvent {
                op,
                owner,
                relationship: &relationship,
                related,
                initiator: name,
            });
            let mirror = relationship
                .mirror()
                .and_then(|m| related.model().find_relationship(m));
            if let Some(mirror) = mirror {
                hooks.relationship_changed(RelationshipEvent {
                    op,
                    owner: related,
                    relationship: mirror,
                    related: owner,
                    initiator: name,
                });
            }
        }

        self.pending_links.push(PendingLink {
            op,
            owner: owner.clone(),
            relationship,
            related: related.clone(),
        });
        Ok(())
    }

    /// Runs a table-level statement against the transaction's working set.
    ///
    /// Returns the number of rows written, deleted or matched.
    pub async fn execute(&mut self, statement: Statement) -> Result<u64> {
        self.autobegin().await;
        self.flush_pending()?;

        if let Some(hooks) = self.hooks.clone() {
            let reader = WorkingSet {
                tables: &self.working,
            };
            hooks.before_statement(&statement, &reader).await?;
        }

        let affected = match &statement {
            Statement::Insert { table, rows } => {
                let model = self.db.model_for_table(table).ok_or_else(|| {
                    ContextError::StorageError(format!("Table '{}' not found", table))
                })?;
                for row in rows {
                    let mut row = model.normalize(row.clone());
                    let mut key = model.primary_key_of(&row);
                    if key.is_null() {
                        key = self.working.next_key(table);
                        row.insert(model.primary_key_column().to_string(), key.clone());
                    }
                    if self.working.contains(table, &key) {
                        return Err(duplicate_key(table, &key));
                    }
                    self.record(Change::Write {
                        table: table.clone(),
                        key,
                        row,
                    });
                }
                rows.len()
            }
            Statement::Update {
                table,
                filter,
                values,
            } => {
                let matched = self.working.matching(table, filter);
                for (key, mut row) in matched.iter().cloned() {
                    for (column, value) in values {
                        if let Some(slot) = row.get_mut(column) {
                            *slot = value.clone();
                        }
                    }
                    self.record(Change::Write {
                        table: table.clone(),
                        key,
                        row,
                    });
                }
                matched.len()
            }
            Statement::Delete { table, filter } => {
                let matched = self.working.matching(table, filter);
                let model = self.db.model_for_table(table);
                for (key, _) in &matched {
                    if let Some(model) = &model {
                        if let Some(entity) = self.identity.remove(&(model.name().to_string(), key.clone())) {
                            self.committed.remove(&entity);
                        }
                    }
                    self.record(Change::Remove {
                        table: table.clone(),
                        key: key.clone(),
                    });
                }
                matched.len()
            }
            Statement::Select { table, filter } => self.working.matching(table, filter).len(),
        };

        trace!(kind = %statement.kind(), table = statement.table(), affected, "statement executed");
        Ok(affected as u64)
    }

    fn record(&mut self, change: Change) {
        self.working.apply(&change);
        self.log.push(change);
    }

    fn materialize(&mut self, model: &Arc<ModelDef>, row: Row) -> Entity {
        let identity_key = (model.name().to_string(), model.primary_key_of(&row));
        if let Some(entity) = self.identity.get(&identity_key) {
            return entity.clone();
        }
        let entity = Entity::new(model, row);
        self.committed.insert(entity.clone(), entity.snapshot());
        self.identity.insert(identity_key, entity.clone());
        if let Some(hooks) = &self.hooks {
            hooks.after_load(&entity);
        }
        entity
    }

    fn dirty(&self) -> HashSet<Entity> {
        self.committed
            .iter()
            .filter(|(entity, baseline)| {
                !self.pending_deleted.contains(entity)
                    && (self.touched.contains(*entity) || entity.snapshot() != **baseline)
            })
            .map(|(entity, _)| entity.clone())
            .collect()
    }

    fn flush_pending(&mut self) -> Result<()> {
        let dirty = self.dirty();
        if self.pending_new.is_empty()
            && self.pending_deleted.is_empty()
            && self.pending_links.is_empty()
            && dirty.is_empty()
        {
            return Ok(());
        }

        let flush = FlushSet {
            new: self.pending_new.iter().cloned().collect(),
            dirty,
            deleted: self.pending_deleted.iter().cloned().collect(),
        };
        if let Some(hooks) = &self.hooks {
            hooks.before_flush(&flush)?;
        }

        let new = std::mem::take(&mut self.pending_new);
        let deleted = std::mem::take(&mut self.pending_deleted);

        for entity in new.iter().filter(|e| !flush.deleted.contains(*e)) {
            self.insert_entity(entity)?;
        }
        for entity in &flush.dirty {
            self.write_entity(entity);
        }
        for entity in &deleted {
            if self.committed.remove(entity).is_some() {
                let key = entity.primary_key();
                self.identity.remove(&(entity.entity_type().to_string(), key.clone()));
                self.record(Change::Remove {
                    table: entity.table().to_string(),
                    key,
                });
            }
        }
        for link in std::mem::take(&mut self.pending_links) {
            self.write_link(&link);
        }
        self.touched.clear();

        debug!(
            new = flush.new.len(),
            dirty = flush.dirty.len(),
            deleted = flush.deleted.len(),
            "memory session flushed"
        );
        Ok(())
    }

    fn insert_entity(&mut self, entity: &Entity) -> Result<()> {
        let model = Arc::clone(entity.model());
        let mut key = entity.primary_key();
        if key.is_null() {
            key = self.working.next_key(model.table());
            entity.set(model.primary_key_column(), key.clone());
        }
        if self.working.contains(model.table(), &key) {
            return Err(duplicate_key(model.table(), &key));
        }
        let row = entity.snapshot();
        self.record(Change::Write {
            table: model.table().to_string(),
            key: key.clone(),
            row: row.clone(),
        });
        self.committed.insert(entity.clone(), row);
        self.identity.insert((model.name().to_string(), key), entity.clone());
        Ok(())
    }

    fn write_entity(&mut self, entity: &Entity) {
        let row = entity.snapshot();
        self.record(Change::Write {
            table: entity.table().to_string(),
            key: entity.primary_key(),
            row: row.clone(),
        });
        self.committed.insert(entity.clone(), row);
    }

    fn write_link(&mut self, link: &PendingLink) {
        let owner_key = link.owner.primary_key();
        let related_key = link.related.primary_key();
        if owner_key.is_null() || related_key.is_null() {
            return;
        }

        let mut sides = vec![(
            (link.owner.entity_type().to_string(), link.relationship.name().to_string()),
            (owner_key.clone(), related_key.clone()),
        )];
        if let Some(mirror) = link.relationship.mirror() {
            sides.push((
                (link.related.entity_type().to_string(), mirror.to_string()),
                (related_key, owner_key),
            ));
        }

        for (key, pair) in sides {
            let change = match link.op {
                RelationshipOp::Add => Change::Link { key, pair },
                RelationshipOp::Del => Change::Unlink { key, pair },
            };
            self.record(change);
        }
    }
}

#[async_trait]
impl UnitOfWork for MemorySession {
    async fn begin(&mut self) -> Result<()> {
        if self.active {
            return Err(ContextError::TransactionError("Transaction already active".into()));
        }
        self.autobegin().await;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.autobegin().await;
        self.flush_pending()
    }

    async fn commit(&mut self) -> Result<()> {
        self.autobegin().await;
        self.flush_pending()?;

        let log = std::mem::take(&mut self.log);
        self.db.apply(&log).await;
        self.active = false;
        debug!(changes = log.len(), "memory session committed");

        if let Some(hooks) = &self.hooks {
            hooks.after_commit()?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let discarded = self.log.len();
        self.log.clear();
        self.pending_new.clear();
        self.pending_deleted.clear();
        self.pending_links.clear();
        self.touched.clear();
        self.identity.clear();
        self.committed.clear();
        self.active = false;
        debug!(discarded, "memory session rolled back");

        if let Some(hooks) = &self.hooks {
            hooks.after_rollback();
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.active
    }
}

struct WorkingSet<'a> {
    tables: &'a Tables,
}

#[async_trait]
impl<'a> PrimaryKeyQuery for WorkingSet<'a> {
    async fn primary_keys(&self, table: &str, primary_key: &str, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self
            .tables
            .matching(table, filter)
            .into_iter()
            .map(|(_, row)| row.get(primary_key).cloned().unwrap_or(Value::Null))
            .collect())
    }
}

fn collection<'a>(owner: &'a Entity, name: &str) -> Result<&'a Relationship> {
    let relationship = owner.model().find_relationship(name).ok_or_else(|| {
        ContextError::StorageError(format!(
            "'{}' has no relationship '{}'",
            owner.entity_type(),
            name
        ))
    })?;
    if !relationship.is_many_to_many() {
        return Err(ContextError::StorageError(format!(
            "'{}.{}' is not a many-to-many collection",
            owner.entity_type(),
            name
        )));
    }
    Ok(relationship)
}

fn duplicate_key(table: &str, key: &Value) -> ContextError {
    ContextError::StorageError(format!("Duplicate primary key {} in table '{}'", key, table))
}
