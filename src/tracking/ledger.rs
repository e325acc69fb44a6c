// ============================================================================
// Mutation Ledger
// ============================================================================
//
// Per-scope record of what the persistence layer did since the last reset.
// Object-level changes are tracked by entity handle; bulk statements are
// tracked by primary key because no instances exist for them.
//
// ============================================================================

use crate::core::{Row, Value};
use crate::persistence::{Entity, FlushSet, RelationshipOp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Changed columns per entity type and primary key.
pub type EntityDiff = BTreeMap<String, BTreeMap<Value, Row>>;

/// One many-to-many association change, as `(op, related type, relationship,
/// [related pk, owner pk])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationshipChange {
    pub op: RelationshipOp,
    pub related_type: String,
    pub relationship: String,
    pub ids: [Value; 2],
}

impl RelationshipChange {
    pub fn new(
        op: RelationshipOp,
        related_type: &str,
        relationship: &str,
        related_id: impl Into<Value>,
        owner_id: impl Into<Value>,
    ) -> Self {
        Self {
            op,
            related_type: related_type.to_string(),
            relationship: relationship.to_string(),
            ids: [related_id.into(), owner_id.into()],
        }
    }
}

impl fmt::Display for RelationshipChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, [{}, {}])",
            self.op, self.related_type, self.relationship, self.ids[0], self.ids[1]
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct MutationLedger {
    created: HashSet<Entity>,
    updated: HashSet<Entity>,
    deleted: HashMap<String, HashSet<Value>>,
    invalidated: HashMap<String, HashSet<Value>>,
    relationship_ops: Vec<RelationshipChange>,
    loaded: HashMap<String, HashMap<Value, Row>>,
}

impl MutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entities created in this epoch, including ones synthesized from bulk
    /// inserts.
    pub fn created(&self) -> &HashSet<Entity> {
        &self.created
    }

    pub fn updated(&self) -> &HashSet<Entity> {
        &self.updated
    }

    pub fn deleted(&self) -> &HashMap<String, HashSet<Value>> {
        &self.deleted
    }

    /// Primary keys touched by bulk updates, per entity type.
    pub fn invalidated(&self) -> &HashMap<String, HashSet<Value>> {
        &self.invalidated
    }

    pub fn relationship_ops(&self) -> &[RelationshipChange] {
        &self.relationship_ops
    }

    /// Load-time snapshots, per entity type and primary key.
    pub fn loaded(&self) -> &HashMap<String, HashMap<Value, Row>> {
        &self.loaded
    }

    pub fn deleted_keys(&self, entity_type: &str) -> Option<&HashSet<Value>> {
        self.deleted.get(entity_type)
    }

    pub fn invalidated_keys(&self, entity_type: &str) -> Option<&HashSet<Value>> {
        self.invalidated.get(entity_type)
    }

    /// Created entities of `entity_type`.
    pub fn created_of<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.created
            .iter()
            .filter(move |e| e.entity_type() == entity_type)
    }

    /// Whether `entity`, or another instance of the same row, was created in
    /// this epoch. Bulk inserts record instances the session never hands out.
    fn is_created(&self, entity: &Entity) -> bool {
        if self.created.contains(entity) {
            return true;
        }
        let key = entity.primary_key();
        !key.is_null() && self.created_of(entity.entity_type()).any(|e| e.primary_key() == key)
    }

    pub fn clear(&mut self) {
        self.created.clear();
        self.updated.clear();
        self.deleted.clear();
        self.invalidated.clear();
        self.relationship_ops.clear();
        self.loaded.clear();
    }

    /// `true` when no mutation was recorded. Load snapshots do not count.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.relationship_ops.is_empty()
    }

    /// Folds one flush into the ledger.
    ///
    /// Dirty entities count as updates unless their row was created in this
    /// epoch. A row created and deleted in the same epoch disappears from
    /// every category. Rows are matched by entity type and primary key.
    pub(crate) fn record_flush(&mut self, flush: &FlushSet) {
        for entity in &flush.dirty {
            if !self.is_created(entity) {
                self.updated.insert(entity.clone());
            }
        }
        self.created.extend(flush.new.iter().cloned());

        for entity in &flush.deleted {
            let entity_type = entity.entity_type();
            let key = entity.primary_key();
            let same_row = |e: &Entity| {
                e == entity || (!key.is_null() && e.entity_type() == entity_type && e.primary_key() == key)
            };

            self.updated.retain(|e| !same_row(e));
            let before = self.created.len();
            self.created.retain(|e| !same_row(e));
            if self.created.len() < before {
                continue;
            }
            self.deleted
                .entry(entity_type.to_string())
                .or_default()
                .insert(key);
        }
    }

    /// Keeps the earliest snapshot seen for each instance.
    pub(crate) fn record_load(&mut self, entity: &Entity) {
        self.loaded
            .entry(entity.entity_type().to_string())
            .or_default()
            .entry(entity.primary_key())
            .or_insert_with(|| entity.snapshot());
    }

    pub(crate) fn record_relationship(&mut self, change: RelationshipChange) {
        self.relationship_ops.push(change);
    }

    pub(crate) fn record_created(&mut self, entities: impl IntoIterator<Item = Entity>) {
        self.created.extend(entities);
    }

    pub(crate) fn record_invalidated(&mut self, entity_type: &str, keys: Vec<Value>) {
        self.invalidated
            .entry(entity_type.to_string())
            .or_default()
            .extend(keys);
    }

    /// Records a bulk delete. Keys of entities created in this epoch cancel
    /// the creation instead of being reported as deleted.
    pub(crate) fn record_bulk_deleted(&mut self, entity_type: &str, keys: Vec<Value>) {
        let keys: HashSet<Value> = keys.into_iter().collect();
        let hit = |e: &Entity| e.entity_type() == entity_type && keys.contains(&e.primary_key());

        let mut cancelled = HashSet::new();
        self.created.retain(|e| {
            if hit(e) {
                cancelled.insert(e.primary_key());
                false
            } else {
                true
            }
        });
        self.updated.retain(|e| !hit(e));

        self.deleted
            .entry(entity_type.to_string())
            .or_default()
            .extend(keys.into_iter().filter(|k| !cancelled.contains(k)));
    }

    /// Columns whose current value differs from the load snapshot, for every
    /// updated entity that has one.
    pub fn update_diff(&self) -> EntityDiff {
        let mut diff = EntityDiff::new();
        for entity in &self.updated {
            let key = entity.primary_key();
            let Some(baseline) = self
                .loaded
                .get(entity.entity_type())
                .and_then(|by_key| by_key.get(&key))
            else {
                continue;
            };

            let changed: Row = entity
                .snapshot()
                .into_iter()
                .filter(|(column, value)| baseline.get(column) != Some(value))
                .collect();
            if !changed.is_empty() {
                diff.entry(entity.entity_type().to_string())
                    .or_default()
                    .insert(key, changed);
            }
        }
        diff
    }
}

impl fmt::Display for MutationLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyed = |m: &HashMap<String, HashSet<Value>>| m.values().map(HashSet::len).sum::<usize>();
        let counts = [
            ("new", self.created.len()),
            ("update", self.updated.len()),
            ("deleted", keyed(&self.deleted)),
            ("invalidated", keyed(&self.invalidated)),
            ("relationship_ops", self.relationship_ops.len()),
        ];

        write!(f, "ResultData: {{")?;
        let mut first = true;
        for (label, count) in counts.into_iter().filter(|(_, n)| *n > 0) {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", label, count)?;
            first = false;
        }
        write!(f, "}}")
    }
}
