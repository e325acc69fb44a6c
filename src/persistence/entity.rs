use super::ModelDef;
use crate::core::{Row, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to one entity instance.
///
/// Clones point at the same instance. Equality and hashing follow instance
/// identity, not column values, so two handles loaded for the same row in
/// different sessions are different entities.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

struct EntityInner {
    instance_id: u64,
    model: Arc<ModelDef>,
    state: Mutex<Row>,
}

impl Entity {
    /// Creates a transient instance; columns missing from `row` start as `Null`.
    pub fn new(model: &Arc<ModelDef>, row: Row) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                model: Arc::clone(model),
                state: Mutex::new(model.normalize(row)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Row> {
        // Rows are plain data; a panic mid-write cannot leave them torn.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id
    }

    pub fn model(&self) -> &Arc<ModelDef> {
        &self.inner.model
    }

    pub fn entity_type(&self) -> &str {
        self.inner.model.name()
    }

    pub fn table(&self) -> &str {
        self.inner.model.table()
    }

    pub fn get(&self, column: &str) -> Value {
        self.state().get(column).cloned().unwrap_or(Value::Null)
    }

    /// Sets a mapped column. Unmapped columns are ignored.
    pub fn set(&self, column: &str, value: impl Into<Value>) {
        if let Some(slot) = self.state().get_mut(column) {
            *slot = value.into();
        }
    }

    pub fn primary_key(&self) -> Value {
        self.inner.model.primary_key_of(&self.state())
    }

    /// Copy of the current column values.
    pub fn snapshot(&self) -> Row {
        self.state().clone()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.inner.instance_id == other.inner.instance_id
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.instance_id.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.entity_type(), self.primary_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row;
    use std::collections::HashSet;

    fn container() -> Arc<ModelDef> {
        ModelDef::new("Container", "container").column("name").build()
    }

    #[test]
    fn test_identity_is_per_instance() {
        let model = container();
        let a = Entity::new(&model, row([("id", 1)]));
        let b = Entity::new(&model, row([("id", 1)]));
        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(b);
        set.insert(a);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_ignores_unmapped_columns() {
        let entity = Entity::new(&container(), row([("id", 7)]));
        entity.set("name", "box");
        entity.set("colour", "red");
        assert_eq!(entity.get("name"), Value::from("box"));
        assert_eq!(entity.get("colour"), Value::Null);
        assert_eq!(entity.primary_key(), Value::from(7));
    }

    #[test]
    fn test_debug_shows_type_and_key() {
        let entity = Entity::new(&container(), row([("id", 3)]));
        assert_eq!(format!("{:?}", entity), "<Container 3>");
    }
}
