use crate::persistence::ModelDef;
use std::collections::HashMap;
use std::sync::Arc;

/// A model the tracker observes.
#[derive(Debug, Clone)]
pub struct RegisteredModel {
    model: Arc<ModelDef>,
}

impl RegisteredModel {
    pub fn entity_type(&self) -> &str {
        self.model.name()
    }

    pub fn primary_key_column(&self) -> &str {
        self.model.primary_key_column()
    }

    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }
}

/// Registered models, indexed both by entity type and by table.
#[derive(Debug, Default)]
pub struct ModelIndex {
    by_type: HashMap<String, RegisteredModel>,
    by_storage: HashMap<String, String>,
}

impl ModelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the entity type was already registered.
    pub fn register(&mut self, model: &Arc<ModelDef>) -> bool {
        if self.by_type.contains_key(model.name()) {
            return false;
        }
        self.by_storage
            .insert(model.table().to_string(), model.name().to_string());
        self.by_type.insert(
            model.name().to_string(),
            RegisteredModel {
                model: Arc::clone(model),
            },
        );
        true
    }

    pub fn by_storage(&self, table: &str) -> Option<&RegisteredModel> {
        self.by_storage
            .get(table)
            .and_then(|entity_type| self.by_type.get(entity_type))
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.by_type.contains_key(entity_type)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let model = ModelDef::new("Item", "items").column("name").build();
        let mut index = ModelIndex::new();
        assert!(index.register(&model));
        assert!(!index.register(&model));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_lookup_by_storage_identity() {
        let model = ModelDef::new("Container", "containers")
            .primary_key("uid")
            .build();
        let mut index = ModelIndex::new();
        index.register(&model);

        let entry = index.by_storage("containers").unwrap();
        assert_eq!(entry.entity_type(), "Container");
        assert_eq!(entry.primary_key_column(), "uid");
        assert!(index.by_storage("Container").is_none());
        assert!(!index.contains("items"));
    }
}
