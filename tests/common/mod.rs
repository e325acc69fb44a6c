// Shared fixtures for the integration tests
//
// Three models mirror a small web application: containers own items and
// other items, and items link to other items through a back-populated
// many-to-many pair (`Item.other_items` <-> `OtherItem.items`).

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use webcontext::prelude::*;

pub struct Models {
    pub container: Arc<ModelDef>,
    pub item: Arc<ModelDef>,
    pub other: Arc<ModelDef>,
}

pub fn models() -> Models {
    let container = ModelDef::new("Container", "container").column("name").build();
    let item = ModelDef::new("Item", "item")
        .columns(["name", "container_id"])
        .relationship(Relationship::many_to_many("other_items", "OtherItem").back_populates("items"))
        .build();
    let other = ModelDef::new("OtherItem", "other_item")
        .columns(["name", "container_id"])
        .relationship(Relationship::many_to_many("items", "Item").back_populates("other_items"))
        .build();
    Models {
        container,
        item,
        other,
    }
}

impl Models {
    /// `(container, item, other)` handles for moving into a scope body.
    pub fn clone_handles(&self) -> (Arc<ModelDef>, Arc<ModelDef>, Arc<ModelDef>) {
        (self.container.clone(), self.item.clone(), self.other.clone())
    }
}

/// Every ledger handed to the change callback, in delivery order.
#[derive(Clone, Default)]
pub struct Recorder {
    delivered: Arc<Mutex<Vec<MutationLedger>>>,
}

impl Recorder {
    pub fn callback(&self) -> impl Fn(&MutationLedger) -> anyhow::Result<()> + Send + Sync + 'static {
        let delivered = Arc::clone(&self.delivered);
        move |ledger| {
            delivered.lock().unwrap().push(ledger.clone());
            Ok(())
        }
    }

    pub fn last(&self) -> MutationLedger {
        self.delivered
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no ledger delivered")
    }

    pub fn delivered(&self) -> Vec<MutationLedger> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.delivered.lock().unwrap().clear();
    }
}

pub struct Fixture {
    pub db: MemoryDatabase,
    pub store: Arc<MemorySessionStore>,
    pub manager: ContextManager<MemoryDatabase>,
    pub models: Models,
}

pub fn fixture(config: ContextConfig) -> Fixture {
    let db = MemoryDatabase::new();
    let models = models();
    for model in [&models.container, &models.item, &models.other] {
        db.create_table(model).unwrap();
    }
    let store = Arc::new(MemorySessionStore::from_config(&config));
    let manager = ContextManager::new(db.clone(), store.clone(), config).unwrap();
    Fixture {
        db,
        store,
        manager,
        models,
    }
}

/// Auto-committing fixture with a tracker that records every delivery.
///
/// Seeds container 1, item 1 and other item 1, then clears the recorder.
pub async fn traced() -> (Fixture, Recorder) {
    let recorder = Recorder::default();
    let mut fx = fixture(ContextConfig::new().auto_commit(true));
    let tracker = Arc::new(ChangeTracker::with_callback(recorder.callback()));
    for model in [&fx.models.container, &fx.models.item, &fx.models.other] {
        tracker.register_model(model).unwrap();
    }
    fx.manager = fx.manager.with_tracker(tracker);

    let (container, item, other) = (
        fx.models.container.clone(),
        fx.models.item.clone(),
        fx.models.other.clone(),
    );
    fx.manager
        .scope(None, move |scope| async move {
            let mut session = scope.transaction().lock().await;
            session.add(Entity::new(
                &container,
                row([("id", Value::from(1)), ("name", Value::from("first container"))]),
            ));
            session.add(Entity::new(
                &item,
                row([
                    ("id", Value::from(1)),
                    ("name", Value::from("first item")),
                    ("container_id", Value::from(1)),
                ]),
            ));
            session.add(Entity::new(
                &other,
                row([
                    ("id", Value::from(1)),
                    ("name", Value::from("first other item")),
                    ("container_id", Value::from(1)),
                ]),
            ));
            Ok::<_, ContextError>(())
        })
        .await
        .unwrap();

    recorder.clear();
    (fx, recorder)
}
