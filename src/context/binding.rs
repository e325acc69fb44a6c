// ============================================================================
// Scoped Bindings
// ============================================================================
//
// A binding is a named slot whose value depends on the logical scope that is
// currently executing. Slots live in a frame:
//
//   task frame    tokio task-local, installed around a future
//   thread frame  thread-local, installed by ThreadFrameGuard
//
// Lookups consult the task frame first and fall back to the thread frame.
// Frames are persistent maps, so handing a copy to a spawned task is O(1) and
// later writes on either side stay invisible to the other.
//
// ============================================================================

use crate::core::{ContextError, Result};
use crate::persistence::UnitOfWork;
use crate::session::{SessionStore, Storage};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;

type Slot = Arc<dyn Any + Send + Sync>;

/// The set of values bound in one scope.
#[derive(Clone, Default)]
pub struct Frame {
    slots: im::HashMap<&'static str, Slot>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.slots.keys()).finish()
    }
}

tokio::task_local! {
    static TASK_FRAME: RefCell<Frame>;
}

thread_local! {
    static THREAD_FRAME: RefCell<Option<Frame>> = const { RefCell::new(None) };
}

fn in_task_frame() -> bool {
    TASK_FRAME.try_with(|_| ()).is_ok()
}

fn lookup(name: &str) -> Option<Slot> {
    match TASK_FRAME.try_with(|frame| frame.borrow().slots.get(name).cloned()) {
        Ok(slot) => slot,
        Err(_) => THREAD_FRAME.with(|frame| {
            frame
                .borrow()
                .as_ref()
                .and_then(|f| f.slots.get(name).cloned())
        }),
    }
}

/// Writes or clears `name` in the innermost frame; returns the previous slot
/// so it is dropped after the frame borrow ends.
fn store(name: &'static str, value: Option<Slot>) -> Result<Option<Slot>> {
    let update = |frame: &mut Frame| match value {
        Some(v) => frame.slots.insert(name, v),
        None => frame.slots.remove(name),
    };

    if in_task_frame() {
        return Ok(TASK_FRAME.with(|frame| update(&mut frame.borrow_mut())));
    }
    THREAD_FRAME.with(|frame| match frame.borrow_mut().as_mut() {
        Some(f) => Ok(update(f)),
        None => Err(ContextError::NoActiveScope),
    })
}

/// Whether any frame is installed for the running code.
pub fn in_scope() -> bool {
    in_task_frame() || THREAD_FRAME.with(|frame| frame.borrow().is_some())
}

/// Copy of the innermost frame.
pub fn current() -> Option<Frame> {
    match TASK_FRAME.try_with(|frame| frame.borrow().clone()) {
        Ok(frame) => Some(frame),
        Err(_) => THREAD_FRAME.with(|frame| frame.borrow().clone()),
    }
}

/// Runs `fut` with `frame` installed as its task frame.
pub async fn with_frame<F: Future>(frame: Frame, fut: F) -> F::Output {
    TASK_FRAME.scope(RefCell::new(frame), fut).await
}

/// Runs `fut` with an empty frame, regardless of what the caller has bound.
pub async fn isolated<F: Future>(fut: F) -> F::Output {
    with_frame(Frame::new(), fut).await
}

/// Spawns `fut` onto the runtime with a copy of the caller's frame.
///
/// Bindings visible at spawn time are visible in the child; rebinding on
/// either side afterwards does not leak across. Mutable values behind a
/// binding (a session payload, a transaction) are shared, not copied.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let frame = current().unwrap_or_default();
    tokio::spawn(TASK_FRAME.scope(RefCell::new(frame), fut))
}

/// Installs a thread frame for the current thread until dropped.
///
/// Dropping restores whatever frame was installed before, so the outermost
/// guard always leaves the thread with no bindings, unwinding included.
pub struct ThreadFrameGuard {
    previous: Option<Frame>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadFrameGuard {
    pub fn install(frame: Frame) -> Self {
        let previous = THREAD_FRAME.with(|slot| slot.replace(Some(frame)));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ThreadFrameGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _released = THREAD_FRAME.with(|slot| slot.replace(previous));
    }
}

/// A named, typed slot in the current frame.
pub struct ScopedBinding<T: ?Sized> {
    name: &'static str,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> ScopedBinding<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Binds `value` in the innermost frame.
    pub fn bind(&self, value: Arc<T>) -> Result<()> {
        let slot: Slot = Arc::new(value);
        store(self.name, Some(slot)).map(drop)
    }

    pub fn unbind(&self) -> Result<()> {
        store(self.name, None).map(drop)
    }

    /// Current value, or `None` when nothing (or a value of another type) is
    /// bound.
    pub fn resolve(&self) -> Option<Arc<T>> {
        lookup(self.name).and_then(|slot| slot.downcast_ref::<Arc<T>>().cloned())
    }

    /// Like [`resolve`](Self::resolve) but distinguishes the failure cases.
    pub fn get(&self) -> Result<Arc<T>> {
        let slot = lookup(self.name).ok_or(ContextError::NoActiveScope)?;
        slot.downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(ContextError::BindingType(self.name))
    }

    pub fn is_bound(&self) -> bool {
        self.resolve().is_some()
    }
}

impl ScopedBinding<Storage> {
    pub fn get_item(&self, key: &str) -> Option<serde_json::Value> {
        self.resolve().and_then(|storage| storage.get(key))
    }

    pub fn get_item_as<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.resolve().and_then(|storage| storage.get_as(key))
    }

    pub fn set_item(&self, key: &str, value: impl Serialize) -> Result<()> {
        self.get()?.set(key, value)
    }

    pub fn remove_item(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get()?.remove(key))
    }
}

/// Unit of work bound to a scope, shared by everything running in it.
pub type Transaction<S> = tokio::sync::Mutex<S>;

const TRANSACTION: &str = "transaction";

/// Session payload of the current scope.
pub static SESSION: ScopedBinding<Storage> = ScopedBinding::new("session");

/// Per-request scratch state; never persisted.
pub static REQUEST: ScopedBinding<Storage> = ScopedBinding::new("request");

pub static IS_ACTIVE: ScopedBinding<bool> = ScopedBinding::new("is_active");

pub static STORE: ScopedBinding<dyn SessionStore> = ScopedBinding::new("store");

/// Identity token of the current scope.
pub static TOKEN: ScopedBinding<String> = ScopedBinding::new("token");

/// The unit of work of the current scope, if its type is `S`.
pub fn transaction<S: UnitOfWork>() -> Option<Arc<Transaction<S>>> {
    ScopedBinding::<Transaction<S>>::new(TRANSACTION).resolve()
}

pub(crate) fn bind_transaction<S: UnitOfWork>(transaction: Arc<Transaction<S>>) -> Result<()> {
    ScopedBinding::<Transaction<S>>::new(TRANSACTION).bind(transaction)
}

/// Whether the running code is inside an entered scope.
pub fn is_active() -> bool {
    IS_ACTIVE.resolve().is_some_and(|active| *active)
}
