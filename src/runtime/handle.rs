//! Scoped capabilities with an explicit lifecycle
//!
//! A [`Handle`] is owned either by the Environment that declares its
//! variable or, when created scopeless, by the executor root. Handle types
//! are registered up front in the global [`HandleCatalog`]; each executor
//! works from an immutable [`HandleRegistry`] snapshot so that lazily
//! created handles are always instantiated the same way.
//!
//! Lifecycle callbacks run with the executor unlocked. While a callback is
//! running the handle is checked out of the [`HandleTable`], so typed access
//! to it from elsewhere reports [`HandleError::Busy`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bookmark::{BookmarkScope, BookmarkScopeHandle};
use super::environment::EnvironmentId;
use super::error::{HandleError, HandleResult, Result};
use super::exclusive::ExclusiveHandle;
use super::executor::SharedState;
use super::instance::InstanceId;
use super::value::ValueType;

/// Id of a handle within one executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

/// A scoped capability
pub trait Handle: Any + Send + Sync {
    /// Called once after construction, before the handle is usable
    fn on_initialize(&mut self, _context: &mut HandleInitializationContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once when the owning scope is torn down
    fn on_uninitialize(
        &mut self,
        _context: &mut HandleInitializationContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether an execution property holding this handle may be added or
    /// removed while the owning instance has executing children
    fn can_be_removed_with_executing_children(&self) -> bool {
        false
    }
}

/// Who owns a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOwner {
    /// Bound to the environment of an instance
    Instance {
        /// Owning instance
        instance: InstanceId,
        /// Environment holding the handle
        environment: EnvironmentId,
    },
    /// Bound to the executor root
    Root,
}

impl HandleOwner {
    /// Owning instance, if any
    pub fn instance(&self) -> Option<InstanceId> {
        match self {
            HandleOwner::Instance { instance, .. } => Some(*instance),
            HandleOwner::Root => None,
        }
    }
}

/// Lifecycle position of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    /// `on_initialize` is running
    Initializing,
    /// Usable
    Initialized,
    /// `on_uninitialize` is running
    Uninitializing,
    /// Torn down
    Uninitialized,
}

/// Factory producing a fresh handle
pub type HandleFactory = Arc<dyn Fn() -> Box<dyn Handle> + Send + Sync>;

#[derive(Clone)]
struct HandleTypeInfo {
    kind: ValueType,
    factory: HandleFactory,
}

/// Global catalog of handle types
pub struct HandleCatalog {
    types: RwLock<HashMap<TypeId, HandleTypeInfo>>,
}

static CATALOG: Lazy<HandleCatalog> = Lazy::new(HandleCatalog::with_builtins);

impl HandleCatalog {
    fn with_builtins() -> Self {
        let catalog = Self {
            types: RwLock::new(HashMap::new()),
        };
        catalog.register_default::<BookmarkScopeHandle>();
        catalog.register_default::<ExclusiveHandle>();
        catalog
    }

    /// Access the global catalog singleton.
    pub fn global() -> &'static Self {
        &CATALOG
    }

    /// Register a handle type with a factory function.
    pub fn register<H, F>(&self, factory: F)
    where
        H: Handle,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let mut types = self.types.write();
        types.insert(
            TypeId::of::<H>(),
            HandleTypeInfo {
                kind: ValueType::of::<H>(),
                factory: Arc::new(move || Box::new(factory()) as Box<dyn Handle>),
            },
        );
    }

    /// Register a handle type that implements `Default`.
    pub fn register_default<H>(&self)
    where
        H: Handle + Default,
    {
        self.register::<H, _>(H::default);
    }

    /// Produce an immutable snapshot for an executor.
    pub fn snapshot(&self) -> HandleRegistry {
        let types = self.types.read();
        HandleRegistry {
            types: Arc::new(types.clone()),
        }
    }
}

/// Immutable executor view of the handle catalog.
#[derive(Clone)]
pub struct HandleRegistry {
    types: Arc<HashMap<TypeId, HandleTypeInfo>>,
}

impl HandleRegistry {
    /// Whether `H` can be created through this snapshot
    pub fn has_type<H: Handle>(&self) -> bool {
        self.types.contains_key(&TypeId::of::<H>())
    }

    /// Instantiate a handle of the given type.
    pub fn create(&self, kind: ValueType) -> HandleResult<Box<dyn Handle>> {
        let (_, factory) = self.factory(kind)?;
        Ok(factory())
    }

    pub(crate) fn factory(&self, kind: ValueType) -> HandleResult<(ValueType, HandleFactory)> {
        let info = self
            .types
            .get(&kind.id())
            .ok_or(HandleError::UnknownKind(kind.name()))?;
        Ok((info.kind, info.factory.clone()))
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

struct HandleSlot {
    handle: Option<Box<dyn Handle>>,
    kind: ValueType,
    owner: HandleOwner,
    state: HandleState,
}

/// Arena of every handle created by one executor
#[derive(Default)]
pub struct HandleTable {
    slots: HashMap<HandleId, HandleSlot>,
    next_id: u64,
}

impl HandleTable {
    /// Reserve an id for a handle about to initialize
    pub(crate) fn reserve(&mut self, kind: ValueType, owner: HandleOwner) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.slots.insert(
            id,
            HandleSlot {
                handle: None,
                kind,
                owner,
                state: HandleState::Initializing,
            },
        );
        id
    }

    pub(crate) fn complete_initialize(&mut self, id: HandleId, handle: Box<dyn Handle>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.handle = Some(handle);
            slot.state = HandleState::Initialized;
        }
    }

    pub(crate) fn discard(&mut self, id: HandleId) {
        self.slots.remove(&id);
    }

    /// Take the handle out for its uninitialize callback
    pub(crate) fn begin_uninitialize(
        &mut self,
        id: HandleId,
    ) -> HandleResult<(Box<dyn Handle>, HandleOwner)> {
        let slot = self.slots.get_mut(&id).ok_or(HandleError::NotFound(id.0))?;
        if slot.state != HandleState::Initialized {
            return Err(HandleError::NotInitialized(id.0));
        }
        let handle = slot.handle.take().ok_or(HandleError::Busy(id.0))?;
        slot.state = HandleState::Uninitializing;
        Ok((handle, slot.owner))
    }

    pub(crate) fn complete_uninitialize(&mut self, id: HandleId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = HandleState::Uninitialized;
        }
    }

    /// Lifecycle state
    pub fn state(&self, id: HandleId) -> Option<HandleState> {
        self.slots.get(&id).map(|slot| slot.state)
    }

    /// Owner
    pub fn owner(&self, id: HandleId) -> Option<HandleOwner> {
        self.slots.get(&id).map(|slot| slot.owner)
    }

    /// Whether `id` names a handle of type `H`, initialized or not
    pub fn is<H: Handle>(&self, id: HandleId) -> bool {
        self.is_kind(id, TypeId::of::<H>())
    }

    pub(crate) fn is_kind(&self, id: HandleId, kind: TypeId) -> bool {
        self.slots.get(&id).is_some_and(|slot| slot.kind.id() == kind)
    }

    fn slot(
        &self,
        id: HandleId,
        expected: &'static str,
        kind: TypeId,
    ) -> HandleResult<&HandleSlot> {
        let slot = self.slots.get(&id).ok_or(HandleError::NotFound(id.0))?;
        if slot.kind.id() != kind {
            return Err(HandleError::WrongKind { id: id.0, expected });
        }
        if slot.state == HandleState::Uninitialized {
            return Err(HandleError::NotInitialized(id.0));
        }
        Ok(slot)
    }

    /// Borrow an initialized handle as `H`
    pub fn get<H: Handle>(&self, id: HandleId) -> HandleResult<&H> {
        let slot = self.slot(id, std::any::type_name::<H>(), TypeId::of::<H>())?;
        let handle = slot.handle.as_deref().ok_or(HandleError::Busy(id.0))?;
        (handle as &dyn Any)
            .downcast_ref::<H>()
            .ok_or(HandleError::WrongKind {
                id: id.0,
                expected: std::any::type_name::<H>(),
            })
    }

    /// Mutably borrow an initialized handle as `H`
    pub fn get_mut<H: Handle>(&mut self, id: HandleId) -> HandleResult<&mut H> {
        self.slot(id, std::any::type_name::<H>(), TypeId::of::<H>())?;
        let slot = self.slots.get_mut(&id).ok_or(HandleError::NotFound(id.0))?;
        let handle = slot.handle.as_deref_mut().ok_or(HandleError::Busy(id.0))?;
        (handle as &mut dyn Any)
            .downcast_mut::<H>()
            .ok_or(HandleError::WrongKind {
                id: id.0,
                expected: std::any::type_name::<H>(),
            })
    }

    /// Borrow an initialized handle as a trait object
    pub fn get_dyn(&self, id: HandleId) -> HandleResult<&dyn Handle> {
        let slot = self.slots.get(&id).ok_or(HandleError::NotFound(id.0))?;
        if slot.state == HandleState::Uninitialized {
            return Err(HandleError::NotInitialized(id.0));
        }
        slot.handle.as_deref().ok_or(HandleError::Busy(id.0))
    }

    /// Ids of initialized handles of type `H`, in creation order
    pub fn ids_of<H: Handle>(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.kind.id() == TypeId::of::<H>() && slot.state == HandleState::Initialized
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}

/// Capabilities available to handle lifecycle callbacks
pub struct HandleInitializationContext {
    state: Option<SharedState>,
    owner: HandleOwner,
    handle: HandleId,
}

impl HandleInitializationContext {
    pub(crate) fn new(state: SharedState, owner: HandleOwner, handle: HandleId) -> Self {
        Self {
            state: Some(state),
            owner,
            handle,
        }
    }

    fn shared(&self) -> Result<&SharedState> {
        self.state
            .as_ref()
            .ok_or_else(|| {
                super::error::UsageError::ObjectDisposed("HandleInitializationContext").into()
            })
    }

    /// Id of the handle running the callback
    pub fn handle_id(&self) -> HandleId {
        self.handle
    }

    /// Owner of the handle running the callback
    pub fn owner(&self) -> HandleOwner {
        self.owner
    }

    /// Create and initialize a further handle with the same owner
    pub fn create_and_initialize_handle<H: Handle>(&mut self) -> Result<HandleId> {
        let state = self.shared()?.clone();
        create_handle(&state, ValueType::of::<H>(), self.owner)
    }

    /// Uninitialize a handle created through this context
    pub fn uninitialize_handle(&mut self, id: HandleId) -> Result<()> {
        let state = self.shared()?.clone();
        uninitialize_handle(&state, id)
    }

    /// Initialized handles of type `H` visible from the owner, nearest
    /// scope first, followed by root-owned ones
    pub fn find_handles<H: Handle>(&self) -> Result<Vec<HandleId>> {
        let state = self.shared()?;
        let st = state.lock();
        Ok(st.visible_handles(self.owner, TypeId::of::<H>()))
    }

    /// Look up a host extension
    pub fn get_extension<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>> {
        let state = self.shared()?;
        let st = state.lock();
        Ok(st.extensions.get::<T>())
    }

    /// Give `scope_handle` a fresh scope and register it
    pub fn create_bookmark_scope(&mut self, scope_handle: HandleId) -> Result<BookmarkScope> {
        let state = self.shared()?;
        let mut st = state.lock();
        st.initialize_bookmark_scope(scope_handle, Uuid::new_v4())
    }

    /// Register a scope with the executor
    pub fn register_bookmark_scope(&mut self, scope: &BookmarkScope) -> Result<()> {
        let state = self.shared()?;
        let mut st = state.lock();
        Ok(st.bookmarks.register_scope(scope)?)
    }

    /// Unregister a scope from the executor
    pub fn unregister_bookmark_scope(&mut self, scope: &BookmarkScope) -> Result<bool> {
        let state = self.shared()?;
        let mut st = state.lock();
        Ok(st.bookmarks.unregister_scope(scope))
    }

    /// Release the executor; later calls fail
    pub fn dispose(&mut self) {
        self.state = None;
    }

    /// Whether the context was disposed
    pub fn is_disposed(&self) -> bool {
        self.state.is_none()
    }
}

/// Construct a handle of `kind`, bind it to `owner` and run `on_initialize`
///
/// The executor is unlocked while the callback runs. A failed
/// initialization discards the handle.
pub(crate) fn create_handle(
    state: &SharedState,
    kind: ValueType,
    owner: HandleOwner,
) -> Result<HandleId> {
    let (id, factory) = {
        let mut st = state.lock();
        let (kind, factory) = st.handle_registry.factory(kind)?;
        let id = st.handles.reserve(kind, owner);
        st.attach_handle(owner, id);
        (id, factory)
    };

    let mut handle = factory();
    let mut context = HandleInitializationContext::new(state.clone(), owner, id);
    let outcome = handle.on_initialize(&mut context);
    context.dispose();

    let mut st = state.lock();
    match outcome {
        Ok(()) => {
            st.handles.complete_initialize(id, handle);
            debug!(handle = id.0, kind = kind.name(), "handle initialized");
            Ok(id)
        }
        Err(err) => {
            st.detach_handle(owner, id);
            st.handles.discard(id);
            warn!(handle = id.0, kind = kind.name(), error = %err, "handle failed to initialize");
            Err(HandleError::InitializationFailed {
                id: id.0,
                detail: err.to_string(),
            }
            .into())
        }
    }
}

/// Run `on_uninitialize` exactly once and detach the handle from its owner
///
/// The handle is torn down even when the callback fails; the failure is
/// still reported to the caller.
pub(crate) fn uninitialize_handle(state: &SharedState, id: HandleId) -> Result<()> {
    let (mut handle, owner) = {
        let mut st = state.lock();
        st.handles.begin_uninitialize(id)?
    };

    let mut context = HandleInitializationContext::new(state.clone(), owner, id);
    let outcome = handle.on_uninitialize(&mut context);
    context.dispose();

    let mut st = state.lock();
    st.handles.complete_uninitialize(id);
    st.detach_handle(owner, id);
    debug!(handle = id.0, "handle uninitialized");

    outcome.map_err(|err| {
        HandleError::UninitializationFailed {
            id: id.0,
            detail: err.to_string(),
        }
        .into()
    })
}

/// Run `f` against the handle `id` under the executor lock
///
/// `f` must not call back into contexts of the same executor.
pub(crate) fn with_handle<H: Handle, R>(
    state: &SharedState,
    id: HandleId,
    f: impl FnOnce(&mut H) -> R,
) -> Result<R> {
    let mut st = state.lock();
    let handle = st.handles.get_mut::<H>(id)?;
    Ok(f(handle))
}
