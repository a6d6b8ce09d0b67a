//! Contexts handed to running activity code
//!
//! A context is bound to one instance for the duration of one activation.
//! It holds a clone of the shared executor state and locks it per
//! operation, so activity code itself never runs under the lock. Contexts
//! are recycled through a [`ContextPool`]; the [`ContextLease`] guard
//! disposes a context and returns it to its pool on every exit path. Any
//! operation on a disposed context fails with [`UsageError::ObjectDisposed`].

use std::any::{Any, type_name};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::bookmark::{Bookmark, BookmarkOptions, BookmarkResumptionResult, BookmarkScope};
use super::definition::NodeKey;
use super::environment::EnvironmentId;
use super::error::{LocationError, Result, StateError, UsageError};
use super::executor::{ExecutorState, ResumeOrigin, SharedState, WorkflowExecutor};
use super::handle::{self, Handle, HandleId, HandleOwner};
use super::id_space::QualifiedId;
use super::instance::{ActivityInstanceReference, ChildCallbacks, InstanceId};
use super::location::{
    AccessDirection, InlinedLocationReference, LocationReference, SharedLocation, read_as, write_as,
};
use super::properties::{ExecutionProperties, PropertyView};
use super::tracking::{CustomTrackingRecord, TrackingRecord};
use super::value::{DynValue, Value, ValueType, boxed};

/// Capabilities shared by every activity kind
#[derive(Default)]
pub struct ActivityContext {
    state: Option<SharedState>,
    instance: InstanceId,
    node: NodeKey,
    environment: EnvironmentId,
}

impl ActivityContext {
    pub(crate) fn bind(
        &mut self,
        state: SharedState,
        instance: InstanceId,
        node: NodeKey,
        environment: EnvironmentId,
    ) {
        self.state = Some(state);
        self.instance = instance;
        self.node = node;
        self.environment = environment;
    }

    pub(crate) fn shared(&self) -> Result<&SharedState> {
        self.state
            .as_ref()
            .ok_or_else(|| UsageError::ObjectDisposed("ActivityContext").into())
    }

    /// Bind this context to `instance` of `executor`, undoing a disposal
    pub fn reinitialize(
        &mut self,
        executor: &WorkflowExecutor,
        instance: InstanceId,
    ) -> Result<()> {
        let state = executor.shared().clone();
        let (node, environment) = {
            let st = state.lock();
            let record = st.instance(instance)?;
            (record.node(), record.environment())
        };
        self.bind(state, instance, node, environment);
        Ok(())
    }

    /// Release the executor; every later operation fails
    pub fn dispose(&mut self) {
        self.state = None;
    }

    /// Whether the context was disposed
    pub fn is_disposed(&self) -> bool {
        self.state.is_none()
    }

    /// Instance this context is bound to
    pub fn activity_instance_id(&self) -> Result<InstanceId> {
        self.shared()?;
        Ok(self.instance)
    }

    /// Id of the running workflow
    pub fn workflow_instance_id(&self) -> Result<Uuid> {
        Ok(self.shared()?.lock().workflow_id)
    }

    /// Display name of the running activity
    pub fn display_name(&self) -> Result<String> {
        let st = self.shared()?.lock();
        Ok(st.definition.node(self.node).display_name().to_string())
    }

    /// Dotted address of the running activity
    pub fn qualified_id(&self) -> Result<QualifiedId> {
        let st = self.shared()?.lock();
        Ok(st.definition.qualified_id(self.node).unwrap_or_else(|| QualifiedId(Vec::new())))
    }

    /// Resolve `reference` through the environment chain
    pub fn get_location(&self, reference: &LocationReference) -> Result<SharedLocation> {
        let st = self.shared()?.lock();
        Ok(st.environments.resolve(self.environment, reference)?.location)
    }

    /// Read a variable or argument
    pub fn get_value<T: Value>(&self, reference: &LocationReference) -> Result<T> {
        let location = self.get_location(reference)?;
        Ok(read_as::<T>(location.as_ref())?)
    }

    /// Write a variable or argument
    pub fn set_value<T: Value>(&self, reference: &LocationReference, value: T) -> Result<()> {
        let location = self.get_location(reference)?;
        write_as(location.as_ref(), value)?;
        Ok(())
    }

    fn resolve_inlined(
        &self,
        inlined: &InlinedLocationReference,
        requested: AccessDirection,
    ) -> Result<SharedLocation> {
        let mut st = self.shared()?.lock();
        let resolved = st
            .environments
            .resolve_inlined(self.environment, inlined, self.node, requested)?;
        Ok(resolved.location)
    }

    /// Read through an inlined reference
    pub fn get_inlined_value<T: Value>(&self, inlined: &InlinedLocationReference) -> Result<T> {
        let location = self.resolve_inlined(inlined, AccessDirection::Read)?;
        Ok(read_as::<T>(location.as_ref())?)
    }

    /// Write through an inlined reference
    pub fn set_inlined_value<T: Value>(
        &self,
        inlined: &InlinedLocationReference,
        value: T,
    ) -> Result<()> {
        let location = self.resolve_inlined(inlined, AccessDirection::Write)?;
        write_as(location.as_ref(), value)?;
        Ok(())
    }

    /// Look up a host extension
    pub fn get_extension<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>> {
        Ok(self.shared()?.lock().extensions.get::<T>())
    }

    /// Emit a custom tracking record
    ///
    /// Records reach the sink in order with the executor's own records,
    /// after the current activation. Does nothing when tracking is disabled
    /// or no sink is installed.
    pub fn track(&self, record: CustomTrackingRecord) -> Result<()> {
        let mut st = self.shared()?.lock();
        if st.tracking_sink().is_none() {
            return Ok(());
        }
        let record = TrackingRecord::Custom {
            instance_id: st.workflow_id,
            activity: st.activity_info(self.instance),
            name: record.name,
            data: record.data,
            timestamp: chrono::Utc::now(),
        };
        st.emit(record);
        Ok(())
    }

    /// Read-only view of the visible execution properties
    pub fn properties(&self) -> Result<PropertyView> {
        let state = self.shared()?.clone();
        Ok(PropertyView::new(ExecutionProperties::new(state, Some(self.instance))))
    }

    fn mark_canceled(&self) -> Result<()> {
        let mut st = self.shared()?.lock();
        let instance = st.instance_mut(self.instance)?;
        if !instance.cancellation_requested && !instance.aborting {
            return Err(StateError::CancellationNotRequested.into());
        }
        instance.marked_canceled = true;
        Ok(())
    }

    fn is_cancellation_requested(&self) -> Result<bool> {
        let st = self.shared()?.lock();
        Ok(st.instance(self.instance)?.is_cancellation_requested())
    }
}

/// Context of a [`CodeActivity`](super::activity::CodeActivity)
#[derive(Default)]
pub struct CodeActivityContext {
    base: ActivityContext,
}

impl CodeActivityContext {
    /// Handle stored in a handle variable, creating it on first use
    ///
    /// A new handle is owned by the environment that declares the variable.
    pub fn get_handle<H: Handle>(&self, reference: &LocationReference) -> Result<HandleId> {
        if reference.handle_kind() != Some(ValueType::of::<H>()) {
            return Err(LocationError::TypeMismatch {
                expected: type_name::<H>(),
                found: reference.handle_kind().map_or("plain variable", |kind| kind.name()),
            }
            .into());
        }

        let state = self.shared()?.clone();
        let (location, owner) = {
            let st = state.lock();
            let resolved = st.environments.resolve(self.environment, reference)?;
            let owner = st
                .environments
                .get(resolved.environment)
                .and_then(|environment| environment.owner())
                .map_or(HandleOwner::Root, |instance| HandleOwner::Instance {
                    instance,
                    environment: resolved.environment,
                });
            (resolved.location, owner)
        };

        if let Some(id) = read_as::<Option<HandleId>>(location.as_ref())? {
            return Ok(id);
        }

        let id = handle::create_handle(&state, ValueType::of::<H>(), owner)?;
        write_as(location.as_ref(), Some(id))?;
        Ok(id)
    }

    /// Run `f` against an initialized handle
    ///
    /// `f` runs while the executor state is locked. Calling any context or
    /// executor method from inside `f` deadlocks; copy what is needed out of
    /// the handle and act on it after `with_handle` returns.
    pub fn with_handle<H: Handle, R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut H) -> R,
    ) -> Result<R> {
        handle::with_handle(self.shared()?, id, f)
    }
}

impl Deref for CodeActivityContext {
    type Target = ActivityContext;

    fn deref(&self) -> &ActivityContext {
        &self.base
    }
}

impl DerefMut for CodeActivityContext {
    fn deref_mut(&mut self) -> &mut ActivityContext {
        &mut self.base
    }
}

/// Completions posted by async operations, drained by the executor
pub(crate) type CompletionInbox = Arc<Mutex<VecDeque<AsyncCompletionMessage>>>;

pub(crate) struct AsyncCompletionMessage {
    pub(crate) instance: InstanceId,
    pub(crate) operation: u64,
    pub(crate) outcome: anyhow::Result<DynValue>,
}

/// Token that completes a pending async operation, from any thread
///
/// The outcome is marshaled back to the executor thread and delivered to
/// `end_execute` on the next run. Completing an operation that was already
/// canceled has no effect.
pub struct AsyncCompletion {
    inbox: CompletionInbox,
    instance: InstanceId,
    operation: u64,
}

impl AsyncCompletion {
    /// Instance waiting for this operation
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Operation number
    pub fn operation(&self) -> u64 {
        self.operation
    }

    /// Deliver the outcome
    pub fn complete(self, outcome: anyhow::Result<DynValue>) {
        self.inbox.lock().push_back(AsyncCompletionMessage {
            instance: self.instance,
            operation: self.operation,
            outcome,
        });
    }

    /// Deliver a successful result
    pub fn succeed<T: Value>(self, value: T) {
        self.complete(Ok(boxed(value)));
    }

    /// Deliver a failure
    pub fn fail(self, error: anyhow::Error) {
        self.complete(Err(error));
    }
}

/// Context of an [`AsyncCodeActivity`](super::activity::AsyncCodeActivity)
#[derive(Default)]
pub struct AsyncCodeActivityContext {
    base: CodeActivityContext,
}

impl AsyncCodeActivityContext {
    /// Whether cancellation was requested
    pub fn is_cancellation_requested(&self) -> Result<bool> {
        self.base.is_cancellation_requested()
    }

    /// Acknowledge a cancellation request
    pub fn mark_canceled(&self) -> Result<()> {
        self.base.mark_canceled()
    }

    /// Start (or rejoin) the pending operation and get its completion token
    pub fn completion(&self) -> Result<AsyncCompletion> {
        let mut st = self.shared()?.lock();
        let inbox = st.inbox.clone();
        let pending = st.instance(self.instance)?.pending_async;
        let operation = match pending {
            Some(operation) => operation,
            None => {
                let operation = st.next_async_operation();
                st.instance_mut(self.instance)?.pending_async = Some(operation);
                debug!(instance = self.instance.0, operation, "async operation started");
                operation
            }
        };
        Ok(AsyncCompletion {
            inbox,
            instance: self.instance,
            operation,
        })
    }

    /// Keep `value` with the instance until the operation ends
    pub fn set_user_state<T: Any + Send>(&self, value: T) -> Result<()> {
        let mut st = self.shared()?.lock();
        st.instance_mut(self.instance)?.async_user_state = Some(Box::new(value));
        Ok(())
    }

    /// Copy of the user state, if it is a `T`
    pub fn user_state<T: Any + Send + Clone>(&self) -> Result<Option<T>> {
        let st = self.shared()?.lock();
        Ok(st
            .instance(self.instance)?
            .async_user_state
            .as_ref()
            .and_then(|state| state.downcast_ref::<T>())
            .cloned())
    }

    /// Remove and return the user state, if it is a `T`
    pub fn take_user_state<T: Any + Send>(&self) -> Result<Option<T>> {
        let mut st = self.shared()?.lock();
        let instance = st.instance_mut(self.instance)?;
        match instance.async_user_state.take() {
            Some(state) => match state.downcast::<T>() {
                Ok(value) => Ok(Some(*value)),
                Err(state) => {
                    instance.async_user_state = Some(state);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

impl Deref for AsyncCodeActivityContext {
    type Target = CodeActivityContext;

    fn deref(&self) -> &CodeActivityContext {
        &self.base
    }
}

impl DerefMut for AsyncCodeActivityContext {
    fn deref_mut(&mut self) -> &mut CodeActivityContext {
        &mut self.base
    }
}

/// Context of a [`NativeActivity`](super::activity::NativeActivity)
#[derive(Default)]
pub struct NativeActivityContext {
    base: CodeActivityContext,
}

impl NativeActivityContext {
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut ExecutorState, InstanceId) -> Result<R>,
    ) -> Result<R> {
        let mut st = self.shared()?.lock();
        f(&mut st, self.instance)
    }

    /// Schedule a child node of this activity
    pub fn schedule_activity(
        &self,
        node: NodeKey,
        callbacks: ChildCallbacks,
    ) -> Result<InstanceId> {
        self.with_state(|st, instance| st.schedule_child(instance, node, callbacks))
    }

    /// Executing children in scheduling order
    pub fn children(&self) -> Result<Vec<InstanceId>> {
        self.with_state(|st, instance| Ok(st.instance(instance)?.children().to_vec()))
    }

    /// Request cancellation of one executing child
    pub fn cancel_child(&self, child: InstanceId) -> Result<()> {
        self.with_state(|st, instance| st.request_cancel(Some(instance), child))
    }

    /// Request cancellation of every executing child
    pub fn cancel_children(&self) -> Result<()> {
        self.with_state(|st, instance| {
            let children = st.instance(instance)?.children().to_vec();
            for child in children {
                st.request_cancel(Some(instance), child)?;
            }
            Ok(())
        })
    }

    /// Create a named bookmark in the default scope
    pub fn create_bookmark(&self, name: &str, options: BookmarkOptions) -> Result<Bookmark> {
        self.with_state(|st, instance| {
            let bookmark = st.create_bookmark(instance, Bookmark::named(name), options)?;
            Ok(bookmark.as_ref().clone())
        })
    }

    /// Create a named bookmark in the scope of an initialized scope handle
    pub fn create_bookmark_in_scope(
        &self,
        name: &str,
        scope_handle: HandleId,
        options: BookmarkOptions,
    ) -> Result<Bookmark> {
        self.with_state(|st, instance| {
            let scope = st.scope_of(scope_handle)?;
            let bookmark = st.create_bookmark(instance, Bookmark::named_in(name, scope), options)?;
            Ok(bookmark.as_ref().clone())
        })
    }

    /// Create a bookmark only this workflow can resume
    pub fn create_internal_bookmark(&self, options: BookmarkOptions) -> Result<Bookmark> {
        self.with_state(|st, instance| {
            let bookmark = st.bookmarks.next_internal();
            let bookmark = st.create_bookmark(instance, bookmark, options)?;
            Ok(bookmark.as_ref().clone())
        })
    }

    /// Remove a bookmark owned by this instance
    pub fn remove_bookmark(&self, bookmark: &Bookmark) -> Result<bool> {
        self.with_state(|st, instance| st.remove_bookmark(instance, bookmark))
    }

    /// Remove every bookmark owned by this instance
    pub fn remove_all_bookmarks(&self) -> Result<usize> {
        self.with_state(|st, instance| Ok(st.remove_all_bookmarks(instance)))
    }

    /// Resume any registered bookmark, internal ones included
    pub fn resume_bookmark(
        &self,
        bookmark: &Bookmark,
        value: DynValue,
    ) -> Result<BookmarkResumptionResult> {
        self.with_state(|st, _| Ok(st.resume(bookmark, value, ResumeOrigin::Activity)))
    }

    /// Give a scope handle a fresh scope
    pub fn create_bookmark_scope(&self, scope_handle: HandleId) -> Result<BookmarkScope> {
        self.with_state(|st, _| st.initialize_bookmark_scope(scope_handle, Uuid::new_v4()))
    }

    /// Give a scope handle a known scope id, e.g. when restoring
    pub fn initialize_bookmark_scope(
        &self,
        scope_handle: HandleId,
        id: Uuid,
    ) -> Result<BookmarkScope> {
        self.with_state(|st, _| st.initialize_bookmark_scope(scope_handle, id))
    }

    /// Make an exclusive handle depend on a scope handle explicitly
    pub fn register_bookmark_scope(
        &self,
        exclusive_handle: HandleId,
        scope_handle: HandleId,
    ) -> Result<()> {
        self.with_state(|st, _| st.register_exclusive_scope(exclusive_handle, scope_handle))
    }

    /// Whether cancellation was requested
    pub fn is_cancellation_requested(&self) -> Result<bool> {
        self.base.is_cancellation_requested()
    }

    /// Acknowledge a cancellation request
    pub fn mark_canceled(&self) -> Result<()> {
        self.base.mark_canceled()
    }

    /// Mutable view of this instance's execution properties
    pub fn properties_mut(&self) -> Result<ExecutionProperties> {
        let state = self.shared()?.clone();
        Ok(ExecutionProperties::new(state, Some(self.instance)))
    }
}

impl Deref for NativeActivityContext {
    type Target = CodeActivityContext;

    fn deref(&self) -> &CodeActivityContext {
        &self.base
    }
}

impl DerefMut for NativeActivityContext {
    fn deref_mut(&mut self) -> &mut CodeActivityContext {
        &mut self.base
    }
}

/// Context of `on_child_faulted`
#[derive(Default)]
pub struct NativeActivityFaultContext {
    base: NativeActivityContext,
    fault: Option<Arc<anyhow::Error>>,
    source: Option<ActivityInstanceReference>,
    handled: bool,
}

impl NativeActivityFaultContext {
    pub(crate) fn prepare(&mut self, fault: Arc<anyhow::Error>, source: ActivityInstanceReference) {
        self.fault = Some(fault);
        self.source = Some(source);
        self.handled = false;
    }

    /// The propagating fault
    pub fn fault(&self) -> Result<Arc<anyhow::Error>> {
        self.shared()?;
        self.fault
            .clone()
            .ok_or_else(|| UsageError::ObjectDisposed("NativeActivityFaultContext").into())
    }

    /// Instance that raised the fault
    pub fn source(&self) -> Result<&ActivityInstanceReference> {
        self.shared()?;
        self.source
            .as_ref()
            .ok_or_else(|| UsageError::ObjectDisposed("NativeActivityFaultContext").into())
    }

    /// Stop propagation; the faulted child subtree is aborted
    pub fn handle_fault(&mut self) -> Result<()> {
        self.shared()?;
        self.handled = true;
        Ok(())
    }

    /// Whether `handle_fault` was called
    pub fn is_handled(&self) -> bool {
        self.handled
    }
}

impl Deref for NativeActivityFaultContext {
    type Target = NativeActivityContext;

    fn deref(&self) -> &NativeActivityContext {
        &self.base
    }
}

impl DerefMut for NativeActivityFaultContext {
    fn deref_mut(&mut self) -> &mut NativeActivityContext {
        &mut self.base
    }
}

/// Contexts that live in a pool
pub(crate) trait PooledContext: Default + Send + 'static {
    fn base_mut(&mut self) -> &mut ActivityContext;

    /// Clear per-activation data before returning to the pool
    fn reset(&mut self) {}

    fn pool(pools: &mut ContextPools) -> &mut ContextPool<Self>;
}

impl PooledContext for CodeActivityContext {
    fn base_mut(&mut self) -> &mut ActivityContext {
        &mut self.base
    }

    fn pool(pools: &mut ContextPools) -> &mut ContextPool<Self> {
        &mut pools.code
    }
}

impl PooledContext for AsyncCodeActivityContext {
    fn base_mut(&mut self) -> &mut ActivityContext {
        &mut self.base.base
    }

    fn pool(pools: &mut ContextPools) -> &mut ContextPool<Self> {
        &mut pools.async_code
    }
}

impl PooledContext for NativeActivityContext {
    fn base_mut(&mut self) -> &mut ActivityContext {
        &mut self.base.base
    }

    fn pool(pools: &mut ContextPools) -> &mut ContextPool<Self> {
        &mut pools.native
    }
}

impl PooledContext for NativeActivityFaultContext {
    fn base_mut(&mut self) -> &mut ActivityContext {
        &mut self.base.base.base
    }

    fn reset(&mut self) {
        self.fault = None;
        self.source = None;
        self.handled = false;
    }

    fn pool(pools: &mut ContextPools) -> &mut ContextPool<Self> {
        &mut pools.fault
    }
}

/// Free list of disposed contexts
#[derive(Debug)]
pub struct ContextPool<C> {
    free: Vec<C>,
    capacity: usize,
}

impl<C: Default> ContextPool<C> {
    /// Pool keeping at most `capacity` idle contexts
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Reuse an idle context or create one
    pub fn acquire(&mut self) -> C {
        self.free.pop().unwrap_or_default()
    }

    /// Return a context; dropped when the pool is full
    pub fn release(&mut self, context: C) {
        if self.free.len() < self.capacity {
            self.free.push(context);
        }
    }

    /// Number of idle contexts
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

/// One pool per context kind
pub(crate) struct ContextPools {
    code: ContextPool<CodeActivityContext>,
    async_code: ContextPool<AsyncCodeActivityContext>,
    native: ContextPool<NativeActivityContext>,
    fault: ContextPool<NativeActivityFaultContext>,
}

impl ContextPools {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            code: ContextPool::new(capacity),
            async_code: ContextPool::new(capacity),
            native: ContextPool::new(capacity),
            fault: ContextPool::new(capacity),
        }
    }
}

/// A pooled context bound to one activation
///
/// Dropping the lease disposes the context and returns it to its pool. The
/// executor lock must not be held when the lease drops.
pub(crate) struct ContextLease<C: PooledContext> {
    context: C,
    state: SharedState,
}

impl<C: PooledContext> ContextLease<C> {
    pub(crate) fn acquire(
        state: &SharedState,
        st: &mut ExecutorState,
        instance: InstanceId,
    ) -> Result<Self> {
        let (node, environment) = {
            let record = st.instance(instance)?;
            (record.node(), record.environment())
        };
        let mut context = C::pool(&mut st.pools).acquire();
        context.base_mut().bind(state.clone(), instance, node, environment);
        Ok(Self {
            context,
            state: state.clone(),
        })
    }
}

impl<C: PooledContext> Deref for ContextLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.context
    }
}

impl<C: PooledContext> DerefMut for ContextLease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.context
    }
}

impl<C: PooledContext> Drop for ContextLease<C> {
    fn drop(&mut self) {
        let mut context = std::mem::take(&mut self.context);
        context.base_mut().dispose();
        context.reset();
        let mut st = self.state.lock();
        C::pool(&mut st.pools).release(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_is_disposed() {
        let context = ActivityContext::default();
        assert!(context.is_disposed());
        let reference = LocationReference::new::<i32>("x");
        assert!(matches!(
            context.get_value::<i32>(&reference),
            Err(crate::runtime::error::RuntimeError::Usage(UsageError::ObjectDisposed(_)))
        ));
        assert!(context.track(CustomTrackingRecord::new("x")).is_err());
        assert!(context.get_extension::<String>().is_err());
    }

    #[test]
    fn test_pool_respects_capacity() {
        let mut pool: ContextPool<CodeActivityContext> = ContextPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_fault_context_reset() {
        let mut context = NativeActivityFaultContext::default();
        context.prepare(
            Arc::new(anyhow::anyhow!("boom")),
            ActivityInstanceReference {
                id: InstanceId(3),
                activity: "Child".into(),
                qualified_id: QualifiedId(vec![1, 2]),
            },
        );
        // disposed contexts refuse access even when prepared
        assert!(context.fault().is_err());
        assert!(context.handle_fault().is_err());

        context.reset();
        assert!(!context.is_handled());
        assert!(context.source.is_none());
    }
}
