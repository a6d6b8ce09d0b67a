//! Reference workflow executor
//!
//! Drives one workflow instance: a tree of activity instances scheduled
//! through a [`Quack`] work queue. Work produced by activities (child
//! executions, completion notifications, internal resumptions) is pushed to
//! the front; host resumptions and async completions are enqueued at the
//! back.
//!
//! All mutable state sits in one [`ExecutorState`] behind
//! `Arc<parking_lot::Mutex<_>>`. The executor and every context lock it per
//! operation and release it before calling into activity code, handle
//! callbacks, property callbacks or tracking sinks.

use std::any::{Any, TypeId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RuntimeConfig;
use super::activity::{ActivityBehavior, CompletedChild};
use super::bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkOptions, BookmarkRecord,
    BookmarkResumptionResult, BookmarkScope, BookmarkScopeHandle,
};
use super::context::{
    ActivityContext, AsyncCodeActivityContext, CodeActivityContext, CompletionInbox, ContextLease,
    ContextPools, NativeActivityContext, NativeActivityFaultContext, PooledContext,
};
use super::definition::{ArgumentBinding, NodeKey, WorkflowDefinition};
use super::environment::EnvironmentArena;
use super::error::{BookmarkError, HandleError, IdSpaceError, LocationError, Result, UsageError};
use super::exclusive::ExclusiveHandle;
use super::extension::Extensions;
use super::handle::{
    self, Handle, HandleId, HandleOwner, HandleRegistry, HandleState, HandleTable, HandleCatalog,
};
use super::id_space::QualifiedId;
use super::instance::{
    ActivityInstance, ActivityInstanceReference, ActivityInstanceState, ChildCallbacks, InstanceId,
    InstanceTable,
};
use super::location::{ArgumentDirection, ReferenceLocation};
use super::properties::{self, ExecutionProperties, PropertyTable, PropertyValue};
use super::quack::Quack;
use super::tracking::{ActivityInfo, TrackingRecord, TrackingSink};
use super::value::{DynValue, ValueType};

pub(crate) type SharedState = Arc<Mutex<ExecutorState>>;

/// Where a workflow stands after `run`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// `start` was not called yet
    NotStarted,
    /// No runnable work; waiting for resumptions or async completions
    Idle,
    /// The root instance reached a terminal state
    Completed(ActivityInstanceState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeOrigin {
    Host,
    Activity,
}

#[derive(Debug)]
pub(crate) enum WorkItem {
    Execute(InstanceId),
    Resume {
        instance: InstanceId,
        bookmark: Arc<Bookmark>,
        value: DynValue,
    },
    ChildCompleted {
        parent: InstanceId,
        child: CompletedChild,
        notify: bool,
    },
    AsyncCompleted {
        instance: InstanceId,
        operation: u64,
        outcome: anyhow::Result<DynValue>,
    },
    Cancel(InstanceId),
}

impl WorkItem {
    fn target(&self) -> InstanceId {
        match self {
            WorkItem::Execute(id) | WorkItem::Cancel(id) => *id,
            WorkItem::Resume { instance, .. } | WorkItem::AsyncCompleted { instance, .. } => {
                *instance
            }
            WorkItem::ChildCompleted { parent, .. } => *parent,
        }
    }
}

#[derive(Debug, Clone)]
struct WorkflowOutcome {
    state: ActivityInstanceState,
    fault: Option<String>,
}

/// Mutable state of one workflow instance
pub(crate) struct ExecutorState {
    pub(crate) config: RuntimeConfig,
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) workflow_id: Uuid,
    pub(crate) instances: InstanceTable,
    pub(crate) environments: EnvironmentArena,
    pub(crate) handles: HandleTable,
    pub(crate) handle_registry: HandleRegistry,
    pub(crate) root_handles: Vec<HandleId>,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) root_properties: PropertyTable,
    pub(crate) extensions: Extensions,
    pub(crate) inbox: CompletionInbox,
    pub(crate) pools: ContextPools,
    tracking: Option<Arc<dyn TrackingSink>>,
    pending_records: Vec<TrackingRecord>,
    work: Quack<WorkItem>,
    root: Option<InstanceId>,
    outcome: Option<WorkflowOutcome>,
    pending_fault: Option<String>,
    next_operation: u64,
}

impl ExecutorState {
    fn new(definition: Arc<WorkflowDefinition>, config: RuntimeConfig) -> Self {
        Self {
            work: Quack::with_capacity(config.initial_work_capacity),
            pools: ContextPools::new(config.context_pool_capacity),
            config,
            definition,
            workflow_id: Uuid::new_v4(),
            instances: InstanceTable::default(),
            environments: EnvironmentArena::new(),
            handles: HandleTable::default(),
            handle_registry: HandleCatalog::global().snapshot(),
            root_handles: Vec::new(),
            bookmarks: BookmarkManager::new(),
            root_properties: PropertyTable::default(),
            extensions: Extensions::default(),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            tracking: None,
            pending_records: Vec::new(),
            root: None,
            outcome: None,
            pending_fault: None,
            next_operation: 0,
        }
    }

    pub(crate) fn instance(&self, id: InstanceId) -> Result<&ActivityInstance> {
        self.instances
            .get(id)
            .ok_or_else(|| UsageError::InstanceNotExecuting(id.0).into())
    }

    pub(crate) fn instance_mut(&mut self, id: InstanceId) -> Result<&mut ActivityInstance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| UsageError::InstanceNotExecuting(id.0).into())
    }

    fn executing(&self, id: InstanceId) -> Result<&ActivityInstance> {
        match self.instances.get(id) {
            Some(instance)
                if instance.state() == ActivityInstanceState::Executing && !instance.aborting =>
            {
                Ok(instance)
            }
            _ => Err(UsageError::InstanceNotExecuting(id.0).into()),
        }
    }

    /// Behavior of an instance that can still run callbacks
    fn live_behavior(&self, id: InstanceId) -> Option<ActivityBehavior> {
        let instance = self.executing(id).ok()?;
        Some(self.definition.node(instance.node()).behavior().clone())
    }

    pub(crate) fn next_async_operation(&mut self) -> u64 {
        self.next_operation += 1;
        self.next_operation
    }

    pub(crate) fn tracking_sink(&self) -> Option<Arc<dyn TrackingSink>> {
        if self.config.tracking_enabled {
            self.tracking.clone()
        } else {
            None
        }
    }

    pub(crate) fn emit(&mut self, record: TrackingRecord) {
        if self.config.tracking_enabled && self.tracking.is_some() {
            self.pending_records.push(record);
        }
    }

    fn emit_state(&mut self, activity: ActivityInfo, state: ActivityInstanceState) {
        let record = TrackingRecord::ActivityState {
            instance_id: self.workflow_id,
            activity,
            state,
            timestamp: chrono::Utc::now(),
        };
        self.emit(record);
    }

    fn emit_workflow(&mut self, state: &str) {
        let record = TrackingRecord::WorkflowInstance {
            instance_id: self.workflow_id,
            state: state.to_string(),
            timestamp: chrono::Utc::now(),
        };
        self.emit(record);
    }

    fn node_of(&self, id: InstanceId) -> Option<NodeKey> {
        self.instances.get(id).map(ActivityInstance::node)
    }

    pub(crate) fn activity_info(&self, id: InstanceId) -> ActivityInfo {
        let reference = self.instance_reference(id);
        ActivityInfo {
            name: reference.activity,
            qualified_id: reference.qualified_id.to_string(),
            instance_id: id,
        }
    }

    pub(crate) fn instance_reference(&self, id: InstanceId) -> ActivityInstanceReference {
        let (activity, qualified_id) = match self.node_of(id) {
            Some(node) => (
                self.definition.node(node).display_name().to_string(),
                self.definition
                    .qualified_id(node)
                    .unwrap_or_else(|| QualifiedId(Vec::new())),
            ),
            None => (String::new(), QualifiedId(Vec::new())),
        };
        ActivityInstanceReference {
            id,
            activity,
            qualified_id,
        }
    }

    fn create_instance(
        &mut self,
        node: NodeKey,
        parent: Option<InstanceId>,
        callbacks: ChildCallbacks,
    ) -> Result<InstanceId> {
        let definition = self.definition.clone();
        let activity = definition.node(node);
        let parent_environment = match parent {
            Some(parent) => Some(self.instance(parent)?.environment()),
            None => None,
        };

        let declarations = activity.declarations().clone();
        let mut locations = declarations.create_locations();

        for argument in activity.arguments() {
            let Some(index) = declarations.find(argument.reference()) else {
                continue;
            };
            let location = match argument.binding() {
                ArgumentBinding::Unbound => continue,
                ArgumentBinding::Literal { factory, .. } => {
                    let cell = argument.reference().create_location();
                    cell.set_dyn(factory())?;
                    cell
                }
                ArgumentBinding::Reference(reference) => {
                    let Some(start) = parent_environment else {
                        return Err(LocationError::NotFound(reference.display_name()).into());
                    };
                    let bound = self.environments.resolve(start, reference)?.location;
                    match argument.direction() {
                        ArgumentDirection::In => {
                            let cell = argument.reference().create_location();
                            cell.set_dyn(bound.get_dyn())?;
                            cell
                        }
                        ArgumentDirection::InOut => ReferenceLocation::shared(bound, false),
                        ArgumentDirection::Out => ReferenceLocation::shared(bound, true),
                    }
                }
            };
            locations[index] = location;
        }

        let id = self.instances.next_id();
        let environment = self
            .environments
            .create(parent_environment, Some(id), declarations, locations);
        self.instances
            .insert(ActivityInstance::new(id, node, parent, environment, callbacks));
        if let Some(parent) = parent {
            self.instance_mut(parent)?.children.push(id);
        }

        debug!(instance = id.0, activity = activity.display_name(), "instance created");
        Ok(id)
    }

    pub(crate) fn schedule_child(
        &mut self,
        parent: InstanceId,
        node: NodeKey,
        callbacks: ChildCallbacks,
    ) -> Result<InstanceId> {
        let parent_node = self.executing(parent)?.node();
        let parent_activity = self.definition.node(parent_node);
        if !parent_activity.has_child(node) {
            let child = self
                .definition
                .get(node)
                .map_or_else(
                    || format!("node {}", node.0),
                    |child| child.display_name().to_string(),
                );
            return Err(UsageError::NotAChild {
                parent: parent_activity.display_name().to_string(),
                child,
            }
            .into());
        }

        let id = self.create_instance(node, Some(parent), callbacks)?;
        self.work.push_front(WorkItem::Execute(id));
        Ok(id)
    }

    /// Request cancellation of `target`; `requester` must be its parent
    pub(crate) fn request_cancel(
        &mut self,
        requester: Option<InstanceId>,
        target: InstanceId,
    ) -> Result<()> {
        if let Some(requester) = requester {
            let parent = self.instances.get(target).and_then(ActivityInstance::parent);
            if parent != Some(requester) {
                return Err(UsageError::NotOwnChild {
                    parent: requester.0,
                    child: target.0,
                }
                .into());
            }
        }

        let instance = self.instance_mut(target)?;
        if instance.state().is_terminal() || instance.cancellation_requested {
            return Ok(());
        }
        instance.cancellation_requested = true;

        if !instance.started {
            self.remove_queued(|item| matches!(item, WorkItem::Execute(id) if *id == target));
        }
        self.work.push_front(WorkItem::Cancel(target));
        debug!(instance = target.0, "cancellation requested");
        Ok(())
    }

    fn remove_queued(&mut self, mut matches: impl FnMut(&WorkItem) -> bool) -> usize {
        let mut removed = 0;
        while let Some(index) = self.work.position(&mut matches) {
            self.work.remove_at(index);
            removed += 1;
        }
        removed
    }

    /// Initialized handles of `kind` visible from `owner`, then root ones
    pub(crate) fn visible_handles(&self, owner: HandleOwner, kind: TypeId) -> Vec<HandleId> {
        let mut ids = match owner {
            HandleOwner::Instance { environment, .. } => {
                self.environments.handles_in_chain(environment)
            }
            HandleOwner::Root => Vec::new(),
        };
        ids.extend(self.root_handles.iter().copied());
        ids.retain(|id| {
            self.handles.is_kind(*id, kind)
                && self.handles.state(*id) == Some(HandleState::Initialized)
        });
        ids
    }

    pub(crate) fn attach_handle(&mut self, owner: HandleOwner, id: HandleId) {
        match owner {
            HandleOwner::Instance { environment, .. } => {
                self.environments.add_handle(environment, id);
            }
            HandleOwner::Root => self.root_handles.push(id),
        }
    }

    pub(crate) fn detach_handle(&mut self, owner: HandleOwner, id: HandleId) {
        match owner {
            HandleOwner::Instance { environment, .. } => {
                self.environments.remove_handle(environment, id)
            }
            HandleOwner::Root => self.root_handles.retain(|h| *h != id),
        }
    }

    /// Register a bookmark and record it with every visible exclusive handle
    pub(crate) fn create_bookmark(
        &mut self,
        owner: InstanceId,
        bookmark: Bookmark,
        options: BookmarkOptions,
    ) -> Result<Arc<Bookmark>> {
        let environment = self.executing(owner)?.environment();
        self.bookmarks.check_insert(&bookmark)?;

        let exclusive = self.visible_handles(
            HandleOwner::Instance {
                instance: owner,
                environment,
            },
            TypeId::of::<ExclusiveHandle>(),
        );
        let shared = self
            .bookmarks
            .insert(bookmark, owner, options, exclusive.clone())?;
        for id in exclusive {
            self.handles
                .get_mut::<ExclusiveHandle>(id)?
                .add_bookmark(shared.clone(), !options.non_blocking);
        }

        debug!(bookmark = %shared, owner = owner.0, "bookmark created");
        Ok(shared)
    }

    fn forget_bookmark(&mut self, record: &BookmarkRecord) {
        for id in record.exclusive_handles() {
            if let Ok(handle) = self.handles.get_mut::<ExclusiveHandle>(*id) {
                handle.remove_bookmark(record.bookmark());
            }
        }
    }

    pub(crate) fn remove_bookmark(
        &mut self,
        owner: InstanceId,
        bookmark: &Bookmark,
    ) -> Result<bool> {
        match self.bookmarks.remove_owned(owner, bookmark)? {
            Some(record) => {
                self.forget_bookmark(&record);
                debug!(bookmark = %bookmark, owner = owner.0, "bookmark removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn remove_all_bookmarks(&mut self, owner: InstanceId) -> usize {
        let records = self.bookmarks.remove_all(owner);
        for record in &records {
            self.forget_bookmark(record);
        }
        records.len()
    }

    /// Schedule delivery of `value` to the owner of `bookmark`
    ///
    /// Hosts may only address named bookmarks.
    pub(crate) fn resume(
        &mut self,
        bookmark: &Bookmark,
        value: DynValue,
        origin: ResumeOrigin,
    ) -> BookmarkResumptionResult {
        if origin == ResumeOrigin::Host && !bookmark.is_named() {
            return BookmarkResumptionResult::NotFound;
        }
        let Some(record) = self.bookmarks.get(bookmark) else {
            return BookmarkResumptionResult::NotFound;
        };
        let owner = record.owner();
        let options = record.options();
        let shared = record.bookmark().clone();

        if self.executing(owner).is_err() {
            return BookmarkResumptionResult::NotReady;
        }
        if !options.multiple_resume {
            if let Some(record) = self.bookmarks.remove(bookmark) {
                self.forget_bookmark(&record);
            }
        }

        let record = TrackingRecord::BookmarkResumption {
            instance_id: self.workflow_id,
            bookmark: shared.as_ref().clone(),
            owner: self.activity_info(owner),
            timestamp: chrono::Utc::now(),
        };
        self.emit(record);

        debug!(bookmark = %shared, owner = owner.0, ?origin, "bookmark resumed");
        let item = WorkItem::Resume {
            instance: owner,
            bookmark: shared,
            value,
        };
        match origin {
            ResumeOrigin::Host => self.work.enqueue(item),
            ResumeOrigin::Activity => self.work.push_front(item),
        }
        BookmarkResumptionResult::Success
    }

    pub(crate) fn scope_of(&self, scope_handle: HandleId) -> Result<BookmarkScope> {
        self.handles
            .get::<BookmarkScopeHandle>(scope_handle)?
            .scope()
            .cloned()
            .ok_or_else(|| BookmarkError::ScopeNotInitialized(scope_handle.0).into())
    }

    pub(crate) fn initialize_bookmark_scope(
        &mut self,
        scope_handle: HandleId,
        id: Uuid,
    ) -> Result<BookmarkScope> {
        if let Some(existing) = self.handles.get::<BookmarkScopeHandle>(scope_handle)?.scope() {
            return Err(UsageError::DuplicateBookmarkScope(existing.to_string()).into());
        }
        let scope = BookmarkScope::Scoped(id);
        self.bookmarks.register_scope(&scope)?;
        self.handles
            .get_mut::<BookmarkScopeHandle>(scope_handle)?
            .set_scope(scope.clone());
        debug!(handle = scope_handle.0, scope = %scope, "bookmark scope initialized");
        Ok(scope)
    }

    pub(crate) fn register_exclusive_scope(
        &mut self,
        exclusive: HandleId,
        scope_handle: HandleId,
    ) -> Result<()> {
        if !self.handles.is::<BookmarkScopeHandle>(scope_handle) {
            return Err(HandleError::WrongKind {
                id: scope_handle.0,
                expected: std::any::type_name::<BookmarkScopeHandle>(),
            }
            .into());
        }
        self.handles
            .get_mut::<ExclusiveHandle>(exclusive)?
            .register_scope(scope_handle)?;
        Ok(())
    }
}

/// Runs one workflow instance
pub struct WorkflowExecutor {
    state: SharedState,
    inbox: CompletionInbox,
}

impl WorkflowExecutor {
    /// Create an executor for a validated definition
    ///
    /// Definitions with validation errors are refused with every error
    /// listed, as are definitions whose ids exceed the configured
    /// `max_activity_id`.
    pub fn new(definition: Arc<WorkflowDefinition>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        definition.validate()?;
        if definition.max_assigned_id() > config.max_activity_id {
            return Err(IdSpaceError::Overflow(config.max_activity_id).into());
        }
        let state = ExecutorState::new(definition, config);
        let inbox = state.inbox.clone();
        debug!(workflow = %state.workflow_id, "executor created");
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            inbox,
        })
    }

    pub(crate) fn shared(&self) -> &SharedState {
        &self.state
    }

    /// Id of this workflow instance
    pub fn workflow_instance_id(&self) -> Uuid {
        self.state.lock().workflow_id
    }

    /// Definition being executed
    pub fn definition(&self) -> Arc<WorkflowDefinition> {
        self.state.lock().definition.clone()
    }

    /// Configuration in effect
    pub fn config(&self) -> RuntimeConfig {
        self.state.lock().config.clone()
    }

    /// Schedule the root activity
    pub fn start(&self) -> Result<InstanceId> {
        let root = {
            let mut st = self.state.lock();
            if st.root.is_some() {
                return Err(UsageError::AlreadyStarted.into());
            }
            let node = st.definition.root();
            let root = st.create_instance(node, None, ChildCallbacks::NONE)?;
            st.root = Some(root);
            st.work.push_front(WorkItem::Execute(root));
            st.emit_workflow("Started");
            info!(workflow = %st.workflow_id, "workflow started");
            root
        };
        self.flush_tracking();
        Ok(root)
    }

    /// Process work until none is runnable
    pub fn run(&self) -> Result<WorkflowStatus> {
        loop {
            self.drain_inbox();
            let item = self.state.lock().work.dequeue();
            let Some(item) = item else {
                break;
            };
            self.dispatch(item)?;
            self.flush_tracking();
        }
        self.flush_tracking();
        Ok(self.status())
    }

    /// Current status without running anything
    pub fn status(&self) -> WorkflowStatus {
        let st = self.state.lock();
        match (&st.root, &st.outcome) {
            (None, _) => WorkflowStatus::NotStarted,
            (_, Some(outcome)) => WorkflowStatus::Completed(outcome.state),
            _ => WorkflowStatus::Idle,
        }
    }

    /// Description of the fault that ended the workflow, if any
    pub fn fault(&self) -> Option<String> {
        self.state
            .lock()
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.fault.clone())
    }

    /// Number of queued work items
    pub fn pending_work(&self) -> usize {
        self.state.lock().work.len()
    }

    /// Resume a named bookmark from the host
    pub fn resume_bookmark(
        &self,
        bookmark: &Bookmark,
        value: DynValue,
    ) -> Result<BookmarkResumptionResult> {
        let mut st = self.state.lock();
        if st.root.is_none() {
            return Err(UsageError::ExecutorNotRunning("not started").into());
        }
        if st.outcome.is_some() {
            return Err(UsageError::ExecutorNotRunning("completed").into());
        }
        Ok(st.resume(bookmark, value, ResumeOrigin::Host))
    }

    /// Request cancellation of the whole workflow
    pub fn cancel(&self) -> Result<()> {
        let mut st = self.state.lock();
        let Some(root) = st.root else {
            return Err(UsageError::ExecutorNotRunning("not started").into());
        };
        if st.outcome.is_some() {
            return Ok(());
        }
        st.request_cancel(None, root)
    }

    /// Abort the whole workflow; every instance ends `Faulted`
    pub fn abort(&self, reason: &str) -> Result<()> {
        let root = {
            let mut st = self.state.lock();
            let Some(root) = st.root else {
                return Err(UsageError::ExecutorNotRunning("not started").into());
            };
            if st.outcome.is_some() {
                return Ok(());
            }
            st.pending_fault = Some(reason.to_string());
            root
        };
        warn!(reason, "workflow aborted");
        self.abort_subtree(root)?;
        self.flush_tracking();
        Ok(())
    }

    /// Provide a host extension to activities
    pub fn add_extension<T: Any + Send + Sync>(&self, extension: Arc<T>) {
        self.state.lock().extensions.insert(extension);
    }

    /// Install the tracking sink
    pub fn set_tracking_sink(&self, sink: Arc<dyn TrackingSink>) {
        self.state.lock().tracking = Some(sink);
    }

    /// Host-level execution properties
    pub fn root_properties(&self) -> ExecutionProperties {
        ExecutionProperties::new(self.state.clone(), None)
    }

    /// Add a host-level execution property
    pub fn add_root_property(
        &self,
        name: &str,
        value: PropertyValue,
        only_visible_to_public_children: bool,
    ) -> Result<()> {
        self.root_properties()
            .add(name, value, only_visible_to_public_children)
    }

    /// Create a handle owned by the executor root
    pub fn create_root_handle<H: Handle>(&self) -> Result<HandleId> {
        handle::create_handle(&self.state, ValueType::of::<H>(), HandleOwner::Root)
    }

    /// Run `f` against an initialized handle
    ///
    /// The executor lock is held while `f` runs, so `f` must not call back
    /// into this executor or any of its contexts.
    pub fn with_handle<H: Handle, R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut H) -> R,
    ) -> Result<R> {
        handle::with_handle(&self.state, id, f)
    }

    /// Lifecycle state of a handle
    pub fn handle_state(&self, id: HandleId) -> Option<HandleState> {
        self.state.lock().handles.state(id)
    }

    /// Registered bookmarks
    pub fn bookmarks(&self) -> Vec<BookmarkInfo> {
        let st = self.state.lock();
        let mut infos: Vec<BookmarkInfo> = st
            .bookmarks
            .records()
            .map(|record| BookmarkInfo {
                bookmark: record.bookmark().as_ref().clone(),
                owner: record.owner(),
                activity: st.activity_info(record.owner()).name,
                options: record.options(),
            })
            .collect();
        infos.sort_by(|a, b| {
            a.owner
                .cmp(&b.owner)
                .then_with(|| a.bookmark.to_string().cmp(&b.bookmark.to_string()))
        });
        infos
    }

    /// State of a live or completed instance
    pub fn instance_state(&self, id: InstanceId) -> Option<ActivityInstanceState> {
        self.state.lock().instances.state(id)
    }

    /// Root instance, once started
    pub fn root_instance(&self) -> Option<InstanceId> {
        self.state.lock().root
    }

    /// Executing children of a live instance
    pub fn children_of(&self, id: InstanceId) -> Vec<InstanceId> {
        self.state
            .lock()
            .instances
            .get(id)
            .map(|instance| instance.children().to_vec())
            .unwrap_or_default()
    }

    /// Number of live instances
    pub fn live_instances(&self) -> usize {
        self.state.lock().instances.live_count()
    }

    /// Fresh, unpooled context bound to a live instance, for host inspection
    pub fn context_for(&self, instance: InstanceId) -> Result<ActivityContext> {
        let mut context = ActivityContext::default();
        context.reinitialize(self, instance)?;
        Ok(context)
    }

    /// Disassociate a bookmark scope from this executor
    pub fn unregister_bookmark_scope(&self, scope: &BookmarkScope) -> bool {
        self.state.lock().bookmarks.unregister_scope(scope)
    }

    fn drain_inbox(&self) {
        let messages: Vec<_> = self.inbox.lock().drain(..).collect();
        if messages.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        for message in messages {
            st.work.enqueue(WorkItem::AsyncCompleted {
                instance: message.instance,
                operation: message.operation,
                outcome: message.outcome,
            });
        }
    }

    fn flush_tracking(&self) {
        let (sink, records) = {
            let mut st = self.state.lock();
            let records = std::mem::take(&mut st.pending_records);
            (st.tracking_sink(), records)
        };
        if let Some(sink) = sink {
            for record in &records {
                sink.track(record);
            }
        }
    }

    fn lease<C: PooledContext>(&self, instance: InstanceId) -> Result<ContextLease<C>> {
        let mut st = self.state.lock();
        ContextLease::acquire(&self.state, &mut st, instance)
    }

    fn dispatch(&self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Execute(id) => self.execute(id),
            WorkItem::Resume {
                instance,
                bookmark,
                value,
            } => self.resume(instance, &bookmark, value),
            WorkItem::ChildCompleted {
                parent,
                child,
                notify,
            } => self.child_completed(parent, child, notify),
            WorkItem::AsyncCompleted {
                instance,
                operation,
                outcome,
            } => self.async_completed(instance, operation, outcome),
            WorkItem::Cancel(id) => self.cancel_instance(id),
        }
    }

    fn execute(&self, id: InstanceId) -> Result<()> {
        let behavior = {
            let mut st = self.state.lock();
            let Some(behavior) = st.live_behavior(id) else {
                return Ok(());
            };
            st.instance_mut(id)?.started = true;
            let info = st.activity_info(id);
            debug!(instance = id.0, activity = %info.name, "executing");
            st.emit_state(info, ActivityInstanceState::Executing);
            behavior
        };

        let outcome = match behavior {
            ActivityBehavior::Code(activity) => {
                let mut context = self.lease::<CodeActivityContext>(id)?;
                activity.execute(&mut context)
            }
            ActivityBehavior::AsyncCode(activity) => {
                let mut context = self.lease::<AsyncCodeActivityContext>(id)?;
                activity.begin_execute(&mut context)
            }
            ActivityBehavior::Native(activity) => {
                let mut context = self.lease::<NativeActivityContext>(id)?;
                activity.execute(&mut context)
            }
        };
        self.after_callback(id, outcome)
    }

    fn resume(&self, instance: InstanceId, bookmark: &Bookmark, value: DynValue) -> Result<()> {
        let behavior = self.state.lock().live_behavior(instance);
        let Some(ActivityBehavior::Native(activity)) = behavior else {
            debug!(instance = instance.0, bookmark = %bookmark, "resumption dropped");
            return Ok(());
        };
        let outcome = {
            let mut context = self.lease::<NativeActivityContext>(instance)?;
            activity.on_bookmark_resumed(&mut context, bookmark, value)
        };
        self.after_callback(instance, outcome)
    }

    fn child_completed(
        &self,
        parent: InstanceId,
        child: CompletedChild,
        notify: bool,
    ) -> Result<()> {
        let behavior = self.state.lock().live_behavior(parent);
        match behavior {
            None => Ok(()),
            Some(ActivityBehavior::Native(activity)) if notify => {
                let outcome = {
                    let mut context = self.lease::<NativeActivityContext>(parent)?;
                    activity.on_child_completed(&mut context, &child)
                };
                self.after_callback(parent, outcome)
            }
            Some(_) => self.try_complete(parent),
        }
    }

    fn async_completed(
        &self,
        instance: InstanceId,
        operation: u64,
        outcome: anyhow::Result<DynValue>,
    ) -> Result<()> {
        let activity = {
            let mut st = self.state.lock();
            let Some(ActivityBehavior::AsyncCode(activity)) = st.live_behavior(instance) else {
                return Ok(());
            };
            let record = st.instance_mut(instance)?;
            if record.pending_async != Some(operation) {
                debug!(instance = instance.0, operation, "stale async completion ignored");
                return Ok(());
            }
            record.pending_async = None;
            activity
        };

        let result = {
            let mut context = self.lease::<AsyncCodeActivityContext>(instance)?;
            activity.end_execute(&mut context, outcome)
        };
        self.after_callback(instance, result)
    }

    fn cancel_instance(&self, id: InstanceId) -> Result<()> {
        let (behavior, started, pending) = {
            let st = self.state.lock();
            let Some(behavior) = st.live_behavior(id) else {
                return Ok(());
            };
            let instance = st.instance(id)?;
            (behavior, instance.started, instance.has_pending_async())
        };

        if !started {
            self.state.lock().instance_mut(id)?.marked_canceled = true;
            return self.try_complete(id);
        }

        let outcome = match behavior {
            ActivityBehavior::Code(_) => Ok(()),
            ActivityBehavior::AsyncCode(_) if !pending => Ok(()),
            ActivityBehavior::AsyncCode(activity) => {
                let outcome = {
                    let mut context = self.lease::<AsyncCodeActivityContext>(id)?;
                    activity.cancel(&mut context)
                };
                // an acknowledged cancellation releases the pending operation
                let mut st = self.state.lock();
                if let Some(instance) = st.instances.get_mut(id) {
                    if instance.marked_canceled {
                        instance.pending_async = None;
                    }
                }
                outcome
            }
            ActivityBehavior::Native(activity) => {
                let mut context = self.lease::<NativeActivityContext>(id)?;
                activity.cancel(&mut context)
            }
        };
        self.after_callback(id, outcome)
    }

    fn after_callback(&self, id: InstanceId, outcome: anyhow::Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => self.try_complete(id),
            Err(error) => self.raise_fault(id, Arc::new(error)),
        }
    }

    /// Complete `id` if nothing keeps it executing
    fn try_complete(&self, id: InstanceId) -> Result<()> {
        let state = {
            let st = self.state.lock();
            let Some(instance) = st.instances.get(id) else {
                return Ok(());
            };
            if instance.state().is_terminal()
                || !instance.children().is_empty()
                || instance.has_pending_async()
                || st.bookmarks.has_blocking(id)
            {
                return Ok(());
            }
            if instance.is_marked_canceled() {
                ActivityInstanceState::Canceled
            } else {
                ActivityInstanceState::Closed
            }
        };
        self.complete_instance(id, state)
    }

    /// Move `id` to `final_state`, tear down its scope and notify the parent
    fn complete_instance(&self, id: InstanceId, final_state: ActivityInstanceState) -> Result<()> {
        let (handles, registered, registration) = {
            let mut st = self.state.lock();
            let Some(instance) = st.instances.get_mut(id) else {
                return Ok(());
            };
            instance.set_state(final_state)?;
            instance.pending_async = None;
            instance.async_user_state = None;
            let registered = instance.properties.drain_registered();
            let environment = instance.environment();

            let registration = properties::registration_context(&st, Some(id))?;

            st.remove_all_bookmarks(id);
            let handles = st
                .environments
                .get(environment)
                .map(|environment| environment.handles().to_vec())
                .unwrap_or_default();
            (handles, registered, registration)
        };

        for handle in handles.into_iter().rev() {
            if let Err(err) = handle::uninitialize_handle(&self.state, handle) {
                warn!(
                    instance = id.0,
                    handle = handle.0,
                    error = %err,
                    "handle uninitialize failed"
                );
            }
        }
        for (name, property) in registered {
            if let Err(err) = property.unregister(&registration) {
                warn!(
                    instance = id.0,
                    property = %name,
                    error = %err,
                    "property unregister failed"
                );
            }
        }

        let is_root = {
            let mut st = self.state.lock();
            let info = st.activity_info(id);
            let Some(instance) = st.instances.retire(id) else {
                return Ok(());
            };
            st.environments.remove(instance.environment());
            st.emit_state(info.clone(), final_state);
            debug!(
                instance = id.0,
                activity = %info.name,
                state = %final_state,
                "instance completed"
            );

            match instance.parent() {
                Some(parent) => {
                    if let Some(record) = st.instances.get_mut(parent) {
                        record.children.retain(|child| *child != id);
                        if !record.state().is_terminal() && !record.aborting {
                            st.work.push_front(WorkItem::ChildCompleted {
                                parent,
                                child: CompletedChild {
                                    instance: id,
                                    node: instance.node(),
                                    display_name: info.name,
                                    state: final_state,
                                },
                                notify: instance.callbacks.on_completed,
                            });
                        }
                    }
                    false
                }
                None => {
                    let fault = st.pending_fault.take();
                    st.outcome = Some(WorkflowOutcome {
                        state: final_state,
                        fault,
                    });
                    st.emit_workflow(&final_state.to_string());
                    info!(workflow = %st.workflow_id, state = %final_state, "workflow completed");
                    true
                }
            }
        };

        if is_root {
            self.teardown_root_handles();
        }
        Ok(())
    }

    fn teardown_root_handles(&self) {
        let handles = self.state.lock().root_handles.clone();
        for handle in handles.into_iter().rev() {
            if let Err(err) = handle::uninitialize_handle(&self.state, handle) {
                warn!(handle = handle.0, error = %err, "root handle uninitialize failed");
            }
        }
    }

    /// Propagate a fault from `source` towards the root
    ///
    /// Each ancestor whose child on the path was scheduled with a fault
    /// callback may handle it; the faulted child subtree is then aborted.
    /// A fault no ancestor handles aborts the whole tree.
    fn raise_fault(&self, source: InstanceId, fault: Arc<anyhow::Error>) -> Result<()> {
        let reference = {
            let st = self.state.lock();
            if st.instances.get(source).is_none() {
                return Ok(());
            }
            st.instance_reference(source)
        };
        warn!(
            instance = source.0,
            activity = %reference.activity,
            error = %fault,
            "activity faulted"
        );

        let mut child = source;
        loop {
            let step = {
                let st = self.state.lock();
                let Some(record) = st.instances.get(child) else {
                    return Ok(());
                };
                record.parent().map(|parent| {
                    let handler = match st.live_behavior(parent) {
                        Some(ActivityBehavior::Native(activity)) if record.callbacks.on_faulted => {
                            Some(activity)
                        }
                        _ => None,
                    };
                    (parent, handler)
                })
            };

            let Some((parent, handler)) = step else {
                self.state.lock().pending_fault = Some(fault.to_string());
                return self.abort_subtree(child);
            };

            if let Some(activity) = handler {
                let (outcome, handled) = {
                    let mut context = self.lease::<NativeActivityFaultContext>(parent)?;
                    context.prepare(fault.clone(), reference.clone());
                    let outcome = activity.on_child_faulted(&mut context);
                    (outcome, context.is_handled())
                };
                if let Err(error) = outcome {
                    return self.raise_fault(parent, Arc::new(error));
                }
                if handled {
                    debug!(handler = parent.0, source = source.0, "fault handled");
                    return self.abort_subtree(child);
                }
            }
            child = parent;
        }
    }

    /// Fault every instance in the subtree of `top`, children first
    fn abort_subtree(&self, top: InstanceId) -> Result<()> {
        let order = {
            let mut st = self.state.lock();
            let order = st.instances.subtree(top);
            for id in &order {
                if let Some(instance) = st.instances.get_mut(*id) {
                    instance.aborting = true;
                }
            }
            let doomed: HashSet<InstanceId> = order.iter().copied().collect();
            st.remove_queued(|item| doomed.contains(&item.target()));
            order
        };

        for id in order.into_iter().rev() {
            self.complete_instance(id, ActivityInstanceState::Faulted)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("WorkflowExecutor")
            .field("workflow_id", &st.workflow_id)
            .field("live_instances", &st.instances.live_count())
            .field("pending_work", &st.work.len())
            .finish()
    }
}
