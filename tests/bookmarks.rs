//! Integration tests for bookmarks, bookmark scopes and exclusive handles

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tarry::runtime::bookmark::BookmarkScope;
use tarry::runtime::error::{RuntimeError, UsageError};
use tarry::runtime::id_space::IdSpace;
use tarry::runtime::{
    ActivityBehavior, ActivityInstanceState, Bookmark, BookmarkOptions, BookmarkResumptionResult,
    BookmarkScopeHandle, DefinitionBuilder, DynValue, ExclusiveHandle, Handle, HandleCatalog,
    HandleInitializationContext, LocationReference, NativeActivity, NativeActivityContext,
    RuntimeConfig, WorkflowExecutor, WorkflowStatus, boxed,
};
use uuid::Uuid;

#[test]
fn test_bookmark_equality_and_hash() {
    let scope = BookmarkScope::Scoped(Uuid::new_v4());

    assert_eq!(Bookmark::named("approve"), Bookmark::named("approve"));
    assert_ne!(Bookmark::named("approve"), Bookmark::named_in("approve", scope.clone()));
    assert_eq!(
        Bookmark::named_in("approve", scope.clone()),
        Bookmark::named_in("approve", scope)
    );

    let mut set = HashSet::new();
    set.insert(Bookmark::named("approve"));
    set.insert(Bookmark::named("approve"));
    set.insert(Bookmark::Internal { id: 1 });
    set.insert(Bookmark::named("1"));
    assert_eq!(set.len(), 3);
    assert_ne!(Bookmark::Internal { id: 1 }, Bookmark::named("1"));
}

#[test]
fn test_default_scope_is_shared() {
    let first = BookmarkScope::default_scope();
    let second = BookmarkScope::default_scope();
    assert!(std::ptr::eq(first, second));
    assert!(first.is_default());
    assert_eq!(Bookmark::named("a").scope(), Some(first));
}

#[test]
fn test_id_space_ids_start_at_one() {
    let mut space = IdSpace::new();
    for name in ["a", "b", "c"] {
        space.add(name).unwrap();
    }

    assert_eq!(space.get(1), Some(&"a"));
    assert_eq!(space.get(3), Some(&"c"));
    assert_eq!(space.get(0), None);
    assert_eq!(space.get(4), None);
    assert_eq!(space.member_count(), 3);
}

/// What the exclusive-handle activity saw at each step
#[derive(Debug, Default)]
struct ExclusiveObservations {
    default_scopes: Vec<bool>,
    scopes_match: bool,
    important_after_create: usize,
    late_registration: Option<String>,
    important_after_remove: usize,
}

struct ScopedApproval {
    scope: LocationReference,
    exclusive: LocationReference,
    seen: Arc<Mutex<ExclusiveObservations>>,
}

impl NativeActivity for ScopedApproval {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        let scope_handle = context.get_handle::<BookmarkScopeHandle>(&self.scope)?;
        context.create_bookmark_scope(scope_handle)?;

        let exclusive = context.get_handle::<ExclusiveHandle>(&self.exclusive)?;
        let (is_default, scopes) = context.with_handle::<ExclusiveHandle, _>(exclusive, |handle| {
            (handle.is_default_scopes(), handle.bookmark_scopes().to_vec())
        })?;

        let bookmark =
            context.create_bookmark_in_scope("approve", scope_handle, BookmarkOptions::NONE)?;
        let important = context
            .with_handle::<ExclusiveHandle, _>(exclusive, |handle| handle.important_count())?;

        let late = context.register_bookmark_scope(exclusive, scope_handle);

        context.remove_bookmark(&bookmark)?;
        let after = context
            .with_handle::<ExclusiveHandle, _>(exclusive, |handle| handle.important_count())?;

        let mut seen = self.seen.lock();
        seen.default_scopes.push(is_default);
        seen.scopes_match = scopes == vec![scope_handle];
        seen.important_after_create = important;
        seen.late_registration = late.err().map(|err| err.to_string());
        seen.important_after_remove = after;
        Ok(())
    }
}

#[test]
fn test_exclusive_handle_tracks_scoped_bookmarks() {
    let scope = LocationReference::handle::<BookmarkScopeHandle>("scope");
    let exclusive = LocationReference::handle::<ExclusiveHandle>("exclusive");
    let seen = Arc::new(Mutex::new(ExclusiveObservations::default()));

    let mut builder = DefinitionBuilder::new();
    let root = builder.add(
        "ScopedApproval",
        ActivityBehavior::native(ScopedApproval {
            scope: scope.clone(),
            exclusive: exclusive.clone(),
            seen: seen.clone(),
        }),
    );
    builder.add_variable(root, &scope).add_variable(root, &exclusive);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor.start().unwrap();
    let status = executor.run().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.default_scopes, vec![true]);
    assert!(seen.scopes_match);
    assert_eq!(seen.important_after_create, 1);
    assert!(seen.late_registration.is_some());
    assert_eq!(seen.important_after_remove, 0);
    assert_eq!(status, WorkflowStatus::Completed(ActivityInstanceState::Closed));
}

/// Waits on one named bookmark, optionally resumable many times
struct Waiter {
    name: String,
    options: BookmarkOptions,
    received: Arc<Mutex<Vec<i32>>>,
    internal: Arc<Mutex<Option<Bookmark>>>,
}

impl NativeActivity for Waiter {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.create_bookmark(&self.name, self.options)?;
        let internal = context.create_internal_bookmark(BookmarkOptions::NON_BLOCKING)?;
        *self.internal.lock() = Some(internal);
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        context: &mut NativeActivityContext,
        _bookmark: &Bookmark,
        value: DynValue,
    ) -> anyhow::Result<()> {
        let value: i32 = tarry::runtime::unbox(value)?;
        self.received.lock().push(value);
        if value < 0 {
            context.remove_all_bookmarks()?;
        }
        Ok(())
    }
}

fn waiter(
    options: BookmarkOptions,
) -> (WorkflowExecutor, Arc<Mutex<Vec<i32>>>, Arc<Mutex<Option<Bookmark>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let internal = Arc::new(Mutex::new(None));
    let mut builder = DefinitionBuilder::new();
    let root = builder.add(
        "Waiter",
        ActivityBehavior::native(Waiter {
            name: "input".to_string(),
            options,
            received: received.clone(),
            internal: internal.clone(),
        }),
    );
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();
    executor.start().unwrap();
    (executor, received, internal)
}

#[test]
fn test_single_resume_bookmark_is_consumed() {
    let (executor, received, _) = waiter(BookmarkOptions::NONE);
    assert_eq!(executor.run().unwrap(), WorkflowStatus::Idle);
    assert_eq!(executor.bookmarks().len(), 2);

    let input = Bookmark::named("input");
    assert_eq!(
        executor.resume_bookmark(&input, boxed(5i32)).unwrap(),
        BookmarkResumptionResult::Success
    );
    assert_eq!(
        executor.resume_bookmark(&input, boxed(6i32)).unwrap(),
        BookmarkResumptionResult::NotFound
    );

    // only the non-blocking internal bookmark remains
    let status = executor.run().unwrap();
    assert_eq!(*received.lock(), vec![5]);
    assert_eq!(status, WorkflowStatus::Completed(ActivityInstanceState::Closed));
}

#[test]
fn test_multiple_resume_bookmark_stays_registered() {
    let (executor, received, _) = waiter(BookmarkOptions::MULTIPLE_RESUME);
    executor.run().unwrap();

    let input = Bookmark::named("input");
    executor.resume_bookmark(&input, boxed(1i32)).unwrap();
    executor.resume_bookmark(&input, boxed(2i32)).unwrap();
    assert_eq!(executor.run().unwrap(), WorkflowStatus::Idle);

    executor.resume_bookmark(&input, boxed(-1i32)).unwrap();
    assert_eq!(
        executor.run().unwrap(),
        WorkflowStatus::Completed(ActivityInstanceState::Closed)
    );
    assert_eq!(*received.lock(), vec![1, 2, -1]);
}

#[test]
fn test_host_cannot_resume_internal_bookmark() {
    let (executor, received, internal) = waiter(BookmarkOptions::NONE);
    executor.run().unwrap();

    let internal = internal.lock().clone().unwrap();
    assert!(!internal.is_named());
    assert_eq!(
        executor.resume_bookmark(&internal, boxed(9i32)).unwrap(),
        BookmarkResumptionResult::NotFound
    );
    assert_eq!(
        executor
            .resume_bookmark(&Bookmark::named("missing"), boxed(9i32))
            .unwrap(),
        BookmarkResumptionResult::NotFound
    );
    assert!(received.lock().is_empty());
}

struct DuplicateScope {
    scope: LocationReference,
    outcome: Arc<Mutex<Option<RuntimeError>>>,
}

impl NativeActivity for DuplicateScope {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        let handle = context.get_handle::<BookmarkScopeHandle>(&self.scope)?;
        let id = Uuid::new_v4();
        context.initialize_bookmark_scope(handle, id)?;
        *self.outcome.lock() = context.initialize_bookmark_scope(handle, id).err();
        Ok(())
    }
}

#[test]
fn test_scope_cannot_be_initialized_twice() {
    let scope = LocationReference::handle::<BookmarkScopeHandle>("scope");
    let outcome = Arc::new(Mutex::new(None));

    let mut builder = DefinitionBuilder::new();
    let root = builder.add(
        "DuplicateScope",
        ActivityBehavior::native(DuplicateScope {
            scope: scope.clone(),
            outcome: outcome.clone(),
        }),
    );
    builder.add_variable(root, &scope);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();
    executor.start().unwrap();
    executor.run().unwrap();

    assert!(matches!(
        outcome.lock().take(),
        Some(RuntimeError::Usage(UsageError::DuplicateBookmarkScope(_)))
    ));
}

/// Registers a private scope while it initializes
#[derive(Default)]
struct PrivateScope {
    scope: Option<BookmarkScope>,
    second_registration: Option<String>,
}

impl Handle for PrivateScope {
    fn on_initialize(&mut self, context: &mut HandleInitializationContext) -> anyhow::Result<()> {
        let scope = BookmarkScope::Scoped(Uuid::new_v4());
        context.register_bookmark_scope(&scope)?;
        self.second_registration =
            context.register_bookmark_scope(&scope).err().map(|err| err.to_string());
        self.scope = Some(scope);
        Ok(())
    }
}

struct HoldPrivateScope {
    private: LocationReference,
    seen: Arc<Mutex<Option<(BookmarkScope, Option<String>)>>>,
}

impl NativeActivity for HoldPrivateScope {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        let private = context.get_handle::<PrivateScope>(&self.private)?;
        let seen = context.with_handle::<PrivateScope, _>(private, |handle| {
            (handle.scope.clone(), handle.second_registration.clone())
        })?;
        if let (Some(scope), repeat) = seen {
            *self.seen.lock() = Some((scope, repeat));
        }
        context.create_bookmark("hold", BookmarkOptions::NONE)?;
        Ok(())
    }
}

#[test]
fn test_handle_registers_its_own_scope() {
    HandleCatalog::global().register_default::<PrivateScope>();
    let private = LocationReference::handle::<PrivateScope>("private");
    let seen = Arc::new(Mutex::new(None));

    let mut builder = DefinitionBuilder::new();
    let root = builder.add(
        "HoldPrivateScope",
        ActivityBehavior::native(HoldPrivateScope {
            private: private.clone(),
            seen: seen.clone(),
        }),
    );
    builder.add_variable(root, &private);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();
    executor.start().unwrap();
    assert_eq!(executor.run().unwrap(), WorkflowStatus::Idle);

    let (scope, repeat) = seen.lock().take().unwrap();
    assert!(!scope.is_default());
    assert!(repeat.is_some());
    assert!(executor.unregister_bookmark_scope(&scope));
    assert!(!executor.unregister_bookmark_scope(&scope));
}
