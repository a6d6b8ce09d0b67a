//! Integration tests for contexts, argument binding, execution properties
//! and tracking

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tarry::runtime::error::{LocationError, PropertyError, RuntimeError, UsageError};
use tarry::runtime::location::{AccessDirection, InlinedLocationReference};
use tarry::runtime::properties::RegistrationContext;
use tarry::runtime::{
    ActivityBehavior, ActivityInstanceState, Argument, ArgumentDirection, Bookmark, BookmarkOptions,
    ChildCallbacks, CodeActivity, CodeActivityContext, CompletedChild, CustomTrackingRecord,
    DefinitionBuilder, DynValue, Handle, HandleCatalog, LocationReference, MemoryTrackingSink,
    NativeActivity, NativeActivityContext, NodeKey, PropertyValue, RegisteredProperty,
    RuntimeConfig, TrackingRecord, WorkflowExecutor, WorkflowStatus, boxed,
};

struct Park;

impl NativeActivity for Park {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.create_bookmark("wake", BookmarkOptions::NONE)?;
        Ok(())
    }
}

#[derive(Debug)]
struct Clock;

#[test]
fn test_disposed_context_rejects_operations() {
    let counter = LocationReference::with_default("counter", 3i64);
    let mut builder = DefinitionBuilder::new();
    let root = builder.add("Root", ActivityBehavior::native(Park));
    builder.add_variable(root, &counter);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();
    executor.add_extension(Arc::new(Clock));

    let root = executor.start().unwrap();
    executor.run().unwrap();

    let mut context = executor.context_for(root).unwrap();
    assert_eq!(context.get_value::<i64>(&counter).unwrap(), 3);
    context.set_value(&counter, 4i64).unwrap();
    assert_eq!(context.get_value::<i64>(&counter).unwrap(), 4);
    assert!(context.get_extension::<Clock>().unwrap().is_some());

    context.dispose();
    assert!(context.is_disposed());
    let disposed = |result: Result<(), RuntimeError>| {
        matches!(result, Err(RuntimeError::Usage(UsageError::ObjectDisposed(_))))
    };
    assert!(disposed(context.get_value::<i64>(&counter).map(|_| ())));
    assert!(disposed(context.set_value(&counter, 5i64)));
    assert!(disposed(context.get_extension::<Clock>().map(|_| ())));
    assert!(disposed(context.track(CustomTrackingRecord::new("late"))));
    assert!(disposed(context.activity_instance_id().map(|_| ())));

    context.reinitialize(&executor, root).unwrap();
    assert_eq!(context.get_value::<i64>(&counter).unwrap(), 4);
    assert_eq!(context.display_name().unwrap(), "Root");
    assert_eq!(context.activity_instance_id().unwrap(), root);
}

/// Adds one to an in/out argument and writes an out argument
struct Bump {
    counter: LocationReference,
    result: LocationReference,
}

impl CodeActivity for Bump {
    fn execute(&self, context: &mut CodeActivityContext) -> anyhow::Result<()> {
        let value: i64 = context.get_value(&self.counter)?;
        context.set_value(&self.counter, value + 1)?;
        context.set_value(&self.result, format!("bumped to {}", value + 1))?;
        Ok(())
    }
}

/// Runs one child and records the variables afterwards
struct Holder {
    child: NodeKey,
    count: LocationReference,
    message: LocationReference,
    seen: Arc<Mutex<Option<(i64, String)>>>,
}

impl NativeActivity for Holder {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.schedule_activity(self.child, ChildCallbacks::COMPLETION)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        context: &mut NativeActivityContext,
        _child: &CompletedChild,
    ) -> anyhow::Result<()> {
        let count = context.get_value::<i64>(&self.count)?;
        let message = context.get_value::<String>(&self.message)?;
        *self.seen.lock() = Some((count, message));
        Ok(())
    }
}

#[test]
fn test_arguments_write_through_to_parent_variables() {
    let count = LocationReference::with_default("count", 41i64);
    let message = LocationReference::new::<String>("message");
    let counter = Argument::new::<i64>("counter", ArgumentDirection::InOut).bind_reference(&count);
    let result = Argument::new::<String>("result", ArgumentDirection::Out).bind_reference(&message);
    let seen = Arc::new(Mutex::new(None));

    let mut builder = DefinitionBuilder::new();
    let bump = builder.add(
        "Bump",
        ActivityBehavior::code(Bump {
            counter: counter.reference().clone(),
            result: result.reference().clone(),
        }),
    );
    let root = builder.add(
        "Holder",
        ActivityBehavior::native(Holder {
            child: bump,
            count: count.clone(),
            message: message.clone(),
            seen: seen.clone(),
        }),
    );
    builder
        .add_child(root, bump)
        .add_variable(root, &count)
        .add_variable(root, &message)
        .add_argument(bump, counter)
        .add_argument(bump, result);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor.start().unwrap();
    let status = executor.run().unwrap();

    assert_eq!(status, WorkflowStatus::Completed(ActivityInstanceState::Closed));
    assert_eq!(*seen.lock(), Some((42, "bumped to 42".to_string())));
}

#[test]
fn test_duplicate_declarations_are_reported_together() {
    let mut builder = DefinitionBuilder::new();
    let root = builder.add("Root", ActivityBehavior::native(Park));
    builder
        .add_variable(root, &LocationReference::new::<i64>("x"))
        .add_variable(root, &LocationReference::new::<String>("x"))
        .add_variable(root, &LocationReference::new::<bool>("y"))
        .add_variable(root, &LocationReference::new::<bool>("y"));
    let definition = Arc::new(builder.build(root).unwrap());

    match WorkflowExecutor::new(definition, RuntimeConfig::default()) {
        Err(RuntimeError::Validation(errors)) => assert_eq!(errors.0.len(), 2),
        other => panic!("expected validation errors, got {:?}", other.map(|_| ())),
    }
}

/// Counts registrations
#[derive(Default)]
struct Audit {
    registered: AtomicUsize,
    unregistered: AtomicUsize,
}

struct AuditProperty(Arc<Audit>);

impl RegisteredProperty for AuditProperty {
    fn register(&self, _context: &RegistrationContext) -> anyhow::Result<()> {
        self.0.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister(&self, _context: &RegistrationContext) -> anyhow::Result<()> {
        self.0.unregistered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Adds properties, then runs a child that reads them
struct Tenant {
    child: NodeKey,
    audit: Arc<Audit>,
    duplicate: Arc<Mutex<Option<RuntimeError>>>,
}

impl NativeActivity for Tenant {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        let properties = context.properties_mut()?;
        properties.add("tenant", PropertyValue::shared("acme".to_string()), false)?;
        properties.add(
            "audit",
            PropertyValue::registered(AuditProperty(self.audit.clone())),
            false,
        )?;
        *self.duplicate.lock() = properties
            .add("tenant", PropertyValue::shared("other".to_string()), false)
            .err();
        context.schedule_activity(self.child, ChildCallbacks::NONE)?;
        Ok(())
    }
}

struct ReadTenant {
    seen: Arc<Mutex<Option<String>>>,
}

impl CodeActivity for ReadTenant {
    fn execute(&self, context: &mut CodeActivityContext) -> anyhow::Result<()> {
        let tenant = context
            .properties()?
            .find("tenant")?
            .and_then(|value| value.downcast::<String>());
        *self.seen.lock() = tenant.map(|tenant| tenant.as_ref().clone());
        Ok(())
    }
}

#[test]
fn test_properties_flow_to_children_and_unregister_on_completion() {
    let audit = Arc::new(Audit::default());
    let duplicate = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(None));

    let mut builder = DefinitionBuilder::new();
    let reader = builder.add(
        "ReadTenant",
        ActivityBehavior::code(ReadTenant { seen: seen.clone() }),
    );
    let root = builder.add(
        "Tenant",
        ActivityBehavior::native(Tenant {
            child: reader,
            audit: audit.clone(),
            duplicate: duplicate.clone(),
        }),
    );
    builder.add_child(root, reader);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor.start().unwrap();
    executor.run().unwrap();

    assert_eq!(seen.lock().as_deref(), Some("acme"));
    assert!(matches!(
        duplicate.lock().take(),
        Some(RuntimeError::Property(PropertyError::DuplicateName(_)))
    ));
    assert_eq!(audit.registered.load(Ordering::SeqCst), 1);
    assert_eq!(audit.unregistered.load(Ordering::SeqCst), 1);
}

#[test]
fn test_root_properties_are_visible_to_activities() {
    let seen = Arc::new(Mutex::new(None));
    let mut builder = DefinitionBuilder::new();
    let root = builder.add("ReadTenant", ActivityBehavior::code(ReadTenant { seen: seen.clone() }));
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor
        .add_root_property("tenant", PropertyValue::shared("host".to_string()), false)
        .unwrap();
    executor.start().unwrap();
    executor.run().unwrap();

    assert_eq!(seen.lock().as_deref(), Some("host"));
}

/// Emits a custom record, then waits
struct Tracked;

impl NativeActivity for Tracked {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.track(CustomTrackingRecord::new("checkpoint").with("step", 1))?;
        context.create_bookmark("go", BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        _context: &mut NativeActivityContext,
        _bookmark: &Bookmark,
        _value: DynValue,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_tracking_records_follow_execution() {
    let sink = Arc::new(MemoryTrackingSink::new());
    let mut builder = DefinitionBuilder::new();
    let root = builder.add("Tracked", ActivityBehavior::native(Tracked));
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();
    executor.set_tracking_sink(sink.clone());

    executor.start().unwrap();
    executor.run().unwrap();
    executor.resume_bookmark(&Bookmark::named("go"), boxed(())).unwrap();
    executor.run().unwrap();

    let records = sink.take();
    let kinds: Vec<&str> = records
        .iter()
        .map(|record| match record {
            TrackingRecord::WorkflowInstance { .. } => "workflow",
            TrackingRecord::ActivityState { .. } => "activity",
            TrackingRecord::BookmarkResumption { .. } => "bookmark",
            TrackingRecord::Custom { .. } => "custom",
        })
        .collect();
    assert_eq!(kinds, vec!["workflow", "activity", "custom", "bookmark", "activity", "workflow"]);

    let Some(TrackingRecord::Custom { name, data, .. }) = records.get(2) else {
        panic!("expected a custom record");
    };
    assert_eq!(name, "checkpoint");
    assert_eq!(data.get("step"), Some(&serde_json::json!(1)));
}

#[test]
fn test_tracking_can_be_disabled() {
    let sink = Arc::new(MemoryTrackingSink::new());
    let mut builder = DefinitionBuilder::new();
    let root = builder.add("Tracked", ActivityBehavior::native(Tracked));
    let config = RuntimeConfig {
        tracking_enabled: false,
        ..RuntimeConfig::default()
    };
    let executor = WorkflowExecutor::new(Arc::new(builder.build(root).unwrap()), config).unwrap();
    executor.set_tracking_sink(sink.clone());

    executor.start().unwrap();
    executor.run().unwrap();
    assert!(sink.is_empty());
}

struct Idle;

impl CodeActivity for Idle {
    fn execute(&self, _context: &mut CodeActivityContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Schedules one child without callbacks
struct Run {
    child: NodeKey,
}

impl NativeActivity for Run {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.schedule_activity(self.child, ChildCallbacks::NONE)?;
        Ok(())
    }
}

struct ReadOut {
    result: LocationReference,
    seen: Arc<Mutex<Option<i64>>>,
}

impl CodeActivity for ReadOut {
    fn execute(&self, context: &mut CodeActivityContext) -> anyhow::Result<()> {
        *self.seen.lock() = Some(context.get_value::<i64>(&self.result)?);
        Ok(())
    }
}

#[test]
fn test_out_argument_reads_bound_value_before_write() {
    let answer = LocationReference::with_default("answer", 42i64);
    let result = Argument::new::<i64>("result", ArgumentDirection::Out).bind_reference(&answer);
    let seen = Arc::new(Mutex::new(None));

    let mut builder = DefinitionBuilder::new();
    let reader = builder.add(
        "ReadOut",
        ActivityBehavior::code(ReadOut {
            result: result.reference().clone(),
            seen: seen.clone(),
        }),
    );
    let root = builder.add("Run", ActivityBehavior::native(Run { child: reader }));
    builder
        .add_child(root, reader)
        .add_variable(root, &answer)
        .add_argument(reader, result);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor.start().unwrap();
    executor.run().unwrap();
    assert_eq!(*seen.lock(), Some(42));
}

#[test]
fn test_inlined_access_is_checked_per_accessor() {
    let total = LocationReference::with_default("total", 5i64).inlined_only();
    let mut builder = DefinitionBuilder::new();
    let root_node = builder.add("Root", ActivityBehavior::native(Park));
    let other = builder.add("Other", ActivityBehavior::code(Idle));
    builder.add_child(root_node, other).add_variable(root_node, &total);
    let definition = Arc::new(builder.build(root_node).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    let root = executor.start().unwrap();
    executor.run().unwrap();
    let context = executor.context_for(root).unwrap();
    let violation = |result: Result<(), RuntimeError>| {
        matches!(result, Err(RuntimeError::Location(LocationError::AccessViolation { .. })))
    };

    // only reachable through an inlined reference
    assert!(violation(context.get_value::<i64>(&total).map(|_| ())));

    let read_only = InlinedLocationReference::new(total.clone(), AccessDirection::Read, root_node);
    assert_eq!(context.get_inlined_value::<i64>(&read_only).unwrap(), 5);
    assert!(violation(context.set_inlined_value(&read_only, 6i64)));

    let foreign = InlinedLocationReference::new(total.clone(), AccessDirection::ReadWrite, other);
    assert!(violation(context.get_inlined_value::<i64>(&foreign).map(|_| ())));
    assert!(violation(context.set_inlined_value(&foreign, 7i64)));
    assert_eq!(context.get_inlined_value::<i64>(&read_only).unwrap(), 5);
}

/// Handle that may be added or removed while children run
#[derive(Default)]
struct Lease;

impl Handle for Lease {
    fn can_be_removed_with_executing_children(&self) -> bool {
        true
    }
}

fn describe(result: Result<(), RuntimeError>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(RuntimeError::Property(PropertyError::ChildrenExecuting(name))) => {
            format!("busy {}", name)
        }
        Err(other) => format!("error {}", other),
    }
}

/// Edits its properties after scheduling a child
struct Crowded {
    child: NodeKey,
    lease: LocationReference,
    outcomes: Arc<Mutex<Vec<String>>>,
}

impl NativeActivity for Crowded {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        let properties = context.properties_mut()?;
        properties.add("early", PropertyValue::shared(1u32), false)?;
        context.schedule_activity(self.child, ChildCallbacks::NONE)?;

        let lease = context.get_handle::<Lease>(&self.lease)?;
        let mut outcomes = self.outcomes.lock();
        outcomes.push(describe(properties.add("late", PropertyValue::shared(2u32), false)));
        outcomes.push(describe(properties.remove("early").map(|_| ())));
        outcomes.push(describe(properties.add("lease", PropertyValue::handle(lease), false)));
        outcomes.push(describe(properties.remove("lease").map(|_| ())));
        Ok(())
    }
}

#[test]
fn test_property_changes_wait_for_children() {
    HandleCatalog::global().register_default::<Lease>();
    let lease = LocationReference::handle::<Lease>("lease");
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let mut builder = DefinitionBuilder::new();
    let child = builder.add("Idle", ActivityBehavior::code(Idle));
    let root = builder.add(
        "Crowded",
        ActivityBehavior::native(Crowded {
            child,
            lease: lease.clone(),
            outcomes: outcomes.clone(),
        }),
    );
    builder.add_child(root, child).add_variable(root, &lease);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor.start().unwrap();
    let status = executor.run().unwrap();

    assert_eq!(status, WorkflowStatus::Completed(ActivityInstanceState::Closed));
    assert_eq!(*outcomes.lock(), vec!["busy late", "busy early", "ok", "ok"]);
}

/// Adds one property for everyone and one for its own IdSpace only
struct Publisher {
    public: NodeKey,
    implementation: NodeKey,
}

impl NativeActivity for Publisher {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        let properties = context.properties_mut()?;
        properties.add("scoped", PropertyValue::shared("inner".to_string()), true)?;
        properties.add("open", PropertyValue::shared("all".to_string()), false)?;
        context.schedule_activity(self.public, ChildCallbacks::NONE)?;
        context.schedule_activity(self.implementation, ChildCallbacks::NONE)?;
        Ok(())
    }
}

type Sightings = Arc<Mutex<Vec<(&'static str, bool, bool)>>>;

struct Look {
    label: &'static str,
    seen: Sightings,
}

impl CodeActivity for Look {
    fn execute(&self, context: &mut CodeActivityContext) -> anyhow::Result<()> {
        let properties = context.properties()?;
        let scoped = properties.find("scoped")?.is_some();
        let open = properties.find("open")?.is_some();
        self.seen.lock().push((self.label, scoped, open));
        Ok(())
    }
}

#[test]
fn test_public_only_property_stays_in_its_id_space() {
    let seen: Sightings = Arc::new(Mutex::new(Vec::new()));
    let mut builder = DefinitionBuilder::new();
    let public = builder.add(
        "Public",
        ActivityBehavior::code(Look {
            label: "public",
            seen: seen.clone(),
        }),
    );
    let implementation = builder.add(
        "Implementation",
        ActivityBehavior::code(Look {
            label: "implementation",
            seen: seen.clone(),
        }),
    );
    let root = builder.add(
        "Publisher",
        ActivityBehavior::native(Publisher {
            public,
            implementation,
        }),
    );
    builder
        .add_child(root, public)
        .add_implementation_child(root, implementation);
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor.start().unwrap();
    executor.run().unwrap();

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec![("implementation", false, true), ("public", true, true)]);
}

type Notes = Arc<Mutex<Vec<(&'static str, bool)>>>;

/// Notes whether its sibling `tenant` is visible when notified
struct Watcher(Notes);

impl RegisteredProperty for Watcher {
    fn register(&self, context: &RegistrationContext) -> anyhow::Result<()> {
        self.0.lock().push(("register", context.find("tenant").is_some()));
        Ok(())
    }

    fn unregister(&self, context: &RegistrationContext) -> anyhow::Result<()> {
        self.0.lock().push(("unregister", context.find("tenant").is_some()));
        Ok(())
    }
}

struct Landlord(Notes);

impl NativeActivity for Landlord {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        let properties = context.properties_mut()?;
        properties.add("tenant", PropertyValue::shared("acme".to_string()), false)?;
        properties.add("watcher", PropertyValue::registered(Watcher(self.0.clone())), false)?;
        Ok(())
    }
}

#[test]
fn test_teardown_unregister_sees_sibling_properties() {
    let notes: Notes = Arc::new(Mutex::new(Vec::new()));
    let mut builder = DefinitionBuilder::new();
    let root = builder.add("Landlord", ActivityBehavior::native(Landlord(notes.clone())));
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();

    executor.start().unwrap();
    let status = executor.run().unwrap();

    assert_eq!(status, WorkflowStatus::Completed(ActivityInstanceState::Closed));
    assert_eq!(*notes.lock(), vec![("register", true), ("unregister", true)]);
}
