//! Activity execution core and its reference executor
//!
//! The building blocks ([`quack`], [`id_space`], [`location`],
//! [`environment`], [`handle`], [`bookmark`], [`properties`]) are usable on
//! their own; [`executor::WorkflowExecutor`] ties them together and hands
//! activities the [`context`] family.

use serde::{Deserialize, Serialize};

pub mod activity;
pub mod bookmark;
pub mod config;
pub mod context;
pub mod definition;
pub mod environment;
pub mod error;
pub mod exclusive;
pub mod executor;
pub mod extension;
pub mod handle;
pub mod host;
pub mod id_space;
pub mod instance;
pub mod location;
pub mod properties;
pub mod quack;
pub mod tracking;
pub mod value;

pub use activity::{
    ActivityBehavior, AsyncCodeActivity, CodeActivity, CompletedChild, NativeActivity,
};
pub use bookmark::{
    Bookmark, BookmarkOptions, BookmarkResumptionResult, BookmarkScope, BookmarkScopeHandle,
};
pub use context::{
    ActivityContext, AsyncCodeActivityContext, AsyncCompletion, CodeActivityContext,
    NativeActivityContext, NativeActivityFaultContext,
};
pub use definition::{Argument, DefinitionBuilder, NodeKey, WorkflowDefinition};
pub use error::{Result, RuntimeError};
pub use exclusive::ExclusiveHandle;
pub use executor::{WorkflowExecutor, WorkflowStatus};
pub use handle::{Handle, HandleCatalog, HandleId, HandleInitializationContext};
pub use host::{HostInstance, HostLifecycleState};
pub use instance::{ActivityInstanceState, ChildCallbacks, InstanceId};
pub use location::{ArgumentDirection, LocationReference};
pub use properties::{ExecutionProperties, PropertyValue, RegisteredProperty};
pub use tracking::{CustomTrackingRecord, MemoryTrackingSink, TrackingRecord, TrackingSink};
pub use value::{DynValue, Value, boxed, unbox};

/// Configuration for a workflow executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Emit tracking records to the installed sink
    pub tracking_enabled: bool,

    /// Idle contexts kept per context kind
    pub context_pool_capacity: usize,

    /// Initial capacity of the work queue
    pub initial_work_capacity: usize,

    /// Largest activity id an id space may hand out; checked against the
    /// definition when an executor is created
    pub max_activity_id: u32,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tracking_enabled: true,
            context_pool_capacity: 16,
            initial_work_capacity: 4,
            max_activity_id: id_space::MAX_ID,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Reject settings no executor can run with
    pub fn validate(&self) -> Result<()> {
        if self.max_activity_id == 0 || self.max_activity_id > id_space::MAX_ID {
            return Err(RuntimeError::Config(format!(
                "max_activity_id must be between 1 and {}",
                id_space::MAX_ID
            )));
        }
        Ok(())
    }
}
