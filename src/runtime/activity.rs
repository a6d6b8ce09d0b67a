//! Activity behavior traits
//!
//! Activities are stateless definitions; all per-execution state lives in
//! locations, bookmarks and handles reached through the context. Returning an
//! error raises a fault from the executing instance.

use std::fmt;
use std::sync::Arc;

use super::bookmark::Bookmark;
use super::context::{
    AsyncCodeActivityContext, CodeActivityContext, NativeActivityContext,
    NativeActivityFaultContext,
};
use super::definition::NodeKey;
use super::instance::{ActivityInstanceState, InstanceId};
use super::value::DynValue;

/// Runs to completion in one step
pub trait CodeActivity: Send + Sync {
    /// Do the work
    fn execute(&self, context: &mut CodeActivityContext) -> anyhow::Result<()>;
}

/// Starts work that completes later, possibly on another thread
pub trait AsyncCodeActivity: Send + Sync {
    /// Start the operation; take a completion token to keep the instance
    /// alive, or return without one to complete immediately
    fn begin_execute(&self, context: &mut AsyncCodeActivityContext) -> anyhow::Result<()>;

    /// Consume the operation's outcome
    fn end_execute(
        &self,
        context: &mut AsyncCodeActivityContext,
        outcome: anyhow::Result<DynValue>,
    ) -> anyhow::Result<()>;

    /// Called when cancellation is requested while the operation is pending
    fn cancel(&self, context: &mut AsyncCodeActivityContext) -> anyhow::Result<()> {
        context.mark_canceled()?;
        Ok(())
    }
}

/// A child that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChild {
    /// Child instance
    pub instance: InstanceId,
    /// Child's definition node
    pub node: NodeKey,
    /// Child's display name
    pub display_name: String,
    /// Final state
    pub state: ActivityInstanceState,
}

/// Full access to scheduling, bookmarks and properties
pub trait NativeActivity: Send + Sync {
    /// First activation
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()>;

    /// A bookmark owned by this instance was resumed
    fn on_bookmark_resumed(
        &self,
        _context: &mut NativeActivityContext,
        _bookmark: &Bookmark,
        _value: DynValue,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A child scheduled with a completion callback finished
    fn on_child_completed(
        &self,
        _context: &mut NativeActivityContext,
        _child: &CompletedChild,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A child scheduled with a fault callback faulted
    fn on_child_faulted(&self, _context: &mut NativeActivityFaultContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Cancellation was requested
    fn cancel(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.cancel_children()?;
        context.remove_all_bookmarks()?;
        context.mark_canceled()?;
        Ok(())
    }
}

/// How a node executes
#[derive(Clone)]
pub enum ActivityBehavior {
    /// Synchronous code
    Code(Arc<dyn CodeActivity>),
    /// Asynchronous code
    AsyncCode(Arc<dyn AsyncCodeActivity>),
    /// Native scheduling logic
    Native(Arc<dyn NativeActivity>),
}

impl ActivityBehavior {
    /// Wrap a code activity
    pub fn code(activity: impl CodeActivity + 'static) -> Self {
        ActivityBehavior::Code(Arc::new(activity))
    }

    /// Wrap an async code activity
    pub fn async_code(activity: impl AsyncCodeActivity + 'static) -> Self {
        ActivityBehavior::AsyncCode(Arc::new(activity))
    }

    /// Wrap a native activity
    pub fn native(activity: impl NativeActivity + 'static) -> Self {
        ActivityBehavior::Native(Arc::new(activity))
    }
}

impl fmt::Debug for ActivityBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityBehavior::Code(_) => f.write_str("Code"),
            ActivityBehavior::AsyncCode(_) => f.write_str("AsyncCode"),
            ActivityBehavior::Native(_) => f.write_str("Native"),
        }
    }
}
