//! Host-facing wrapper around a workflow executor
//!
//! The wrapper's lifecycle is a one-shot transition out of `Initialized`,
//! taken with a compare-and-set so independent host threads can race on
//! `load` and `abort`. The loser gets the winner's state back instead of
//! retrying.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::bookmark::{Bookmark, BookmarkResumptionResult};
use super::error::{HostError, Result, UsageError};
use super::executor::{WorkflowExecutor, WorkflowStatus};
use super::instance::InstanceId;
use super::value::DynValue;

/// Lifecycle of a [`HostInstance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostLifecycleState {
    /// Created; neither loaded nor aborted
    Initialized,
    /// Loaded and runnable
    Loaded,
    /// Aborted before or instead of loading
    Aborted,
}

impl HostLifecycleState {
    fn to_u8(self) -> u8 {
        match self {
            HostLifecycleState::Initialized => 0,
            HostLifecycleState::Loaded => 1,
            HostLifecycleState::Aborted => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => HostLifecycleState::Initialized,
            1 => HostLifecycleState::Loaded,
            _ => HostLifecycleState::Aborted,
        }
    }
}

/// An executor owned by the host
pub struct HostInstance {
    executor: WorkflowExecutor,
    lifecycle: AtomicU8,
    abandoned: AtomicBool,
}

impl HostInstance {
    /// Wrap an executor in the `Initialized` state
    pub fn new(executor: WorkflowExecutor) -> Self {
        Self {
            executor,
            lifecycle: AtomicU8::new(HostLifecycleState::Initialized.to_u8()),
            abandoned: AtomicBool::new(false),
        }
    }

    /// The wrapped executor
    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> HostLifecycleState {
        HostLifecycleState::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Whether `abandon` was called
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    fn transition(&self, to: HostLifecycleState) -> std::result::Result<(), HostError> {
        self.lifecycle
            .compare_exchange(
                HostLifecycleState::Initialized.to_u8(),
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|winner| HostError::AlreadyTransitioned(HostLifecycleState::from_u8(winner)))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_abandoned() {
            return Err(UsageError::ExecutorNotRunning("abandoned").into());
        }
        if self.lifecycle() != HostLifecycleState::Loaded {
            return Err(HostError::NotLoaded.into());
        }
        Ok(())
    }

    /// Move to `Loaded` and schedule the root activity
    pub fn load(&self) -> Result<InstanceId> {
        self.transition(HostLifecycleState::Loaded)?;
        debug!(workflow = %self.executor.workflow_instance_id(), "host instance loaded");
        self.executor.start()
    }

    /// Move to `Aborted`
    ///
    /// Fails with the winner's state when `load` or another `abort` got
    /// there first.
    pub fn abort(&self, reason: &str) -> Result<()> {
        self.transition(HostLifecycleState::Aborted)?;
        warn!(workflow = %self.executor.workflow_instance_id(), reason, "host instance aborted");
        Ok(())
    }

    /// Run the loaded executor until idle
    pub fn run(&self) -> Result<WorkflowStatus> {
        self.ensure_active()?;
        self.executor.run()
    }

    /// Resume a named bookmark on the loaded executor
    pub fn resume_bookmark(
        &self,
        bookmark: &Bookmark,
        value: DynValue,
    ) -> Result<BookmarkResumptionResult> {
        self.ensure_active()?;
        self.executor.resume_bookmark(bookmark, value)
    }

    /// Give up on the instance without completing it
    ///
    /// Executing instances are faulted and their handles uninitialized.
    pub fn abandon(&self) -> Result<()> {
        if self.abandoned.swap(true, Ordering::AcqRel) {
            return Err(UsageError::AlreadyAbandoned.into());
        }
        if self.lifecycle() == HostLifecycleState::Loaded
            && !matches!(self.executor.status(), WorkflowStatus::Completed(_))
        {
            self.executor.abort("abandoned")?;
        }
        debug!(workflow = %self.executor.workflow_instance_id(), "host instance abandoned");
        Ok(())
    }
}

impl std::fmt::Debug for HostInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostInstance")
            .field("lifecycle", &self.lifecycle())
            .field("abandoned", &self.is_abandoned())
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::runtime::activity::{ActivityBehavior, CodeActivity};
    use crate::runtime::context::CodeActivityContext;
    use crate::runtime::definition::DefinitionBuilder;
    use crate::runtime::error::RuntimeError;

    struct Noop;

    impl CodeActivity for Noop {
        fn execute(&self, _context: &mut CodeActivityContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn host() -> HostInstance {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Noop", ActivityBehavior::code(Noop));
        let definition = Arc::new(builder.build(root).unwrap());
        HostInstance::new(WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap())
    }

    #[test]
    fn test_load_then_abort_reports_winner() {
        let host = host();
        host.load().unwrap();

        let err = host.abort("late").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Host(HostError::AlreadyTransitioned(HostLifecycleState::Loaded))
        ));
        assert_eq!(
            host.run().unwrap(),
            WorkflowStatus::Completed(crate::runtime::ActivityInstanceState::Closed)
        );
    }

    #[test]
    fn test_run_requires_load() {
        let host = host();
        assert!(matches!(host.run(), Err(RuntimeError::Host(HostError::NotLoaded))));
    }

    #[test]
    fn test_double_abandon() {
        let host = host();
        host.abandon().unwrap();
        assert!(matches!(
            host.abandon(),
            Err(RuntimeError::Usage(UsageError::AlreadyAbandoned))
        ));
    }
}
