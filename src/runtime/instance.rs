//! Activity instances and their lifecycle state

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::definition::NodeKey;
use super::environment::EnvironmentId;
use super::error::StateError;
use super::id_space::QualifiedId;
use super::properties::PropertyTable;

/// Unique id of an activity instance within one executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an activity instance
///
/// `Executing` is the only non-terminal state; every terminal state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    /// Scheduled or running
    Executing,
    /// Completed normally
    Closed,
    /// Completed after honoring a cancellation request
    Canceled,
    /// Completed because of an unhandled fault
    Faulted,
}

impl ActivityInstanceState {
    /// Whether the state is final
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActivityInstanceState::Executing)
    }

    /// Check that moving to `to` is allowed
    pub fn transition(
        self,
        to: ActivityInstanceState,
    ) -> Result<ActivityInstanceState, StateError> {
        if self.is_terminal() || to == ActivityInstanceState::Executing {
            return Err(StateError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        Ok(to)
    }
}

impl fmt::Display for ActivityInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityInstanceState::Executing => "Executing",
            ActivityInstanceState::Closed => "Closed",
            ActivityInstanceState::Canceled => "Canceled",
            ActivityInstanceState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// Stable description of an instance, safe to keep after it completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInstanceReference {
    /// Instance id
    pub id: InstanceId,
    /// Display name of the instance's activity
    pub activity: String,
    /// Dotted address of the activity
    pub qualified_id: QualifiedId,
}

impl fmt::Display for ActivityInstanceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({}) instance {}", self.activity, self.qualified_id, self.id)
    }
}

/// Which parent callbacks a child was scheduled with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildCallbacks {
    /// Parent wants `on_child_completed`
    pub on_completed: bool,
    /// Parent wants `on_child_faulted`
    pub on_faulted: bool,
}

impl ChildCallbacks {
    /// No callbacks
    pub const NONE: ChildCallbacks = ChildCallbacks {
        on_completed: false,
        on_faulted: false,
    };

    /// Completion callback only
    pub const COMPLETION: ChildCallbacks = ChildCallbacks {
        on_completed: true,
        on_faulted: false,
    };

    /// Completion and fault callbacks
    pub const ALL: ChildCallbacks = ChildCallbacks {
        on_completed: true,
        on_faulted: true,
    };
}

/// Runtime record of one executing activity
pub struct ActivityInstance {
    pub(crate) id: InstanceId,
    pub(crate) node: NodeKey,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) environment: EnvironmentId,
    pub(crate) state: ActivityInstanceState,
    pub(crate) children: Vec<InstanceId>,
    pub(crate) callbacks: ChildCallbacks,
    pub(crate) properties: PropertyTable,
    pub(crate) cancellation_requested: bool,
    pub(crate) marked_canceled: bool,
    pub(crate) aborting: bool,
    pub(crate) started: bool,
    pub(crate) pending_async: Option<u64>,
    pub(crate) async_user_state: Option<Box<dyn Any + Send>>,
}

impl ActivityInstance {
    pub(crate) fn new(
        id: InstanceId,
        node: NodeKey,
        parent: Option<InstanceId>,
        environment: EnvironmentId,
        callbacks: ChildCallbacks,
    ) -> Self {
        Self {
            id,
            node,
            parent,
            environment,
            state: ActivityInstanceState::Executing,
            children: Vec::new(),
            callbacks,
            properties: PropertyTable::default(),
            cancellation_requested: false,
            marked_canceled: false,
            aborting: false,
            started: false,
            pending_async: None,
            async_user_state: None,
        }
    }

    /// Instance id
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Definition node
    pub fn node(&self) -> NodeKey {
        self.node
    }

    /// Scheduling parent
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Environment created for this instance
    pub fn environment(&self) -> EnvironmentId {
        self.environment
    }

    /// Current state
    pub fn state(&self) -> ActivityInstanceState {
        self.state
    }

    /// Executing children in scheduling order
    pub fn children(&self) -> &[InstanceId] {
        &self.children
    }

    /// Whether cancellation was requested
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation_requested
    }

    /// Whether the activity acknowledged cancellation
    pub fn is_marked_canceled(&self) -> bool {
        self.marked_canceled
    }

    /// Whether an async operation is outstanding
    pub fn has_pending_async(&self) -> bool {
        self.pending_async.is_some()
    }

    pub(crate) fn set_state(&mut self, to: ActivityInstanceState) -> Result<(), StateError> {
        self.state = self.state.transition(to)?;
        Ok(())
    }
}

impl fmt::Debug for ActivityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityInstance")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("children", &self.children)
            .finish()
    }
}

/// Live instances plus the final state of completed ones
#[derive(Debug, Default)]
pub struct InstanceTable {
    live: BTreeMap<InstanceId, ActivityInstance>,
    finished: HashMap<InstanceId, ActivityInstanceState>,
    next_id: u64,
}

impl InstanceTable {
    /// Reserve the next instance id
    pub(crate) fn next_id(&mut self) -> InstanceId {
        self.next_id += 1;
        InstanceId(self.next_id)
    }

    pub(crate) fn insert(&mut self, instance: ActivityInstance) {
        self.live.insert(instance.id, instance);
    }

    /// Borrow a live instance
    pub fn get(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.live.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut ActivityInstance> {
        self.live.get_mut(&id)
    }

    /// Move an instance to the finished set
    pub(crate) fn retire(&mut self, id: InstanceId) -> Option<ActivityInstance> {
        let instance = self.live.remove(&id)?;
        self.finished.insert(id, instance.state);
        Some(instance)
    }

    /// State of a live or finished instance
    pub fn state(&self, id: InstanceId) -> Option<ActivityInstanceState> {
        self.live
            .get(&id)
            .map(|instance| instance.state)
            .or_else(|| self.finished.get(&id).copied())
    }

    /// Number of live instances
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Ids of `id` and every live descendant, parents before children
    pub(crate) fn subtree(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut order = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(instance) = self.live.get(&current) {
                order.push(current);
                pending.extend(instance.children.iter().rev().copied());
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        use ActivityInstanceState::*;

        assert_eq!(Executing.transition(Closed), Ok(Closed));
        assert_eq!(Executing.transition(Faulted), Ok(Faulted));
        assert!(Closed.transition(Canceled).is_err());
        assert!(Faulted.transition(Closed).is_err());
        assert!(Executing.transition(Executing).is_err());
    }

    #[test]
    fn test_retired_state_is_remembered() {
        let mut table = InstanceTable::default();
        let id = table.next_id();
        let callbacks = ChildCallbacks::default();
        let mut instance = ActivityInstance::new(id, NodeKey(0), None, EnvironmentId(1), callbacks);
        instance.set_state(ActivityInstanceState::Canceled).unwrap();
        table.insert(instance);

        table.retire(id);
        assert!(table.get(id).is_none());
        assert_eq!(table.state(id), Some(ActivityInstanceState::Canceled));
    }

    #[test]
    fn test_subtree_order() {
        let mut table = InstanceTable::default();
        let root = table.next_id();
        let child = table.next_id();
        let grandchild = table.next_id();

        let callbacks = ChildCallbacks::default();
        let mut r = ActivityInstance::new(root, NodeKey(0), None, EnvironmentId(1), callbacks);
        r.children.push(child);
        let mut c =
            ActivityInstance::new(child, NodeKey(1), Some(root), EnvironmentId(2), callbacks);
        c.children.push(grandchild);
        let g =
            ActivityInstance::new(grandchild, NodeKey(2), Some(child), EnvironmentId(3), callbacks);
        table.insert(r);
        table.insert(c);
        table.insert(g);

        assert_eq!(table.subtree(root), vec![root, child, grandchild]);
        assert_eq!(table.subtree(child), vec![child, grandchild]);
    }
}
