//! Error types for the tarry runtime
//!
//! Domain errors are `thiserror` enums, one per concern, wrapped by
//! [`RuntimeError`] at the public boundary. Validation problems found during
//! the metadata pass are plain data ([`ValidationError`]) so a whole pass can
//! be reported at once.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::host::HostLifecycleState;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// API misuse at the call site
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    /// Location resolution or access errors
    #[error("Location error: {0}")]
    Location(#[from] LocationError),

    /// Handle lifecycle errors
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),

    /// Execution property errors
    #[error("Property error: {0}")]
    Property(#[from] PropertyError),

    /// Bookmark registry errors
    #[error("Bookmark error: {0}")]
    Bookmark(#[from] BookmarkError),

    /// Instance state machine violations
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Id assignment errors
    #[error("IdSpace error: {0}")]
    IdSpace(#[from] IdSpaceError),

    /// Definition could not be built
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Host wrapper errors
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// Definition failed its metadata pass
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors that stop a definition from being built
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// A key that does not name a node of this builder
    #[error("Node key {0} does not belong to this definition")]
    UnknownNode(usize),

    /// The caching pass ran out of ids
    #[error(transparent)]
    IdSpace(#[from] IdSpaceError),
}

/// Hard failures signalling a host or authoring bug
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Operation attempted on a disposed object
    #[error("Cannot access a disposed object: {0}")]
    ObjectDisposed(&'static str),

    /// The same bookmark scope (or scope handle) was registered twice
    #[error("Bookmark scope {0} is already registered")]
    DuplicateBookmarkScope(String),

    /// Explicit scope registration after bookmarks were recorded
    #[error("Cannot register bookmark scopes on an exclusive handle that already tracks bookmarks")]
    ExclusiveHandleScopesFrozen,

    /// Host wrapper abandoned twice
    #[error("Instance has already been abandoned")]
    AlreadyAbandoned,

    /// Node is not a child of the scheduling activity
    #[error("Activity '{child}' is not a child of '{parent}'")]
    NotAChild {
        /// Scheduling activity
        parent: String,
        /// Requested child
        child: String,
    },

    /// Instance id does not name a live instance
    #[error("Activity instance {0} is not executing")]
    InstanceNotExecuting(u64),

    /// Instance id does not belong to the caller
    #[error("Activity instance {child} is not a child of instance {parent}")]
    NotOwnChild {
        /// Caller instance
        parent: u64,
        /// Target instance
        child: u64,
    },

    /// Executor was not started or already completed
    #[error("Workflow executor is not running: {0}")]
    ExecutorNotRunning(&'static str),

    /// `start` was called twice
    #[error("Workflow executor was already started")]
    AlreadyStarted,
}

/// Location resolution and access errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocationError {
    /// No declaration matched along the environment chain
    #[error("Location reference '{0}' could not be resolved")]
    NotFound(String),

    /// Requested type differs from cell type with no implicit conversion
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type the cell holds
        expected: &'static str,
        /// Type the caller used
        found: &'static str,
    },

    /// Direction or accessor check failed
    #[error("Access violation on '{reference}': {detail}")]
    AccessViolation {
        /// Reference name
        reference: String,
        /// What was rejected
        detail: String,
    },
}

/// Convenience result alias for location operations
pub type LocationResult<T> = std::result::Result<T, LocationError>;

/// Handle lifecycle errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// No factory registered for the requested handle type
    #[error("No handle factory registered for {0}")]
    UnknownKind(&'static str),

    /// Handle id is unknown
    #[error("Handle {0} not found")]
    NotFound(u64),

    /// Handle is not of the requested type
    #[error("Handle {id} is not a {expected}")]
    WrongKind {
        /// Handle id
        id: u64,
        /// Requested type name
        expected: &'static str,
    },

    /// Uninitialize attempted on a handle that is not initialized
    #[error("Handle {0} is not initialized")]
    NotInitialized(u64),

    /// Handle is currently running a lifecycle callback
    #[error("Handle {0} is busy in a lifecycle callback")]
    Busy(u64),

    /// Initialization callback failed
    #[error("Handle {id} failed to initialize: {detail}")]
    InitializationFailed {
        /// Handle id
        id: u64,
        /// Failure description
        detail: String,
    },

    /// Uninitialization callback failed; the handle is still torn down
    #[error("Handle {id} failed to uninitialize: {detail}")]
    UninitializationFailed {
        /// Handle id
        id: u64,
        /// Failure description
        detail: String,
    },
}

/// Convenience result alias for handle operations
pub type HandleResult<T> = std::result::Result<T, HandleError>;

/// Execution property errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PropertyError {
    /// Name already visible in the chain
    #[error("An execution property named '{0}' already exists")]
    DuplicateName(String),

    /// Mutation while the instance has executing children
    #[error(
        "Execution properties cannot be modified while children are executing (property '{0}')"
    )]
    ChildrenExecuting(String),

    /// Empty property names are rejected
    #[error("Execution property names cannot be empty")]
    EmptyName,

    /// A registered property rejected its registration
    #[error("Property '{name}' failed to register: {detail}")]
    RegistrationFailed {
        /// Property name
        name: String,
        /// Failure description
        detail: String,
    },
}

/// Bookmark registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BookmarkError {
    /// Named bookmark already exists in this scope
    #[error("Bookmark '{0}' already exists")]
    AlreadyExists(String),

    /// Bookmark scope handle has no initialized scope
    #[error("Bookmark scope handle {0} has no initialized scope")]
    ScopeNotInitialized(u64),

    /// Scope is not registered with the executor
    #[error("Bookmark scope {0} is not registered")]
    ScopeNotRegistered(String),

    /// Bookmark is owned by another instance
    #[error("Bookmark '{0}' is not owned by the calling activity")]
    NotOwner(String),
}

/// Convenience result alias for bookmark operations
pub type BookmarkResult<T> = std::result::Result<T, BookmarkError>;

/// Instance state machine violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// MarkCanceled without a pending cancellation
    #[error(
        "MarkCanceled may only be called while cancellation is requested or the instance is aborting"
    )]
    CancellationNotRequested,

    /// Transition out of a terminal state
    #[error("Invalid activity instance state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// An async operation was started twice in one activation
    #[error("An asynchronous operation is already pending for instance {0}")]
    AsyncAlreadyPending(u64),
}

/// Id assignment errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdSpaceError {
    /// More members than the maximum id allows
    #[error("IdSpace overflow: more than {0} members")]
    Overflow(u32),
}

/// Host wrapper errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Another caller already won the one-shot transition
    #[error("Instance has already transitioned to {0:?}")]
    AlreadyTransitioned(HostLifecycleState),

    /// Instance has not been loaded
    #[error("Instance is not loaded")]
    NotLoaded,
}

/// Kind of problem found during the metadata pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationErrorKind {
    /// Two declarations with the same name in one scope
    DuplicateName,
    /// Node reachable from more than one parent
    NodeReused,
    /// Out/InOut argument bound to a literal
    ArgumentDirection,
    /// Argument and bound reference types are incompatible
    ArgumentType,
    /// Bound reference is not declared by any ancestor
    UnresolvedReference,
}

/// A single validation diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Kind of problem
    pub kind: ValidationErrorKind,
    /// Display name of the offending activity
    pub activity: String,
    /// Human readable description
    pub message: String,
}

impl ValidationError {
    /// Create a new validation error
    pub fn new(
        kind: ValidationErrorKind,
        activity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            activity: activity.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.activity, self.message)
    }
}

/// Every error from one metadata pass
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Workflow definition has {} validation error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {}", error)?;
        }
        Ok(())
    }
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_render_together() {
        let errors = ValidationErrors(vec![
            ValidationError::new(ValidationErrorKind::DuplicateName, "Seq", "duplicate 'x'"),
            ValidationError::new(
                ValidationErrorKind::ArgumentDirection,
                "Write",
                "Out bound to literal",
            ),
        ]);
        let text = errors.to_string();
        assert!(text.contains("2 validation error(s)"));
        assert!(text.contains("Seq: duplicate 'x'"));
        assert!(text.contains("Write: Out bound to literal"));
    }

    #[test]
    fn test_domain_errors_convert_to_runtime_error() {
        let err: RuntimeError = UsageError::ObjectDisposed("ActivityContext").into();
        assert!(matches!(err, RuntimeError::Usage(UsageError::ObjectDisposed(_))));
    }
}
