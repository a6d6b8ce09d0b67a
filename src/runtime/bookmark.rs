//! Bookmarks: named suspension points and their registry
//!
//! A bookmark is identified structurally. Named bookmarks compare by name
//! and scope, internal bookmarks by their numeric id, and the two kinds are
//! never equal. The [`BookmarkManager`] is keyed by that identity so a host
//! can resume a bookmark from a freshly constructed value.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{BookmarkError, BookmarkResult, UsageError};
use super::handle::{Handle, HandleId, HandleInitializationContext};
use super::instance::InstanceId;

static DEFAULT_SCOPE: BookmarkScope = BookmarkScope::Default;

/// Namespace a named bookmark lives in
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookmarkScope {
    /// The process-wide default scope
    #[default]
    Default,
    /// A scope created by a [`BookmarkScopeHandle`]
    Scoped(Uuid),
}

impl BookmarkScope {
    /// The shared default scope
    pub fn default_scope() -> &'static BookmarkScope {
        &DEFAULT_SCOPE
    }

    /// Whether this is the default scope
    pub fn is_default(&self) -> bool {
        matches!(self, BookmarkScope::Default)
    }

    /// Scope id, `None` for the default scope
    pub fn id(&self) -> Option<Uuid> {
        match self {
            BookmarkScope::Default => None,
            BookmarkScope::Scoped(id) => Some(*id),
        }
    }
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkScope::Default => f.write_str("default"),
            BookmarkScope::Scoped(id) => write!(f, "{}", id),
        }
    }
}

/// Identity of a suspension point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bookmark {
    /// Host-resumable bookmark
    Named {
        /// Bookmark name
        name: String,
        /// Scope the name lives in
        scope: BookmarkScope,
    },
    /// Runtime-private bookmark
    Internal {
        /// Executor-assigned id
        id: u64,
    },
}

impl Bookmark {
    /// Named bookmark in the default scope
    pub fn named(name: impl Into<String>) -> Self {
        Bookmark::Named {
            name: name.into(),
            scope: BookmarkScope::Default,
        }
    }

    /// Named bookmark in `scope`
    pub fn named_in(name: impl Into<String>, scope: BookmarkScope) -> Self {
        Bookmark::Named {
            name: name.into(),
            scope,
        }
    }

    /// Whether the bookmark is named
    pub fn is_named(&self) -> bool {
        matches!(self, Bookmark::Named { .. })
    }

    /// Name of a named bookmark
    pub fn name(&self) -> Option<&str> {
        match self {
            Bookmark::Named { name, .. } => Some(name),
            Bookmark::Internal { .. } => None,
        }
    }

    /// Scope of a named bookmark
    pub fn scope(&self) -> Option<&BookmarkScope> {
        match self {
            Bookmark::Named { scope, .. } => Some(scope),
            Bookmark::Internal { .. } => None,
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bookmark::Named { name, scope } if scope.is_default() => write!(f, "'{}'", name),
            Bookmark::Named { name, scope } => write!(f, "'{}' in scope {}", name, scope),
            Bookmark::Internal { id } => write!(f, "internal bookmark #{}", id),
        }
    }
}

/// Behavior flags of a bookmark
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkOptions {
    /// Stays registered after being resumed
    pub multiple_resume: bool,
    /// Does not keep its owner executing
    pub non_blocking: bool,
}

impl BookmarkOptions {
    /// Single resume, blocking
    pub const NONE: BookmarkOptions = BookmarkOptions {
        multiple_resume: false,
        non_blocking: false,
    };

    /// Resumable any number of times
    pub const MULTIPLE_RESUME: BookmarkOptions = BookmarkOptions {
        multiple_resume: true,
        non_blocking: false,
    };

    /// Does not keep its owner alive
    pub const NON_BLOCKING: BookmarkOptions = BookmarkOptions {
        multiple_resume: false,
        non_blocking: true,
    };
}

/// Outcome of a resumption request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    /// Resumption was scheduled
    Success,
    /// No such bookmark is registered
    NotFound,
    /// The owner cannot accept resumptions right now
    NotReady,
}

/// Public description of a registered bookmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    /// Bookmark identity
    pub bookmark: Bookmark,
    /// Owning instance
    pub owner: InstanceId,
    /// Display name of the owning activity
    pub activity: String,
    /// Options
    pub options: BookmarkOptions,
}

/// Registry entry for one bookmark
#[derive(Debug, Clone)]
pub struct BookmarkRecord {
    bookmark: Arc<Bookmark>,
    owner: InstanceId,
    options: BookmarkOptions,
    exclusive_handles: Vec<HandleId>,
}

impl BookmarkRecord {
    /// Shared bookmark value
    pub fn bookmark(&self) -> &Arc<Bookmark> {
        &self.bookmark
    }

    /// Owning instance
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Options
    pub fn options(&self) -> BookmarkOptions {
        self.options
    }

    /// Exclusive handles that recorded this bookmark
    pub fn exclusive_handles(&self) -> &[HandleId] {
        &self.exclusive_handles
    }
}

/// Registered bookmarks and bookmark scopes of one executor
#[derive(Debug, Default)]
pub struct BookmarkManager {
    records: HashMap<Bookmark, BookmarkRecord>,
    by_owner: HashMap<InstanceId, Vec<Arc<Bookmark>>>,
    scopes: HashSet<Uuid>,
    next_internal: u64,
}

impl BookmarkManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an internal bookmark
    pub fn next_internal(&mut self) -> Bookmark {
        self.next_internal += 1;
        Bookmark::Internal {
            id: self.next_internal,
        }
    }

    /// Check that `bookmark` could be inserted
    pub fn check_insert(&self, bookmark: &Bookmark) -> BookmarkResult<()> {
        if self.records.contains_key(bookmark) {
            return Err(BookmarkError::AlreadyExists(bookmark.to_string()));
        }
        if let Some(BookmarkScope::Scoped(id)) = bookmark.scope() {
            if !self.scopes.contains(id) {
                return Err(BookmarkError::ScopeNotRegistered(id.to_string()));
            }
        }
        Ok(())
    }

    /// Register a bookmark for `owner`
    pub fn insert(
        &mut self,
        bookmark: Bookmark,
        owner: InstanceId,
        options: BookmarkOptions,
        exclusive_handles: Vec<HandleId>,
    ) -> BookmarkResult<Arc<Bookmark>> {
        self.check_insert(&bookmark)?;
        let shared = Arc::new(bookmark.clone());
        self.records.insert(
            bookmark,
            BookmarkRecord {
                bookmark: shared.clone(),
                owner,
                options,
                exclusive_handles,
            },
        );
        self.by_owner.entry(owner).or_default().push(shared.clone());
        Ok(shared)
    }

    /// Look up by structural identity
    pub fn get(&self, bookmark: &Bookmark) -> Option<&BookmarkRecord> {
        self.records.get(bookmark)
    }

    /// Whether `bookmark` is registered
    pub fn contains(&self, bookmark: &Bookmark) -> bool {
        self.records.contains_key(bookmark)
    }

    /// Remove regardless of owner
    pub fn remove(&mut self, bookmark: &Bookmark) -> Option<BookmarkRecord> {
        let record = self.records.remove(bookmark)?;
        if let Some(owned) = self.by_owner.get_mut(&record.owner) {
            owned.retain(|b| !Arc::ptr_eq(b, &record.bookmark));
            if owned.is_empty() {
                self.by_owner.remove(&record.owner);
            }
        }
        Some(record)
    }

    /// Remove a bookmark on behalf of `owner`
    pub fn remove_owned(
        &mut self,
        owner: InstanceId,
        bookmark: &Bookmark,
    ) -> BookmarkResult<Option<BookmarkRecord>> {
        match self.records.get(bookmark) {
            None => Ok(None),
            Some(record) if record.owner != owner => {
                Err(BookmarkError::NotOwner(bookmark.to_string()))
            }
            Some(_) => Ok(self.remove(bookmark)),
        }
    }

    /// Remove every bookmark owned by `owner`
    pub fn remove_all(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        let owned = self.by_owner.remove(&owner).unwrap_or_default();
        owned
            .iter()
            .filter_map(|bookmark| self.records.remove(bookmark.as_ref()))
            .collect()
    }

    /// Bookmarks owned by `owner`, in creation order
    pub fn owned_by(&self, owner: InstanceId) -> &[Arc<Bookmark>] {
        self.by_owner.get(&owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `owner` holds a blocking bookmark
    pub fn has_blocking(&self, owner: InstanceId) -> bool {
        self.owned_by(owner)
            .iter()
            .filter_map(|bookmark| self.records.get(bookmark.as_ref()))
            .any(|record| !record.options.non_blocking)
    }

    /// All records
    pub fn records(&self) -> impl Iterator<Item = &BookmarkRecord> + '_ {
        self.records.values()
    }

    /// Number of registered bookmarks
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no bookmarks are registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register a scope so bookmarks may be created in it
    ///
    /// The default scope is always registered.
    pub fn register_scope(&mut self, scope: &BookmarkScope) -> Result<(), UsageError> {
        match scope {
            BookmarkScope::Default => Ok(()),
            BookmarkScope::Scoped(id) => {
                if self.scopes.insert(*id) {
                    Ok(())
                } else {
                    Err(UsageError::DuplicateBookmarkScope(id.to_string()))
                }
            }
        }
    }

    /// Unregister a scope; bookmarks already in it stay registered
    pub fn unregister_scope(&mut self, scope: &BookmarkScope) -> bool {
        match scope {
            BookmarkScope::Default => false,
            BookmarkScope::Scoped(id) => self.scopes.remove(id),
        }
    }

    /// Whether a scope is registered
    pub fn is_scope_registered(&self, scope: &BookmarkScope) -> bool {
        match scope {
            BookmarkScope::Default => true,
            BookmarkScope::Scoped(id) => self.scopes.contains(id),
        }
    }
}

/// Handle owning a bookmark scope
#[derive(Debug, Default)]
pub struct BookmarkScopeHandle {
    scope: Option<BookmarkScope>,
}

impl BookmarkScopeHandle {
    /// Scope, once created or initialized
    pub fn scope(&self) -> Option<&BookmarkScope> {
        self.scope.as_ref()
    }

    pub(crate) fn set_scope(&mut self, scope: BookmarkScope) {
        self.scope = Some(scope);
    }
}

impl Handle for BookmarkScopeHandle {
    fn on_uninitialize(&mut self, context: &mut HandleInitializationContext) -> anyhow::Result<()> {
        if let Some(scope) = self.scope.take() {
            context.unregister_bookmark_scope(&scope)?;
        }
        Ok(())
    }
}
