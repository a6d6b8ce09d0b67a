//! Exclusive-scope arbitration bookkeeping
//!
//! An [`ExclusiveHandle`] records which bookmarks were created while it was
//! visible, split into important (blocking) and unimportant (non-blocking)
//! lists, together with the bookmark scope handles it depends on. Scope
//! dependencies come from default discovery at initialization or from one
//! explicit registration; once a bookmark is recorded the set is frozen.

use std::sync::Arc;

use super::bookmark::{Bookmark, BookmarkScopeHandle};
use super::error::UsageError;
use super::handle::{Handle, HandleId, HandleInitializationContext};

/// Arbitration unit for mutually exclusive bookmark scopes
#[derive(Debug, Default)]
pub struct ExclusiveHandle {
    important: Vec<Arc<Bookmark>>,
    unimportant: Vec<Arc<Bookmark>>,
    scopes: Vec<HandleId>,
    default_scopes: bool,
}

impl ExclusiveHandle {
    /// Bookmarks whose resumption the owner waits on
    pub fn important_bookmarks(&self) -> &[Arc<Bookmark>] {
        &self.important
    }

    /// Non-blocking bookmarks
    pub fn unimportant_bookmarks(&self) -> &[Arc<Bookmark>] {
        &self.unimportant
    }

    /// Number of important bookmarks
    pub fn important_count(&self) -> usize {
        self.important.len()
    }

    /// Number of unimportant bookmarks
    pub fn unimportant_count(&self) -> usize {
        self.unimportant.len()
    }

    /// Whether any bookmark was recorded
    pub fn has_bookmarks(&self) -> bool {
        !self.important.is_empty() || !self.unimportant.is_empty()
    }

    /// Scope handles this handle depends on
    pub fn bookmark_scopes(&self) -> &[HandleId] {
        &self.scopes
    }

    /// Whether the scope list came from default discovery
    pub fn is_default_scopes(&self) -> bool {
        self.default_scopes
    }

    /// Whether `bookmark` is recorded, by identity
    pub fn contains(&self, bookmark: &Arc<Bookmark>) -> bool {
        self.important.iter().chain(&self.unimportant).any(|b| Arc::ptr_eq(b, bookmark))
    }

    pub(crate) fn set_default_scopes(&mut self, scopes: Vec<HandleId>) {
        self.scopes = scopes;
        self.default_scopes = true;
    }

    /// Replace the default scope list on the first call, append afterwards
    pub(crate) fn register_scope(&mut self, scope_handle: HandleId) -> Result<(), UsageError> {
        if self.has_bookmarks() {
            return Err(UsageError::ExclusiveHandleScopesFrozen);
        }
        if self.default_scopes {
            self.scopes.clear();
            self.default_scopes = false;
        } else if self.scopes.contains(&scope_handle) {
            return Err(UsageError::DuplicateBookmarkScope(format!("handle {}", scope_handle.0)));
        }
        self.scopes.push(scope_handle);
        Ok(())
    }

    pub(crate) fn add_bookmark(&mut self, bookmark: Arc<Bookmark>, important: bool) {
        if important {
            self.important.push(bookmark);
        } else {
            self.unimportant.push(bookmark);
        }
    }

    pub(crate) fn remove_bookmark(&mut self, bookmark: &Arc<Bookmark>) -> bool {
        if let Some(index) = self.important.iter().position(|b| Arc::ptr_eq(b, bookmark)) {
            self.important.remove(index);
            return true;
        }
        if let Some(index) = self.unimportant.iter().position(|b| Arc::ptr_eq(b, bookmark)) {
            self.unimportant.remove(index);
            return true;
        }
        false
    }
}

impl Handle for ExclusiveHandle {
    fn on_initialize(&mut self, context: &mut HandleInitializationContext) -> anyhow::Result<()> {
        let scopes = context.find_handles::<BookmarkScopeHandle>()?;
        self.set_default_scopes(scopes);
        Ok(())
    }
}
