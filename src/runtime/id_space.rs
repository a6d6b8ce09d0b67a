//! Tree-node addressing
//!
//! An `IdSpace` hands out sequential 1-based ids to the nodes added during
//! one metadata caching pass and maps ids back to nodes in O(1). Nested
//! spaces remember the space and id of the node that owns them, so a node's
//! full address is the dotted path of ids from the root space down
//! ([`QualifiedId`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::IdSpaceError;

/// Largest id a space hands out unless configured otherwise
pub const MAX_ID: u32 = i32::MAX as u32;

/// Key of an IdSpace inside an [`IdSpaceTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdSpaceKey(pub usize);

/// Sequential id assignment table for one caching pass
#[derive(Debug, Clone)]
pub struct IdSpace<M> {
    parent: Option<IdSpaceKey>,
    parent_id: u32,
    members: Vec<M>,
    max_id: u32,
    epoch: u64,
}

impl<M> IdSpace<M> {
    /// Create a root space
    pub fn new() -> Self {
        Self {
            parent: None,
            parent_id: 0,
            members: Vec::new(),
            max_id: MAX_ID,
            epoch: 0,
        }
    }

    /// Create a space nested under the member `parent_id` of `parent`
    pub fn nested(parent: IdSpaceKey, parent_id: u32) -> Self {
        Self {
            parent: Some(parent),
            parent_id,
            ..Self::new()
        }
    }

    /// Limit the number of ids this space may hand out
    pub fn with_max_id(mut self, max_id: u32) -> Self {
        self.max_id = max_id;
        self
    }

    /// Parent space, if nested
    pub fn parent(&self) -> Option<IdSpaceKey> {
        self.parent
    }

    /// Id of the owning member inside the parent space (0 for root spaces)
    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    /// Number of members, which is also the last id handed out
    pub fn member_count(&self) -> u32 {
        self.members.len() as u32
    }

    /// Bumped on every disposal
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Add a member and return its id
    pub fn add(&mut self, member: M) -> Result<u32, IdSpaceError> {
        let next = self.members.len() as u64 + 1;
        if next > self.max_id as u64 {
            return Err(IdSpaceError::Overflow(self.max_id));
        }
        self.members.push(member);
        Ok(next as u32)
    }

    /// Look up a member by id; 0 and out-of-range ids are not found
    pub fn get(&self, id: u32) -> Option<&M> {
        if id == 0 {
            return None;
        }
        self.members.get(id as usize - 1)
    }

    /// Iterate members with their ids
    pub fn iter(&self) -> impl Iterator<Item = (u32, &M)> + '_ {
        self.members
            .iter()
            .enumerate()
            .map(|(index, member)| (index as u32 + 1, member))
    }

    /// Forget every member; previously handed out ids become invalid
    pub fn dispose(&mut self) {
        self.members.clear();
        self.epoch += 1;
    }
}

impl<M> Default for IdSpace<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every IdSpace produced by one definition
#[derive(Debug, Clone)]
pub struct IdSpaceTable<M> {
    spaces: Vec<IdSpace<M>>,
}

impl<M: Copy> IdSpaceTable<M> {
    /// Create an empty table
    pub fn new() -> Self {
        Self { spaces: Vec::new() }
    }

    /// Register a space and return its key
    pub fn insert(&mut self, space: IdSpace<M>) -> IdSpaceKey {
        self.spaces.push(space);
        IdSpaceKey(self.spaces.len() - 1)
    }

    /// Borrow a space
    pub fn get(&self, key: IdSpaceKey) -> Option<&IdSpace<M>> {
        self.spaces.get(key.0)
    }

    /// Mutably borrow a space
    pub fn get_mut(&mut self, key: IdSpaceKey) -> Option<&mut IdSpace<M>> {
        self.spaces.get_mut(key.0)
    }

    /// Number of spaces
    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    /// Whether no spaces exist
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    /// Resolve a member by space and id
    pub fn lookup(&self, key: IdSpaceKey, id: u32) -> Option<M> {
        self.get(key)?.get(id).copied()
    }

    /// Member that owns a nested space
    pub fn owner(&self, key: IdSpaceKey) -> Option<M> {
        let space = self.get(key)?;
        let parent = space.parent()?;
        self.lookup(parent, space.parent_id())
    }

    /// Dotted path of ids from the root space to `id` in `key`
    pub fn qualified_id(&self, key: IdSpaceKey, id: u32) -> QualifiedId {
        let mut parts = vec![id];
        let mut current = self.get(key);
        while let Some(space) = current {
            match space.parent() {
                Some(parent) => {
                    parts.push(space.parent_id());
                    current = self.get(parent);
                }
                None => break,
            }
        }
        parts.reverse();
        QualifiedId(parts)
    }

    /// Dispose every space
    pub fn dispose_all(&mut self) {
        for space in &mut self.spaces {
            space.dispose();
        }
        self.spaces.clear();
    }
}

impl<M: Copy> Default for IdSpaceTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Dotted address of a node across nested IdSpaces (e.g. `1.4.2`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedId(pub Vec<u32>);

impl QualifiedId {
    /// Ids from outermost to innermost
    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    /// Whether `self` addresses a node nested under `other`
    pub fn is_nested_under(&self, other: &QualifiedId) -> bool {
        self.0.len() > other.0.len() && self.0.starts_with(&other.0)
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for QualifiedId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split('.')
            .map(str::parse::<u32>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(parts))
    }
}
