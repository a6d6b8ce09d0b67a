//! Scope declarations and parent-chained location environments
//!
//! [`ScopeDeclarations`] is the metadata view of one scope: the references an
//! activity declares, with name collisions recorded as validation errors.
//! [`EnvironmentArena`] holds the runtime view: one environment per activity
//! instance, each with a cell per declaration and a parent link. Resolution
//! walks the parent chain and the first matching declaration wins.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::definition::NodeKey;
use super::error::{LocationError, LocationResult, ValidationError, ValidationErrorKind};
use super::handle::HandleId;
use super::instance::InstanceId;
use super::location::{
    AccessDirection, InlinedLocationReference, LocationReference, SharedLocation, Visibility,
};

/// References declared by one scope
#[derive(Debug, Clone, Default)]
pub struct ScopeDeclarations {
    references: Vec<LocationReference>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u64, usize>,
}

impl ScopeDeclarations {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a reference
    ///
    /// A name already declared in this scope is not an immediate failure: the
    /// collision is pushed onto `errors`, the first declaration stays in
    /// place and `false` is returned.
    pub fn declare(
        &mut self,
        reference: LocationReference,
        activity: &str,
        errors: &mut Vec<ValidationError>,
    ) -> bool {
        if self.by_id.contains_key(&reference.id()) {
            return true;
        }

        if let Some(name) = reference.name() {
            if self.by_name.contains_key(name) {
                errors.push(ValidationError::new(
                    ValidationErrorKind::DuplicateName,
                    activity,
                    format!(
                        "a variable or argument named '{}' is already declared in this scope",
                        name
                    ),
                ));
                return false;
            }
        }

        let index = self.references.len();
        if let Some(name) = reference.name() {
            self.by_name.insert(name.to_string(), index);
        }
        self.by_id.insert(reference.id(), index);
        self.references.push(reference);
        true
    }

    /// Slot index of the declaration matching `reference`
    ///
    /// Named references match by name, unnamed ones by identity.
    pub fn find(&self, reference: &LocationReference) -> Option<usize> {
        match reference.name() {
            Some(name) => self.by_name.get(name).copied(),
            None => self.by_id.get(&reference.id()).copied(),
        }
    }

    /// Declaration by name
    pub fn find_by_name(&self, name: &str) -> Option<&LocationReference> {
        self.by_name.get(name).map(|index| &self.references[*index])
    }

    /// Declaration at a slot index
    pub fn get(&self, index: usize) -> Option<&LocationReference> {
        self.references.get(index)
    }

    /// All declarations in slot order
    pub fn references(&self) -> &[LocationReference] {
        &self.references
    }

    /// Number of declarations
    pub fn len(&self) -> usize {
        self.references.len()
    }

    /// Whether nothing is declared
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Fresh cells for every declaration, in slot order
    pub fn create_locations(&self) -> Vec<SharedLocation> {
        self.references
            .iter()
            .map(LocationReference::create_location)
            .collect()
    }
}

/// Identifier of a runtime environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId(pub u64);

/// Runtime scope of one activity instance
#[derive(Debug)]
pub struct Environment {
    parent: Option<EnvironmentId>,
    owner: Option<InstanceId>,
    declarations: Arc<ScopeDeclarations>,
    locations: Vec<SharedLocation>,
    handles: Vec<HandleId>,
}

impl Environment {
    /// Enclosing environment
    pub fn parent(&self) -> Option<EnvironmentId> {
        self.parent
    }

    /// Instance that owns this environment
    pub fn owner(&self) -> Option<InstanceId> {
        self.owner
    }

    /// Declarations backing the cells
    pub fn declarations(&self) -> &ScopeDeclarations {
        &self.declarations
    }

    /// Handles owned by this scope, in creation order
    pub fn handles(&self) -> &[HandleId] {
        &self.handles
    }
}

/// Result of a successful resolution
#[derive(Debug, Clone)]
pub struct ResolvedLocation {
    /// Environment that declares the reference
    pub environment: EnvironmentId,
    /// Declared reference that matched
    pub declaration: LocationReference,
    /// The cell
    pub location: SharedLocation,
}

/// All live environments of one executor
#[derive(Debug, Default)]
pub struct EnvironmentArena {
    environments: HashMap<EnvironmentId, Environment>,
    next_id: u64,
    chained_access_allowed: bool,
}

impl EnvironmentArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an environment with the given cells (one per declaration)
    pub fn create(
        &mut self,
        parent: Option<EnvironmentId>,
        owner: Option<InstanceId>,
        declarations: Arc<ScopeDeclarations>,
        locations: Vec<SharedLocation>,
    ) -> EnvironmentId {
        debug_assert_eq!(declarations.len(), locations.len());
        self.next_id += 1;
        let id = EnvironmentId(self.next_id);
        self.environments.insert(
            id,
            Environment {
                parent,
                owner,
                declarations,
                locations,
                handles: Vec::new(),
            },
        );
        id
    }

    /// Borrow an environment
    pub fn get(&self, id: EnvironmentId) -> Option<&Environment> {
        self.environments.get(&id)
    }

    /// Number of live environments
    pub fn len(&self) -> usize {
        self.environments.len()
    }

    /// Whether no environments are live
    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    /// Environment ids from `start` up to the outermost scope
    pub fn chain(&self, start: EnvironmentId) -> Vec<EnvironmentId> {
        let mut chain = Vec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            match self.environments.get(&id) {
                Some(environment) => {
                    chain.push(id);
                    current = environment.parent;
                }
                None => break,
            }
        }
        chain
    }

    /// Resolve `reference` starting at `start`
    pub fn resolve(
        &self,
        start: EnvironmentId,
        reference: &LocationReference,
    ) -> LocationResult<ResolvedLocation> {
        for id in self.chain(start) {
            let environment = &self.environments[&id];
            let Some(index) = environment.declarations.find(reference) else {
                continue;
            };

            let declaration = environment.declarations.references()[index].clone();
            if declaration.visibility() == Visibility::Inlined && !self.chained_access_allowed {
                return Err(LocationError::AccessViolation {
                    reference: reference.display_name(),
                    detail: "declaration is only reachable through an inlined reference".into(),
                });
            }

            return Ok(ResolvedLocation {
                environment: id,
                declaration,
                location: environment.locations[index].clone(),
            });
        }

        Err(LocationError::NotFound(reference.display_name()))
    }

    /// Resolve through an inlined reference on behalf of `accessor`
    ///
    /// Direction and accessor are checked first; the chained-access flag is
    /// raised only for the duration of the delegated lookup.
    pub fn resolve_inlined(
        &mut self,
        start: EnvironmentId,
        inlined: &InlinedLocationReference,
        accessor: NodeKey,
        requested: AccessDirection,
    ) -> LocationResult<ResolvedLocation> {
        inlined.check_access(accessor, requested)?;

        self.chained_access_allowed = true;
        let resolved = self.resolve(start, inlined.reference());
        self.chained_access_allowed = false;
        resolved
    }

    /// Whether an inlined lookup is in progress
    pub fn is_chained_access_allowed(&self) -> bool {
        self.chained_access_allowed
    }

    /// Record that `environment` owns `handle`
    pub fn add_handle(&mut self, environment: EnvironmentId, handle: HandleId) -> bool {
        match self.environments.get_mut(&environment) {
            Some(env) => {
                env.handles.push(handle);
                true
            }
            None => false,
        }
    }

    /// Forget ownership of `handle`
    pub fn remove_handle(&mut self, environment: EnvironmentId, handle: HandleId) {
        if let Some(env) = self.environments.get_mut(&environment) {
            env.handles.retain(|h| *h != handle);
        }
    }

    /// Handles owned by every scope from `start` outward, nearest first
    pub fn handles_in_chain(&self, start: EnvironmentId) -> Vec<HandleId> {
        self.chain(start)
            .into_iter()
            .flat_map(|id| self.environments[&id].handles.clone())
            .collect()
    }

    /// Remove an environment, returning it for teardown
    pub fn remove(&mut self, id: EnvironmentId) -> Option<Environment> {
        self.environments.remove(&id)
    }
}
