//! Workflow definitions and the metadata caching pass
//!
//! A [`WorkflowDefinition`] is an arena of [`ActivityNode`]s built with a
//! [`DefinitionBuilder`]. Building runs the caching pass: every node reachable
//! from the root gets an id in an [`IdSpace`] (implementation children get a
//! nested space owned by their parent), its scope declarations are collected,
//! and argument bindings are checked. Problems are accumulated as
//! [`ValidationError`]s rather than failing fast.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::activity::ActivityBehavior;
use super::environment::ScopeDeclarations;
use super::error::{
    DefinitionError, IdSpaceError, ValidationError, ValidationErrorKind, ValidationErrors,
};
use super::id_space::{IdSpace, IdSpaceKey, IdSpaceTable, MAX_ID, QualifiedId};
use super::location::{ArgumentDirection, LocationReference};
use super::value::{DynValue, Value, ValueType, boxed};

/// Index of a node in its definition arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub usize);

type LiteralFactory = Arc<dyn Fn() -> DynValue + Send + Sync>;

/// Source of an argument's value
#[derive(Clone)]
pub enum ArgumentBinding {
    /// No binding; the argument starts at its declared default
    Unbound,
    /// A constant, copied into every instance
    Literal {
        /// Type of the literal
        value_type: ValueType,
        /// Produces a fresh copy
        factory: LiteralFactory,
    },
    /// A variable or argument declared by an ancestor
    Reference(LocationReference),
}

impl fmt::Debug for ArgumentBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentBinding::Unbound => f.write_str("Unbound"),
            ArgumentBinding::Literal { value_type, .. } => write!(f, "Literal({})", value_type),
            ArgumentBinding::Reference(reference) => {
                write!(f, "Reference({})", reference.display_name())
            }
        }
    }
}

/// A declared argument and its binding
///
/// `In` arguments get a fresh copy of the bound value. `InOut` and `Out`
/// arguments alias the bound location, so reading an `Out` argument before
/// the activity writes it returns the bound variable's current value, not
/// the argument's default.
#[derive(Debug, Clone)]
pub struct Argument {
    reference: LocationReference,
    direction: ArgumentDirection,
    binding: ArgumentBinding,
}

impl Argument {
    /// Declare an argument named `name` of type `T`
    pub fn new<T: Value>(name: impl Into<String>, direction: ArgumentDirection) -> Self {
        Self {
            reference: LocationReference::new::<T>(name),
            direction,
            binding: ArgumentBinding::Unbound,
        }
    }

    /// Shorthand for an `In` argument bound to a literal
    pub fn input<T: Value>(name: impl Into<String>, value: T) -> Self {
        Self::new::<T>(name, ArgumentDirection::In).bind_literal(value)
    }

    /// Bind to a literal value
    pub fn bind_literal<T: Value>(mut self, value: T) -> Self {
        self.binding = ArgumentBinding::Literal {
            value_type: ValueType::of::<T>(),
            factory: Arc::new(move || boxed(value.clone())),
        };
        self
    }

    /// Bind to a reference declared by an ancestor
    pub fn bind_reference(mut self, reference: &LocationReference) -> Self {
        self.binding = ArgumentBinding::Reference(reference.clone());
        self
    }

    /// The argument's own reference, used by the activity to read or write it
    pub fn reference(&self) -> &LocationReference {
        &self.reference
    }

    /// Direction
    pub fn direction(&self) -> ArgumentDirection {
        self.direction
    }

    /// Binding
    pub fn binding(&self) -> &ArgumentBinding {
        &self.binding
    }
}

/// One element of the definition tree
pub struct ActivityNode {
    display_name: String,
    behavior: ActivityBehavior,
    children: Vec<NodeKey>,
    implementation_children: Vec<NodeKey>,
    variables: Vec<LocationReference>,
    arguments: Vec<Argument>,
    declarations: Arc<ScopeDeclarations>,
    parent: Option<NodeKey>,
    id_space: Option<IdSpaceKey>,
    id: u32,
    cache_epoch: u64,
}

impl ActivityNode {
    fn new(display_name: String, behavior: ActivityBehavior) -> Self {
        Self {
            display_name,
            behavior,
            children: Vec::new(),
            implementation_children: Vec::new(),
            variables: Vec::new(),
            arguments: Vec::new(),
            declarations: Arc::new(ScopeDeclarations::new()),
            parent: None,
            id_space: None,
            id: 0,
            cache_epoch: 0,
        }
    }

    /// Display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Execution behavior
    pub fn behavior(&self) -> &ActivityBehavior {
        &self.behavior
    }

    /// Public children
    pub fn children(&self) -> &[NodeKey] {
        &self.children
    }

    /// Implementation children (nested IdSpace)
    pub fn implementation_children(&self) -> &[NodeKey] {
        &self.implementation_children
    }

    /// Declared variables
    pub fn variables(&self) -> &[LocationReference] {
        &self.variables
    }

    /// Declared arguments
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Scope declarations (variables then arguments)
    pub fn declarations(&self) -> &Arc<ScopeDeclarations> {
        &self.declarations
    }

    /// Parent node after caching
    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    /// IdSpace this node belongs to
    pub fn id_space(&self) -> Option<IdSpaceKey> {
        self.id_space
    }

    /// Id within its IdSpace (0 when not cached)
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Epoch of the caching pass that assigned the id
    pub fn cache_epoch(&self) -> u64 {
        self.cache_epoch
    }

    /// Whether `child` is a public or implementation child
    pub fn has_child(&self, child: NodeKey) -> bool {
        self.children.contains(&child) || self.implementation_children.contains(&child)
    }
}

impl fmt::Debug for ActivityNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityNode")
            .field("display_name", &self.display_name)
            .field("id", &self.id)
            .field("children", &self.children)
            .field("implementation_children", &self.implementation_children)
            .finish()
    }
}

/// Collects nodes before the caching pass
pub struct DefinitionBuilder {
    nodes: Vec<ActivityNode>,
    max_id: u32,
    unknown: Vec<NodeKey>,
}

impl DefinitionBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            max_id: MAX_ID,
            unknown: Vec::new(),
        }
    }

    /// Limit ids per IdSpace
    pub fn with_max_id(mut self, max_id: u32) -> Self {
        self.max_id = max_id;
        self
    }

    /// Add a node
    pub fn add(&mut self, display_name: impl Into<String>, behavior: ActivityBehavior) -> NodeKey {
        self.nodes.push(ActivityNode::new(display_name.into(), behavior));
        NodeKey(self.nodes.len() - 1)
    }

    /// Add a public child
    pub fn add_child(&mut self, parent: NodeKey, child: NodeKey) -> &mut Self {
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
        self
    }

    /// Add an implementation child
    pub fn add_implementation_child(&mut self, parent: NodeKey, child: NodeKey) -> &mut Self {
        if let Some(node) = self.node_mut(parent) {
            node.implementation_children.push(child);
        }
        self
    }

    /// Declare a variable on a node
    pub fn add_variable(&mut self, node: NodeKey, reference: &LocationReference) -> &mut Self {
        if let Some(node) = self.node_mut(node) {
            node.variables.push(reference.clone());
        }
        self
    }

    /// Declare an argument on a node
    pub fn add_argument(&mut self, node: NodeKey, argument: Argument) -> &mut Self {
        if let Some(node) = self.node_mut(node) {
            node.arguments.push(argument);
        }
        self
    }

    fn node_mut(&mut self, key: NodeKey) -> Option<&mut ActivityNode> {
        if key.0 >= self.nodes.len() {
            self.unknown.push(key);
        }
        self.nodes.get_mut(key.0)
    }

    /// Run the caching pass rooted at `root`
    ///
    /// Validation problems are recorded on the definition. Keys outside this
    /// builder and id overflow abort the pass. Keys are plain indices, so a
    /// key from another builder is only caught when it is out of range here.
    pub fn build(self, root: NodeKey) -> Result<WorkflowDefinition, DefinitionError> {
        let len = self.nodes.len();
        let children = self
            .nodes
            .iter()
            .flat_map(|node| node.children.iter().chain(&node.implementation_children));
        if let Some(key) = self
            .unknown
            .iter()
            .chain(std::iter::once(&root))
            .chain(children)
            .find(|key| key.0 >= len)
        {
            return Err(DefinitionError::UnknownNode(key.0));
        }

        let mut definition = WorkflowDefinition {
            nodes: self.nodes,
            id_spaces: IdSpaceTable::new(),
            root,
            cache_epoch: 0,
            max_id: self.max_id,
            errors: Vec::new(),
        };
        definition.cache_metadata()?;
        Ok(definition)
    }
}

impl Default for DefinitionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable tree of activity nodes with cached metadata
pub struct WorkflowDefinition {
    nodes: Vec<ActivityNode>,
    id_spaces: IdSpaceTable<NodeKey>,
    root: NodeKey,
    cache_epoch: u64,
    max_id: u32,
    errors: Vec<ValidationError>,
}

impl WorkflowDefinition {
    /// Root node
    pub fn root(&self) -> NodeKey {
        self.root
    }

    /// Borrow a node
    ///
    /// Panics on a key from another definition.
    pub fn node(&self, key: NodeKey) -> &ActivityNode {
        &self.nodes[key.0]
    }

    /// Borrow a node if the key is in range
    pub fn get(&self, key: NodeKey) -> Option<&ActivityNode> {
        self.nodes.get(key.0)
    }

    /// Number of nodes in the arena
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current caching pass number
    pub fn cache_epoch(&self) -> u64 {
        self.cache_epoch
    }

    /// Whether `key` was cached by the latest pass
    pub fn is_current(&self, key: NodeKey) -> bool {
        self.get(key)
            .is_some_and(|node| node.cache_epoch == self.cache_epoch && node.id != 0)
    }

    /// IdSpaces of the latest pass
    pub fn id_spaces(&self) -> &IdSpaceTable<NodeKey> {
        &self.id_spaces
    }

    /// Dotted address of a cached node
    pub fn qualified_id(&self, key: NodeKey) -> Option<QualifiedId> {
        let node = self.get(key)?;
        let space = node.id_space?;
        Some(self.id_spaces.qualified_id(space, node.id))
    }

    /// Find a node by its dotted address
    pub fn find(&self, id: &QualifiedId) -> Option<NodeKey> {
        let (first, rest) = id.parts().split_first()?;
        let root_space = self.node(self.root).id_space?;
        let mut current = self.id_spaces.lookup(root_space, *first)?;
        for part in rest {
            let node = self.node(current);
            let nested = node
                .implementation_children
                .first()
                .and_then(|child| self.node(*child).id_space)?;
            current = self.id_spaces.lookup(nested, *part)?;
        }
        Some(current)
    }

    /// Largest id the latest pass assigned in any IdSpace
    pub fn max_assigned_id(&self) -> u32 {
        self.nodes
            .iter()
            .filter(|node| node.cache_epoch == self.cache_epoch)
            .map(|node| node.id)
            .max()
            .unwrap_or(0)
    }

    /// Errors from the latest pass
    pub fn validation_errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Errors from the latest pass as a single error value
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.errors.clone()))
        }
    }

    /// Run the caching pass again
    ///
    /// Every IdSpace of the previous pass is disposed; nodes that are no
    /// longer reachable keep their old epoch and report as stale.
    pub fn recache(&mut self) -> Result<(), IdSpaceError> {
        self.cache_metadata()
    }

    fn cache_metadata(&mut self) -> Result<(), IdSpaceError> {
        self.cache_epoch += 1;
        self.id_spaces.dispose_all();
        self.errors.clear();
        for node in &mut self.nodes {
            node.parent = None;
            node.id_space = None;
            node.id = 0;
        }

        let root_space = self
            .id_spaces
            .insert(IdSpace::new().with_max_id(self.max_id));
        let mut pending = vec![(self.root, None, root_space)];

        while let Some((key, parent, space)) = pending.pop() {
            if self.nodes[key.0].cache_epoch == self.cache_epoch {
                let name = self.nodes[key.0].display_name.clone();
                self.errors.push(ValidationError::new(
                    ValidationErrorKind::NodeReused,
                    name,
                    "activity is referenced from more than one parent",
                ));
                continue;
            }

            let id = match self.id_spaces.get_mut(space) {
                Some(table) => table.add(key)?,
                None => continue,
            };

            let epoch = self.cache_epoch;
            {
                let node = &mut self.nodes[key.0];
                node.id = id;
                node.id_space = Some(space);
                node.parent = parent;
                node.cache_epoch = epoch;
            }

            self.collect_declarations(key);
            self.check_arguments(key);

            let node = &self.nodes[key.0];
            let children = node.children.clone();
            let implementation_children = node.implementation_children.clone();

            if !implementation_children.is_empty() {
                let nested = self
                    .id_spaces
                    .insert(IdSpace::nested(space, id).with_max_id(self.max_id));
                for child in implementation_children.into_iter().rev() {
                    pending.push((child, Some(key), nested));
                }
            }
            // Reverse so public children get ids in declaration order
            for child in children.into_iter().rev() {
                pending.push((child, Some(key), space));
            }
        }

        Ok(())
    }

    fn collect_declarations(&mut self, key: NodeKey) {
        let node = &self.nodes[key.0];
        let mut declarations = ScopeDeclarations::new();
        for variable in &node.variables {
            declarations.declare(variable.clone(), &node.display_name, &mut self.errors);
        }
        for argument in &node.arguments {
            declarations.declare(argument.reference.clone(), &node.display_name, &mut self.errors);
        }
        self.nodes[key.0].declarations = Arc::new(declarations);
    }

    fn check_arguments(&mut self, key: NodeKey) {
        let node = &self.nodes[key.0];
        let mut errors = Vec::new();

        for argument in &node.arguments {
            let name = argument.reference.display_name();
            let declared = argument.reference.value_type();

            match &argument.binding {
                ArgumentBinding::Unbound => {}
                ArgumentBinding::Literal { value_type, .. } => {
                    if argument.direction != ArgumentDirection::In {
                        errors.push(ValidationError::new(
                            ValidationErrorKind::ArgumentDirection,
                            node.display_name.clone(),
                            format!(
                                "{:?} argument '{}' cannot be bound to a literal",
                                argument.direction, name
                            ),
                        ));
                    } else if !value_type.is_assignable_to(&declared) {
                        errors.push(ValidationError::new(
                            ValidationErrorKind::ArgumentType,
                            node.display_name.clone(),
                            format!(
                                "literal of type {} cannot bind argument '{}' of type {}",
                                value_type, name, declared
                            ),
                        ));
                    }
                }
                ArgumentBinding::Reference(reference) => {
                    let Some(target) = self.resolve_in_ancestors(node.parent, reference) else {
                        errors.push(ValidationError::new(
                            ValidationErrorKind::UnresolvedReference,
                            node.display_name.clone(),
                            format!(
                                "argument '{}' is bound to '{}', which no enclosing activity declares",
                                name,
                                reference.display_name()
                            ),
                        ));
                        continue;
                    };

                    let bound = target.value_type();
                    let compatible = match argument.direction {
                        ArgumentDirection::In => bound.is_assignable_to(&declared),
                        ArgumentDirection::Out => declared.is_assignable_to(&bound),
                        ArgumentDirection::InOut => bound == declared,
                    };
                    if !compatible {
                        errors.push(ValidationError::new(
                            ValidationErrorKind::ArgumentType,
                            node.display_name.clone(),
                            format!(
                                "{:?} argument '{}' of type {} cannot bind '{}' of type {}",
                                argument.direction,
                                name,
                                declared,
                                reference.display_name(),
                                bound
                            ),
                        ));
                    }
                }
            }
        }

        self.errors.extend(errors);
    }

    fn resolve_in_ancestors(
        &self,
        start: Option<NodeKey>,
        reference: &LocationReference,
    ) -> Option<LocationReference> {
        let mut current = start;
        while let Some(key) = current {
            let node = &self.nodes[key.0];
            if let Some(index) = node.declarations.find(reference) {
                return node.declarations.get(index).cloned();
            }
            current = node.parent;
        }
        None
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("cache_epoch", &self.cache_epoch)
            .field("errors", &self.errors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{ActivityBehavior, CodeActivity};
    use crate::runtime::context::CodeActivityContext;

    struct Noop;

    impl CodeActivity for Noop {
        fn execute(&self, _context: &mut CodeActivityContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn noop() -> ActivityBehavior {
        ActivityBehavior::code(Noop)
    }

    #[test]
    fn test_ids_assigned_in_order() {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        let a = builder.add("A", noop());
        let b = builder.add("B", noop());
        builder.add_child(root, a).add_child(root, b);

        let definition = builder.build(root).unwrap();
        assert_eq!(definition.node(root).id(), 1);
        assert_eq!(definition.node(a).id(), 2);
        assert_eq!(definition.node(b).id(), 3);
        assert!(definition.validation_errors().is_empty());
    }

    #[test]
    fn test_implementation_children_get_nested_space() {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        let public = builder.add("Public", noop());
        let hidden = builder.add("Hidden", noop());
        builder.add_child(root, public);
        builder.add_implementation_child(public, hidden);

        let definition = builder.build(root).unwrap();
        let space = definition.node(hidden).id_space().unwrap();
        assert_ne!(Some(space), definition.node(public).id_space());
        assert_eq!(definition.id_spaces().owner(space), Some(public));
        assert_eq!(definition.qualified_id(hidden).unwrap().to_string(), "2.1");
        assert_eq!(definition.find(&"2.1".parse().unwrap()), Some(hidden));
    }

    #[test]
    fn test_validation_errors_accumulate() {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        let child = builder.add("Child", noop());
        builder.add_child(root, child);

        let x1 = LocationReference::new::<i32>("x");
        let x2 = LocationReference::new::<i32>("x");
        let text = LocationReference::new::<String>("text");
        builder.add_variable(root, &x1).add_variable(root, &x2).add_variable(root, &text);
        builder.add_argument(
            child,
            Argument::new::<i32>("out", ArgumentDirection::Out).bind_literal(1),
        );
        builder.add_argument(
            child,
            Argument::new::<i32>("num", ArgumentDirection::In).bind_reference(&text),
        );
        builder.add_argument(
            child,
            Argument::new::<i32>("lost", ArgumentDirection::In)
                .bind_reference(&LocationReference::unnamed::<i32>()),
        );

        let definition = builder.build(root).unwrap();
        let kinds: Vec<_> = definition.validation_errors().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(kinds, vec![
            ValidationErrorKind::DuplicateName,
            ValidationErrorKind::ArgumentDirection,
            ValidationErrorKind::ArgumentType,
            ValidationErrorKind::UnresolvedReference,
        ]);
        assert!(definition.validate().is_err());
        // the first declaration of `x` stays in the scope
        assert_eq!(definition.node(root).declarations().find_by_name("x"), Some(&x1));
    }

    #[test]
    fn test_reused_node_is_reported() {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        let shared = builder.add("Shared", noop());
        builder.add_child(root, shared).add_child(root, shared);

        let definition = builder.build(root).unwrap();
        assert_eq!(definition.validation_errors().len(), 1);
        assert_eq!(definition.validation_errors()[0].kind, ValidationErrorKind::NodeReused);
    }

    #[test]
    fn test_recache_bumps_epoch() {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        let orphan = builder.add("Orphan", noop());
        let mut definition = builder.build(root).unwrap();

        assert!(definition.is_current(root));
        assert!(!definition.is_current(orphan));
        let before = definition.cache_epoch();
        definition.recache().unwrap();
        assert_eq!(definition.cache_epoch(), before + 1);
        assert!(definition.is_current(root));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        builder.add_child(root, NodeKey(7));
        assert_eq!(builder.build(root).unwrap_err(), DefinitionError::UnknownNode(7));

        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        builder.add_variable(NodeKey(3), &LocationReference::new::<i32>("x"));
        assert_eq!(builder.build(root).unwrap_err(), DefinitionError::UnknownNode(3));

        let builder = DefinitionBuilder::new();
        assert_eq!(builder.build(NodeKey(0)).unwrap_err(), DefinitionError::UnknownNode(0));
    }

    #[test]
    fn test_max_assigned_id_spans_nested_spaces() {
        let mut builder = DefinitionBuilder::new();
        let root = builder.add("Root", noop());
        let a = builder.add("A", noop());
        let b = builder.add("B", noop());
        let hidden = builder.add("Hidden", noop());
        builder.add_child(root, a).add_child(root, b).add_implementation_child(a, hidden);

        let definition = builder.build(root).unwrap();
        assert_eq!(definition.max_assigned_id(), 3);
    }

    #[test]
    fn test_overflow_aborts_pass() {
        let mut builder = DefinitionBuilder::new().with_max_id(2);
        let root = builder.add("Root", noop());
        for i in 0..2 {
            let child = builder.add(format!("C{}", i), noop());
            builder.add_child(root, child);
        }
        assert_eq!(
            builder.build(root).unwrap_err(),
            DefinitionError::IdSpace(IdSpaceError::Overflow(2))
        );
    }
}
