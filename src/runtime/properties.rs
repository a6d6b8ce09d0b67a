//! Execution properties: named ambient values chained along the instance tree
//!
//! Each instance carries a [`PropertyTable`]; lookups walk from the instance
//! through its ancestors to the executor root. An entry may be restricted to
//! the IdSpace of the activity that added it, which hides it from
//! implementation children of that activity's public children.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::error::{PropertyError, Result, UsageError};
use super::executor::{ExecutorState, SharedState};
use super::handle::HandleId;
use super::id_space::IdSpaceKey;
use super::instance::InstanceId;

/// A property that wants to know when it enters or leaves the chain
pub trait RegisteredProperty: Any + Send + Sync {
    /// Called before the property becomes visible; an error rejects the add
    fn register(&self, _context: &RegistrationContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after the property is removed
    fn unregister(&self, _context: &RegistrationContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Value stored under a property name
#[derive(Clone)]
pub enum PropertyValue {
    /// Plain shared value
    Shared(Arc<dyn Any + Send + Sync>),
    /// Value with registration callbacks
    Registered(Arc<dyn RegisteredProperty>),
    /// A handle owned by the adding instance
    Handle(HandleId),
}

impl PropertyValue {
    /// Wrap a plain value
    pub fn shared<T: Any + Send + Sync>(value: T) -> Self {
        PropertyValue::Shared(Arc::new(value))
    }

    /// Wrap a value with registration callbacks
    pub fn registered<T: RegisteredProperty>(value: T) -> Self {
        PropertyValue::Registered(Arc::new(value))
    }

    /// Reference a handle
    pub fn handle(id: HandleId) -> Self {
        PropertyValue::Handle(id)
    }

    /// Downcast a shared or registered value
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            PropertyValue::Shared(value) => value.clone().downcast::<T>().ok(),
            PropertyValue::Registered(value) => {
                let value: Arc<dyn Any + Send + Sync> = value.clone();
                value.downcast::<T>().ok()
            }
            PropertyValue::Handle(_) => None,
        }
    }

    /// Handle id of a handle value
    pub fn as_handle(&self) -> Option<HandleId> {
        match self {
            PropertyValue::Handle(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Shared(_) => f.write_str("Shared(..)"),
            PropertyValue::Registered(_) => f.write_str("Registered(..)"),
            PropertyValue::Handle(id) => write!(f, "Handle({})", id.0),
        }
    }
}

#[derive(Debug, Clone)]
struct PropertyEntry {
    name: String,
    value: PropertyValue,
    visible_in: Option<IdSpaceKey>,
}

/// Properties added at one scope, in insertion order
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    entries: Vec<PropertyEntry>,
}

impl PropertyTable {
    /// Value under `name` if visible from `reader`
    pub fn find(&self, name: &str, reader: Option<IdSpaceKey>) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find(|entry| entry.name == name && is_visible(entry.visible_in, reader))
            .map(|entry| &entry.value)
    }

    fn insert(&mut self, name: String, value: PropertyValue, visible_in: Option<IdSpaceKey>) {
        self.entries.push(PropertyEntry { name, value, visible_in });
    }

    fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        let index = self.entries.iter().position(|entry| entry.name == name)?;
        Some(self.entries.remove(index).value)
    }

    fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.iter().find(|entry| entry.name == name).map(|entry| &entry.value)
    }

    /// Remove every registered property, returning them for unregistration
    pub(crate) fn drain_registered(&mut self) -> Vec<(String, Arc<dyn RegisteredProperty>)> {
        let mut drained = Vec::new();
        self.entries.retain(|entry| match &entry.value {
            PropertyValue::Registered(property) => {
                drained.push((entry.name.clone(), property.clone()));
                false
            }
            _ => true,
        });
        drained
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_visible(visible_in: Option<IdSpaceKey>, reader: Option<IdSpaceKey>) -> bool {
    match visible_in {
        None => true,
        Some(space) => reader == Some(space),
    }
}

/// Snapshot of the properties visible where a registered property is added
/// or removed
#[derive(Debug, Clone, Default)]
pub struct RegistrationContext {
    properties: Vec<(String, PropertyValue)>,
}

impl RegistrationContext {
    /// Nearest visible property named `name`
    pub fn find(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.iter().find(|(n, _)| n == name).map(|(_, value)| value)
    }

    /// Visible properties, nearest scope first
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> + '_ {
        self.properties.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Property chain of an instance, or of the executor root
pub struct ExecutionProperties {
    state: SharedState,
    scope: Option<InstanceId>,
}

impl ExecutionProperties {
    pub(crate) fn new(state: SharedState, scope: Option<InstanceId>) -> Self {
        Self { state, scope }
    }

    /// Nearest property named `name` visible from this scope
    pub fn find(&self, name: &str) -> Result<Option<PropertyValue>> {
        let st = self.state.lock();
        find_visible(&st, self.scope, name)
    }

    /// Every visible property, nearest scope first, shadowed names omitted
    pub fn iter(&self) -> Result<Vec<(String, PropertyValue)>> {
        let st = self.state.lock();
        flatten_visible(&st, self.scope)
    }

    /// Whether no property is visible
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.iter()?.is_empty())
    }

    /// Add a property at this scope
    ///
    /// With `only_visible_to_public_children` the property is hidden from
    /// lookups made from any other IdSpace.
    pub fn add(
        &self,
        name: &str,
        value: PropertyValue,
        only_visible_to_public_children: bool,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(PropertyError::EmptyName.into());
        }

        let (visible_in, registration) = {
            let st = self.state.lock();
            if find_visible(&st, self.scope, name)?.is_some() {
                return Err(PropertyError::DuplicateName(name.to_string()).into());
            }
            check_children(&st, self.scope, name, &value)?;

            let reader = reader_space(&st, self.scope)?;
            let visible_in = if only_visible_to_public_children { reader } else { None };
            let registration = match &value {
                PropertyValue::Registered(_) => Some(RegistrationContext {
                    properties: flatten_visible(&st, self.scope)?,
                }),
                _ => None,
            };
            (visible_in, registration)
        };

        if let (PropertyValue::Registered(property), Some(context)) = (&value, &registration) {
            property
                .register(context)
                .map_err(|err| PropertyError::RegistrationFailed {
                    name: name.to_string(),
                    detail: err.to_string(),
                })?;
        }

        let mut st = self.state.lock();
        if find_visible(&st, self.scope, name)?.is_some() {
            return Err(PropertyError::DuplicateName(name.to_string()).into());
        }
        table_mut(&mut st, self.scope)?.insert(name.to_string(), value, visible_in);
        debug!(property = name, scope = ?self.scope, "execution property added");
        Ok(())
    }

    /// Remove a property added at this scope
    ///
    /// Returns `false` when no such property exists here; ancestors are
    /// never touched.
    pub fn remove(&self, name: &str) -> Result<bool> {
        if name.is_empty() {
            return Err(PropertyError::EmptyName.into());
        }

        let (removed, registration) = {
            let mut st = self.state.lock();
            let Some(value) = table(&st, self.scope)?.get(name).cloned() else {
                return Ok(false);
            };
            check_children(&st, self.scope, name, &value)?;
            let removed = table_mut(&mut st, self.scope)?.remove(name);
            let registration = RegistrationContext {
                properties: flatten_visible(&st, self.scope)?,
            };
            (removed, registration)
        };

        if let Some(PropertyValue::Registered(property)) = &removed {
            if let Err(err) = property.unregister(&registration) {
                tracing::warn!(property = name, error = %err, "property unregister failed");
            }
        }
        debug!(property = name, scope = ?self.scope, "execution property removed");
        Ok(removed.is_some())
    }
}

/// Read-only view of an instance's property chain
pub struct PropertyView {
    inner: ExecutionProperties,
}

impl PropertyView {
    pub(crate) fn new(inner: ExecutionProperties) -> Self {
        Self { inner }
    }

    /// Nearest property named `name` visible from this scope
    pub fn find(&self, name: &str) -> Result<Option<PropertyValue>> {
        self.inner.find(name)
    }

    /// Every visible property, nearest scope first
    pub fn iter(&self) -> Result<Vec<(String, PropertyValue)>> {
        self.inner.iter()
    }
}

/// Registration context for `scope` built from what it can currently see
pub(crate) fn registration_context(
    st: &ExecutorState,
    scope: Option<InstanceId>,
) -> Result<RegistrationContext> {
    Ok(RegistrationContext {
        properties: flatten_visible(st, scope)?,
    })
}

fn reader_space(st: &ExecutorState, scope: Option<InstanceId>) -> Result<Option<IdSpaceKey>> {
    match scope {
        None => Ok(st.definition.node(st.definition.root()).id_space()),
        Some(id) => {
            let instance = st.instances.get(id).ok_or(UsageError::InstanceNotExecuting(id.0))?;
            Ok(st.definition.node(instance.node()).id_space())
        }
    }
}

fn chain(st: &ExecutorState, scope: Option<InstanceId>) -> Result<Vec<&PropertyTable>> {
    let mut tables = Vec::new();
    let mut current = scope;
    if let Some(id) = scope {
        if st.instances.get(id).is_none() {
            return Err(UsageError::InstanceNotExecuting(id.0).into());
        }
    }
    while let Some(id) = current {
        match st.instances.get(id) {
            Some(instance) => {
                tables.push(&instance.properties);
                current = instance.parent();
            }
            None => break,
        }
    }
    tables.push(&st.root_properties);
    Ok(tables)
}

fn find_visible(
    st: &ExecutorState,
    scope: Option<InstanceId>,
    name: &str,
) -> Result<Option<PropertyValue>> {
    let reader = reader_space(st, scope)?;
    Ok(chain(st, scope)?
        .into_iter()
        .find_map(|table| table.find(name, reader))
        .cloned())
}

fn flatten_visible(
    st: &ExecutorState,
    scope: Option<InstanceId>,
) -> Result<Vec<(String, PropertyValue)>> {
    let reader = reader_space(st, scope)?;
    let mut seen = HashSet::new();
    let mut flattened = Vec::new();
    for table in chain(st, scope)? {
        for entry in &table.entries {
            if is_visible(entry.visible_in, reader) && seen.insert(entry.name.clone()) {
                flattened.push((entry.name.clone(), entry.value.clone()));
            }
        }
    }
    Ok(flattened)
}

fn table(st: &ExecutorState, scope: Option<InstanceId>) -> Result<&PropertyTable> {
    match scope {
        None => Ok(&st.root_properties),
        Some(id) => st
            .instances
            .get(id)
            .map(|instance| &instance.properties)
            .ok_or_else(|| UsageError::InstanceNotExecuting(id.0).into()),
    }
}

fn table_mut(st: &mut ExecutorState, scope: Option<InstanceId>) -> Result<&mut PropertyTable> {
    match scope {
        None => Ok(&mut st.root_properties),
        Some(id) => st
            .instances
            .get_mut(id)
            .map(|instance| &mut instance.properties)
            .ok_or_else(|| UsageError::InstanceNotExecuting(id.0).into()),
    }
}

fn check_children(
    st: &ExecutorState,
    scope: Option<InstanceId>,
    name: &str,
    value: &PropertyValue,
) -> Result<()> {
    let Some(id) = scope else {
        return Ok(());
    };
    let instance = st.instances.get(id).ok_or(UsageError::InstanceNotExecuting(id.0))?;
    if instance.children().is_empty() {
        return Ok(());
    }

    let exempt = match value {
        PropertyValue::Handle(handle) => st
            .handles
            .get_dyn(*handle)
            .map(|h| h.can_be_removed_with_executing_children())
            .unwrap_or(false),
        _ => false,
    };
    if exempt {
        Ok(())
    } else {
        Err(PropertyError::ChildrenExecuting(name.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_restriction() {
        let mut table = PropertyTable::default();
        table.insert("open".into(), PropertyValue::shared(1u32), None);
        table.insert("scoped".into(), PropertyValue::shared(2u32), Some(IdSpaceKey(0)));

        assert!(table.find("open", Some(IdSpaceKey(5))).is_some());
        assert!(table.find("scoped", Some(IdSpaceKey(0))).is_some());
        assert!(table.find("scoped", Some(IdSpaceKey(1))).is_none());
    }

    #[test]
    fn test_downcast() {
        struct Marker(u8);
        impl RegisteredProperty for Marker {}

        let shared = PropertyValue::shared(String::from("x"));
        assert_eq!(shared.downcast::<String>().unwrap().as_str(), "x");
        assert!(shared.downcast::<u32>().is_none());

        let registered = PropertyValue::registered(Marker(3));
        assert_eq!(registered.downcast::<Marker>().unwrap().0, 3);
        assert_eq!(PropertyValue::handle(HandleId(9)).as_handle(), Some(HandleId(9)));
    }
}
