//! Locations and location references
//!
//! A [`LocationReference`] is the identity of a declared variable or
//! argument. Each activity instance's environment holds one [`Location`]
//! cell per declared reference. Cells are shared (`Arc`) so argument
//! bindings can alias a cell declared further up the tree.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::definition::NodeKey;
use super::error::{LocationError, LocationResult};
use super::handle::{Handle, HandleId};
use super::value::{DynValue, Value, ValueType, boxed, convert, unbox};

static REFERENCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A typed, shared, mutable value cell
pub trait Location: Send + Sync + fmt::Debug {
    /// Declared type of the cell
    fn value_type(&self) -> ValueType;

    /// Read the current value as a boxed value of the cell type
    fn get_dyn(&self) -> DynValue;

    /// Write a boxed value, converting it to the cell type if needed
    fn set_dyn(&self, value: DynValue) -> LocationResult<()>;

    /// Borrow as `Any` for typed fast paths
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a location cell
pub type SharedLocation = Arc<dyn Location>;

/// Plain storage cell holding a `T`
pub struct ValueLocation<T: Value> {
    value: RwLock<T>,
}

impl<T: Value> ValueLocation<T> {
    /// Create a cell holding `value`
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    /// Create a shared cell holding `value`
    pub fn shared(value: T) -> SharedLocation {
        Arc::new(Self::new(value))
    }

    /// Current value
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value
    pub fn set(&self, value: T) {
        *self.value.write() = value;
    }
}

impl<T: Value> Location for ValueLocation<T> {
    fn value_type(&self) -> ValueType {
        ValueType::of::<T>()
    }

    fn get_dyn(&self) -> DynValue {
        boxed(self.get())
    }

    fn set_dyn(&self, value: DynValue) -> LocationResult<()> {
        self.set(unbox::<T>(value)?);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: Value> fmt::Debug for ValueLocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueLocation")
            .field("value", &*self.value.read())
            .finish()
    }
}

/// Alias of another location
///
/// Writes always reach the inner location. With buffered gets enabled,
/// reads return the last value written through this alias (seeded from the
/// inner location on creation) instead of reading through.
pub struct ReferenceLocation {
    inner: SharedLocation,
    buffer_gets: bool,
    buffer: RwLock<Option<DynValue>>,
}

impl ReferenceLocation {
    /// Alias `inner`
    pub fn new(inner: SharedLocation, buffer_gets: bool) -> Self {
        let buffer = if buffer_gets {
            Some(inner.get_dyn())
        } else {
            None
        };
        Self {
            inner,
            buffer_gets,
            buffer: RwLock::new(buffer),
        }
    }

    /// Alias `inner` behind a shared pointer
    pub fn shared(inner: SharedLocation, buffer_gets: bool) -> SharedLocation {
        Arc::new(Self::new(inner, buffer_gets))
    }

    /// Whether reads come from the buffer
    pub fn buffers_gets(&self) -> bool {
        self.buffer_gets
    }

    /// The aliased location
    pub fn inner(&self) -> &SharedLocation {
        &self.inner
    }
}

impl Location for ReferenceLocation {
    fn value_type(&self) -> ValueType {
        self.inner.value_type()
    }

    fn get_dyn(&self) -> DynValue {
        if self.buffer_gets {
            if let Some(value) = self.buffer.read().as_ref() {
                return value.clone();
            }
        }
        self.inner.get_dyn()
    }

    fn set_dyn(&self, value: DynValue) -> LocationResult<()> {
        let value = convert(value, self.inner.value_type())?;
        if self.buffer_gets {
            self.inner.set_dyn(value.clone())?;
            *self.buffer.write() = Some(value);
            Ok(())
        } else {
            self.inner.set_dyn(value)
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ReferenceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceLocation")
            .field("inner", &self.inner)
            .field("buffer_gets", &self.buffer_gets)
            .finish()
    }
}

/// Read a location as `T`
///
/// Exact-type cells are read directly; anything else goes through the boxed
/// conversion path.
pub fn read_as<T: Value>(location: &dyn Location) -> LocationResult<T> {
    if let Some(cell) = location.as_any().downcast_ref::<ValueLocation<T>>() {
        return Ok(cell.get());
    }
    unbox::<T>(location.get_dyn())
}

/// Write a `T` into a location
pub fn write_as<T: Value>(location: &dyn Location, value: T) -> LocationResult<()> {
    if let Some(cell) = location.as_any().downcast_ref::<ValueLocation<T>>() {
        cell.set(value);
        return Ok(());
    }
    location.set_dyn(boxed(value))
}

/// Who may resolve a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    /// Any lookup along the environment chain
    Public,
    /// Only lookups made through an [`InlinedLocationReference`]
    Inlined,
}

/// Direction of data flow for an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentDirection {
    /// Value flows into the activity
    In,
    /// Value flows out of the activity
    Out,
    /// Value flows both ways
    InOut,
}

/// Permitted or requested access to a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessDirection {
    /// Reads only
    Read,
    /// Writes only
    Write,
    /// Reads and writes
    ReadWrite,
}

impl AccessDirection {
    /// Whether a location allowing `self` accepts a `requested` access
    pub fn permits(self, requested: AccessDirection) -> bool {
        self == AccessDirection::ReadWrite || self == requested
    }
}

type CellFactory = Arc<dyn Fn() -> SharedLocation + Send + Sync>;

#[derive(Clone)]
struct ReferenceInfo {
    id: u64,
    name: Option<String>,
    value_type: ValueType,
    handle_kind: Option<ValueType>,
    visibility: Visibility,
    factory: CellFactory,
}

/// Identity of a declared variable or argument
#[derive(Clone)]
pub struct LocationReference {
    info: Arc<ReferenceInfo>,
}

impl LocationReference {
    /// Declare a named reference whose cells start at `T::default()`
    pub fn new<T: Value>(name: impl Into<String>) -> Self {
        Self::with_default(name, T::default())
    }

    /// Declare a named reference whose cells start at `initial`
    pub fn with_default<T: Value>(name: impl Into<String>, initial: T) -> Self {
        Self::build::<T>(Some(name.into()), initial, None)
    }

    /// Declare an unnamed reference, resolved by identity only
    pub fn unnamed<T: Value>() -> Self {
        Self::build::<T>(None, T::default(), None)
    }

    /// Declare a variable holding a lazily constructed handle of type `H`
    pub fn handle<H: Handle>(name: impl Into<String>) -> Self {
        Self::build::<Option<HandleId>>(Some(name.into()), None, Some(ValueType::of::<H>()))
    }

    fn build<T: Value>(name: Option<String>, initial: T, handle_kind: Option<ValueType>) -> Self {
        let factory: CellFactory = Arc::new(move || ValueLocation::shared(initial.clone()));
        Self {
            info: Arc::new(ReferenceInfo {
                id: REFERENCE_COUNTER.fetch_add(1, Ordering::Relaxed),
                name,
                value_type: ValueType::of::<T>(),
                handle_kind,
                visibility: Visibility::Public,
                factory,
            }),
        }
    }

    /// Restrict resolution of this declaration to inlined references
    pub fn inlined_only(self) -> Self {
        let mut info = (*self.info).clone();
        info.visibility = Visibility::Inlined;
        Self {
            info: Arc::new(info),
        }
    }

    /// Unique identity
    pub fn id(&self) -> u64 {
        self.info.id
    }

    /// Declared name, if any
    pub fn name(&self) -> Option<&str> {
        self.info.name.as_deref()
    }

    /// Name for diagnostics
    pub fn display_name(&self) -> String {
        match &self.info.name {
            Some(name) => name.clone(),
            None => format!("#{}", self.info.id),
        }
    }

    /// Cell type
    pub fn value_type(&self) -> ValueType {
        self.info.value_type
    }

    /// Handle type for handle variables
    pub fn handle_kind(&self) -> Option<ValueType> {
        self.info.handle_kind
    }

    /// Resolution visibility
    pub fn visibility(&self) -> Visibility {
        self.info.visibility
    }

    /// Create a fresh cell with the declared initial value
    pub fn create_location(&self) -> SharedLocation {
        (self.info.factory)()
    }
}

impl PartialEq for LocationReference {
    fn eq(&self, other: &Self) -> bool {
        self.info.id == other.info.id
    }
}

impl Eq for LocationReference {}

impl Hash for LocationReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.info.id.hash(state);
    }
}

impl fmt::Debug for LocationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationReference")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("type", &self.info.value_type)
            .finish()
    }
}

/// Reference usable only by one accessor node, in one direction
#[derive(Debug, Clone)]
pub struct InlinedLocationReference {
    reference: LocationReference,
    allowed: AccessDirection,
    valid_accessor: NodeKey,
}

impl InlinedLocationReference {
    /// Wrap `reference` for use by `valid_accessor`
    pub fn new(
        reference: LocationReference,
        allowed: AccessDirection,
        valid_accessor: NodeKey,
    ) -> Self {
        Self {
            reference,
            allowed,
            valid_accessor,
        }
    }

    /// Wrapped reference
    pub fn reference(&self) -> &LocationReference {
        &self.reference
    }

    /// Permitted direction
    pub fn allowed(&self) -> AccessDirection {
        self.allowed
    }

    /// Only node allowed to use this reference
    pub fn valid_accessor(&self) -> NodeKey {
        self.valid_accessor
    }

    /// Reject the access unless `accessor` and `requested` are permitted
    pub fn check_access(
        &self,
        accessor: NodeKey,
        requested: AccessDirection,
    ) -> LocationResult<()> {
        if accessor != self.valid_accessor {
            return Err(LocationError::AccessViolation {
                reference: self.reference.display_name(),
                detail: format!(
                    "node {} is not the valid accessor (node {})",
                    accessor.0, self.valid_accessor.0
                ),
            });
        }

        if !self.allowed.permits(requested) {
            return Err(LocationError::AccessViolation {
                reference: self.reference.display_name(),
                detail: format!("{:?} access on a {:?} reference", requested, self.allowed),
            });
        }

        Ok(())
    }
}
