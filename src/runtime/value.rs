//! Dynamically typed values stored in locations
//!
//! Locations are typed cells, but the environment stores them behind trait
//! objects. Values cross that boundary as [`DynValue`], a cloneable boxed
//! `Any`. When a caller asks for a type other than the cell's own, the
//! implicit conversion table below is consulted before failing.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

use super::error::{LocationError, LocationResult};

/// Types that can live in a location
pub trait Value: Any + Clone + Default + Send + Sync + fmt::Debug {}

impl<T> Value for T where T: Any + Clone + Default + Send + Sync + fmt::Debug {}

/// Runtime description of a value type
#[derive(Clone, Copy)]
pub struct ValueType {
    id: TypeId,
    name: &'static str,
}

impl ValueType {
    /// Describe `T`
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Type id
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Type name, for diagnostics only
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether values of `self` can be stored in a cell of type `target`
    pub fn is_assignable_to(&self, target: &ValueType) -> bool {
        self.id == target.id || CONVERSIONS.contains_key(&(self.id, target.id))
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ValueType {}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Object-safe view of a [`Value`]
pub trait AnyValue: Any + Send + Sync + fmt::Debug {
    /// Clone into a new box
    fn clone_value(&self) -> DynValue;
    /// Describe the concrete type
    fn value_type(&self) -> ValueType;
    /// Borrow as `Any`
    fn as_any(&self) -> &dyn Any;
    /// Convert into a boxed `Any` for downcasting by value
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Value> AnyValue for T {
    fn clone_value(&self) -> DynValue {
        Box::new(self.clone())
    }

    fn value_type(&self) -> ValueType {
        ValueType::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// Boxed value of any location type
pub type DynValue = Box<dyn AnyValue>;

impl Clone for DynValue {
    fn clone(&self) -> Self {
        self.as_ref().clone_value()
    }
}

/// Box a concrete value
pub fn boxed<T: Value>(value: T) -> DynValue {
    Box::new(value)
}

/// Extract `T` from a boxed value, converting if an implicit conversion exists
pub fn unbox<T: Value>(value: DynValue) -> LocationResult<T> {
    let target = ValueType::of::<T>();
    let source = value.as_ref().value_type();
    let value = if source == target {
        value
    } else {
        convert(value, target)?
    };

    value
        .into_any()
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| LocationError::TypeMismatch {
            expected: target.name(),
            found: source.name(),
        })
}

/// Convert a boxed value to `target`, or fail with a type mismatch
pub fn convert(value: DynValue, target: ValueType) -> LocationResult<DynValue> {
    let source = value.as_ref().value_type();
    if source == target {
        return Ok(value);
    }

    match CONVERSIONS.get(&(source.id(), target.id())) {
        Some(conversion) => Ok(conversion(value)),
        None => Err(LocationError::TypeMismatch {
            expected: target.name(),
            found: source.name(),
        }),
    }
}

type Conversion = fn(DynValue) -> DynValue;

macro_rules! widen {
    ($table:ident, $from:ty => $($to:ty),+) => {
        $(
            $table.insert(
                (TypeId::of::<$from>(), TypeId::of::<$to>()),
                (|value: DynValue| -> DynValue {
                    let inner = value
                        .as_ref()
                        .as_any()
                        .downcast_ref::<$from>()
                        .copied()
                        .unwrap_or_default();
                    Box::new(<$to>::from(inner))
                }) as Conversion,
            );
        )+
    };
}

static CONVERSIONS: Lazy<HashMap<(TypeId, TypeId), Conversion>> = Lazy::new(|| {
    let mut table: HashMap<(TypeId, TypeId), Conversion> = HashMap::new();

    widen!(table, i8 => i16, i32, i64, f32, f64);
    widen!(table, i16 => i32, i64, f32, f64);
    widen!(table, i32 => i64, f64);
    widen!(table, u8 => u16, u32, u64, i16, i32, i64, f32, f64);
    widen!(table, u16 => u32, u64, i32, i64, f32, f64);
    widen!(table, u32 => u64, i64, f64);
    widen!(table, f32 => f64);

    table.insert(
        (TypeId::of::<&'static str>(), TypeId::of::<String>()),
        |value| {
            let text = value
                .as_ref()
                .as_any()
                .downcast_ref::<&'static str>()
                .map(|s| s.to_string())
                .unwrap_or_default();
            Box::new(text)
        },
    );
    table.insert((TypeId::of::<char>(), TypeId::of::<String>()), |value| {
        let text = value
            .as_ref()
            .as_any()
            .downcast_ref::<char>()
            .map(|c| c.to_string())
            .unwrap_or_default();
        Box::new(text)
    });

    table
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbox_exact_type() {
        let value = boxed(42i32);
        assert_eq!(unbox::<i32>(value).unwrap(), 42);
    }

    #[test]
    fn test_numeric_widening() {
        assert_eq!(unbox::<i64>(boxed(7i32)).unwrap(), 7i64);
        assert_eq!(unbox::<f64>(boxed(1.5f32)).unwrap(), 1.5f64);
        assert_eq!(unbox::<u64>(boxed(9u8)).unwrap(), 9u64);
    }

    #[test]
    fn test_narrowing_is_rejected() {
        let err = unbox::<i32>(boxed(7i64)).unwrap_err();
        assert!(matches!(err, LocationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_string_conversions() {
        let text: &'static str = "hello";
        assert_eq!(unbox::<String>(boxed(text)).unwrap(), "hello");
        assert_eq!(unbox::<String>(boxed('x')).unwrap(), "x");
    }

    #[test]
    fn test_assignability() {
        assert!(ValueType::of::<i32>().is_assignable_to(&ValueType::of::<i64>()));
        assert!(!ValueType::of::<String>().is_assignable_to(&ValueType::of::<i64>()));
    }

    #[test]
    fn test_dyn_value_clone() {
        let value = boxed(String::from("copy"));
        let copy = value.clone();
        assert_eq!(unbox::<String>(copy).unwrap(), "copy");
        assert_eq!(unbox::<String>(value).unwrap(), "copy");
    }
}
