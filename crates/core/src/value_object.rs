//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value** - two variance
/// figures with the same quantity, percent and value are the same variance.
/// To "modify" one, construct a new value.
///
/// Requirements:
/// - **Clone**: values are cheap to copy
/// - **PartialEq**: compared by attribute values
/// - **Debug**: debuggable in logs and tests
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
