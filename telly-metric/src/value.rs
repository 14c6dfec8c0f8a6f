use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of measurement a [`Metric`](crate::Metric) represents.
///
/// Backends use the value type to pick a storage or encoding strategy. Most inputs produce
/// [`ValueType::Untyped`] metrics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// No type information is available.
    #[default]
    Untyped,
    /// A monotonically increasing value.
    Counter,
    /// A value that can go up and down.
    Gauge,
    /// Precomputed quantiles of a distribution.
    Summary,
    /// Bucketed counts of a distribution.
    Histogram,
}

impl ValueType {
    /// Returns the string representation of this value type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untyped => "untyped",
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Summary => "summary",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The typed value of a metric field.
///
/// Narrower numeric types are widened on conversion, keeping their signedness: `i32` becomes
/// [`FieldValue::Int`], `u16` becomes [`FieldValue::Uint`] and `f32` becomes
/// [`FieldValue::Float`].
#[derive(Clone, Debug, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// A signed 64-bit integer.
    Int(i64),
    /// An unsigned 64-bit integer.
    Uint(u64),
    /// A 64-bit float.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// A string.
    String(String),
}

impl FieldValue {
    /// Returns the value as a float if it is numeric.
    ///
    /// Integers are converted with possible loss of precision, booleans and strings return
    /// `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(v) => Some(v as f64),
            Self::Uint(v) => Some(v as f64),
            Self::Float(v) => Some(v),
            Self::Bool(_) | Self::String(_) => None,
        }
    }

    /// Returns the string slice if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}i"),
            Self::Uint(v) => write!(f, "{v}u"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
        }
    }
}

macro_rules! impl_from {
    ($variant:ident, $target:ty, $($ty:ty),+) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(<$target>::from(value))
                }
            }
        )+
    };
}

impl_from!(Int, i64, i8, i16, i32, i64);
impl_from!(Uint, u64, u8, u16, u32, u64);
impl_from!(Float, f64, f32, f64);
impl_from!(Bool, bool, bool);
impl_from!(String, String, String, &str, Cow<'_, str>);

impl From<isize> for FieldValue {
    fn from(value: isize) -> Self {
        // isize is at most 64 bits wide on all supported platforms.
        Self::Int(value as i64)
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        Self::Uint(value as u64)
    }
}

/// Conversion into a [`FieldValue`] that may reject the input.
///
/// Metric constructors and [`Metric::add_field`](crate::Metric::add_field) accept any type
/// implementing this trait. Values that cannot be represented, such as a `u128` that does not fit
/// into 64 bits or `None`, are rejected and the field is silently not added.
pub trait IntoFieldValue {
    /// Converts `self` into a field value, or `None` if it cannot be represented.
    fn into_field_value(self) -> Option<FieldValue>;
}

macro_rules! impl_into_field_value {
    ($($ty:ty),+) => {
        $(
            impl IntoFieldValue for $ty {
                fn into_field_value(self) -> Option<FieldValue> {
                    Some(FieldValue::from(self))
                }
            }
        )+
    };
}

impl_into_field_value!(
    i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, bool, String, &str,
    Cow<'_, str>
);

impl IntoFieldValue for FieldValue {
    fn into_field_value(self) -> Option<FieldValue> {
        Some(self)
    }
}

impl IntoFieldValue for &FieldValue {
    fn into_field_value(self) -> Option<FieldValue> {
        Some(self.clone())
    }
}

impl IntoFieldValue for i128 {
    fn into_field_value(self) -> Option<FieldValue> {
        i64::try_from(self).ok().map(FieldValue::Int)
    }
}

impl IntoFieldValue for u128 {
    fn into_field_value(self) -> Option<FieldValue> {
        u64::try_from(self).ok().map(FieldValue::Uint)
    }
}

impl<T: IntoFieldValue> IntoFieldValue for Option<T> {
    fn into_field_value(self) -> Option<FieldValue> {
        self.and_then(IntoFieldValue::into_field_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening_keeps_signedness() {
        assert_eq!(FieldValue::from(-3i8), FieldValue::Int(-3));
        assert_eq!(FieldValue::from(7u16), FieldValue::Uint(7));
        assert_eq!(FieldValue::from(1.5f32), FieldValue::Float(1.5));
        assert_eq!(FieldValue::from("x"), FieldValue::String("x".to_owned()));
    }

    #[test]
    fn test_unrepresentable_values_rejected() {
        assert_eq!(u128::MAX.into_field_value(), None);
        assert_eq!(i128::MIN.into_field_value(), None);
        assert_eq!(42u128.into_field_value(), Some(FieldValue::Uint(42)));
        assert_eq!(None::<i32>.into_field_value(), None);
        assert_eq!(Some(true).into_field_value(), Some(FieldValue::Bool(true)));
    }

    #[test]
    fn test_as_f64() {
        assert_eq!(FieldValue::Int(-2).as_f64(), Some(-2.0));
        assert_eq!(FieldValue::Uint(2).as_f64(), Some(2.0));
        assert_eq!(FieldValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_value_type_serde() {
        let ty: ValueType = serde_json::from_str("\"histogram\"").unwrap();
        assert_eq!(ty, ValueType::Histogram);
        assert_eq!(ty.to_string(), "histogram");
    }
}
