//! Dynamic attribute value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The value of one attribute in a row.
///
/// Rows hold scalars and blobs. `Array` exists for relationship columns,
/// which store the primary keys of their destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque blob.
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Ordered list of values.
    Array(Vec<Value>),
}

impl Value {
    /// Orders two values for sorting and range comparison.
    ///
    /// Values of different families order by family:
    /// `Null < Bool < numbers < Timestamp < Text < Bytes < Array`.
    /// Integers and floats compare numerically with each other; floats use
    /// IEEE total ordering so the result is always defined.
    #[must_use]
    pub fn cmp_total(&self, other: &Self) -> Ordering {
        let (ra, rb) = (self.family_rank(), other.family_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp_total(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    fn family_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
            Value::Array(_) => 6,
        }
    }

    /// Returns a short name of the variant, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
        }
    }

    /// Rough heap footprint in bytes, used for cache accounting.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Text(s) => inline + s.len(),
            Value::Bytes(b) => inline + b.len(),
            Value::Array(items) => inline + items.iter().map(Value::approx_size).sum::<usize>(),
            _ => inline,
        }
    }

    /// Checks if this value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Gets this value as a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Gets this value as an integer.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Gets this value as a float, widening integers.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Gets this value as text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Gets this value as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Gets this value as a timestamp in milliseconds.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Gets this value as an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(t) => write!(f, "@{t}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_order_before_content() {
        let mut values = vec![
            Value::Text("a".into()),
            Value::Integer(7),
            Value::Null,
            Value::Bool(false),
            Value::Bytes(vec![0]),
        ];
        values.sort_by(Value::cmp_total);
        assert_eq!(
            values.iter().map(Value::type_name).collect::<Vec<_>>(),
            vec!["null", "bool", "integer", "text", "bytes"]
        );
    }

    #[test]
    fn integers_and_floats_compare_numerically() {
        assert_eq!(
            Value::Integer(2).cmp_total(&Value::Float(2.5)),
            Ordering::Less
        );
        assert_eq!(
            Value::Float(3.0).cmp_total(&Value::Integer(3)),
            Ordering::Equal
        );
        assert_eq!(
            Value::Float(f64::NAN).cmp_total(&Value::Float(f64::NAN)),
            Ordering::Equal
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_by_length() {
        let short = Value::Array(vec![Value::Integer(1)]);
        let long = Value::Array(vec![Value::Integer(1), Value::Integer(0)]);
        let bigger = Value::Array(vec![Value::Integer(2)]);
        assert_eq!(short.cmp_total(&long), Ordering::Less);
        assert_eq!(long.cmp_total(&bigger), Ordering::Less);
    }

    #[test]
    fn option_conversion_maps_none_to_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn accessors_are_strict_except_float() {
        assert_eq!(Value::Integer(4).as_float(), Some(4.0));
        assert_eq!(Value::Float(4.0).as_integer(), None);
        assert_eq!(Value::Timestamp(9).as_timestamp(), Some(9));
        assert_eq!(Value::Text("t".into()).as_bytes(), None);
    }

    #[test]
    fn approx_size_counts_heap_payload() {
        let small = Value::Integer(1).approx_size();
        let text = Value::Text("x".repeat(100)).approx_size();
        assert_eq!(text, small + 100);
    }
}
