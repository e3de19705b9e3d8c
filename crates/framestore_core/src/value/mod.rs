//! Dynamically typed values stored in arrays.
pub mod encoding;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use framestore_error::{FrameStoreError, Result};
use serde::{Deserialize, Serialize};

/// Type tag for a value, and the declared type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Undefined,
    Integer,
    Float,
    String,
    Vector,
    List,
    Dict,
    DateTime,
    Image,
}

impl ValueType {
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Undefined => 0,
            Self::Integer => 1,
            Self::Float => 2,
            Self::String => 3,
            Self::Vector => 4,
            Self::List => 5,
            Self::Dict => 6,
            Self::DateTime => 7,
            Self::Image => 8,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Undefined,
            1 => Self::Integer,
            2 => Self::Float,
            3 => Self::String,
            4 => Self::Vector,
            5 => Self::List,
            6 => Self::Dict,
            7 => Self::DateTime,
            8 => Self::Image,
            _ => return None,
        })
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Whether blocks of this type carry min/max skip metadata.
    pub const fn has_block_stats(&self) -> bool {
        matches!(self, Self::Integer | Self::Float | Self::String)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undefined => "undefined",
            Self::Integer => "int",
            Self::Float => "float",
            Self::String => "str",
            Self::Vector => "vector",
            Self::List => "list",
            Self::Dict => "dict",
            Self::DateTime => "datetime",
            Self::Image => "image",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ImageFormat {
    Raw = 0,
    Png = 1,
    Jpeg = 2,
}

impl ImageFormat {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Raw),
            1 => Some(Self::Png),
            2 => Some(Self::Jpeg),
            _ => None,
        }
    }
}

/// An image value. Pixel data is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub format: ImageFormat,
    pub data: Bytes,
}

/// A single dynamically typed value.
///
/// Values have a total order so they can be used directly as sort and join
/// keys. `Undefined` sorts before everything else, integers and floats
/// compare numerically with each other, and all other types compare by type
/// tag first.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Integer(i64),
    Float(f64),
    String(String),
    Vector(Vec<f64>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    DateTime(DateTime<FixedOffset>),
    Image(Image),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Undefined => ValueType::Undefined,
            Self::Integer(_) => ValueType::Integer,
            Self::Float(_) => ValueType::Float,
            Self::String(_) => ValueType::String,
            Self::Vector(_) => ValueType::Vector,
            Self::List(_) => ValueType::List,
            Self::Dict(_) => ValueType::Dict,
            Self::DateTime(_) => ValueType::DateTime,
            Self::Image(_) => ValueType::Image,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Truthiness used by logical filters and ternary conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined => false,
            Self::Integer(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::String(v) => !v.is_empty(),
            Self::Vector(v) => !v.is_empty(),
            Self::List(v) => !v.is_empty(),
            Self::Dict(v) => !v.is_empty(),
            Self::DateTime(_) | Self::Image(_) => true,
        }
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            Self::Integer(v) => Ok(*v),
            other => Err(FrameStoreError::type_mismatch(format!(
                "expected int, got {}",
                other.value_type()
            ))),
        }
    }

    pub fn try_as_f64(&self) -> Result<f64> {
        match self {
            Self::Integer(v) => Ok(*v as f64),
            Self::Float(v) => Ok(*v),
            other => Err(FrameStoreError::type_mismatch(format!(
                "expected float, got {}",
                other.value_type()
            ))),
        }
    }

    pub fn try_as_str(&self) -> Result<&str> {
        match self {
            Self::String(v) => Ok(v),
            other => Err(FrameStoreError::type_mismatch(format!(
                "expected str, got {}",
                other.value_type()
            ))),
        }
    }

    /// Convert this value so it can be stored in an array of type `ty`.
    ///
    /// Undefined is accepted by every type, integers widen to floats.
    pub fn coerce_to(self, ty: ValueType) -> Result<Value> {
        match (self, ty) {
            (Self::Undefined, _) => Ok(Self::Undefined),
            (Self::Integer(v), ValueType::Float) => Ok(Self::Float(v as f64)),
            (v, ty) if v.value_type() == ty => Ok(v),
            (v, ty) => Err(FrameStoreError::type_mismatch(format!(
                "cannot store {} value in {ty} array",
                v.value_type()
            ))),
        }
    }

    /// Rough estimate of the number of bytes this value takes in memory.
    pub fn estimated_size(&self) -> usize {
        const BASE: usize = std::mem::size_of::<Value>();
        BASE + match self {
            Self::Undefined | Self::Integer(_) | Self::Float(_) | Self::DateTime(_) => 0,
            Self::String(s) => s.len(),
            Self::Vector(v) => v.len() * 8,
            Self::List(v) => v.iter().map(|v| v.estimated_size()).sum(),
            Self::Dict(v) => v
                .iter()
                .map(|(k, v)| k.estimated_size() + v.estimated_size())
                .sum(),
            Self::Image(img) => img.data.len(),
        }
    }

    /// Rank of the value's type in the total order.
    fn order_rank(&self) -> u8 {
        match self {
            Self::Undefined => 0,
            Self::Integer(_) | Self::Float(_) => 1,
            Self::String(_) => 2,
            Self::Vector(_) => 3,
            Self::List(_) => 4,
            Self::Dict(_) => 5,
            Self::DateTime(_) => 6,
            Self::Image(_) => 7,
        }
    }

    /// Total order over all values.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Undefined, Self::Undefined) => Ordering::Equal,
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => cmp_f64(*a, *b),
            (Self::Integer(a), Self::Float(b)) => cmp_i64_f64(*a, *b),
            (Self::Float(a), Self::Integer(b)) => cmp_i64_f64(*b, *a).reverse(),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Vector(a), Self::Vector(b)) => {
                for (a, b) in a.iter().zip(b.iter()) {
                    match cmp_f64(*a, *b) {
                        Ordering::Equal => (),
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Dict(a), Self::Dict(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            (Self::Image(a), Self::Image(b)) => a.cmp(b),
            (a, b) => a.order_rank().cmp(&b.order_rank()),
        }
    }
}

/// Compares floats so that 0.0 and -0.0 are equal, and NaN sorts last.
fn cmp_f64(a: f64, b: f64) -> Ordering {
    match a.partial_cmp(&b) {
        Some(ord) => ord,
        None => a.is_nan().cmp(&b.is_nan()),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

/// Exact comparison of an integer and a float, without rounding the integer.
fn cmp_i64_f64(i: i64, f: f64) -> Ordering {
    // 2^63, the first float past i64::MAX.
    const UPPER: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() || f >= UPPER {
        return Ordering::Less;
    }
    if f < i64::MIN as f64 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => cmp_f64(whole, f),
        ord => ord,
    }
}

/// Hash a float consistently with `cmp_f64` equality.
fn hash_f64<H: Hasher>(v: f64, state: &mut H) {
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        // Integral floats hash like the equal integer.
        (v as i64).hash(state);
    } else if v.is_nan() {
        u64::MAX.hash(state);
    } else {
        v.to_bits().hash(state);
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.order_rank().hash(state);
        match self {
            Self::Undefined => (),
            Self::Integer(v) => v.hash(state),
            Self::Float(v) => hash_f64(*v, state),
            Self::String(v) => v.hash(state),
            Self::Vector(v) => {
                v.len().hash(state);
                for f in v {
                    hash_f64(*f, state);
                }
            }
            Self::List(v) => v.hash(state),
            Self::Dict(v) => v.hash(state),
            Self::DateTime(v) => v.hash(state),
            Self::Image(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "None"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::Vector(v) => {
                write!(f, "[")?;
                for (idx, x) in v.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
            Self::List(v) => {
                write!(f, "[")?;
                for (idx, x) in v.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
            Self::Dict(v) => {
                write!(f, "{{")?;
                for (idx, (k, x)) in v.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {x}")?;
                }
                write!(f, "}}")
            }
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Image(img) => write!(
                f,
                "Image(height: {}, width: {}, channels: {})",
                img.height, img.width, img.channels
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Undefined,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn numeric_cross_type_ordering() {
        assert_eq!(Ordering::Less, Value::Integer(1).cmp(&Value::Float(1.5)));
        assert_eq!(Value::Integer(2), Value::Float(2.0));
        assert_eq!(hash_of(&Value::Integer(2)), hash_of(&Value::Float(2.0)));
    }

    #[test]
    fn integer_float_comparison_is_exact() {
        let big = 1_i64 << 53;
        let a = Value::Integer(big + 1);
        let b = Value::Float(big as f64);
        let c = Value::Integer(big);
        assert_eq!(Ordering::Greater, a.cmp(&b));
        assert_eq!(Ordering::Equal, b.cmp(&c));
        assert_eq!(Ordering::Greater, a.cmp(&c));

        assert_eq!(Ordering::Less, Value::Integer(i64::MAX).cmp(&Value::Float(i64::MAX as f64)));
        assert_eq!(Value::Integer(i64::MIN), Value::Float(i64::MIN as f64));
        assert_eq!(Ordering::Less, Value::Integer(-3).cmp(&Value::Float(-2.5)));
        assert_eq!(Ordering::Greater, Value::Integer(-2).cmp(&Value::Float(-2.5)));
        assert_eq!(Ordering::Less, Value::Integer(i64::MAX).cmp(&Value::Float(f64::NAN)));
        assert_eq!(Ordering::Greater, Value::Integer(i64::MIN).cmp(&Value::Float(f64::NEG_INFINITY)));
        assert_eq!(Value::Integer(0), Value::Float(-0.0));

        let mut vals = vec![a.clone(), b.clone(), c.clone(), Value::Float(big as f64 + 2.0)];
        vals.sort();
        assert_eq!(vec![b, c, a, Value::Float(big as f64 + 2.0)], vals);
    }

    #[test]
    fn undefined_sorts_first() {
        let mut vals = vec![
            Value::from("a"),
            Value::Integer(3),
            Value::Undefined,
            Value::Float(-1.0),
        ];
        vals.sort();
        assert_eq!(
            vec![
                Value::Undefined,
                Value::Float(-1.0),
                Value::Integer(3),
                Value::from("a"),
            ],
            vals
        );
    }

    #[test]
    fn coerce() {
        assert_eq!(
            Value::Float(3.0),
            Value::Integer(3).coerce_to(ValueType::Float).unwrap()
        );
        assert!(Value::Undefined.coerce_to(ValueType::String).is_ok());
        let err = Value::from("x").coerce_to(ValueType::Integer).unwrap_err();
        assert_eq!(framestore_error::ErrorKind::TypeMismatch, err.kind());
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(Value::Integer(-4).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::List(vec![Value::Undefined]).is_truthy());
    }
}
