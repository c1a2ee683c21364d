//! # Value Type System
//!
//! The universal tagged value used by every layer of the engine: parser
//! terms, compiled rules, stored documents, and query results all share
//! this representation.
//!
//! ## Usage
//!
//! ```rust
//! use verdict::value::Value;
//!
//! let doc = Value::from_json_str(r#"{"user": "alice", "roles": ["admin"]}"#).unwrap();
//! assert_eq!(doc.get_key(&Value::string("user")), Some(&Value::string("alice")));
//! ```
//!
//! Equality is structural everywhere: numbers compare by numeric value
//! (`1.0 == 1`), sets by membership, objects by key/value pairs.

use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Arbitrary-precision decimal number.
///
/// Comparison and hashing follow numeric value, not representation:
/// `1`, `1.0` and `1e0` are the same `Number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Number(BigDecimal);

impl Number {
    pub fn from_i64(n: i64) -> Self {
        Number(BigDecimal::from(n))
    }

    pub fn from_f64(n: f64) -> Option<Self> {
        BigDecimal::from_f64(n).map(Number)
    }

    pub fn as_i64(&self) -> Option<i64> {
        if self.0.is_integer() {
            self.0.to_i64()
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.0.to_f64()
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_i64().and_then(|n| usize::try_from(n).ok())
    }

    pub fn is_integer(&self) -> bool {
        self.0.is_integer()
    }

    pub fn is_zero(&self) -> bool {
        use bigdecimal::Zero;
        self.0.is_zero()
    }

    pub fn checked_add(&self, other: &Number) -> Number {
        Number(&self.0 + &other.0)
    }

    pub fn checked_sub(&self, other: &Number) -> Number {
        Number(&self.0 - &other.0)
    }

    pub fn checked_mul(&self, other: &Number) -> Number {
        Number(&self.0 * &other.0)
    }

    /// Division; `None` when the divisor is zero.
    pub fn checked_div(&self, other: &Number) -> Option<Number> {
        if other.is_zero() {
            None
        } else {
            Some(Number(&self.0 / &other.0))
        }
    }

    /// Integer remainder; `None` for zero divisor or non-integer operands.
    pub fn checked_rem(&self, other: &Number) -> Option<Number> {
        let (a, b) = (self.as_i64()?, other.as_i64()?);
        if b == 0 {
            None
        } else {
            Some(Number::from_i64(a % b))
        }
    }

    pub fn abs(&self) -> Number {
        Number(self.0.abs())
    }

    pub fn round(&self) -> Number {
        Number(self.0.round(0))
    }

    pub fn ceil(&self) -> Number {
        if self.0.is_integer() {
            self.clone()
        } else {
            let down = self.0.with_scale_round(0, bigdecimal::RoundingMode::Floor);
            Number(down + BigDecimal::from(1))
        }
    }

    pub fn floor(&self) -> Number {
        Number(self.0.with_scale_round(0, bigdecimal::RoundingMode::Floor))
    }

    pub fn neg(&self) -> Number {
        Number(-self.0.clone())
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Normalize so 1, 1.0 and 1e0 hash alike.
        self.0.normalized().hash(state);
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalized())
    }
}

impl FromStr for Number {
    type Err = bigdecimal::ParseBigDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigDecimal::from_str(s).map(Number)
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Number::from_i64(n)
    }
}

/// The universal value.
///
/// `Var` and `Ref` only appear in terms during compilation and
/// evaluation; ground documents never contain them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    /// Keys are unique; stored in canonical value order.
    Object(BTreeMap<Value, Value>),
    Set(BTreeSet<Value>),
    /// An identifier bound during evaluation.
    Var(String),
    /// Head variable followed by String/Number/Var/Ref operands.
    Ref(Vec<Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn number(n: i64) -> Value {
        Value::Number(Number::from_i64(n))
    }

    pub fn var(name: impl Into<String>) -> Value {
        Value::Var(name.into())
    }

    /// Build a ref like `data.pkg.rule` from a head var and string operands.
    pub fn ref_from_path(head: &str, path: &[&str]) -> Value {
        let mut parts = vec![Value::var(head)];
        parts.extend(path.iter().map(|s| Value::string(*s)));
        Value::Ref(parts)
    }

    pub fn empty_object() -> Value {
        Value::Object(BTreeMap::new())
    }

    pub fn empty_set() -> Value {
        Value::Set(BTreeSet::new())
    }

    pub fn object_from(pairs: Vec<(Value, Value)>) -> Value {
        Value::Object(pairs.into_iter().collect())
    }

    pub fn set_from(items: Vec<Value>) -> Value {
        Value::Set(items.into_iter().collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Set(_) => "set",
            Value::Var(_) => "var",
            Value::Ref(_) => "ref",
        }
    }

    /// True for values that contain no `Var` or `Ref` anywhere.
    pub fn is_ground(&self) -> bool {
        match self {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
            Value::Array(items) => items.iter().all(Value::is_ground),
            Value::Object(map) => map.iter().all(|(k, v)| k.is_ground() && v.is_ground()),
            Value::Set(items) => items.iter().all(Value::is_ground),
            Value::Var(_) | Value::Ref(_) => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&Number> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Object key lookup.
    pub fn get_key(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Index into an array, object, or set by a ground key value.
    pub fn index(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Array(items) => {
                let idx = key.as_number()?.as_usize()?;
                items.get(idx)
            }
            Value::Object(map) => map.get(key),
            // Indexing a set with a member yields the member itself.
            Value::Set(items) => items.get(key),
            _ => None,
        }
    }

    /// Total order rank used by `Ord`; groups values by variant.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
            Value::Set(_) => 6,
            Value::Var(_) => 7,
            Value::Ref(_) => 8,
        }
    }

    /// Parse a JSON document into a ground value.
    pub fn from_json_str(s: &str) -> Result<Value, serde_json::Error> {
        let json: serde_json::Value = serde_json::from_str(s)?;
        Ok(Value::from_json(&json))
    }

    /// Convert from `serde_json::Value`. Numbers go through their decimal
    /// text form so no precision is lost.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                let parsed =
                    Number::from_str(&n.to_string()).unwrap_or_else(|_| Number::from_i64(0));
                Value::Number(parsed)
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (Value::String(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to `serde_json::Value`. Sets become sorted arrays;
    /// non-string object keys are rendered through their display form.
    /// Returns `None` for terms containing variables or refs.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Number(n) => {
                let text = n.to_string();
                serde_json::Number::from_str(&text)
                    .ok()
                    .map(serde_json::Value::Number)
            }
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Array(items) => {
                let out: Option<Vec<_>> = items.iter().map(Value::to_json).collect();
                Some(serde_json::Value::Array(out?))
            }
            Value::Set(items) => {
                let out: Option<Vec<_>> = items.iter().map(Value::to_json).collect();
                Some(serde_json::Value::Array(out?))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    let key = match k {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out.insert(key, v.to_json()?);
                }
                Some(serde_json::Value::Object(out))
            }
            Value::Var(_) | Value::Ref(_) => None,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => a.iter().cmp(b.iter()),
            (Value::Set(a), Value::Set(b)) => a.iter().cmp(b.iter()),
            (Value::Var(a), Value::Var(b)) => a.cmp(b),
            (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
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
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Set(items) => {
                if items.is_empty() {
                    return write!(f, "set()");
                }
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Value::Var(name) => {
                // Parser-generated wildcards print back as `_`.
                if name.starts_with("$w") {
                    write!(f, "_")
                } else {
                    write!(f, "{name}")
                }
            }
            Value::Ref(parts) => {
                // Refs name documents; print dotted where operands allow.
                let mut first = true;
                for part in parts {
                    match part {
                        Value::Var(name) if first => write!(f, "{name}")?,
                        Value::String(s) if !first && is_ident(s) => write!(f, ".{s}")?,
                        other => {
                            if first {
                                write!(f, "{other}")?;
                            } else {
                                write!(f, "[{other}]")?;
                            }
                        }
                    }
                    first = false;
                }
                Ok(())
            }
        }
    }
}

/// True if `s` prints as a bare identifier in a dotted ref.
fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_equality_ignores_representation() {
        let a: Number = "1.0".parse().unwrap();
        let b: Number = "1".parse().unwrap();
        let c: Number = "1e0".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_number_hash_consistent_with_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Value::Number("2.50".parse().unwrap()));
        assert!(set.contains(&Value::Number("2.5".parse().unwrap())));
    }

    #[test]
    fn test_set_equality_by_membership() {
        let a = Value::set_from(vec![Value::number(1), Value::number(2)]);
        let b = Value::set_from(vec![Value::number(2), Value::number(1), Value::number(2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_object_lookup() {
        let obj = Value::object_from(vec![
            (Value::string("user"), Value::string("alice")),
            (Value::string("age"), Value::number(30)),
        ]);
        assert_eq!(
            obj.get_key(&Value::string("user")),
            Some(&Value::string("alice"))
        );
        assert_eq!(obj.get_key(&Value::string("missing")), None);
    }

    #[test]
    fn test_array_index() {
        let arr = Value::Array(vec![Value::string("a"), Value::string("b")]);
        assert_eq!(arr.index(&Value::number(1)), Some(&Value::string("b")));
        assert_eq!(arr.index(&Value::number(5)), None);
        assert_eq!(arr.index(&Value::string("x")), None);
    }

    #[test]
    fn test_json_round_trip() {
        let text = r#"{"servers":[{"id":"s1","protocols":["http"]}],"count":3}"#;
        let value = Value::from_json_str(text).unwrap();
        let json = value.to_json().unwrap();
        let back = Value::from_json(&json);
        assert_eq!(value, back);
    }

    #[test]
    fn test_display_ref() {
        let r = Value::ref_from_path("data", &["p", "allow"]);
        assert_eq!(r.to_string(), "data.p.allow");
    }

    #[test]
    fn test_cross_type_ordering_is_total() {
        let mut values = vec![
            Value::string("z"),
            Value::Null,
            Value::number(3),
            Value::Bool(true),
        ];
        values.sort();
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[1], Value::Bool(true));
    }

    #[test]
    fn test_arithmetic() {
        let a = Number::from_i64(7);
        let b = Number::from_i64(2);
        assert_eq!(a.checked_add(&b), Number::from_i64(9));
        assert_eq!(a.checked_rem(&b), Some(Number::from_i64(1)));
        assert_eq!(a.checked_div(&Number::from_i64(0)), None);
    }

    #[test]
    fn test_floor_ceil_negative() {
        let n: Number = "-1.5".parse().unwrap();
        assert_eq!(n.floor(), Number::from_i64(-2));
        assert_eq!(n.ceil(), Number::from_i64(-1));
    }

    #[test]
    fn test_is_ground() {
        assert!(Value::number(1).is_ground());
        assert!(!Value::var("x").is_ground());
        assert!(!Value::Array(vec![Value::var("x")]).is_ground());
    }
}
