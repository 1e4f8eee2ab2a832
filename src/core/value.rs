use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use strum::{Display, EnumDiscriminants, EnumString, IntoStaticStr};

use crate::core::{
    LinkError, LinkResult,
    encoding::{decode_timestamp, encode_timestamp},
    errors::DecodeError,
};

/// A typed value as read from or written to the store.
///
/// Scalars live as fields in a record's attribute hash, collections own a native structure
/// each. The discriminant [`ValueType`] decides how a key is laid out and how its value is
/// (de)serialized.
#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(
    vis(pub),
    name(ValueType),
    derive(Hash, PartialOrd, Ord, Display, EnumString, IntoStaticStr),
    strum(serialize_all = "snake_case")
)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    /// Stored as decimal epoch seconds.
    Timestamp(DateTime<Utc>),
    Boolean(bool),
    List(Vec<String>),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
    /// `(score, member)` pairs. Reads return a [`Value::Set`] of the members.
    SortedSet(Vec<(f64, String)>),
}

impl ValueType {
    pub const fn is_collection(&self) -> bool {
        matches!(
            self,
            ValueType::List | ValueType::Set | ValueType::Hash | ValueType::SortedSet
        )
    }

    /// Returns the empty container read for a missing collection key.
    pub(crate) fn empty_container(&self) -> Option<Value> {
        match self {
            ValueType::List => Some(Value::List(Vec::new())),
            ValueType::Set | ValueType::SortedSet => Some(Value::Set(BTreeSet::new())),
            ValueType::Hash => Some(Value::Hash(BTreeMap::new())),
            _ => None,
        }
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        self.into()
    }

    /// Encodes a scalar into its text form. Collections have no scalar form.
    pub fn encode_scalar(&self) -> LinkResult<String> {
        match self {
            Value::String(s) => Ok(s.clone()),
            Value::Integer(i) => Ok(i.to_string()),
            // `Display` for f64 emits the shortest text that parses back to the same bits
            Value::Float(f) => Ok(f.to_string()),
            Value::Timestamp(t) => Ok(encode_timestamp(t)),
            Value::Boolean(b) => Ok(if *b { "true" } else { "false" }.to_owned()),
            other => Err(LinkError::unsupported(format!(
                "{} values have no scalar encoding",
                other.value_type()
            ))),
        }
    }

    /// Decodes the text form of a scalar of the `expected` type.
    pub fn decode_scalar(raw: &str, expected: ValueType) -> Result<Value, DecodeError> {
        match expected {
            ValueType::String => Ok(Value::String(raw.to_owned())),
            ValueType::Integer => Ok(Value::Integer(raw.parse()?)),
            ValueType::Float => Ok(Value::Float(raw.parse()?)),
            ValueType::Timestamp => Ok(Value::Timestamp(decode_timestamp(raw)?)),
            ValueType::Boolean => {
                if raw.eq_ignore_ascii_case("true") {
                    Ok(Value::Boolean(true))
                } else if raw.eq_ignore_ascii_case("false") {
                    Ok(Value::Boolean(false))
                } else {
                    Err(DecodeError::InvalidBoolean(raw.to_owned()))
                }
            }
            collection => Err(DecodeError::NotScalar(collection)),
        }
    }

    /// Flattens a member-like value (single string, list or set) into its members.
    pub(crate) fn into_members(self) -> Option<Vec<String>> {
        match self {
            Value::String(s) => Some(vec![s]),
            Value::List(l) => Some(l),
            Value::Set(s) => Some(s.into_iter().collect()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_set(self) -> Option<BTreeSet<String>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_hash(self) -> Option<BTreeMap<String, String>> {
        match self {
            Value::Hash(h) => Some(h),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<String>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl From<BTreeSet<String>> for Value {
    fn from(s: BTreeSet<String>) -> Self {
        Value::Set(s)
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(h: BTreeMap<String, String>) -> Self {
        Value::Hash(h)
    }
}
