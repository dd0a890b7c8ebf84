//! Tagged attribute values.
//!
//! Events and catalogues carry an open mapping of string keys to scalar
//! values. The mapping is ordered by key so that serialization is stable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Open attribute mapping attached to events and catalogues.
pub type Attributes = BTreeMap<String, AttrValue>;

/// A scalar attribute value.
///
/// Serialized untagged, so JSON `1` reads back as [`AttrValue::Integer`] and
/// `1.0` as [`AttrValue::Float`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// Discriminant of an [`AttrValue`], used when a schema must agree across rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    Float,
    String,
}

impl AttrValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            AttrValue::Null => ValueKind::Null,
            AttrValue::Bool(_) => ValueKind::Bool,
            AttrValue::Integer(_) => ValueKind::Integer,
            AttrValue::Float(_) => ValueKind::Float,
            AttrValue::String(_) => ValueKind::String,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => Ok(()),
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Integer(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::String(v) => f.write_str(v),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Integer(v.into())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Integer(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Integer(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::String(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::String(v)
    }
}

impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(AttrValue::Null, Into::into)
    }
}

/// First key holding a NaN or infinite float. JSON has no spelling for those.
pub(crate) fn non_finite_key(attributes: &Attributes) -> Option<&str> {
    attributes
        .iter()
        .find(|(_, v)| matches!(v, AttrValue::Float(f) if !f.is_finite()))
        .map(|(k, _)| k.as_str())
}
