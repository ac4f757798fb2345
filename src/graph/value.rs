//! Attribute values and symbolic references between resources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute name used when a reference does not name one.
pub const ID_ATTRIBUTE: &str = "id";

/// Desired or recorded attribute mapping of a resource.
///
/// Ordered so that serialization and hashing are deterministic.
pub type Attributes = BTreeMap<String, Value>;

/// An attribute value.
///
/// Comparison is structural: two values are equal when their trees are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// Reference to another resource's output.
    Ref(Reference),
    /// Nested mapping.
    Map(BTreeMap<String, Value>),
}

/// A symbolic reference, written `{"$ref": "<logical id>[.<attribute>]"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    /// Target in `logical_id[.attribute]` form.
    #[serde(rename = "$ref")]
    pub target: String,
}

impl Reference {
    /// Creates a reference to `target`.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Creates a reference to a named output of `logical_id`.
    #[must_use]
    pub fn to_output(logical_id: &str, attribute: &str) -> Self {
        Self::new(format!("{logical_id}.{attribute}"))
    }

    /// Logical id of the referenced resource.
    #[must_use]
    pub fn resource(&self) -> &str {
        self.target
            .split_once('.')
            .map_or(self.target.as_str(), |(id, _)| id)
    }

    /// Referenced attribute; `id` (the physical id) when omitted.
    #[must_use]
    pub fn attribute(&self) -> &str {
        self.target
            .split_once('.')
            .map_or(ID_ATTRIBUTE, |(_, attr)| attr)
    }

    /// Returns true if the reference resolves to the physical id.
    #[must_use]
    pub fn is_physical_id(&self) -> bool {
        self.attribute() == ID_ATTRIBUTE
    }
}

impl Value {
    /// Collects every reference contained in this value, depth first.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::String(_) => {}
        }
    }

    /// Returns every reference contained in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    /// Returns true if any reference is contained in this value.
    #[must_use]
    pub fn contains_reference(&self) -> bool {
        match self {
            Self::Ref(_) => true,
            Self::List(items) => items.iter().any(Self::contains_reference),
            Self::Map(entries) => entries.values().any(Self::contains_reference),
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::String(_) => false,
        }
    }

    /// Replaces every reference with the value returned by `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` could not resolve.
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<Self, Reference>
    where
        F: Fn(&Reference) -> Option<Self>,
    {
        match self {
            Self::Ref(reference) => lookup(reference).ok_or_else(|| reference.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::List),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|v| (k.clone(), v)))
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
            other => Ok(other.clone()),
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Collects the references of every attribute in `attributes`.
#[must_use]
pub fn attribute_references(attributes: &Attributes) -> Vec<&Reference> {
    let mut out = Vec::new();
    for value in attributes.values() {
        value.collect_references(&mut out);
    }
    out
}

/// Resolves every reference in `attributes`.
///
/// # Errors
///
/// Returns the first reference `lookup` could not resolve.
pub fn resolve_attributes<F>(
    attributes: &Attributes,
    lookup: &F,
) -> std::result::Result<Attributes, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    attributes
        .iter()
        .map(|(k, v)| v.resolve(lookup).map(|v| (k.clone(), v)))
        .collect()
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Reference> for Value {
    fn from(value: Reference) -> Self {
        Self::Ref(value)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}}}", self.target)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Ref(r) => write!(f, "{r}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parts() {
        let bare = Reference::new("net");
        assert_eq!(bare.resource(), "net");
        assert_eq!(bare.attribute(), "id");
        assert!(bare.is_physical_id());

        let output = Reference::new("app/bucket.arn");
        assert_eq!(output.resource(), "app/bucket");
        assert_eq!(output.attribute(), "arn");
    }

    #[test]
    fn test_deserialize_reference_and_map() {
        let value: Value = serde_yaml::from_str("{ $ref: sg.id }").expect("parse ref");
        assert_eq!(value, Value::Ref(Reference::new("sg.id")));

        let map: Value =
            serde_yaml::from_str("{ $ref: sg.id, extra: 1 }").expect("parse map");
        assert!(matches!(map, Value::Map(_)));

        let null: Value = serde_yaml::from_str("~").expect("parse null");
        assert_eq!(null, Value::Null);
    }

    #[test]
    fn test_structural_equality() {
        let a: Value = serde_json::from_str(r#"{"ports": [80, 443], "name": "web"}"#)
            .expect("parse a");
        let b: Value = serde_json::from_str(r#"{"name": "web", "ports": [80, 443]}"#)
            .expect("parse b");
        assert_eq!(a, b);
    }

    #[test]
    fn test_resolve_nested_references() {
        let value: Value = serde_json::from_str(
            r#"{"subnets": [{"$ref": "net"}], "role": {"$ref": "role.arn"}}"#,
        )
        .expect("parse");

        assert_eq!(value.references().len(), 2);

        let resolved = value
            .resolve(&|r: &Reference| Some(Value::from(format!("resolved-{}", r.target))))
            .expect("resolve");
        assert!(!resolved.contains_reference());

        let missing = value.resolve(&|_: &Reference| None);
        assert_eq!(missing, Err(Reference::new("role.arn")));
    }
}
