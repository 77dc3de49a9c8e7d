//! Attribute maps: the local view of an entry's attributes
//!
//! Keys compare case-insensitively but preserve insertion order (deterministic wire order);
//! value lists behave as sets under the bound schema's equality matching rules. `AttrValues::All`
//! is the `DELETE_ALL` sentinel accepted wherever a modification value list is expected; it is
//! never a storable value.

use crate::filter::{Attribute, AttributeValue, PartialAttribute};
use crate::error::Error;
use crate::ldap::{LdapString, SearchResultEntry};
use crate::schema::SchemaRegistry;
use std::borrow::Cow;
use std::sync::Arc;

/// Value list or the "all current values" sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValues {
    Concrete(Vec<Vec<u8>>),
    /// `DELETE_ALL`: stands for every current value of the attribute
    All,
}

impl AttrValues {
    pub fn from_strs(values: &[&str]) -> Self {
        AttrValues::Concrete(values.iter().map(|v| v.as_bytes().to_vec()).collect())
    }

    /// The concrete values, or `InvalidValue` where the sentinel is not acceptable.
    pub fn concrete(self) -> Result<Vec<Vec<u8>>, Error> {
        match self {
            AttrValues::Concrete(values) => Ok(values),
            AttrValues::All => Err(Error::InvalidValue(
                "DELETE_ALL sentinel used where concrete values are required".to_string(),
            )),
        }
    }
}

impl From<Vec<Vec<u8>>> for AttrValues {
    fn from(values: Vec<Vec<u8>>) -> Self {
        AttrValues::Concrete(values)
    }
}

/// Case-insensitive, order-preserving attribute → values mapping.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    entries: Vec<(String, Vec<Vec<u8>>)>,
    schema: Option<Arc<SchemaRegistry>>,
}

impl AttributeMap {
    pub fn new() -> Self {
        AttributeMap::default()
    }

    /// Bind a schema; membership and equality then dispatch through matching rules.
    pub fn with_schema(schema: Arc<SchemaRegistry>) -> Self {
        AttributeMap {
            entries: Vec::new(),
            schema: Some(schema),
        }
    }

    pub fn set_schema(&mut self, schema: Arc<SchemaRegistry>) {
        self.schema = Some(schema);
    }

    pub fn from_entry(entry: &SearchResultEntry<'_>, schema: Option<Arc<SchemaRegistry>>) -> Self {
        let mut map = AttributeMap {
            entries: Vec::new(),
            schema,
        };
        for attr in &entry.attributes {
            for value in &attr.attr_vals {
                map.add_value(&attr.attr_type.0, value.0.to_vec());
            }
        }
        map
    }

    fn position(&self, attr: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(attr))
    }

    fn values_equal(&self, attr: &str, a: &[u8], b: &[u8]) -> bool {
        match &self.schema {
            Some(schema) => schema.values_equal(attr, a, b),
            None => a == b,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_attr(&self, attr: &str) -> bool {
        self.position(attr).is_some()
    }

    pub fn get(&self, attr: &str) -> Option<&[Vec<u8>]> {
        self.position(attr).map(|i| self.entries[i].1.as_slice())
    }

    /// First value as UTF-8, a common convenience for single-valued attributes.
    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.get(attr)
            .and_then(|values| values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains_value(&self, attr: &str, value: &[u8]) -> bool {
        match self.get(attr) {
            Some(values) => values.iter().any(|v| self.values_equal(attr, v, value)),
            None => false,
        }
    }

    /// Insert one value; a value equal to a present one (under the matching rule) is a no-op.
    /// Returns whether the map changed.
    pub fn add_value(&mut self, attr: &str, value: Vec<u8>) -> bool {
        if self.contains_value(attr, &value) {
            return false;
        }
        match self.position(attr) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((attr.to_string(), vec![value])),
        }
        true
    }

    pub fn add_values(&mut self, attr: &str, values: Vec<Vec<u8>>) {
        for value in values {
            self.add_value(attr, value);
        }
    }

    /// Remove one value; removing a value that is not present is a no-op. Removing the last
    /// value removes the attribute. Returns whether the map changed.
    pub fn remove_value(&mut self, attr: &str, value: &[u8]) -> bool {
        let Some(i) = self.position(attr) else {
            return false;
        };
        let values = &mut self.entries[i].1;
        let before = values.len();
        let schema = self.schema.clone();
        values.retain(|v| match &schema {
            Some(schema) => !schema.values_equal(attr, v, value),
            None => v.as_slice() != value,
        });
        let changed = values.len() != before;
        if values.is_empty() {
            self.entries.remove(i);
        }
        changed
    }

    /// Replace the attribute's values wholesale; an empty list removes the attribute.
    pub fn replace(&mut self, attr: &str, values: Vec<Vec<u8>>) {
        let deduped = dedup(values, |a, b| self.values_equal(attr, a, b));
        match self.position(attr) {
            Some(i) if deduped.is_empty() => {
                self.entries.remove(i);
            }
            Some(i) => self.entries[i].1 = deduped,
            None if deduped.is_empty() => {}
            None => self.entries.push((attr.to_string(), deduped)),
        }
    }

    pub fn remove_attr(&mut self, attr: &str) -> bool {
        match self.position(attr) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    /// Wire form for a search result entry or add request.
    pub fn to_partial_attributes(&self) -> Vec<PartialAttribute<'static>> {
        self.entries
            .iter()
            .map(|(key, values)| PartialAttribute {
                attr_type: LdapString(Cow::Owned(key.clone())),
                attr_vals: values
                    .iter()
                    .map(|v| AttributeValue(Cow::Owned(v.clone())))
                    .collect(),
            })
            .collect()
    }

    pub fn to_attributes(&self) -> Vec<Attribute<'static>> {
        self.entries
            .iter()
            .map(|(key, values)| Attribute {
                attr_type: LdapString(Cow::Owned(key.clone())),
                attr_vals: values
                    .iter()
                    .map(|v| AttributeValue(Cow::Owned(v.clone())))
                    .collect(),
            })
            .collect()
    }
}

impl PartialEq for AttributeMap {
    /// Equality by matching rule: same attributes (case-insensitively) with equal value sets,
    /// irrespective of order.
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(attr, values)| {
            match other.get(attr) {
                Some(other_values) => {
                    values.len() == other_values.len()
                        && values
                            .iter()
                            .all(|v| other_values.iter().any(|o| self.values_equal(attr, v, o)))
                }
                None => false,
            }
        })
    }
}

fn dedup(values: Vec<Vec<u8>>, equal: impl Fn(&[u8], &[u8]) -> bool) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = Vec::with_capacity(values.len());
    for value in values {
        if !out.iter().any(|v| equal(v, &value)) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> AttributeMap {
        AttributeMap::with_schema(Arc::new(SchemaRegistry::core()))
    }

    #[test]
    fn test_case_insensitive_keys_preserve_order() {
        let mut m = map();
        m.add_value("description", b"first".to_vec());
        m.add_value("cn", b"foo".to_vec());
        m.add_value("DESCRIPTION", b"second".to_vec());
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["description", "cn"]);
        assert_eq!(m.get("Description").map(<[Vec<u8>]>::len), Some(2));
    }

    #[test]
    fn test_add_equal_value_is_noop() {
        let mut m = map();
        assert!(m.add_value("cn", b"Babs Jensen".to_vec()));
        // equal under caseIgnoreMatch
        assert!(!m.add_value("cn", b"babs  jensen".to_vec()));
        assert_eq!(m.get("cn").map(<[Vec<u8>]>::len), Some(1));
    }

    #[test]
    fn test_remove_value_by_rule() {
        let mut m = map();
        m.add_value("cn", b"Foo".to_vec());
        assert!(m.remove_value("cn", b"foo"));
        assert!(!m.contains_attr("cn"));
        // deleting a non-present value is a no-op
        assert!(!m.remove_value("cn", b"foo"));
    }

    #[test]
    fn test_case_exact_attribute_keeps_both() {
        let mut m = map();
        assert!(m.add_value("memberUid", b"Foo".to_vec()));
        assert!(m.add_value("memberUid", b"foo".to_vec()));
        assert_eq!(m.get("memberUid").map(<[Vec<u8>]>::len), Some(2));
    }

    #[test]
    fn test_replace() {
        let mut m = map();
        m.add_value("description", b"a".to_vec());
        m.replace("description", vec![b"b".to_vec(), b"B ".to_vec()]);
        // the replacement list is itself deduplicated under the rule
        assert_eq!(m.get("description").map(<[Vec<u8>]>::len), Some(1));
        m.replace("description", Vec::new());
        assert!(!m.contains_attr("description"));
    }

    #[test]
    fn test_equality_by_rule() {
        let mut a = map();
        a.add_value("cn", b"Foo Bar".to_vec());
        a.add_value("description", b"x".to_vec());
        let mut b = map();
        b.add_value("description", b"x".to_vec());
        b.add_value("CN", b"foo  bar".to_vec());
        assert_eq!(a, b);
        b.add_value("cn", b"other".to_vec());
        assert_ne!(a, b);
    }

    #[test]
    fn test_sentinel_never_stores() {
        assert!(AttrValues::All.concrete().is_err());
        assert_eq!(
            AttrValues::from_strs(&["a"]).concrete().unwrap(),
            vec![b"a".to_vec()]
        );
    }
}
