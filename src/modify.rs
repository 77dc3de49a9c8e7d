//! The modification planner
//!
//! High-level "add/delete/replace these attributes" requests become a minimal list of atomic
//! modification elements. In the default non-strict mode the planner consults the known entry
//! state (the caller's cached attributes or a prior base-scoped search): adds drop values the
//! entry already holds, deletes drop values it does not, and elements with nothing left are
//! skipped entirely, so the emitted `modifyRequest` never carries a redundant or impossible
//! change. The raw path and strict mode bypass all of that and send exactly what was given.

use crate::attrs::{AttrValues, AttributeMap};
use crate::conn::EmptyListPolicy;
use crate::error::Error;
use crate::filter::{AttributeValue, PartialAttribute};
use crate::ldap::{Change, LdapString, Operation};
use crate::schema::SchemaRegistry;
use std::borrow::Cow;

/// One atomic modification element, pre-wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMod {
    pub op: Operation,
    pub attr: String,
    pub values: AttrValues,
}

impl RawMod {
    pub fn add(attr: &str, values: Vec<Vec<u8>>) -> Self {
        RawMod {
            op: Operation::Add,
            attr: attr.to_string(),
            values: AttrValues::Concrete(values),
        }
    }

    pub fn delete(attr: &str, values: AttrValues) -> Self {
        RawMod {
            op: Operation::Delete,
            attr: attr.to_string(),
            values,
        }
    }

    pub fn replace(attr: &str, values: AttrValues) -> Self {
        RawMod {
            op: Operation::Replace,
            attr: attr.to_string(),
            values,
        }
    }
}

/// A high-level modification request.
#[derive(Debug, Clone)]
pub enum ModifyIntent {
    AddAttrs(Vec<(String, Vec<Vec<u8>>)>),
    DeleteAttrs(Vec<(String, AttrValues)>),
    ReplaceAttrs(Vec<(String, AttrValues)>),
}

impl ModifyIntent {
    /// Attribute names the non-strict planner needs current state for.
    pub fn referenced_attrs(&self) -> Vec<String> {
        match self {
            ModifyIntent::AddAttrs(items) => items.iter().map(|(a, _)| a.clone()).collect(),
            ModifyIntent::DeleteAttrs(items) | ModifyIntent::ReplaceAttrs(items) => {
                items.iter().map(|(a, _)| a.clone()).collect()
            }
        }
    }
}

pub struct Planner<'a> {
    pub schema: &'a SchemaRegistry,
    pub policy: EmptyListPolicy,
}

impl Planner<'_> {
    /// Non-strict planning against the known entry state. `current` is `None` only when the
    /// entry could not be read (then nothing can be deduplicated).
    pub fn plan(
        &self,
        intent: ModifyIntent,
        current: Option<&AttributeMap>,
    ) -> Result<Vec<RawMod>, Error> {
        let mut mods = Vec::new();
        match intent {
            ModifyIntent::AddAttrs(items) => {
                for (attr, values) in items {
                    let values = self.validated(&attr, values)?;
                    let mut surviving: Vec<Vec<u8>> = Vec::new();
                    for value in values {
                        let present = current
                            .map(|c| c.contains_value(&attr, &value))
                            .unwrap_or(false);
                        let duplicate = surviving
                            .iter()
                            .any(|s| self.schema.values_equal(&attr, s, &value));
                        if !present && !duplicate {
                            surviving.push(value);
                        }
                    }
                    if surviving.is_empty() {
                        log::debug!("add to {} fully deduplicated, skipping", attr);
                        continue;
                    }
                    mods.push(RawMod {
                        op: Operation::Add,
                        attr,
                        values: AttrValues::Concrete(surviving),
                    });
                }
            }
            ModifyIntent::DeleteAttrs(items) => {
                for (attr, values) in items {
                    match values {
                        AttrValues::All => mods.push(RawMod {
                            op: Operation::Delete,
                            attr,
                            values: AttrValues::All,
                        }),
                        AttrValues::Concrete(values) => {
                            let surviving: Vec<Vec<u8>> = values
                                .into_iter()
                                .filter(|value| {
                                    current
                                        .map(|c| c.contains_value(&attr, value))
                                        .unwrap_or(true)
                                })
                                .collect();
                            if surviving.is_empty() {
                                log::debug!("delete from {} has no present values, skipping", attr);
                                continue;
                            }
                            mods.push(RawMod {
                                op: Operation::Delete,
                                attr,
                                values: AttrValues::Concrete(surviving),
                            });
                        }
                    }
                }
            }
            ModifyIntent::ReplaceAttrs(items) => {
                for (attr, values) in items {
                    match values {
                        AttrValues::All => mods.push(RawMod {
                            op: Operation::Replace,
                            attr,
                            values: AttrValues::All,
                        }),
                        AttrValues::Concrete(values) => {
                            if values.is_empty() {
                                match self.policy {
                                    EmptyListPolicy::Ignore => continue,
                                    EmptyListPolicy::Warn => {
                                        log::warn!(
                                            "dropping replace of {} with an empty value list \
                                             (would delete all values)",
                                            attr
                                        );
                                        continue;
                                    }
                                    EmptyListPolicy::Error => {
                                        return Err(Error::InvalidValue(format!(
                                            "replace of {} with an empty value list",
                                            attr
                                        )));
                                    }
                                    EmptyListPolicy::Forward => {}
                                }
                            }
                            let values = self.validated(&attr, values)?;
                            mods.push(RawMod {
                                op: Operation::Replace,
                                attr,
                                values: AttrValues::Concrete(values),
                            });
                        }
                    }
                }
            }
        }
        Ok(mods)
    }

    /// Strict planning: no pre-fetch, no deduplication, elements pass through verbatim.
    pub fn plan_strict(&self, intent: ModifyIntent) -> Result<Vec<RawMod>, Error> {
        let mods = match intent {
            ModifyIntent::AddAttrs(items) => items
                .into_iter()
                .map(|(attr, values)| RawMod {
                    op: Operation::Add,
                    attr,
                    values: AttrValues::Concrete(values),
                })
                .collect(),
            ModifyIntent::DeleteAttrs(items) => items
                .into_iter()
                .map(|(attr, values)| RawMod {
                    op: Operation::Delete,
                    attr,
                    values,
                })
                .collect(),
            ModifyIntent::ReplaceAttrs(items) => items
                .into_iter()
                .map(|(attr, values)| RawMod {
                    op: Operation::Replace,
                    attr,
                    values,
                })
                .collect(),
        };
        Ok(mods)
    }

    fn validated(&self, attr: &str, values: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, Error> {
        for value in &values {
            self.schema.validate_value(attr, value)?;
        }
        Ok(values)
    }
}

/// Wire form of a planned modification list.
pub fn to_changes(mods: Vec<RawMod>) -> Vec<Change<'static>> {
    mods.into_iter()
        .map(|m| Change {
            operation: m.op,
            modification: PartialAttribute {
                attr_type: LdapString(Cow::Owned(m.attr)),
                attr_vals: match m.values {
                    AttrValues::Concrete(values) => values
                        .into_iter()
                        .map(|v| AttributeValue(Cow::Owned(v)))
                        .collect(),
                    // the sentinel is an empty value list on the wire
                    AttrValues::All => Vec::new(),
                },
            },
        })
        .collect()
}

/// Mirror an applied modification list into the local attribute map.
pub fn apply(mods: &[RawMod], attrs: &mut AttributeMap) {
    for m in mods {
        match (&m.op, &m.values) {
            (&Operation::Add, AttrValues::Concrete(values)) => {
                attrs.add_values(&m.attr, values.clone());
            }
            (&Operation::Delete, AttrValues::Concrete(values)) => {
                for value in values {
                    attrs.remove_value(&m.attr, value);
                }
            }
            (&Operation::Delete, AttrValues::All) | (&Operation::Replace, AttrValues::All) => {
                attrs.remove_attr(&m.attr);
            }
            (&Operation::Replace, AttrValues::Concrete(values)) => {
                attrs.replace(&m.attr, values.clone());
            }
            _ => log::warn!("not mirroring unknown modify operation {:?}", m.op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use std::sync::Arc;

    fn planner(schema: &SchemaRegistry) -> Planner<'_> {
        Planner {
            schema,
            policy: EmptyListPolicy::Warn,
        }
    }

    fn entry_with(attr: &str, values: &[&str], schema: Arc<SchemaRegistry>) -> AttributeMap {
        let mut map = AttributeMap::with_schema(schema);
        for v in values {
            map.add_value(attr, v.as_bytes().to_vec());
        }
        map
    }

    #[test]
    fn test_add_dedup_against_current() {
        let schema = Arc::new(SchemaRegistry::core());
        let current = entry_with("description", &["a"], schema.clone());
        let intent = ModifyIntent::AddAttrs(vec![(
            "description".to_string(),
            vec![b"a".to_vec(), b"b".to_vec()],
        )]);
        let mods = planner(&schema).plan(intent, Some(&current)).unwrap();
        assert_eq!(
            mods,
            vec![RawMod::add("description", vec![b"b".to_vec()])]
        );
    }

    #[test]
    fn test_add_fully_present_skips_element() {
        let schema = Arc::new(SchemaRegistry::core());
        let current = entry_with("description", &["a", "b"], schema.clone());
        let intent = ModifyIntent::AddAttrs(vec![(
            "description".to_string(),
            // equal under caseIgnoreMatch
            vec![b"A".to_vec(), b"B ".to_vec()],
        )]);
        let mods = planner(&schema).plan(intent, Some(&current)).unwrap();
        assert!(mods.is_empty());
    }

    #[test]
    fn test_delete_drops_missing_values() {
        let schema = Arc::new(SchemaRegistry::core());
        let current = entry_with("description", &["a"], schema.clone());
        let intent = ModifyIntent::DeleteAttrs(vec![(
            "description".to_string(),
            AttrValues::Concrete(vec![b"a".to_vec(), b"nope".to_vec()]),
        )]);
        let mods = planner(&schema).plan(intent, Some(&current)).unwrap();
        assert_eq!(
            mods,
            vec![RawMod::delete(
                "description",
                AttrValues::Concrete(vec![b"a".to_vec()])
            )]
        );
    }

    #[test]
    fn test_delete_all_passes_through() {
        let schema = Arc::new(SchemaRegistry::core());
        let current = entry_with("description", &["a"], schema.clone());
        let intent =
            ModifyIntent::DeleteAttrs(vec![("description".to_string(), AttrValues::All)]);
        let mods = planner(&schema).plan(intent, Some(&current)).unwrap();
        assert_eq!(mods, vec![RawMod::delete("description", AttrValues::All)]);
        // the sentinel serialises as an empty value list
        let changes = to_changes(mods);
        assert!(changes[0].modification.attr_vals.is_empty());
    }

    #[test]
    fn test_empty_replace_policy() {
        let schema = Arc::new(SchemaRegistry::core());
        let empty = ModifyIntent::ReplaceAttrs(vec![(
            "description".to_string(),
            AttrValues::Concrete(Vec::new()),
        )]);

        let mods = planner(&schema).plan(empty.clone(), None).unwrap();
        assert!(mods.is_empty(), "Warn drops the element");

        let strict_policy = Planner {
            schema: &schema,
            policy: EmptyListPolicy::Error,
        };
        assert!(strict_policy.plan(empty.clone(), None).is_err());

        let forwarding = Planner {
            schema: &schema,
            policy: EmptyListPolicy::Forward,
        };
        let mods = forwarding.plan(empty, None).unwrap();
        assert_eq!(mods.len(), 1);
    }

    #[test]
    fn test_strict_mode_is_verbatim() {
        let schema = Arc::new(SchemaRegistry::core());
        let intent = ModifyIntent::AddAttrs(vec![(
            "description".to_string(),
            vec![b"a".to_vec(), b"a".to_vec()],
        )]);
        let mods = planner(&schema).plan_strict(intent).unwrap();
        assert_eq!(
            mods,
            vec![RawMod::add(
                "description",
                vec![b"a".to_vec(), b"a".to_vec()]
            )]
        );
    }

    #[test]
    fn test_validation_rejects_bad_syntax() {
        let schema = Arc::new(SchemaRegistry::core());
        let intent = ModifyIntent::AddAttrs(vec![(
            "gidNumber".to_string(),
            vec![b"not-a-number".to_vec()],
        )]);
        assert!(planner(&schema).plan(intent, None).is_err());
    }

    #[test]
    fn test_apply_mirrors_change() {
        let schema = Arc::new(SchemaRegistry::core());
        let mut attrs = entry_with("description", &["a"], schema.clone());
        apply(
            &[RawMod::add("description", vec![b"b".to_vec()])],
            &mut attrs,
        );
        assert_eq!(attrs.get("description").map(<[Vec<u8>]>::len), Some(2));
        apply(&[RawMod::delete("description", AttrValues::All)], &mut attrs);
        assert!(!attrs.contains_attr("description"));
    }
}
