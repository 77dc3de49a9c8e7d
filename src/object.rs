//! Directory objects: a mutable local view of one entry bound to its connection
//!
//! An object carries its DN, a local attribute map, and a relative-search scope. Operations
//! take the DN implicitly; high-level attribute modifications go through the planner, which
//! consults the local map when it is known to be complete and the server otherwise.

use crate::attrs::{AttrValues, AttributeMap};
use crate::conn::{LdapConnection, SearchItem, SearchOptions, SearchStream};
use crate::dn::{Dn, Rdn};
use crate::error::Error;
use crate::ldap::{SearchResultEntry, SearchScope};
use crate::filter::Filter;
use crate::ldap::LdapString;
use crate::modify::{self, ModifyIntent, Planner, RawMod};
use std::borrow::Cow;
use std::str::FromStr;

#[derive(Debug)]
pub struct LdapObject {
    conn: LdapConnection,
    dn: Dn,
    attrs: AttributeMap,
    relative_scope: SearchScope,
    /// True when the local attribute map mirrors the server state for every attribute of
    /// interest; lets the planner skip its pre-fetch.
    complete: bool,
}

impl LdapObject {
    /// Bind a DN to a connection without reading the entry.
    pub fn attached(conn: &LdapConnection, dn: &str) -> Result<Self, Error> {
        Ok(LdapObject {
            conn: conn.clone(),
            dn: Dn::from_str(dn)?,
            attrs: AttributeMap::with_schema(conn.schema()),
            relative_scope: conn.config().relative_scope,
            complete: false,
        })
    }

    /// Read the entry and bind it. Requesting no specific attributes retrieves all user
    /// attributes and marks the object complete.
    pub fn fetch(conn: &LdapConnection, dn: &str, attrs: &[&str]) -> Result<Self, Error> {
        let mut object = LdapObject::attached(conn, dn)?;
        object.refresh(attrs)?;
        Ok(object)
    }

    /// Wrap a search result entry.
    pub fn from_entry(conn: &LdapConnection, entry: &SearchResultEntry<'_>) -> Result<Self, Error> {
        Ok(LdapObject {
            conn: conn.clone(),
            dn: Dn::from_str(&entry.object_name.0)?,
            attrs: AttributeMap::from_entry(entry, Some(conn.schema())),
            relative_scope: conn.config().relative_scope,
            complete: false,
        })
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn attrs(&self) -> &AttributeMap {
        &self.attrs
    }

    pub fn connection(&self) -> &LdapConnection {
        &self.conn
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Treat the local attribute map as authoritative for planning purposes.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn set_relative_scope(&mut self, scope: SearchScope) {
        self.relative_scope = scope;
    }

    /// Re-read the entry; an empty `attrs` list retrieves all user attributes and marks the
    /// object complete.
    pub fn refresh(&mut self, attrs: &[&str]) -> Result<(), Error> {
        let dn = self.dn.to_string();
        match self.conn.read_entry_attrs(&dn, attrs)? {
            Some(map) => {
                self.attrs = map;
                self.complete = attrs.is_empty();
                Ok(())
            }
            None => Err(Error::OperationFailed {
                result_code: crate::ldap::ResultCode::NoSuchObject,
                diagnostic_message: format!("{} does not exist", dn),
                matched_dn: String::new(),
            }),
        }
    }

    // ---- relative searches ----

    /// Search below this object with its configured relative scope.
    pub fn search_relative(&self, filter: &str, attrs: &[&str]) -> Result<SearchStream, Error> {
        self.conn
            .search(&self.dn.to_string(), self.relative_scope, filter, attrs)
    }

    /// Locate a child by RDN assertion: one-level search when so configured, subtree
    /// otherwise.
    pub fn find(&self, rdn: &str, attrs: &[&str]) -> Result<Option<LdapObject>, Error> {
        let rdn = Rdn::from_str(rdn)?;
        let scope = match self.relative_scope {
            SearchScope::SingleLevel => SearchScope::SingleLevel,
            _ => SearchScope::WholeSubtree,
        };
        let filter = Filter::And(
            rdn.avas
                .iter()
                .map(|ava| {
                    Filter::EqualityMatch(crate::filter::AttributeValueAssertion {
                        attribute_desc: LdapString(Cow::Borrowed(ava.attr.as_str())),
                        assertion_value: Cow::Borrowed(ava.value.as_bytes()),
                    })
                })
                .collect(),
        );
        let filter = match filter {
            Filter::And(mut parts) if parts.len() == 1 => parts.swap_remove(0),
            other => other,
        };
        let mut stream = self.conn.search_ast(
            &self.dn.to_string(),
            scope,
            filter,
            attrs,
            SearchOptions::default(),
        )?;
        let mut found = None;
        while let Some(item) = stream.next()? {
            if let SearchItem::Entry(entry, _) = item {
                if found.is_none() {
                    found = Some(LdapObject::from_entry(&self.conn, &entry)?);
                }
            }
        }
        stream.take_outcome()?.check()?;
        Ok(found)
    }

    /// Read the entry at `rdn` relative to this object (base-scoped search at the composed
    /// DN).
    pub fn get_child(&self, rdn: &str, attrs: &[&str]) -> Result<Option<LdapObject>, Error> {
        let child_dn = self.dn.child_str(rdn)?;
        let dn = child_dn.to_string();
        match self.conn.read_entry_attrs(&dn, attrs)? {
            Some(map) => Ok(Some(LdapObject {
                conn: self.conn.clone(),
                dn: child_dn,
                attrs: map,
                relative_scope: self.relative_scope,
                complete: attrs.is_empty(),
            })),
            None => Ok(None),
        }
    }

    // ---- modifications ----

    /// Add attribute values (non-strict by default: values the entry already holds are not
    /// re-sent).
    pub fn add_attrs(&mut self, items: Vec<(String, Vec<Vec<u8>>)>) -> Result<(), Error> {
        self.run_intent(ModifyIntent::AddAttrs(items))
    }

    /// Delete attribute values; `AttrValues::All` removes the attribute entirely.
    pub fn delete_attrs(&mut self, items: Vec<(String, AttrValues)>) -> Result<(), Error> {
        self.run_intent(ModifyIntent::DeleteAttrs(items))
    }

    /// Replace attribute value lists wholesale.
    pub fn replace_attrs(&mut self, items: Vec<(String, AttrValues)>) -> Result<(), Error> {
        self.run_intent(ModifyIntent::ReplaceAttrs(items))
    }

    /// Raw path: the list goes to the server unchanged, no pre-fetch, no deduplication.
    pub fn modify_raw(&mut self, mods: Vec<RawMod>) -> Result<(), Error> {
        if mods.is_empty() {
            return Ok(());
        }
        let changes = modify::to_changes(mods.clone());
        self.conn.modify(&self.dn.to_string(), changes, Vec::new())?;
        modify::apply(&mods, &mut self.attrs);
        Ok(())
    }

    fn run_intent(&mut self, intent: ModifyIntent) -> Result<(), Error> {
        let schema = self.conn.schema();
        let planner = Planner {
            schema: &schema,
            policy: self.conn.config().empty_list_policy,
        };
        let (mods, fetched) = if self.conn.config().strict_modify {
            (planner.plan_strict(intent)?, None)
        } else {
            let referenced: Vec<String> = intent.referenced_attrs();
            let current = if self.complete {
                Some(self.attrs.clone())
            } else {
                let refs: Vec<&str> = referenced.iter().map(String::as_str).collect();
                self.conn.read_entry_attrs(&self.dn.to_string(), &refs)?
            };
            (planner.plan(intent, current.as_ref())?, current)
        };
        if mods.is_empty() {
            log::debug!("modification of {} planned to nothing", self.dn);
            return Ok(());
        }
        let changes = modify::to_changes(mods.clone());
        self.conn.modify(&self.dn.to_string(), changes, Vec::new())?;
        // mirror the applied change over the state the plan was computed against
        if let Some(current) = fetched {
            for (attr, values) in current.iter() {
                self.attrs.replace(attr, values.to_vec());
            }
        }
        modify::apply(&mods, &mut self.attrs);
        Ok(())
    }

    // ---- entry-level operations ----

    /// Server-side compare against this entry.
    pub fn compare(&self, attr: &str, value: &[u8]) -> Result<bool, Error> {
        self.conn.compare(&self.dn.to_string(), attr, value)
    }

    /// Delete the entry; consumes the object.
    pub fn delete(self) -> Result<(), Error> {
        self.conn.delete(&self.dn.to_string(), Vec::new())?;
        Ok(())
    }

    /// Rename in place (modifyDN without a new superior); the local DN follows the change.
    pub fn rename(&mut self, new_rdn: &str, delete_old_rdn: bool) -> Result<(), Error> {
        let parsed = Rdn::from_str(new_rdn)?;
        self.conn
            .mod_dn(&self.dn.to_string(), new_rdn, delete_old_rdn, None)?;
        let parent = self.dn.parent().unwrap_or_else(Dn::root);
        self.dn = parent.child(parsed);
        Ok(())
    }
}
