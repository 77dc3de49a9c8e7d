//! Schema elements and their registry (RFC 4512)
//!
//! Attribute types, object classes, matching rules and syntaxes are parsed from their RFC 4512
//! textual descriptions (the same form the subschema subentry serves). The registry resolves
//! names and OIDs to elements, enforces uniqueness, and drives value comparison through the
//! matching rules' preparation pipelines.

use crate::dn::Dn;
use crate::error::Error;
use crate::prep::{self, PrepStep};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeUsage {
    UserApplications,
    DirectoryOperation,
    DistributedOperation,
    DsaOperation,
}

impl Default for AttributeUsage {
    fn default() -> Self {
        AttributeUsage::UserApplications
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeType {
    pub oid: String,
    pub names: Vec<String>,
    pub description: Option<String>,
    pub obsolete: bool,
    pub sup: Option<String>,
    pub equality: Option<String>,
    pub ordering: Option<String>,
    pub substr: Option<String>,
    pub syntax: Option<String>,
    pub single_value: bool,
    pub collective: bool,
    pub no_user_modification: bool,
    pub usage: AttributeUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClassKind {
    Abstract,
    Structural,
    Auxiliary,
}

impl Default for ObjectClassKind {
    fn default() -> Self {
        ObjectClassKind::Structural
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectClass {
    pub oid: String,
    pub names: Vec<String>,
    pub description: Option<String>,
    pub obsolete: bool,
    pub sup: Vec<String>,
    pub kind: ObjectClassKind,
    pub must: Vec<String>,
    pub may: Vec<String>,
}

/// A matching rule and its preparation pipeline.
///
/// An empty pipeline means raw octet comparison (octetStringMatch, booleanMatch and similar
/// rules whose values are not character strings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingRule {
    pub oid: String,
    pub names: Vec<String>,
    pub description: Option<String>,
    pub obsolete: bool,
    pub syntax: String,
    pub prep: Vec<PrepStep>,
}

#[derive(Clone)]
pub struct LdapSyntax {
    pub oid: String,
    pub description: Option<String>,
    pub validator: fn(&[u8]) -> bool,
}

impl std::fmt::Debug for LdapSyntax {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSyntax")
            .field("oid", &self.oid)
            .field("description", &self.description)
            .finish()
    }
}

impl PartialEq for LdapSyntax {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid && self.description == other.description
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaElement {
    Attribute(Arc<AttributeType>),
    Class(Arc<ObjectClass>),
    Rule(Arc<MatchingRule>),
    Syntax(Arc<LdapSyntax>),
}

impl SchemaElement {
    fn oid(&self) -> &str {
        match self {
            SchemaElement::Attribute(e) => &e.oid,
            SchemaElement::Class(e) => &e.oid,
            SchemaElement::Rule(e) => &e.oid,
            SchemaElement::Syntax(e) => &e.oid,
        }
    }

    fn names(&self) -> &[String] {
        match self {
            SchemaElement::Attribute(e) => &e.names,
            SchemaElement::Class(e) => &e.names,
            SchemaElement::Rule(e) => &e.names,
            SchemaElement::Syntax(_) => &[],
        }
    }
}

/// Registry over all schema elements with OID, name and syntax indices.
///
/// Registration is idempotent: registering a definition identical to the stored one is a no-op,
/// a conflicting definition under the same OID or name fails with [`Error::SchemaConflict`].
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    by_oid: HashMap<String, SchemaElement>,
    by_name: HashMap<String, SchemaElement>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Registry seeded with the core syntaxes, matching rules, attribute types and object
    /// classes every server is expected to know.
    pub fn core() -> Self {
        let mut registry = SchemaRegistry::new();
        for (oid, description, validator) in CORE_SYNTAXES {
            let result = registry.register(SchemaElement::Syntax(Arc::new(LdapSyntax {
                oid: oid.to_string(),
                description: Some(description.to_string()),
                validator: *validator,
            })));
            debug_assert!(result.is_ok(), "core syntax {}", oid);
        }
        for def in CORE_MATCHING_RULES {
            match MatchingRule::from_str(def) {
                Ok(rule) => {
                    let result = registry.register(SchemaElement::Rule(Arc::new(rule)));
                    debug_assert!(result.is_ok(), "core rule {}", def);
                }
                Err(_) => debug_assert!(false, "unparseable core rule {}", def),
            }
        }
        for def in CORE_ATTRIBUTE_TYPES {
            match AttributeType::from_str(def) {
                Ok(at) => {
                    let result = registry.register(SchemaElement::Attribute(Arc::new(at)));
                    debug_assert!(result.is_ok(), "core attribute {}", def);
                }
                Err(_) => debug_assert!(false, "unparseable core attribute {}", def),
            }
        }
        for def in CORE_OBJECT_CLASSES {
            match ObjectClass::from_str(def) {
                Ok(oc) => {
                    let result = registry.register(SchemaElement::Class(Arc::new(oc)));
                    debug_assert!(result.is_ok(), "core class {}", def);
                }
                Err(_) => debug_assert!(false, "unparseable core class {}", def),
            }
        }
        registry
    }

    pub fn register(&mut self, element: SchemaElement) -> Result<(), Error> {
        let oid = element.oid().to_string();
        if let Some(existing) = self.by_oid.get(&oid) {
            if *existing == element {
                return Ok(());
            }
            return Err(Error::SchemaConflict(oid));
        }
        for name in element.names() {
            let key = name.to_ascii_lowercase();
            if let Some(existing) = self.by_name.get(&key) {
                if existing.oid() != oid {
                    return Err(Error::SchemaConflict(name.clone()));
                }
            }
        }
        for name in element.names() {
            self.by_name
                .insert(name.to_ascii_lowercase(), element.clone());
        }
        self.by_oid.insert(oid, element);
        Ok(())
    }

    pub fn register_attribute_type(&mut self, at: AttributeType) -> Result<(), Error> {
        self.register(SchemaElement::Attribute(Arc::new(at)))
    }

    pub fn register_object_class(&mut self, oc: ObjectClass) -> Result<(), Error> {
        self.register(SchemaElement::Class(Arc::new(oc)))
    }

    pub fn register_matching_rule(&mut self, rule: MatchingRule) -> Result<(), Error> {
        self.register(SchemaElement::Rule(Arc::new(rule)))
    }

    fn resolve(&self, name_or_oid: &str) -> Option<&SchemaElement> {
        // an attribute description may carry options ("cn;lang-en")
        let bare = name_or_oid.split(';').next().unwrap_or(name_or_oid);
        self.by_oid
            .get(bare)
            .or_else(|| self.by_name.get(&bare.to_ascii_lowercase()))
    }

    pub fn attribute_type(&self, name_or_oid: &str) -> Option<&Arc<AttributeType>> {
        match self.resolve(name_or_oid) {
            Some(SchemaElement::Attribute(at)) => Some(at),
            _ => None,
        }
    }

    pub fn object_class(&self, name_or_oid: &str) -> Option<&Arc<ObjectClass>> {
        match self.resolve(name_or_oid) {
            Some(SchemaElement::Class(oc)) => Some(oc),
            _ => None,
        }
    }

    pub fn matching_rule(&self, name_or_oid: &str) -> Option<&Arc<MatchingRule>> {
        match self.resolve(name_or_oid) {
            Some(SchemaElement::Rule(rule)) => Some(rule),
            _ => None,
        }
    }

    pub fn syntax(&self, oid: &str) -> Option<&Arc<LdapSyntax>> {
        match self.by_oid.get(oid) {
            Some(SchemaElement::Syntax(syntax)) => Some(syntax),
            _ => None,
        }
    }

    /// The equality matching rule for an attribute, following the SUP chain.
    pub fn equality_rule(&self, attr: &str) -> Option<&Arc<MatchingRule>> {
        let mut current = self.attribute_type(attr)?;
        for _ in 0..16 {
            if let Some(rule) = &current.equality {
                return self.matching_rule(rule);
            }
            current = self.attribute_type(current.sup.as_deref()?)?;
        }
        None
    }

    /// The ordering matching rule for an attribute, following the SUP chain.
    pub fn ordering_rule(&self, attr: &str) -> Option<&Arc<MatchingRule>> {
        let mut current = self.attribute_type(attr)?;
        for _ in 0..16 {
            if let Some(rule) = &current.ordering {
                return self.matching_rule(rule);
            }
            current = self.attribute_type(current.sup.as_deref()?)?;
        }
        None
    }

    /// Value equality under the attribute's equality rule.
    ///
    /// Unknown attribute types degrade to octet equality: the server is authoritative for
    /// attributes the client has no schema for.
    pub fn values_equal(&self, attr: &str, a: &[u8], b: &[u8]) -> bool {
        match self.equality_rule(attr) {
            Some(rule) if !rule.prep.is_empty() => prep::equal(a, b, &rule.prep),
            Some(_) => a == b,
            None => {
                log::trace!("no equality rule for {}, comparing octets", attr);
                a == b
            }
        }
    }

    /// Ordering comparison of prepared values; integers compare numerically.
    pub fn values_compare(&self, attr: &str, a: &[u8], b: &[u8]) -> Option<std::cmp::Ordering> {
        let rule = self.ordering_rule(attr)?;
        if rule.oid == "2.5.13.15" {
            // integerOrderingMatch compares numeric values, not prepared strings
            let a: i64 = std::str::from_utf8(a).ok()?.trim().parse().ok()?;
            let b: i64 = std::str::from_utf8(b).ok()?.trim().parse().ok()?;
            return Some(a.cmp(&b));
        }
        prep::compare(a, b, &rule.prep)
    }

    /// Check a value against the attribute's syntax.
    ///
    /// Unknown attribute types are permitted with a warning; a known syntax that rejects the
    /// value is an error raised before any I/O.
    pub fn validate_value(&self, attr: &str, value: &[u8]) -> Result<(), Error> {
        let at = match self.attribute_type(attr) {
            Some(at) => at,
            None => {
                log::warn!("unknown attribute type {}, skipping validation", attr);
                return Ok(());
            }
        };
        let mut current = at.clone();
        for _ in 0..16 {
            if let Some(syntax_oid) = &current.syntax {
                if let Some(syntax) = self.syntax(syntax_oid) {
                    if !(syntax.validator)(value) {
                        return Err(Error::InvalidSyntax(format!(
                            "value for {} does not conform to syntax {}",
                            attr, syntax_oid
                        )));
                    }
                }
                return Ok(());
            }
            match current.sup.as_deref().and_then(|s| self.attribute_type(s)) {
                Some(sup) => current = sup.clone(),
                None => break,
            }
        }
        Ok(())
    }

    /// The registered spelling of an attribute name, where known.
    pub fn canonical_attr_case<'a>(&'a self, name: &'a str) -> &'a str {
        if let Some(at) = self.attribute_type(name) {
            for registered in &at.names {
                if registered.eq_ignore_ascii_case(name) {
                    return registered;
                }
            }
        }
        name
    }

    /// Render a DN with schema-canonical attribute name casing.
    pub fn canonical_dn(&self, dn: &Dn) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, rdn) in dn.rdns().iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            for (j, ava) in rdn.avas.iter().enumerate() {
                if j > 0 {
                    out.push('+');
                }
                let canonical = crate::dn::Rdn::new(self.canonical_attr_case(&ava.attr), &ava.value);
                let _ = write!(out, "{}", canonical);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }
}

// ---- RFC 4512 description parsing ----

struct SpecParser<'s> {
    input: &'s str,
    bytes: &'s [u8],
    pos: usize,
}

impl<'s> SpecParser<'s> {
    fn new(input: &'s str) -> Self {
        SpecParser {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn fail(&self, what: &str) -> Error {
        Error::InvalidSyntax(format!("{} at byte {} in {:?}", what, self.pos, self.input))
    }

    fn ws(&mut self) {
        while matches!(self.bytes.get(self.pos), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8, what: &str) -> Result<(), Error> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(what))
        }
    }

    /// keystring / numericoid token
    fn token(&mut self) -> Result<&'s str, Error> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.fail("token"));
        }
        Ok(&self.input[start..self.pos])
    }

    /// `'qdstring'` with RFC 4512 escapes
    fn qdstring(&mut self) -> Result<String, Error> {
        self.expect(b'\'', "opening quote")?;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.fail("closing quote")),
                Some(b'\'') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    // \27 and \5c escapes
                    let hex = self.bytes.get(self.pos + 1..self.pos + 3);
                    match hex {
                        Some(h) if h.eq_ignore_ascii_case(b"27") => out.push('\''),
                        Some(h) if h.eq_ignore_ascii_case(b"5c") => out.push('\\'),
                        _ => return Err(self.fail("qdstring escape")),
                    }
                    self.pos += 3;
                }
                Some(_) => {
                    // advance one character, preserving UTF-8
                    let rest = &self.input[self.pos..];
                    match rest.chars().next() {
                        Some(c) => {
                            out.push(c);
                            self.pos += c.len_utf8();
                        }
                        None => return Err(self.fail("character")),
                    }
                }
            }
        }
    }

    /// `'descr'` or `( 'a' 'b' ... )`
    fn qdescrs(&mut self) -> Result<Vec<String>, Error> {
        self.ws();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let mut names = Vec::new();
            loop {
                self.ws();
                if self.peek() == Some(b')') {
                    self.pos += 1;
                    return Ok(names);
                }
                names.push(self.qdstring()?);
            }
        }
        Ok(vec![self.qdstring()?])
    }

    /// `oid` or `( oid $ oid ... )`
    fn oids(&mut self) -> Result<Vec<String>, Error> {
        self.ws();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let mut oids = Vec::new();
            loop {
                self.ws();
                match self.peek() {
                    Some(b')') => {
                        self.pos += 1;
                        return Ok(oids);
                    }
                    Some(b'$') => {
                        self.pos += 1;
                    }
                    _ => oids.push(self.token()?.to_string()),
                }
            }
        }
        Ok(vec![self.token()?.to_string()])
    }

    /// `numericoid` with optional `{len}` bound
    fn noidlen(&mut self) -> Result<String, Error> {
        self.ws();
        // syntaxes may be quoted in some server implementations
        let quoted = self.peek() == Some(b'\'');
        if quoted {
            self.pos += 1;
        }
        let oid = self.token()?.to_string();
        if self.peek() == Some(b'{') {
            while let Some(b) = self.peek() {
                self.pos += 1;
                if b == b'}' {
                    break;
                }
            }
        }
        if quoted {
            self.expect(b'\'', "closing quote")?;
        }
        Ok(oid)
    }

    /// Skip the value of an unrecognised `X-...` extension.
    fn skip_extension_value(&mut self) -> Result<(), Error> {
        self.ws();
        if self.peek() == Some(b'\'') {
            self.qdstring()?;
            return Ok(());
        }
        if self.peek() == Some(b'(') {
            self.qdescrs()?;
            return Ok(());
        }
        self.token()?;
        Ok(())
    }

    fn open(&mut self) -> Result<String, Error> {
        self.ws();
        self.expect(b'(', "opening parenthesis")?;
        self.ws();
        Ok(self.token()?.to_string())
    }

    /// Consume the closing parenthesis; anything but trailing whitespace after it is an
    /// error (a concatenated or truncated definition must not be silently accepted).
    fn close(&mut self) -> Result<(), Error> {
        self.expect(b')', "closing parenthesis")?;
        self.ws();
        if self.pos != self.bytes.len() {
            return Err(self.fail("end of definition"));
        }
        Ok(())
    }
}

impl FromStr for AttributeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut p = SpecParser::new(s);
        let mut at = AttributeType {
            oid: p.open()?,
            ..AttributeType::default()
        };
        loop {
            p.ws();
            if p.peek() == Some(b')') {
                p.close()?;
                return Ok(at);
            }
            let keyword = p.token()?.to_ascii_uppercase();
            match keyword.as_str() {
                "NAME" => at.names = p.qdescrs()?,
                "DESC" => {
                    p.ws();
                    at.description = Some(p.qdstring()?);
                }
                "OBSOLETE" => at.obsolete = true,
                "SUP" => {
                    p.ws();
                    at.sup = Some(p.token()?.to_string());
                }
                "EQUALITY" => {
                    p.ws();
                    at.equality = Some(p.token()?.to_string());
                }
                "ORDERING" => {
                    p.ws();
                    at.ordering = Some(p.token()?.to_string());
                }
                "SUBSTR" => {
                    p.ws();
                    at.substr = Some(p.token()?.to_string());
                }
                "SYNTAX" => at.syntax = Some(p.noidlen()?),
                "SINGLE-VALUE" => at.single_value = true,
                "COLLECTIVE" => at.collective = true,
                "NO-USER-MODIFICATION" => at.no_user_modification = true,
                "USAGE" => {
                    p.ws();
                    at.usage = match p.token()?.to_ascii_lowercase().as_str() {
                        "userapplications" => AttributeUsage::UserApplications,
                        "directoryoperation" => AttributeUsage::DirectoryOperation,
                        "distributedoperation" => AttributeUsage::DistributedOperation,
                        "dsaoperation" => AttributeUsage::DsaOperation,
                        _ => return Err(p.fail("attribute usage")),
                    };
                }
                kw if kw.starts_with("X-") => p.skip_extension_value()?,
                _ => return Err(p.fail("attribute type keyword")),
            }
        }
    }
}

impl FromStr for ObjectClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut p = SpecParser::new(s);
        let mut oc = ObjectClass {
            oid: p.open()?,
            ..ObjectClass::default()
        };
        loop {
            p.ws();
            if p.peek() == Some(b')') {
                p.close()?;
                return Ok(oc);
            }
            let keyword = p.token()?.to_ascii_uppercase();
            match keyword.as_str() {
                "NAME" => oc.names = p.qdescrs()?,
                "DESC" => {
                    p.ws();
                    oc.description = Some(p.qdstring()?);
                }
                "OBSOLETE" => oc.obsolete = true,
                "SUP" => oc.sup = p.oids()?,
                "ABSTRACT" => oc.kind = ObjectClassKind::Abstract,
                "STRUCTURAL" => oc.kind = ObjectClassKind::Structural,
                "AUXILIARY" => oc.kind = ObjectClassKind::Auxiliary,
                "MUST" => oc.must = p.oids()?,
                "MAY" => oc.may = p.oids()?,
                kw if kw.starts_with("X-") => p.skip_extension_value()?,
                _ => return Err(p.fail("object class keyword")),
            }
        }
    }
}

impl FromStr for MatchingRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut p = SpecParser::new(s);
        let oid = p.open()?;
        let mut rule = MatchingRule {
            prep: builtin_prep(&oid),
            oid,
            names: Vec::new(),
            description: None,
            obsolete: false,
            syntax: String::new(),
        };
        loop {
            p.ws();
            if p.peek() == Some(b')') {
                if rule.syntax.is_empty() {
                    return Err(p.fail("SYNTAX"));
                }
                p.close()?;
                return Ok(rule);
            }
            let keyword = p.token()?.to_ascii_uppercase();
            match keyword.as_str() {
                "NAME" => rule.names = p.qdescrs()?,
                "DESC" => {
                    p.ws();
                    rule.description = Some(p.qdstring()?);
                }
                "OBSOLETE" => rule.obsolete = true,
                "SYNTAX" => rule.syntax = p.noidlen()?,
                kw if kw.starts_with("X-") => p.skip_extension_value()?,
                _ => return Err(p.fail("matching rule keyword")),
            }
        }
    }
}

/// Preparation pipelines for the standard matching rules. Rules not listed compare raw octets.
fn builtin_prep(oid: &str) -> Vec<PrepStep> {
    match oid {
        // objectIdentifierMatch
        "2.5.13.0" => vec![PrepStep::CaseFold],
        // distinguishedNameMatch
        "2.5.13.1" => vec![PrepStep::CaseFold, PrepStep::SpaceInsignificant],
        // caseIgnoreMatch, caseIgnoreOrderingMatch, caseIgnoreSubstringsMatch
        "2.5.13.2" | "2.5.13.3" | "2.5.13.4" => {
            vec![PrepStep::CaseFold, PrepStep::SpaceInsignificant]
        }
        // caseExactMatch, caseExactOrderingMatch, caseExactSubstringsMatch
        "2.5.13.5" | "2.5.13.6" | "2.5.13.7" => vec![PrepStep::SpaceInsignificant],
        // numericStringMatch, numericStringSubstringsMatch
        "2.5.13.8" | "2.5.13.10" => vec![PrepStep::NumericSquash],
        // integerMatch, integerOrderingMatch
        "2.5.13.14" | "2.5.13.15" => vec![PrepStep::SpaceInsignificant],
        // telephoneNumberMatch, telephoneNumberSubstringsMatch
        "2.5.13.20" | "2.5.13.21" => vec![PrepStep::CaseFold, PrepStep::TelephoneSquash],
        // caseExactIA5Match
        "1.3.6.1.4.1.1466.109.114.1" => vec![PrepStep::SpaceInsignificant],
        // caseIgnoreIA5Match, caseIgnoreIA5SubstringsMatch
        "1.3.6.1.4.1.1466.109.114.2" | "1.3.6.1.4.1.1466.109.114.3" => {
            vec![PrepStep::CaseFold, PrepStep::SpaceInsignificant]
        }
        _ => Vec::new(),
    }
}

// ---- built-in core schema ----

fn valid_utf8(v: &[u8]) -> bool {
    std::str::from_utf8(v).is_ok()
}

fn valid_ia5(v: &[u8]) -> bool {
    v.iter().all(u8::is_ascii)
}

fn valid_integer(v: &[u8]) -> bool {
    match v.split_first() {
        Some((b'-', rest)) => !rest.is_empty() && rest.iter().all(u8::is_ascii_digit),
        Some(_) => v.iter().all(u8::is_ascii_digit),
        None => false,
    }
}

fn valid_boolean(v: &[u8]) -> bool {
    v == b"TRUE" || v == b"FALSE"
}

fn valid_dn(v: &[u8]) -> bool {
    match std::str::from_utf8(v) {
        Ok(s) => Dn::from_str(s).is_ok(),
        Err(_) => false,
    }
}

fn valid_numeric_string(v: &[u8]) -> bool {
    !v.is_empty() && v.iter().all(|&b| b.is_ascii_digit() || b == b' ')
}

fn valid_oid(v: &[u8]) -> bool {
    !v.is_empty()
        && v.iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

fn valid_generalized_time(v: &[u8]) -> bool {
    // YYYYMMDDHH at minimum, ending in Z or a differential
    v.len() >= 11
        && v[..10].iter().all(u8::is_ascii_digit)
        && matches!(v[v.len() - 1], b'Z' | b'0'..=b'9')
}

fn valid_any(_: &[u8]) -> bool {
    true
}

type SyntaxSeed = (&'static str, &'static str, fn(&[u8]) -> bool);

const CORE_SYNTAXES: &[SyntaxSeed] = &[
    ("1.3.6.1.4.1.1466.115.121.1.7", "Boolean", valid_boolean),
    ("1.3.6.1.4.1.1466.115.121.1.12", "DN", valid_dn),
    ("1.3.6.1.4.1.1466.115.121.1.15", "Directory String", valid_utf8),
    ("1.3.6.1.4.1.1466.115.121.1.24", "Generalized Time", valid_generalized_time),
    ("1.3.6.1.4.1.1466.115.121.1.26", "IA5 String", valid_ia5),
    ("1.3.6.1.4.1.1466.115.121.1.27", "INTEGER", valid_integer),
    ("1.3.6.1.4.1.1466.115.121.1.36", "Numeric String", valid_numeric_string),
    ("1.3.6.1.4.1.1466.115.121.1.38", "OID", valid_oid),
    ("1.3.6.1.4.1.1466.115.121.1.40", "Octet String", valid_any),
    ("1.3.6.1.4.1.1466.115.121.1.50", "Telephone Number", valid_utf8),
];

const CORE_MATCHING_RULES: &[&str] = &[
    "( 2.5.13.0 NAME 'objectIdentifierMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 )",
    "( 2.5.13.1 NAME 'distinguishedNameMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 )",
    "( 2.5.13.2 NAME 'caseIgnoreMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
    "( 2.5.13.3 NAME 'caseIgnoreOrderingMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
    "( 2.5.13.4 NAME 'caseIgnoreSubstringsMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.58 )",
    "( 2.5.13.5 NAME 'caseExactMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
    "( 2.5.13.6 NAME 'caseExactOrderingMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
    "( 2.5.13.8 NAME 'numericStringMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.36 )",
    "( 2.5.13.13 NAME 'booleanMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.7 )",
    "( 2.5.13.14 NAME 'integerMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.27 )",
    "( 2.5.13.15 NAME 'integerOrderingMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.27 )",
    "( 2.5.13.17 NAME 'octetStringMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.40 )",
    "( 2.5.13.20 NAME 'telephoneNumberMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.50 )",
    "( 2.5.13.27 NAME 'generalizedTimeMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.24 )",
    "( 2.5.13.28 NAME 'generalizedTimeOrderingMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.24 )",
    "( 1.3.6.1.4.1.1466.109.114.1 NAME 'caseExactIA5Match' SYNTAX 1.3.6.1.4.1.1466.115.121.1.26 )",
    "( 1.3.6.1.4.1.1466.109.114.2 NAME 'caseIgnoreIA5Match' SYNTAX 1.3.6.1.4.1.1466.115.121.1.26 )",
];

const CORE_ATTRIBUTE_TYPES: &[&str] = &[
    "( 2.5.4.0 NAME 'objectClass' EQUALITY objectIdentifierMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 )",
    "( 2.5.4.41 NAME 'name' EQUALITY caseIgnoreMatch SUBSTR caseIgnoreSubstringsMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
    "( 2.5.4.3 NAME ( 'cn' 'commonName' ) SUP name )",
    "( 2.5.4.4 NAME ( 'sn' 'surname' ) SUP name )",
    "( 2.5.4.10 NAME ( 'o' 'organizationName' ) SUP name )",
    "( 2.5.4.11 NAME ( 'ou' 'organizationalUnitName' ) SUP name )",
    "( 2.5.4.13 NAME 'description' EQUALITY caseIgnoreMatch SUBSTR caseIgnoreSubstringsMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
    "( 2.5.4.20 NAME 'telephoneNumber' EQUALITY telephoneNumberMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.50 )",
    "( 2.5.4.34 NAME 'seeAlso' SUP distinguishedName )",
    "( 2.5.4.35 NAME 'userPassword' EQUALITY octetStringMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.40 )",
    "( 2.5.4.49 NAME 'distinguishedName' EQUALITY distinguishedNameMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 )",
    "( 2.5.4.31 NAME 'member' SUP distinguishedName )",
    "( 0.9.2342.19200300.100.1.1 NAME ( 'uid' 'userid' ) EQUALITY caseIgnoreMatch SUBSTR caseIgnoreSubstringsMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
    "( 0.9.2342.19200300.100.1.25 NAME ( 'dc' 'domainComponent' ) EQUALITY caseIgnoreIA5Match SYNTAX 1.3.6.1.4.1.1466.115.121.1.26 SINGLE-VALUE )",
    "( 1.3.6.1.1.1.1.0 NAME 'uidNumber' EQUALITY integerMatch ORDERING integerOrderingMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.27 SINGLE-VALUE )",
    "( 1.3.6.1.1.1.1.1 NAME 'gidNumber' EQUALITY integerMatch ORDERING integerOrderingMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.27 SINGLE-VALUE )",
    "( 1.3.6.1.1.1.1.12 NAME 'memberUid' EQUALITY caseExactIA5Match SYNTAX 1.3.6.1.4.1.1466.115.121.1.26 )",
    "( 1.3.6.1.4.1.1466.101.120.5 NAME 'namingContexts' SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 USAGE dSAOperation )",
    "( 1.3.6.1.4.1.1466.101.120.13 NAME 'supportedControl' SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 USAGE dSAOperation )",
    "( 1.3.6.1.4.1.1466.101.120.7 NAME 'supportedExtension' SYNTAX 1.3.6.1.4.1.1466.115.121.1.38 USAGE dSAOperation )",
    "( 2.5.18.10 NAME 'subschemaSubentry' EQUALITY distinguishedNameMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.12 SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )",
    "( 2.5.21.5 NAME 'attributeTypes' SYNTAX 1.3.6.1.4.1.1466.115.121.1.3 USAGE directoryOperation )",
    "( 2.5.21.6 NAME 'objectClasses' SYNTAX 1.3.6.1.4.1.1466.115.121.1.37 USAGE directoryOperation )",
    "( 2.5.21.4 NAME 'matchingRules' SYNTAX 1.3.6.1.4.1.1466.115.121.1.30 USAGE directoryOperation )",
    "( 1.3.6.1.4.1.1466.101.120.16 NAME 'ldapSyntaxes' SYNTAX 1.3.6.1.4.1.1466.115.121.1.54 USAGE directoryOperation )",
];

const CORE_OBJECT_CLASSES: &[&str] = &[
    "( 2.5.6.0 NAME 'top' ABSTRACT MUST objectClass )",
    "( 2.5.6.4 NAME 'organization' SUP top STRUCTURAL MUST o )",
    "( 2.5.6.5 NAME 'organizationalUnit' SUP top STRUCTURAL MUST ou )",
    "( 2.5.6.6 NAME 'person' SUP top STRUCTURAL MUST ( sn $ cn ) MAY ( userPassword $ telephoneNumber $ seeAlso $ description ) )",
    "( 2.5.6.9 NAME 'groupOfNames' SUP top STRUCTURAL MUST ( member $ cn ) MAY ( o $ ou $ description ) )",
    "( 0.9.2342.19200300.100.4.13 NAME 'domain' SUP top STRUCTURAL MUST dc )",
    "( 1.3.6.1.1.1.2.0 NAME 'posixAccount' SUP top AUXILIARY MUST ( cn $ uid $ uidNumber $ gidNumber ) MAY description )",
    "( 1.3.6.1.1.1.2.2 NAME 'posixGroup' SUP top AUXILIARY MUST ( cn $ gidNumber ) MAY ( memberUid $ description ) )",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attribute_type() {
        let at = AttributeType::from_str(
            "( 2.5.4.13 NAME 'description' EQUALITY caseIgnoreMatch \
             SUBSTR caseIgnoreSubstringsMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15{1024} )",
        )
        .expect("parse failed");
        assert_eq!(at.oid, "2.5.4.13");
        assert_eq!(at.names, vec!["description"]);
        assert_eq!(at.equality.as_deref(), Some("caseIgnoreMatch"));
        assert_eq!(at.syntax.as_deref(), Some("1.3.6.1.4.1.1466.115.121.1.15"));
        assert!(!at.single_value);
    }

    #[test]
    fn test_parse_attribute_type_aliases_and_flags() {
        let at = AttributeType::from_str(
            "( 0.9.2342.19200300.100.1.1 NAME ( 'uid' 'userid' ) DESC 'RFC 4519' \
             EQUALITY caseIgnoreMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 \
             SINGLE-VALUE USAGE userApplications X-ORIGIN 'test' )",
        )
        .expect("parse failed");
        assert_eq!(at.names, vec!["uid", "userid"]);
        assert!(at.single_value);
        assert_eq!(at.usage, AttributeUsage::UserApplications);
    }

    #[test]
    fn test_rejects_trailing_content() {
        // concatenated or malformed definitions are errors, not silent truncation
        assert!(AttributeType::from_str(
            "( 2.5.4.3 NAME 'cn' SUP name ) ( 9.9.9 NAME 'evil' SUP name )"
        )
        .is_err());
        assert!(
            ObjectClass::from_str("( 2.5.6.0 NAME 'top' ABSTRACT MUST objectClass ) x").is_err()
        );
        assert!(MatchingRule::from_str(
            "( 2.5.13.2 NAME 'caseIgnoreMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 ) junk"
        )
        .is_err());
        // trailing whitespace alone is harmless
        assert!(AttributeType::from_str("( 2.5.4.3 NAME 'cn' SUP name )  ").is_ok());
    }

    #[test]
    fn test_parse_object_class() {
        let oc = ObjectClass::from_str(
            "( 2.5.6.6 NAME 'person' SUP top STRUCTURAL MUST ( sn $ cn ) \
             MAY ( userPassword $ telephoneNumber ) )",
        )
        .expect("parse failed");
        assert_eq!(oc.oid, "2.5.6.6");
        assert_eq!(oc.kind, ObjectClassKind::Structural);
        assert_eq!(oc.must, vec!["sn", "cn"]);
        assert_eq!(oc.may, vec!["userPassword", "telephoneNumber"]);
        assert_eq!(oc.sup, vec!["top"]);
    }

    #[test]
    fn test_core_registry_resolution() {
        let registry = SchemaRegistry::core();
        // by name, by alias, by OID, case-insensitively
        assert!(registry.attribute_type("cn").is_some());
        assert!(registry.attribute_type("commonName").is_some());
        assert!(registry.attribute_type("COMMONNAME").is_some());
        assert_eq!(
            registry.attribute_type("2.5.4.3").map(|a| a.oid.as_str()),
            Some("2.5.4.3")
        );
        assert!(registry.object_class("posixAccount").is_some());
        assert!(registry.matching_rule("caseIgnoreMatch").is_some());
        assert!(registry.syntax("1.3.6.1.4.1.1466.115.121.1.27").is_some());
        // attribute options are stripped for resolution
        assert!(registry.attribute_type("description;lang-en").is_some());
    }

    #[test]
    fn test_idempotent_and_conflicting_registration() {
        let mut registry = SchemaRegistry::core();
        let before = registry.len();
        let same = AttributeType::from_str(
            "( 2.5.4.13 NAME 'description' EQUALITY caseIgnoreMatch \
             SUBSTR caseIgnoreSubstringsMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
        )
        .expect("parse failed");
        registry
            .register_attribute_type(same)
            .expect("identical re-registration must be a no-op");
        assert_eq!(registry.len(), before);

        let conflicting = AttributeType::from_str(
            "( 2.5.4.13 NAME 'description' EQUALITY caseExactMatch \
             SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
        )
        .expect("parse failed");
        assert!(matches!(
            registry.register_attribute_type(conflicting),
            Err(Error::SchemaConflict(_))
        ));
    }

    #[test]
    fn test_equality_through_sup_chain() {
        let registry = SchemaRegistry::core();
        // cn has no EQUALITY of its own; it inherits caseIgnoreMatch via SUP name
        let rule = registry.equality_rule("cn").expect("no rule for cn");
        assert_eq!(rule.oid, "2.5.13.2");
        assert!(registry.values_equal("cn", b"Babs  Jensen", b"babs jensen"));
        assert!(!registry.values_equal("memberUid", b"Foo", b"foo"));
        // unknown attributes degrade to octet equality
        assert!(registry.values_equal("frobnitz", b"x", b"x"));
        assert!(!registry.values_equal("frobnitz", b"X", b"x"));
    }

    #[test]
    fn test_integer_ordering_is_numeric() {
        let registry = SchemaRegistry::core();
        assert_eq!(
            registry.values_compare("gidNumber", b"900", b"1000"),
            Some(std::cmp::Ordering::Less)
        );
    }

    #[test]
    fn test_validate_value() {
        let registry = SchemaRegistry::core();
        assert!(registry.validate_value("gidNumber", b"1000").is_ok());
        assert!(registry.validate_value("gidNumber", b"abc").is_err());
        // unknown attribute: permitted with a warning
        assert!(registry.validate_value("frobnitz", b"anything").is_ok());
    }

    #[test]
    fn test_canonical_case() {
        let registry = SchemaRegistry::core();
        assert_eq!(registry.canonical_attr_case("COMMONNAME"), "commonName");
        assert_eq!(registry.canonical_attr_case("unknownAttr"), "unknownAttr");
    }
}
