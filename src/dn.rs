//! Distinguished names (RFC 4514)
//!
//! A [`Dn`] is an immutable sequence of relative DNs, most specific first; each RDN is a set of
//! attribute/value assertions (almost always exactly one). The empty DN addresses the root DSE.
//! Equality is normalised: attribute names compare case-insensitively and values through the
//! caseIgnore preparation pipeline, so `CN=Foo,DC=Example` equals `cn=foo,dc=example`.

use crate::error::Error;
use crate::prep;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// One attribute/value assertion of an RDN
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ava {
    pub attr: String,
    pub value: String,
}

impl Ava {
    pub fn new(attr: &str, value: &str) -> Self {
        Ava {
            attr: attr.to_string(),
            value: value.to_string(),
        }
    }

    fn normalized(&self) -> String {
        let value = prep::prepare(
            self.value.as_bytes(),
            &[prep::PrepStep::CaseFold, prep::PrepStep::SpaceInsignificant],
        )
        .unwrap_or_else(|_| self.value.clone());
        format!("{}={}", self.attr.to_ascii_lowercase(), value)
    }
}

/// Relative distinguished name: a non-empty set of AVAs
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rdn {
    pub avas: Vec<Ava>,
}

impl Rdn {
    pub fn new(attr: &str, value: &str) -> Self {
        Rdn {
            avas: vec![Ava::new(attr, value)],
        }
    }

    fn normalized(&self) -> String {
        let mut keys: Vec<String> = self.avas.iter().map(Ava::normalized).collect();
        // AVAs of a multi-valued RDN are unordered
        keys.sort();
        keys.join("+")
    }
}

impl FromStr for Rdn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let dn = Dn::from_str(s)?;
        match <[Rdn; 1]>::try_from(dn.rdns) {
            Ok([rdn]) => Ok(rdn),
            Err(_) => Err(Error::InvalidDn(format!("not a single RDN: {}", s))),
        }
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.attr, escape_value(&ava.value))?;
        }
        Ok(())
    }
}

/// A distinguished name; `rdns[0]` is the most specific component
#[derive(Debug, Clone, Eq)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty DN, addressing the root DSE
    pub fn root() -> Self {
        Dn { rdns: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// The first (most specific) RDN
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Everything but the first RDN; `None` for the root DSE
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// Joining an RDN to a parent DN yields a new, one-level-deeper DN.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend_from_slice(&self.rdns);
        Dn { rdns }
    }

    /// `child` from the string form of an RDN (which may itself span several levels).
    pub fn child_str(&self, rdn: &str) -> Result<Dn, Error> {
        let prefix = Dn::from_str(rdn)?;
        let mut rdns = prefix.rdns;
        rdns.extend_from_slice(&self.rdns);
        Ok(Dn { rdns })
    }

    /// True if `self` is `other` or one of its descendants.
    pub fn is_within(&self, other: &Dn) -> bool {
        if other.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - other.rdns.len();
        self.rdns[offset..]
            .iter()
            .zip(&other.rdns)
            .all(|(a, b)| a.normalized() == b.normalized())
    }

    fn normalized(&self) -> String {
        let keys: Vec<String> = self.rdns.iter().map(Rdn::normalized).collect();
        keys.join(",")
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns.len() == other.rdns.len() && self.normalized() == other.normalized()
    }
}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Ok(Dn::root());
        }
        let mut parser = DnParser::new(s);
        let mut rdns = Vec::new();
        loop {
            rdns.push(parser.rdn()?);
            match parser.peek() {
                None => break,
                Some(',') => {
                    parser.bump();
                }
                _ => return Err(parser.fail("',' between RDNs")),
            }
        }
        Ok(Dn { rdns })
    }
}

struct DnParser<'s> {
    input: &'s str,
    chars: std::iter::Peekable<std::str::Chars<'s>>,
}

impl<'s> DnParser<'s> {
    fn new(input: &'s str) -> Self {
        DnParser {
            input,
            chars: input.chars().peekable(),
        }
    }

    fn fail(&self, what: &str) -> Error {
        Error::InvalidDn(format!("{} in {:?}", what, self.input))
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next()
    }

    fn rdn(&mut self) -> Result<Rdn, Error> {
        let mut avas = vec![self.ava()?];
        while self.peek() == Some('+') {
            self.bump();
            avas.push(self.ava()?);
        }
        Ok(Rdn { avas })
    }

    fn ava(&mut self) -> Result<Ava, Error> {
        let attr = self.attribute_type()?;
        if self.bump() != Some('=') {
            return Err(self.fail("'=' after attribute type"));
        }
        let value = self.value()?;
        Ok(Ava { attr, value })
    }

    fn attribute_type(&mut self) -> Result<String, Error> {
        let mut attr = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                attr.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if attr.is_empty() {
            return Err(self.fail("attribute type"));
        }
        Ok(attr)
    }

    fn value(&mut self) -> Result<String, Error> {
        if self.peek() == Some('#') {
            // hex-encoded BER value; kept in its textual form
            let mut value = String::from("#");
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    value.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            if value.len() < 3 || value.len() % 2 == 0 {
                return Err(self.fail("hex string value"));
            }
            return Ok(value);
        }
        let mut value = String::new();
        let mut pending_spaces = 0usize;
        loop {
            match self.peek() {
                None | Some(',') | Some('+') => break,
                Some(' ') => {
                    self.bump();
                    pending_spaces += 1;
                }
                Some('\\') => {
                    self.bump();
                    // interior spaces become significant once followed by content;
                    // leading unescaped spaces are not part of the value
                    if !value.is_empty() {
                        for _ in 0..pending_spaces {
                            value.push(' ');
                        }
                    }
                    pending_spaces = 0;
                    value.push(self.escaped()?);
                }
                Some(c) => {
                    self.bump();
                    if !value.is_empty() {
                        for _ in 0..pending_spaces {
                            value.push(' ');
                        }
                    }
                    pending_spaces = 0;
                    value.push(c);
                }
            }
        }
        // trailing unescaped spaces are insignificant
        Ok(value)
    }

    fn escaped(&mut self) -> Result<char, Error> {
        match self.bump() {
            Some(c) if is_special(c) || c == ' ' || c == '#' || c == '=' => Ok(c),
            Some(hi) if hi.is_ascii_hexdigit() => match self.bump() {
                Some(lo) if lo.is_ascii_hexdigit() => {
                    let hi = hi.to_digit(16).unwrap_or(0);
                    let lo = lo.to_digit(16).unwrap_or(0);
                    // a single escaped pair must stand for an ASCII character; multibyte
                    // UTF-8 may also be written raw
                    Ok((hi * 16 + lo) as u8 as char)
                }
                _ => Err(self.fail("two hex digits after '\\'")),
            },
            _ => Err(self.fail("escapable character after '\\'")),
        }
    }
}

fn is_special(c: char) -> bool {
    matches!(c, '"' | '+' | ',' | ';' | '<' | '>' | '\\')
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.len().saturating_sub(1);
    for (i, c) in value.char_indices() {
        match c {
            c if is_special(c) => {
                out.push('\\');
                out.push(c);
            }
            ' ' if i == 0 || i == last => {
                out.push('\\');
                out.push(' ');
            }
            '#' if i == 0 => {
                out.push('\\');
                out.push('#');
            }
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render_roundtrip() {
        for s in [
            "cn=admin,dc=example,dc=org",
            "uid=jsmith,ou=People,dc=example,dc=org",
            "ou=Sales+cn=J. Smith,dc=example,dc=net",
            "cn=James \\\"Jim\\\" Smith\\, III,dc=example,dc=net",
            "",
        ] {
            let dn = Dn::from_str(s).expect(s);
            assert_eq!(dn.to_string(), s, "round-trip of {:?}", s);
            assert_eq!(Dn::from_str(&dn.to_string()).expect(s), dn);
        }
    }

    #[test]
    fn test_escaped_leading_space_and_hash() {
        let dn = Dn::from_str("cn=\\ space,dc=x").expect("parse failed");
        assert_eq!(dn.rdn().unwrap().avas[0].value, " space");
        assert_eq!(dn.to_string(), "cn=\\ space,dc=x");

        let dn = Dn::from_str("cn=\\#tag,dc=x").expect("parse failed");
        assert_eq!(dn.rdn().unwrap().avas[0].value, "#tag");
    }

    #[test]
    fn test_normalized_equality() {
        let a = Dn::from_str("CN=Admin,DC=Example,DC=Org").expect("parse failed");
        let b = Dn::from_str("cn=admin,dc=example,dc=org").expect("parse failed");
        assert_eq!(a, b);
        let c = Dn::from_str("cn=other,dc=example,dc=org").expect("parse failed");
        assert_ne!(a, c);
    }

    #[test]
    fn test_join_and_parent() {
        let base = Dn::from_str("dc=example,dc=org").expect("parse failed");
        let child = base.child(Rdn::new("cn", "foo"));
        assert_eq!(child.to_string(), "cn=foo,dc=example,dc=org");
        assert_eq!(child.parent(), Some(base.clone()));
        assert!(child.is_within(&base));
        assert!(!base.is_within(&child));
        assert!(Dn::root().parent().is_none());
    }

    #[test]
    fn test_multilevel_child_str() {
        let base = Dn::from_str("dc=example,dc=org").expect("parse failed");
        let sub = base.child_str("cn=foo,ou=bar").expect("parse failed");
        assert_eq!(sub.to_string(), "cn=foo,ou=bar,dc=example,dc=org");
    }

    #[test]
    fn test_invalid() {
        assert!(Dn::from_str("cn").is_err());
        assert!(Dn::from_str("cn=x,").is_err());
        assert!(Dn::from_str("=x").is_err());
        assert!(Rdn::from_str("cn=a,cn=b").is_err());
    }

    #[test]
    fn test_escaped_trailing_space() {
        let dn = Dn::from_str("cn=trailing\\ ,dc=x").expect("parse failed");
        assert_eq!(dn.rdn().unwrap().avas[0].value, "trailing ");
    }
}
