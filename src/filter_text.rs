//! Parsing and rendering of textual search filters
//!
//! Two concrete syntaxes produce the same [`Filter`] tree:
//!
//! - the RFC 4515 prefix form: `(&(objectClass=posixAccount)(!(memberUid=*)))`
//! - a simplified infix form: `(objectClass=posixAccount) AND NOT (memberUid=*)`
//!
//! The default "unified" mode accepts either at every subexpression position: a `(` followed by
//! `&`, `|` or `!` starts an RFC 4515 composite, anything else is read as the infix grammar (of
//! which a bare `(attr=value)` item is the degenerate case). Infix `NOT` binds tightest, then
//! `AND`, then `OR`; grouping parentheses are allowed.
//!
//! Rendering always emits the canonical RFC 4515 form.

use crate::error::Error;
use crate::filter::{
    AssertionValue, AttributeDescription, AttributeValueAssertion, Filter, MatchingRuleAssertion,
    SubstringFilter, Substring,
};
use crate::ldap::LdapString;
use std::borrow::Cow;
use std::fmt;

/// Which textual grammar to accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSyntax {
    /// RFC 4515 only
    Standard,
    /// Infix `AND`/`OR`/`NOT` over parenthesised items only
    Simple,
    /// Either form at each subexpression position
    Unified,
}

impl Default for FilterSyntax {
    fn default() -> Self {
        FilterSyntax::Unified
    }
}

/// Parse a filter string in unified mode.
pub fn parse_filter(input: &str) -> Result<Filter<'static>, Error> {
    parse_filter_with(input, FilterSyntax::Unified)
}

/// Parse a filter string with an explicit grammar selection.
pub fn parse_filter_with(input: &str, syntax: FilterSyntax) -> Result<Filter<'static>, Error> {
    let mut cursor = Cursor::new(input);
    cursor.skip_ws();
    let filter = match syntax {
        FilterSyntax::Standard => cursor.standard_filter()?,
        FilterSyntax::Simple | FilterSyntax::Unified => {
            cursor.or_expr(syntax == FilterSyntax::Unified)?
        }
    };
    cursor.skip_ws();
    if !cursor.at_end() {
        return Err(cursor.fail("end of filter"));
    }
    Ok(filter)
}

/// Render a filter tree in the canonical RFC 4515 form.
pub fn render_filter(filter: &Filter<'_>) -> String {
    let mut out = String::new();
    render_into(&mut out, filter);
    out
}

impl fmt::Display for Filter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_filter(self))
    }
}

const MAX_DEPTH: usize = 128;

struct Cursor<'s> {
    bytes: &'s [u8],
    pos: usize,
    depth: usize,
}

impl<'s> Cursor<'s> {
    fn new(input: &'s str) -> Self {
        Cursor {
            bytes: input.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn descend(&mut self) -> Result<(), Error> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.fail("shallower nesting"));
        }
        Ok(())
    }

    fn fail(&self, expected: &'static str) -> Error {
        Error::FilterSyntax {
            position: self.pos,
            expected,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, b: u8, expected: &'static str) -> Result<(), Error> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(expected))
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    /// Case-insensitive keyword match, delimited by whitespace, `(` or end of input.
    fn keyword(&mut self, kw: &str) -> bool {
        let end = self.pos + kw.len();
        if end > self.bytes.len() {
            return false;
        }
        let candidate = &self.bytes[self.pos..end];
        if !candidate.eq_ignore_ascii_case(kw.as_bytes()) {
            return false;
        }
        match self.bytes.get(end) {
            None | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') | Some(b'(') => {
                self.pos = end;
                true
            }
            _ => false,
        }
    }

    // ---- infix grammar ----

    fn or_expr(&mut self, unified: bool) -> Result<Filter<'static>, Error> {
        let mut operands = vec![self.and_expr(unified)?];
        loop {
            self.skip_ws();
            if !self.keyword("OR") {
                break;
            }
            self.skip_ws();
            operands.push(self.and_expr(unified)?);
        }
        Ok(if operands.len() == 1 {
            operands.swap_remove(0)
        } else {
            Filter::Or(operands)
        })
    }

    fn and_expr(&mut self, unified: bool) -> Result<Filter<'static>, Error> {
        let mut operands = vec![self.unary_expr(unified)?];
        loop {
            self.skip_ws();
            if !self.keyword("AND") {
                break;
            }
            self.skip_ws();
            operands.push(self.unary_expr(unified)?);
        }
        Ok(if operands.len() == 1 {
            operands.swap_remove(0)
        } else {
            Filter::And(operands)
        })
    }

    fn unary_expr(&mut self, unified: bool) -> Result<Filter<'static>, Error> {
        self.skip_ws();
        if self.keyword("NOT") {
            self.skip_ws();
            self.descend()?;
            let inner = self.unary_expr(unified);
            self.depth -= 1;
            return Ok(Filter::Not(Box::new(inner?)));
        }
        self.primary(unified)
    }

    fn primary(&mut self, unified: bool) -> Result<Filter<'static>, Error> {
        self.descend()?;
        let filter = self.primary_inner(unified);
        self.depth -= 1;
        filter
    }

    fn primary_inner(&mut self, unified: bool) -> Result<Filter<'static>, Error> {
        self.expect(b'(', "opening parenthesis")?;
        match self.peek() {
            Some(b'&') | Some(b'|') | Some(b'!') if unified => {
                let filter = self.composite()?;
                self.expect(b')', "closing parenthesis")?;
                Ok(filter)
            }
            Some(b'(') | Some(b' ') | Some(b'\t') => {
                // grouping parentheses around a nested infix expression
                self.skip_ws();
                let filter = self.or_expr(unified)?;
                self.skip_ws();
                self.expect(b')', "closing parenthesis")?;
                Ok(filter)
            }
            _ => {
                let save = self.pos;
                match self.item() {
                    Ok(filter) => {
                        self.expect(b')', "closing parenthesis")?;
                        Ok(filter)
                    }
                    Err(item_err) => {
                        // grouping whose first token is a keyword, e.g. "(NOT (a=1))"
                        self.pos = save;
                        let filter = self.or_expr(unified).map_err(|_| item_err)?;
                        self.skip_ws();
                        self.expect(b')', "closing parenthesis")?;
                        Ok(filter)
                    }
                }
            }
        }
    }

    // ---- RFC 4515 grammar ----

    fn standard_filter(&mut self) -> Result<Filter<'static>, Error> {
        self.descend()?;
        let result = self.standard_filter_inner();
        self.depth -= 1;
        result
    }

    fn standard_filter_inner(&mut self) -> Result<Filter<'static>, Error> {
        self.expect(b'(', "opening parenthesis")?;
        let filter = match self.peek() {
            Some(b'&') | Some(b'|') | Some(b'!') => self.composite()?,
            _ => self.item()?,
        };
        self.expect(b')', "closing parenthesis")?;
        Ok(filter)
    }

    /// Called after `(` with `&`, `|` or `!` pending.
    fn composite(&mut self) -> Result<Filter<'static>, Error> {
        match self.bump() {
            Some(b'&') => Ok(Filter::And(self.filter_list()?)),
            Some(b'|') => Ok(Filter::Or(self.filter_list()?)),
            Some(b'!') => Ok(Filter::Not(Box::new(self.standard_filter()?))),
            _ => Err(self.fail("filter composite")),
        }
    }

    fn filter_list(&mut self) -> Result<Vec<Filter<'static>>, Error> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.standard_filter()?);
        }
        if filters.is_empty() {
            return Err(self.fail("at least one filter"));
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<Filter<'static>, Error> {
        let attr = self.attribute_description()?;
        match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                self.equality_or_substring(attr)
            }
            Some(b'>') => {
                self.pos += 1;
                self.expect(b'=', "'=' after '>'")?;
                Ok(Filter::GreaterOrEqual(self.ava(attr)?))
            }
            Some(b'<') => {
                self.pos += 1;
                self.expect(b'=', "'=' after '<'")?;
                Ok(Filter::LessOrEqual(self.ava(attr)?))
            }
            Some(b'~') => {
                self.pos += 1;
                self.expect(b'=', "'=' after '~'")?;
                Ok(Filter::ApproxMatch(self.ava(attr)?))
            }
            Some(b':') => self.extensible(attr),
            _ => Err(self.fail("filter operator")),
        }
    }

    fn attribute_description(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b';' {
                self.pos += 1;
            } else {
                break;
            }
        }
        // always valid UTF-8: the accepted set is ASCII
        let s = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.fail("attribute description"))?;
        Ok(s.to_string())
    }

    fn ava(&mut self, attr: String) -> Result<AttributeValueAssertion<'static>, Error> {
        let value = self.value_until_paren(false)?;
        match value {
            ValueChunks::Plain(bytes) => Ok(AttributeValueAssertion {
                attribute_desc: LdapString(Cow::Owned(attr)),
                assertion_value: Cow::Owned(bytes),
            }),
            ValueChunks::Starred(_) => Err(self.fail("value without wildcard")),
        }
    }

    fn equality_or_substring(&mut self, attr: String) -> Result<Filter<'static>, Error> {
        if attr.is_empty() {
            return Err(self.fail("attribute description"));
        }
        match self.value_until_paren(true)? {
            ValueChunks::Plain(bytes) => Ok(Filter::EqualityMatch(AttributeValueAssertion {
                attribute_desc: LdapString(Cow::Owned(attr)),
                assertion_value: Cow::Owned(bytes),
            })),
            ValueChunks::Starred(segments) => {
                if segments.len() == 2 && segments.iter().all(Vec::is_empty) {
                    // "(attr=*)"
                    return Ok(Filter::Present(LdapString(Cow::Owned(attr))));
                }
                let last = segments.len() - 1;
                let mut substrings = Vec::new();
                for (idx, segment) in segments.into_iter().enumerate() {
                    if segment.is_empty() {
                        if idx != 0 && idx != last {
                            return Err(self.fail("non-empty substring"));
                        }
                        continue;
                    }
                    let value = AssertionValue(Cow::Owned(segment));
                    substrings.push(if idx == 0 {
                        Substring::Initial(value)
                    } else if idx == last {
                        Substring::Final(value)
                    } else {
                        Substring::Any(value)
                    });
                }
                Ok(Filter::Substrings(SubstringFilter {
                    filter_type: LdapString(Cow::Owned(attr)),
                    substrings,
                }))
            }
        }
    }

    // attr [":dn"] [":" matchingrule] ":=" assertionvalue
    fn extensible(&mut self, attr: String) -> Result<Filter<'static>, Error> {
        let mut dn_attributes = None;
        let mut matching_rule = None;
        loop {
            self.expect(b':', "':'")?;
            if self.peek() == Some(b'=') {
                self.pos += 1;
                break;
            }
            let word = self.attribute_description()?;
            if word.is_empty() {
                return Err(self.fail("matching rule or 'dn'"));
            }
            if word.eq_ignore_ascii_case("dn") && dn_attributes.is_none() {
                dn_attributes = Some(true);
            } else if matching_rule.is_none() {
                matching_rule = Some(word);
            } else {
                return Err(self.fail("':=' after matching rule"));
            }
        }
        if attr.is_empty() && matching_rule.is_none() {
            return Err(self.fail("attribute or matching rule"));
        }
        let value = match self.value_until_paren(false)? {
            ValueChunks::Plain(bytes) => bytes,
            ValueChunks::Starred(_) => return Err(self.fail("value without wildcard")),
        };
        Ok(Filter::ExtensibleMatch(MatchingRuleAssertion {
            matching_rule: matching_rule.map(|r| LdapString(Cow::Owned(r))),
            rule_type: if attr.is_empty() {
                None
            } else {
                Some(AttributeDescription(Cow::Owned(attr)))
            },
            assertion_value: AssertionValue(Cow::Owned(value)),
            dn_attributes,
        }))
    }

    /// Read an assertion value up to the closing `)`, decoding RFC 4515 `\xx` escapes. When
    /// `allow_star` is set, unescaped `*` characters split the value into substring segments.
    fn value_until_paren(&mut self, allow_star: bool) -> Result<ValueChunks, Error> {
        let mut segments: Vec<Vec<u8>> = vec![Vec::new()];
        let mut starred = false;
        loop {
            match self.peek() {
                None | Some(b')') => break,
                Some(b'(') => return Err(self.fail("escaped '('")),
                Some(b'*') => {
                    if !allow_star {
                        return Err(self.fail("escaped '*'"));
                    }
                    self.pos += 1;
                    starred = true;
                    segments.push(Vec::new());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let hi = self.bump().ok_or_else(|| self.fail("two hex digits"))?;
                    let lo = self.bump().ok_or_else(|| self.fail("two hex digits"))?;
                    let hi = (hi as char).to_digit(16);
                    let lo = (lo as char).to_digit(16);
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => {
                            if let Some(segment) = segments.last_mut() {
                                segment.push((hi * 16 + lo) as u8);
                            }
                        }
                        _ => return Err(self.fail("two hex digits")),
                    }
                }
                Some(b) => {
                    self.pos += 1;
                    if let Some(segment) = segments.last_mut() {
                        segment.push(b);
                    }
                }
            }
        }
        if starred {
            Ok(ValueChunks::Starred(segments))
        } else {
            Ok(ValueChunks::Plain(segments.swap_remove(0)))
        }
    }
}

enum ValueChunks {
    Plain(Vec<u8>),
    Starred(Vec<Vec<u8>>),
}

fn render_into(out: &mut String, filter: &Filter<'_>) {
    match filter {
        Filter::And(filters) => {
            out.push_str("(&");
            for f in filters {
                render_into(out, f);
            }
            out.push(')');
        }
        Filter::Or(filters) => {
            out.push_str("(|");
            for f in filters {
                render_into(out, f);
            }
            out.push(')');
        }
        Filter::Not(f) => {
            out.push_str("(!");
            render_into(out, f);
            out.push(')');
        }
        Filter::EqualityMatch(ava) => render_ava(out, ava, "="),
        Filter::GreaterOrEqual(ava) => render_ava(out, ava, ">="),
        Filter::LessOrEqual(ava) => render_ava(out, ava, "<="),
        Filter::ApproxMatch(ava) => render_ava(out, ava, "~="),
        Filter::Present(attr) => {
            out.push('(');
            out.push_str(&attr.0);
            out.push_str("=*)");
        }
        Filter::Substrings(sf) => {
            out.push('(');
            out.push_str(&sf.filter_type.0);
            out.push('=');
            let mut initial = None;
            let mut any = Vec::new();
            let mut final_ = None;
            for sub in &sf.substrings {
                match sub {
                    Substring::Initial(v) => initial = Some(&v.0),
                    Substring::Any(v) => any.push(&v.0),
                    Substring::Final(v) => final_ = Some(&v.0),
                }
            }
            if let Some(v) = initial {
                escape_value(out, v);
            }
            out.push('*');
            for v in any {
                escape_value(out, v);
                out.push('*');
            }
            if let Some(v) = final_ {
                escape_value(out, v);
            }
            out.push(')');
        }
        Filter::ExtensibleMatch(mra) => {
            out.push('(');
            if let Some(rule_type) = &mra.rule_type {
                out.push_str(&rule_type.0);
            }
            if mra.dn_attributes == Some(true) {
                out.push_str(":dn");
            }
            if let Some(rule) = &mra.matching_rule {
                out.push(':');
                out.push_str(&rule.0);
            }
            out.push_str(":=");
            escape_value(out, &mra.assertion_value.0);
            out.push(')');
        }
    }
}

fn render_ava(out: &mut String, ava: &AttributeValueAssertion<'_>, op: &str) {
    out.push('(');
    out.push_str(&ava.attribute_desc.0);
    out.push_str(op);
    escape_value(out, &ava.assertion_value);
    out.push(')');
}

/// Escape a value for the textual form: `*`, `(`, `)`, `\`, NUL and non-UTF-8 bytes become
/// `\xx` hex pairs, everything else is passed through.
fn escape_value(out: &mut String, bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                push_escaped_str(out, s);
                return;
            }
            Err(e) => {
                let (valid, invalid) = rest.split_at(e.valid_up_to());
                if let Ok(s) = std::str::from_utf8(valid) {
                    push_escaped_str(out, s);
                }
                let skip = e.error_len().unwrap_or(invalid.len());
                for &b in &invalid[..skip] {
                    push_hex(out, b);
                }
                rest = &invalid[skip..];
            }
        }
    }
}

fn push_escaped_str(out: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '*' | '(' | ')' | '\\' | '\0' => push_hex(out, ch as u8),
            _ => out.push(ch),
        }
    }
}

fn push_hex(out: &mut String, b: u8) {
    out.push('\\');
    let hex = b"0123456789abcdef";
    out.push(hex[(b >> 4) as usize] as char);
    out.push(hex[(b & 0x0f) as usize] as char);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &str) {
        let parsed = parse_filter_with(s, FilterSyntax::Standard).expect(s);
        assert_eq!(render_filter(&parsed), s, "canonical form of {}", s);
        let reparsed = parse_filter_with(&render_filter(&parsed), FilterSyntax::Standard)
            .expect("re-parse failed");
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn test_standard_roundtrip() {
        roundtrip("(cn=Babs Jensen)");
        roundtrip("(!(cn=Tim Howes))");
        roundtrip("(&(objectClass=Person)(|(sn=Jensen)(cn=Babs J*)))");
        roundtrip("(o=univ*of*mich*)");
        roundtrip("(cn=*end)");
        roundtrip("(seeAlso=)");
        roundtrip("(gidNumber<=1000)");
        roundtrip("(uidNumber>=500)");
        roundtrip("(sn~=jensen)");
        roundtrip("(memberUid=*)");
    }

    #[test]
    fn test_escapes() {
        let f = parse_filter("(cn=Parens R Us \\28for all your parenthetical needs\\29)")
            .expect("parse failed");
        match &f {
            Filter::EqualityMatch(ava) => assert_eq!(
                ava.assertion_value.as_ref(),
                b"Parens R Us (for all your parenthetical needs)"
            ),
            other => panic!("unexpected filter {:?}", other),
        }
        // the canonical renderer lowercases hex and keeps only the mandatory escapes
        assert_eq!(
            render_filter(&f),
            "(cn=Parens R Us \\28for all your parenthetical needs\\29)"
        );

        let f = parse_filter("(cn=star \\2a)").expect("parse failed");
        match &f {
            Filter::EqualityMatch(ava) => {
                assert_eq!(ava.assertion_value.as_ref(), b"star *")
            }
            other => panic!("unexpected filter {:?}", other),
        }
    }

    #[test]
    fn test_substring_segments() {
        let f = parse_filter("(cn=ab*cd*ef)").expect("parse failed");
        match &f {
            Filter::Substrings(sf) => {
                assert_eq!(sf.substrings.len(), 3);
                assert!(matches!(&sf.substrings[0], Substring::Initial(v) if v.0.as_ref() == b"ab"));
                assert!(matches!(&sf.substrings[1], Substring::Any(v) if v.0.as_ref() == b"cd"));
                assert!(matches!(&sf.substrings[2], Substring::Final(v) if v.0.as_ref() == b"ef"));
            }
            other => panic!("unexpected filter {:?}", other),
        }
        assert_eq!(render_filter(&f), "(cn=ab*cd*ef)");
    }

    #[test]
    fn test_extensible() {
        roundtrip("(cn:caseExactMatch:=Fred Flintstone)");
        roundtrip("(sn:dn:2.4.6.8.10:=Barney Rubble)");
        roundtrip("(:dn:2.4.6.8.10:=Dino)");
        roundtrip("(o:dn:=Ace Industry)");
    }

    #[test]
    fn test_simple_infix() {
        let unified =
            parse_filter("(gidNumber<=1000) AND NOT (memberUid=*)").expect("parse failed");
        assert_eq!(
            render_filter(&unified),
            "(&(gidNumber<=1000)(!(memberUid=*)))"
        );
        let simple = parse_filter_with(
            "(gidNumber<=1000) AND NOT (memberUid=*)",
            FilterSyntax::Simple,
        )
        .expect("parse failed");
        assert_eq!(unified, simple);
        // re-parsing the canonical render yields the same tree
        let reparsed = parse_filter(&render_filter(&unified)).expect("re-parse failed");
        assert_eq!(reparsed, unified);
    }

    #[test]
    fn test_infix_precedence() {
        // NOT binds tightest, then AND, then OR
        let f = parse_filter("(a=1) OR (b=2) AND NOT (c=3)").expect("parse failed");
        assert_eq!(render_filter(&f), "(|(a=1)(&(b=2)(!(c=3))))");

        let grouped = parse_filter("((a=1) OR (b=2)) AND (c=3)").expect("parse failed");
        assert_eq!(render_filter(&grouped), "(&(|(a=1)(b=2))(c=3))");
    }

    #[test]
    fn test_unified_matches_standard() {
        for s in [
            "(&(objectClass=Person)(sn=Jensen))",
            "(|(a=1)(b=2))",
            "(!(cn=x))",
            "(cn=Babs J*)",
        ] {
            assert_eq!(
                parse_filter(s).expect(s),
                parse_filter_with(s, FilterSyntax::Standard).expect(s)
            );
        }
    }

    #[test]
    fn test_standard_rejects_infix() {
        assert!(parse_filter_with("(a=1) AND (b=2)", FilterSyntax::Standard).is_err());
    }

    #[test]
    fn test_simple_rejects_composite() {
        assert!(parse_filter_with("(&(a=1)(b=2))", FilterSyntax::Simple).is_err());
    }

    #[test]
    fn test_error_position() {
        match parse_filter("(cn=x") {
            Err(Error::FilterSyntax { position, .. }) => assert_eq!(position, 5),
            other => panic!("unexpected result {:?}", other),
        }
        match parse_filter("cn=x") {
            Err(Error::FilterSyntax { position, .. }) => assert_eq!(position, 0),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_bad_escape() {
        assert!(parse_filter("(cn=ab\\zz)").is_err());
        assert!(parse_filter("(cn=trailing\\2)").is_err());
    }
}
