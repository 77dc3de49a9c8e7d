//! Definition for types used in LDAP filters

use crate::ldap::LdapString;
use std::borrow::Cow;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Filter<'a> {
    And(Vec<Filter<'a>>),
    Or(Vec<Filter<'a>>),
    Not(Box<Filter<'a>>),
    EqualityMatch(AttributeValueAssertion<'a>),
    Substrings(SubstringFilter<'a>),
    GreaterOrEqual(AttributeValueAssertion<'a>),
    LessOrEqual(AttributeValueAssertion<'a>),
    Present(LdapString<'a>),
    ApproxMatch(AttributeValueAssertion<'a>),
    ExtensibleMatch(MatchingRuleAssertion<'a>),
}

impl<'a> Filter<'a> {
    /// Equality filter over a UTF-8 assertion value
    pub fn equality(attr: &'a str, value: &'a str) -> Self {
        Filter::EqualityMatch(AttributeValueAssertion {
            attribute_desc: LdapString(Cow::Borrowed(attr)),
            assertion_value: Cow::Borrowed(value.as_bytes()),
        })
    }

    /// Presence filter (`(attr=*)`)
    pub fn present(attr: &'a str) -> Self {
        Filter::Present(LdapString(Cow::Borrowed(attr)))
    }

    pub fn and(filters: Vec<Filter<'a>>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter<'a>>) -> Self {
        Filter::Or(filters)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter<'a>) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn to_static(&self) -> Filter<'static> {
        match self {
            Filter::And(fs) => Filter::And(fs.iter().map(Filter::to_static).collect()),
            Filter::Or(fs) => Filter::Or(fs.iter().map(Filter::to_static).collect()),
            Filter::Not(f) => Filter::Not(Box::new(f.to_static())),
            Filter::EqualityMatch(a) => Filter::EqualityMatch(a.to_static()),
            Filter::Substrings(s) => Filter::Substrings(s.to_static()),
            Filter::GreaterOrEqual(a) => Filter::GreaterOrEqual(a.to_static()),
            Filter::LessOrEqual(a) => Filter::LessOrEqual(a.to_static()),
            Filter::Present(s) => Filter::Present(s.to_static()),
            Filter::ApproxMatch(a) => Filter::ApproxMatch(a.to_static()),
            Filter::ExtensibleMatch(m) => Filter::ExtensibleMatch(m.to_static()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartialAttribute<'a> {
    pub attr_type: LdapString<'a>,
    pub attr_vals: Vec<AttributeValue<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute<'a> {
    pub attr_type: LdapString<'a>,
    pub attr_vals: Vec<AttributeValue<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValueAssertion<'a> {
    pub attribute_desc: LdapString<'a>,
    pub assertion_value: Cow<'a, [u8]>,
}

impl AttributeValueAssertion<'_> {
    pub fn to_static(&self) -> AttributeValueAssertion<'static> {
        AttributeValueAssertion {
            attribute_desc: self.attribute_desc.to_static(),
            assertion_value: Cow::Owned(self.assertion_value.clone().into_owned()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeDescription<'a>(pub Cow<'a, str>);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MatchingRuleAssertion<'a> {
    pub matching_rule: Option<LdapString<'a>>,
    pub rule_type: Option<AttributeDescription<'a>>,
    pub assertion_value: AssertionValue<'a>,
    pub dn_attributes: Option<bool>,
}

impl MatchingRuleAssertion<'_> {
    pub fn to_static(&self) -> MatchingRuleAssertion<'static> {
        MatchingRuleAssertion {
            matching_rule: self.matching_rule.as_ref().map(LdapString::to_static),
            rule_type: self
                .rule_type
                .as_ref()
                .map(|d| AttributeDescription(Cow::Owned(d.0.clone().into_owned()))),
            assertion_value: self.assertion_value.to_static(),
            dn_attributes: self.dn_attributes,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MatchingRuleId<'a>(pub Cow<'a, str>);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubstringFilter<'a> {
    pub filter_type: LdapString<'a>,
    pub substrings: Vec<Substring<'a>>,
}

impl SubstringFilter<'_> {
    pub fn to_static(&self) -> SubstringFilter<'static> {
        SubstringFilter {
            filter_type: self.filter_type.to_static(),
            substrings: self
                .substrings
                .iter()
                .map(|s| match s {
                    Substring::Initial(v) => Substring::Initial(v.to_static()),
                    Substring::Any(v) => Substring::Any(v.to_static()),
                    Substring::Final(v) => Substring::Final(v.to_static()),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Substring<'a> {
    Initial(AssertionValue<'a>),
    Any(AssertionValue<'a>),
    Final(AssertionValue<'a>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssertionValue<'a>(pub Cow<'a, [u8]>);

impl AssertionValue<'_> {
    pub fn to_static(&self) -> AssertionValue<'static> {
        AssertionValue(Cow::Owned(self.0.clone().into_owned()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValue<'a>(pub Cow<'a, [u8]>);
