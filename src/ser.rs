// DEFINITIONS
// IMPLICIT TAGS
// EXTENSIBILITY IMPLIED

use crate::ber::{self, BerWriter};
use crate::filter::*;
use crate::ldap::*;

/// BER serialisation of a protocol element.
///
/// Mirrors the `FromBer` implementations in `parser`: every item is written with the exact
/// RFC 4511 wire tags, definite minimal lengths only. Encoding cannot fail; all constraints
/// (UTF-8 strings, tag ranges) are enforced by construction of the model types.
pub trait ToBer {
    fn to_ber(&self, w: &mut BerWriter);
}

/// Serialise a complete message into a fresh buffer.
pub fn encode_message(msg: &LdapMessage<'_>) -> Vec<u8> {
    let mut w = BerWriter::with_capacity(128);
    msg.to_ber(&mut w);
    w.into_bytes()
}

// LDAPMessage ::= SEQUENCE {
//      messageID       MessageID,
//      protocolOp      CHOICE { ... },
//      controls       [0] Controls OPTIONAL }
impl ToBer for LdapMessage<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::TAG_SEQUENCE, |w| {
            w.write_integer(i64::from(self.message_id.0));
            self.protocol_op.to_ber(w);
            if let Some(controls) = &self.controls {
                w.constructed(ber::context(0), |w| {
                    for control in controls {
                        control.to_ber(w);
                    }
                });
            }
        });
    }
}

impl ToBer for ProtocolOp<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        match self {
            ProtocolOp::BindRequest(r) => r.to_ber(w),
            ProtocolOp::BindResponse(r) => r.to_ber(w),
            // UnbindRequest ::= [APPLICATION 2] NULL
            ProtocolOp::UnbindRequest => w.primitive(ber::application_primitive(2), &[]),
            ProtocolOp::SearchRequest(r) => r.to_ber(w),
            ProtocolOp::SearchResultEntry(r) => r.to_ber(w),
            // SearchResultDone ::= [APPLICATION 5] LDAPResult
            ProtocolOp::SearchResultDone(r) => {
                w.constructed(ber::application(5), |w| write_ldap_result(w, r))
            }
            // SearchResultReference ::= [APPLICATION 19] SEQUENCE SIZE (1..MAX) OF uri URI
            ProtocolOp::SearchResultReference(uris) => w.constructed(ber::application(19), |w| {
                for uri in uris {
                    w.write_str(&uri.0);
                }
            }),
            ProtocolOp::ModifyRequest(r) => r.to_ber(w),
            // ModifyResponse ::= [APPLICATION 7] LDAPResult
            ProtocolOp::ModifyResponse(r) => {
                w.constructed(ber::application(7), |w| write_ldap_result(w, &r.result))
            }
            ProtocolOp::AddRequest(r) => r.to_ber(w),
            // AddResponse ::= [APPLICATION 9] LDAPResult
            ProtocolOp::AddResponse(r) => {
                w.constructed(ber::application(9), |w| write_ldap_result(w, r))
            }
            // DelRequest ::= [APPLICATION 10] LDAPDN
            ProtocolOp::DelRequest(dn) => {
                w.primitive(ber::application_primitive(10), dn.0.as_bytes())
            }
            // DelResponse ::= [APPLICATION 11] LDAPResult
            ProtocolOp::DelResponse(r) => {
                w.constructed(ber::application(11), |w| write_ldap_result(w, r))
            }
            ProtocolOp::ModDnRequest(r) => r.to_ber(w),
            // ModifyDNResponse ::= [APPLICATION 13] LDAPResult
            ProtocolOp::ModDnResponse(r) => {
                w.constructed(ber::application(13), |w| write_ldap_result(w, r))
            }
            ProtocolOp::CompareRequest(r) => r.to_ber(w),
            // CompareResponse ::= [APPLICATION 15] LDAPResult
            ProtocolOp::CompareResponse(r) => {
                w.constructed(ber::application(15), |w| write_ldap_result(w, r))
            }
            // AbandonRequest ::= [APPLICATION 16] MessageID
            ProtocolOp::AbandonRequest(id) => {
                w.write_integer_tagged(ber::application_primitive(16), i64::from(id.0))
            }
            ProtocolOp::ExtendedRequest(r) => r.to_ber(w),
            ProtocolOp::ExtendedResponse(r) => r.to_ber(w),
            ProtocolOp::IntermediateResponse(r) => r.to_ber(w),
        }
    }
}

// LDAPResult ::= SEQUENCE {
//      resultCode         ENUMERATED { ... },
//      matchedDN          LDAPDN,
//      diagnosticMessage  LDAPString,
//      referral           [3] Referral OPTIONAL }
fn write_ldap_result(w: &mut BerWriter, r: &LdapResult<'_>) {
    w.write_enumerated(r.result_code.0);
    w.write_str(&r.matched_dn.0);
    w.write_str(&r.diagnostic_message.0);
    if let Some(referral) = &r.referral {
        w.constructed(ber::context(3), |w| {
            for uri in referral {
                w.write_str(&uri.0);
            }
        });
    }
}

// BindRequest ::= [APPLICATION 0] SEQUENCE {
//      version                 INTEGER (1 ..  127),
//      name                    LDAPDN,
//      authentication          AuthenticationChoice }
impl ToBer for BindRequest<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(0), |w| {
            w.write_integer(i64::from(self.version));
            w.write_str(&self.name.0);
            match &self.authentication {
                // simple [0] OCTET STRING
                AuthenticationChoice::Simple(password) => {
                    w.primitive(ber::context_primitive(0), password)
                }
                // sasl [3] SaslCredentials
                AuthenticationChoice::Sasl(creds) => w.constructed(ber::context(3), |w| {
                    w.write_str(&creds.mechanism.0);
                    if let Some(credentials) = &creds.credentials {
                        w.write_octet_string(credentials);
                    }
                }),
            }
        });
    }
}

// BindResponse ::= [APPLICATION 1] SEQUENCE {
//      COMPONENTS OF LDAPResult,
//      serverSaslCreds    [7] OCTET STRING OPTIONAL }
impl ToBer for BindResponse<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(1), |w| {
            write_ldap_result(w, &self.result);
            if let Some(creds) = &self.server_sasl_creds {
                w.primitive(ber::context_primitive(7), creds);
            }
        });
    }
}

// SearchRequest ::= [APPLICATION 3] SEQUENCE {
//      baseObject      LDAPDN,
//      scope           ENUMERATED,
//      derefAliases    ENUMERATED,
//      sizeLimit       INTEGER (0 ..  maxInt),
//      timeLimit       INTEGER (0 ..  maxInt),
//      typesOnly       BOOLEAN,
//      filter          Filter,
//      attributes      AttributeSelection }
impl ToBer for SearchRequest<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(3), |w| {
            w.write_str(&self.base_object.0);
            w.write_enumerated(self.scope.0);
            w.write_enumerated(self.deref_aliases.0);
            w.write_integer(i64::from(self.size_limit));
            w.write_integer(i64::from(self.time_limit));
            w.write_bool(self.types_only);
            self.filter.to_ber(w);
            w.constructed(ber::TAG_SEQUENCE, |w| {
                for attr in &self.attributes {
                    w.write_str(&attr.0);
                }
            });
        });
    }
}

// SearchResultEntry ::= [APPLICATION 4] SEQUENCE {
//     objectName      LDAPDN,
//     attributes      PartialAttributeList }
impl ToBer for SearchResultEntry<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(4), |w| {
            w.write_str(&self.object_name.0);
            w.constructed(ber::TAG_SEQUENCE, |w| {
                for attr in &self.attributes {
                    attr.to_ber(w);
                }
            });
        });
    }
}

// PartialAttribute ::= SEQUENCE {
//      type       AttributeDescription,
//      vals       SET OF value AttributeValue }
impl ToBer for PartialAttribute<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::TAG_SEQUENCE, |w| {
            w.write_str(&self.attr_type.0);
            w.constructed(ber::TAG_SET, |w| {
                for val in &self.attr_vals {
                    w.write_octet_string(&val.0);
                }
            });
        });
    }
}

// Attribute ::= PartialAttribute(WITH COMPONENTS { ..., vals (SIZE(1..MAX))})
impl ToBer for Attribute<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::TAG_SEQUENCE, |w| {
            w.write_str(&self.attr_type.0);
            w.constructed(ber::TAG_SET, |w| {
                for val in &self.attr_vals {
                    w.write_octet_string(&val.0);
                }
            });
        });
    }
}

// ModifyRequest ::= [APPLICATION 6] SEQUENCE {
//     object          LDAPDN,
//     changes         SEQUENCE OF change SEQUENCE {
//          operation       ENUMERATED,
//          modification    PartialAttribute } }
impl ToBer for ModifyRequest<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(6), |w| {
            w.write_str(&self.object.0);
            w.constructed(ber::TAG_SEQUENCE, |w| {
                for change in &self.changes {
                    w.constructed(ber::TAG_SEQUENCE, |w| {
                        w.write_enumerated(change.operation.0);
                        change.modification.to_ber(w);
                    });
                }
            });
        });
    }
}

// AddRequest ::= [APPLICATION 8] SEQUENCE {
//     entry           LDAPDN,
//     attributes      AttributeList }
impl ToBer for AddRequest<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(8), |w| {
            w.write_str(&self.entry.0);
            w.constructed(ber::TAG_SEQUENCE, |w| {
                for attr in &self.attributes {
                    attr.to_ber(w);
                }
            });
        });
    }
}

// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE {
//     entry           LDAPDN,
//     newrdn          RelativeLDAPDN,
//     deleteoldrdn    BOOLEAN,
//     newSuperior     [0] LDAPDN OPTIONAL }
impl ToBer for ModDnRequest<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(12), |w| {
            w.write_str(&self.entry.0);
            w.write_str(&self.newrdn.0);
            w.write_bool(self.deleteoldrdn);
            if let Some(superior) = &self.newsuperior {
                w.primitive(ber::context_primitive(0), superior.0.as_bytes());
            }
        });
    }
}

// CompareRequest ::= [APPLICATION 14] SEQUENCE {
//     entry           LDAPDN,
//     ava             AttributeValueAssertion }
impl ToBer for CompareRequest<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(14), |w| {
            w.write_str(&self.entry.0);
            w.constructed(ber::TAG_SEQUENCE, |w| {
                w.write_str(&self.ava.attribute_desc.0);
                w.write_octet_string(&self.ava.assertion_value);
            });
        });
    }
}

// ExtendedRequest ::= [APPLICATION 23] SEQUENCE {
//     requestName      [0] LDAPOID,
//     requestValue     [1] OCTET STRING OPTIONAL }
impl ToBer for ExtendedRequest<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(23), |w| {
            w.primitive(ber::context_primitive(0), self.request_name.0.as_bytes());
            if let Some(value) = &self.request_value {
                w.primitive(ber::context_primitive(1), value);
            }
        });
    }
}

// ExtendedResponse ::= [APPLICATION 24] SEQUENCE {
//     COMPONENTS OF LDAPResult,
//     responseName     [10] LDAPOID OPTIONAL,
//     responseValue    [11] OCTET STRING OPTIONAL }
impl ToBer for ExtendedResponse<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(24), |w| {
            write_ldap_result(w, &self.result);
            if let Some(name) = &self.response_name {
                w.primitive(ber::context_primitive(10), name.0.as_bytes());
            }
            if let Some(value) = &self.response_value {
                w.primitive(ber::context_primitive(11), value);
            }
        });
    }
}

// IntermediateResponse ::= [APPLICATION 25] SEQUENCE {
//      responseName     [0] LDAPOID OPTIONAL,
//      responseValue    [1] OCTET STRING OPTIONAL }
impl ToBer for IntermediateResponse<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::application(25), |w| {
            if let Some(name) = &self.response_name {
                w.primitive(ber::context_primitive(0), name.0.as_bytes());
            }
            if let Some(value) = &self.response_value {
                w.primitive(ber::context_primitive(1), value);
            }
        });
    }
}

// Filter ::= CHOICE {
//     and             [0] SET SIZE (1..MAX) OF filter Filter,
//     or              [1] SET SIZE (1..MAX) OF filter Filter,
//     not             [2] Filter,
//     equalityMatch   [3] AttributeValueAssertion,
//     substrings      [4] SubstringFilter,
//     greaterOrEqual  [5] AttributeValueAssertion,
//     lessOrEqual     [6] AttributeValueAssertion,
//     present         [7] AttributeDescription,
//     approxMatch     [8] AttributeValueAssertion,
//     extensibleMatch [9] MatchingRuleAssertion }
impl ToBer for Filter<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        match self {
            Filter::And(filters) => w.constructed(ber::context(0), |w| {
                for f in filters {
                    f.to_ber(w);
                }
            }),
            Filter::Or(filters) => w.constructed(ber::context(1), |w| {
                for f in filters {
                    f.to_ber(w);
                }
            }),
            Filter::Not(f) => w.constructed(ber::context(2), |w| f.to_ber(w)),
            Filter::EqualityMatch(ava) => write_ava(w, 3, ava),
            Filter::Substrings(sf) => sf.to_ber(w),
            Filter::GreaterOrEqual(ava) => write_ava(w, 5, ava),
            Filter::LessOrEqual(ava) => write_ava(w, 6, ava),
            Filter::Present(attr) => w.primitive(ber::context_primitive(7), attr.0.as_bytes()),
            Filter::ApproxMatch(ava) => write_ava(w, 8, ava),
            Filter::ExtensibleMatch(mra) => mra.to_ber(w),
        }
    }
}

// AttributeValueAssertion ::= SEQUENCE {
//      attributeDesc   AttributeDescription,
//      assertionValue  AssertionValue }
fn write_ava(w: &mut BerWriter, tag: u32, ava: &AttributeValueAssertion<'_>) {
    w.constructed(ber::context(tag), |w| {
        w.write_str(&ava.attribute_desc.0);
        w.write_octet_string(&ava.assertion_value);
    });
}

// SubstringFilter ::= SEQUENCE {
//      type           AttributeDescription,
//      substrings     SEQUENCE SIZE (1..MAX) OF substring CHOICE {
//           initial [0] AssertionValue,  -- can occur at most once
//           any     [1] AssertionValue,
//           final   [2] AssertionValue } -- can occur at most once
//      }
impl ToBer for SubstringFilter<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::context(4), |w| {
            w.write_str(&self.filter_type.0);
            w.constructed(ber::TAG_SEQUENCE, |w| {
                for sub in &self.substrings {
                    match sub {
                        Substring::Initial(v) => w.primitive(ber::context_primitive(0), &v.0),
                        Substring::Any(v) => w.primitive(ber::context_primitive(1), &v.0),
                        Substring::Final(v) => w.primitive(ber::context_primitive(2), &v.0),
                    }
                }
            });
        });
    }
}

// MatchingRuleAssertion ::= SEQUENCE {
//     matchingRule    [1] MatchingRuleId OPTIONAL,
//     type            [2] AttributeDescription OPTIONAL,
//     matchValue      [3] AssertionValue,
//     dnAttributes    [4] BOOLEAN DEFAULT FALSE }
impl ToBer for MatchingRuleAssertion<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::context(9), |w| {
            if let Some(rule) = &self.matching_rule {
                w.primitive(ber::context_primitive(1), rule.0.as_bytes());
            }
            if let Some(rule_type) = &self.rule_type {
                w.primitive(ber::context_primitive(2), rule_type.0.as_bytes());
            }
            w.primitive(ber::context_primitive(3), &self.assertion_value.0);
            if let Some(dn_attributes) = self.dn_attributes {
                w.primitive(
                    ber::context_primitive(4),
                    &[if dn_attributes { 0xff } else { 0x00 }],
                );
            }
        });
    }
}

// Control ::= SEQUENCE {
//     controlType             LDAPOID,
//     criticality             BOOLEAN DEFAULT FALSE,
//     controlValue            OCTET STRING OPTIONAL }
impl ToBer for Control<'_> {
    fn to_ber(&self, w: &mut BerWriter) {
        w.constructed(ber::TAG_SEQUENCE, |w| {
            w.write_str(&self.control_type.0);
            // DEFAULT FALSE is omitted when false
            if self.criticality {
                w.write_bool(true);
            }
            if let Some(value) = &self.control_value {
                w.write_octet_string(value);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asn1_rs::FromBer;
    use hex_literal::hex;
    use std::borrow::Cow;

    #[test]
    fn test_encode_abandon_request() {
        let msg = LdapMessage {
            message_id: MessageID(6),
            protocol_op: ProtocolOp::AbandonRequest(MessageID(5)),
            controls: None,
        };
        assert_eq!(encode_message(&msg), hex!("30 06 02 01 06 50 01 05"));
    }

    #[test]
    fn test_encode_unbind_request() {
        let msg = LdapMessage {
            message_id: MessageID(3),
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        };
        assert_eq!(encode_message(&msg), hex!("30 05 02 01 03 42 00"));
    }

    #[test]
    fn test_encode_simple_bind() {
        let msg = LdapMessage {
            message_id: MessageID(1),
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: LdapDN(Cow::Borrowed("cn=admin")),
                authentication: AuthenticationChoice::Simple(Cow::Borrowed(b"secret")),
            }),
            controls: None,
        };
        let out = encode_message(&msg);
        assert_eq!(
            out,
            hex!("30 1a 02 01 01 60 15 02 01 03 04 08 63 6e 3d 61 64 6d 69 6e 80 06 73 65 63 72 65 74")
        );
        // and the decoder agrees
        let (rem, parsed) = LdapMessage::from_ber(&out).expect("re-parse failed");
        assert!(rem.is_empty());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_encode_search_roundtrip() {
        let msg = LdapMessage {
            message_id: MessageID(2),
            protocol_op: ProtocolOp::SearchRequest(SearchRequest {
                base_object: LdapDN(Cow::Borrowed("dc=example,dc=org")),
                scope: SearchScope::WholeSubtree,
                deref_aliases: DerefAliases::NeverDerefAliases,
                size_limit: 0,
                time_limit: 0,
                types_only: false,
                filter: Filter::And(vec![
                    Filter::equality("objectClass", "posixAccount"),
                    Filter::Not(Box::new(Filter::present("memberUid"))),
                ]),
                attributes: vec![LdapString(Cow::Borrowed("uid"))],
            }),
            controls: None,
        };
        let out = encode_message(&msg);
        let (rem, parsed) = LdapMessage::from_ber(&out).expect("re-parse failed");
        assert!(rem.is_empty());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_encode_control_default_criticality_omitted() {
        let control = Control {
            control_type: LdapOID(Cow::Borrowed("1.2.3.4")),
            criticality: false,
            control_value: None,
        };
        let mut w = BerWriter::new();
        control.to_ber(&mut w);
        assert_eq!(w.into_bytes(), hex!("30 09 04 07 31 2e 32 2e 33 2e 34"));
    }
}
