//! Round-trip tests: encoding any well-typed message and decoding it yields an equal value.

use ldap_client::filter::*;
use ldap_client::ldap::*;
use ldap_client::ser::encode_message;
use ldap_client::FromBer;
use std::borrow::Cow;

fn roundtrip(msg: LdapMessage<'_>) {
    let bytes = encode_message(&msg);
    let (rem, parsed) = LdapMessage::from_ber(&bytes).expect("decoding failed");
    assert!(rem.is_empty(), "trailing bytes after {:?}", msg.protocol_op.tag());
    assert_eq!(parsed, msg, "round-trip of {:?}", msg.protocol_op.tag());
}

fn msg(id: u32, protocol_op: ProtocolOp<'_>) -> LdapMessage<'_> {
    LdapMessage {
        message_id: MessageID(id),
        protocol_op,
        controls: None,
    }
}

fn result(code: ResultCode) -> LdapResult<'static> {
    LdapResult {
        result_code: code,
        matched_dn: LdapDN(Cow::Borrowed("")),
        diagnostic_message: LdapString(Cow::Borrowed("")),
        referral: None,
    }
}

#[test]
fn test_bind_request_simple() {
    roundtrip(msg(
        1,
        ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: LdapDN(Cow::Borrowed("cn=admin,dc=example,dc=org")),
            authentication: AuthenticationChoice::Simple(Cow::Borrowed(b"secret")),
        }),
    ));
}

#[test]
fn test_bind_request_sasl() {
    roundtrip(msg(
        1,
        ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: LdapDN(Cow::Borrowed("")),
            authentication: AuthenticationChoice::Sasl(SaslCredentials {
                mechanism: LdapString(Cow::Borrowed("EXTERNAL")),
                credentials: Some(Cow::Borrowed(b"")),
            }),
        }),
    ));
}

#[test]
fn test_bind_response_with_sasl_creds() {
    roundtrip(msg(
        1,
        ProtocolOp::BindResponse(BindResponse {
            result: result(ResultCode::SaslBindInProgress),
            server_sasl_creds: Some(Cow::Borrowed(b"challenge")),
        }),
    ));
}

#[test]
fn test_unbind() {
    roundtrip(msg(7, ProtocolOp::UnbindRequest));
}

#[test]
fn test_search_request_all_filter_shapes() {
    let filter = Filter::And(vec![
        Filter::Or(vec![
            Filter::equality("objectClass", "posixAccount"),
            Filter::ApproxMatch(AttributeValueAssertion {
                attribute_desc: LdapString(Cow::Borrowed("sn")),
                assertion_value: Cow::Borrowed(b"jensen"),
            }),
        ]),
        Filter::Not(Box::new(Filter::present("memberUid"))),
        Filter::GreaterOrEqual(AttributeValueAssertion {
            attribute_desc: LdapString(Cow::Borrowed("uidNumber")),
            assertion_value: Cow::Borrowed(b"500"),
        }),
        Filter::LessOrEqual(AttributeValueAssertion {
            attribute_desc: LdapString(Cow::Borrowed("gidNumber")),
            assertion_value: Cow::Borrowed(b"1000"),
        }),
        Filter::Substrings(SubstringFilter {
            filter_type: LdapString(Cow::Borrowed("cn")),
            substrings: vec![
                Substring::Initial(AssertionValue(Cow::Borrowed(b"ab"))),
                Substring::Any(AssertionValue(Cow::Borrowed(b"cd"))),
                Substring::Final(AssertionValue(Cow::Borrowed(b"ef"))),
            ],
        }),
        Filter::ExtensibleMatch(MatchingRuleAssertion {
            matching_rule: Some(LdapString(Cow::Borrowed("caseExactMatch"))),
            rule_type: Some(AttributeDescription(Cow::Borrowed("cn"))),
            assertion_value: AssertionValue(Cow::Borrowed(b"Fred")),
            dn_attributes: Some(true),
        }),
    ]);
    roundtrip(msg(
        2,
        ProtocolOp::SearchRequest(SearchRequest {
            base_object: LdapDN(Cow::Borrowed("dc=example,dc=org")),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::DerefAlways,
            size_limit: 10,
            time_limit: 30,
            types_only: false,
            filter,
            attributes: vec![
                LdapString(Cow::Borrowed("uid")),
                LdapString(Cow::Borrowed("cn")),
            ],
        }),
    ));
}

#[test]
fn test_search_result_entry() {
    roundtrip(msg(
        2,
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: LdapDN(Cow::Borrowed("uid=jdoe,dc=example,dc=org")),
            attributes: vec![
                PartialAttribute {
                    attr_type: LdapString(Cow::Borrowed("uid")),
                    attr_vals: vec![AttributeValue(Cow::Borrowed(b"jdoe"))],
                },
                PartialAttribute {
                    attr_type: LdapString(Cow::Borrowed("jpegPhoto")),
                    attr_vals: vec![],
                },
            ],
        }),
    ));
}

#[test]
fn test_search_result_done_with_referral() {
    let mut r = result(ResultCode::Referral);
    r.referral = Some(vec![
        LdapString(Cow::Borrowed("ldap://other.example.org/dc=example,dc=org")),
    ]);
    roundtrip(msg(2, ProtocolOp::SearchResultDone(r)));
}

#[test]
fn test_search_result_reference() {
    roundtrip(msg(
        2,
        ProtocolOp::SearchResultReference(vec![LdapString(Cow::Borrowed(
            "ldap://other.example.org/ou=People,dc=example,dc=org",
        ))]),
    ));
}

#[test]
fn test_modify_request_and_response() {
    roundtrip(msg(
        3,
        ProtocolOp::ModifyRequest(ModifyRequest {
            object: LdapDN(Cow::Borrowed("cn=foo,dc=example,dc=org")),
            changes: vec![
                Change {
                    operation: Operation::Add,
                    modification: PartialAttribute {
                        attr_type: LdapString(Cow::Borrowed("description")),
                        attr_vals: vec![AttributeValue(Cow::Borrowed(b"b"))],
                    },
                },
                Change {
                    operation: Operation::Delete,
                    modification: PartialAttribute {
                        attr_type: LdapString(Cow::Borrowed("seeAlso")),
                        attr_vals: vec![],
                    },
                },
                Change {
                    operation: Operation::Replace,
                    modification: PartialAttribute {
                        attr_type: LdapString(Cow::Borrowed("telephoneNumber")),
                        attr_vals: vec![
                            AttributeValue(Cow::Borrowed(b"+1 555 0100")),
                            AttributeValue(Cow::Borrowed(b"+1 555 0101")),
                        ],
                    },
                },
            ],
        }),
    ));
    roundtrip(msg(
        3,
        ProtocolOp::ModifyResponse(ModifyResponse {
            result: result(ResultCode::Success),
        }),
    ));
}

#[test]
fn test_add_request_and_response() {
    roundtrip(msg(
        4,
        ProtocolOp::AddRequest(AddRequest {
            entry: LdapDN(Cow::Borrowed("cn=new,dc=example,dc=org")),
            attributes: vec![Attribute {
                attr_type: LdapString(Cow::Borrowed("objectClass")),
                attr_vals: vec![
                    AttributeValue(Cow::Borrowed(b"top")),
                    AttributeValue(Cow::Borrowed(b"person")),
                ],
            }],
        }),
    ));
    roundtrip(msg(4, ProtocolOp::AddResponse(result(ResultCode::Success))));
}

#[test]
fn test_del_request_and_response() {
    roundtrip(msg(
        5,
        ProtocolOp::DelRequest(LdapDN(Cow::Borrowed("cn=old,dc=example,dc=org"))),
    ));
    roundtrip(msg(
        5,
        ProtocolOp::DelResponse(result(ResultCode::NoSuchObject)),
    ));
}

#[test]
fn test_moddn_request_and_response() {
    roundtrip(msg(
        6,
        ProtocolOp::ModDnRequest(ModDnRequest {
            entry: LdapDN(Cow::Borrowed("cn=foo,ou=a,dc=example,dc=org")),
            newrdn: RelativeLdapDN(Cow::Borrowed("cn=bar")),
            deleteoldrdn: true,
            newsuperior: Some(LdapDN(Cow::Borrowed("ou=b,dc=example,dc=org"))),
        }),
    ));
    roundtrip(msg(6, ProtocolOp::ModDnResponse(result(ResultCode::Success))));
}

#[test]
fn test_compare_request_and_response() {
    roundtrip(msg(
        7,
        ProtocolOp::CompareRequest(CompareRequest {
            entry: LdapDN(Cow::Borrowed("cn=foo,dc=example,dc=org")),
            ava: AttributeValueAssertion {
                attribute_desc: LdapString(Cow::Borrowed("cn")),
                assertion_value: Cow::Borrowed(b"foo"),
            },
        }),
    ));
    roundtrip(msg(
        7,
        ProtocolOp::CompareResponse(result(ResultCode::CompareTrue)),
    ));
}

#[test]
fn test_abandon_request() {
    roundtrip(msg(8, ProtocolOp::AbandonRequest(MessageID(5))));
}

#[test]
fn test_extended_request_and_response() {
    roundtrip(msg(
        9,
        ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: LdapOID(Cow::Borrowed(oid::WHO_AM_I)),
            request_value: None,
        }),
    ));
    roundtrip(msg(
        9,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: result(ResultCode::Success),
            response_name: Some(LdapOID(Cow::Borrowed(oid::NOTICE_OF_DISCONNECTION))),
            response_value: Some(Cow::Borrowed(b"dn:cn=admin")),
        }),
    ));
}

#[test]
fn test_intermediate_response() {
    roundtrip(msg(
        10,
        ProtocolOp::IntermediateResponse(IntermediateResponse {
            response_name: Some(LdapOID(Cow::Borrowed("1.3.6.1.4.1.4203.1.9.1.4"))),
            response_value: Some(Cow::Borrowed(&[0x30, 0x00])),
        }),
    ));
}

#[test]
fn test_message_controls() {
    let mut m = msg(11, ProtocolOp::DelRequest(LdapDN(Cow::Borrowed("cn=x"))));
    m.controls = Some(vec![
        Control {
            control_type: LdapOID(Cow::Borrowed("1.2.840.113556.1.4.805")),
            criticality: true,
            control_value: None,
        },
        Control {
            control_type: LdapOID(Cow::Borrowed("2.16.840.1.113730.3.4.2")),
            criticality: false,
            control_value: Some(Cow::Borrowed(b"\x30\x00")),
        },
    ]);
    roundtrip(m);
}

#[test]
fn test_unknown_result_code_preserved() {
    // codes outside the RFC enumeration must carry their numeric value verbatim
    roundtrip(msg(12, ProtocolOp::DelResponse(result(ResultCode(4096)))));
}

#[test]
fn test_result_code_other() {
    roundtrip(msg(13, ProtocolOp::DelResponse(result(ResultCode::Other))));
}
