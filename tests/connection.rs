//! Connection scenarios against a scripted in-process server.
//!
//! The mock speaks real frames produced by this crate's own encoder, so these tests exercise
//! the full path: serialisation, framing, the reader thread, routing and the waiter channels.

use ldap_client::attrs::AttrValues;
use ldap_client::conn::{
    ConnState, DefaultsConfig, LdapConnection, SearchItem,
};
use ldap_client::error::Error;
use ldap_client::filter::{AttributeValue, PartialAttribute};
use ldap_client::ldap::*;
use ldap_client::object::LdapObject;
use ldap_client::ser::encode_message;
use ldap_client::{ber, FromBer};
use std::borrow::Cow;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Wire {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Wire {
    fn read_msg(&mut self) -> Option<LdapMessage<'static>> {
        loop {
            if let Ok(ber::Framing::Ready(n)) = ber::frame_len(&self.buf) {
                let frame: Vec<u8> = self.buf.drain(..n).collect();
                let (_, msg) = LdapMessage::from_ber(&frame).expect("server-side parse");
                return Some(msg.to_static());
            }
            let mut tmp = [0u8; 4096];
            match self.stream.read(&mut tmp) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
            }
        }
    }

    fn send(&mut self, msg: &LdapMessage<'_>) {
        self.stream
            .write_all(&encode_message(msg))
            .expect("server-side write");
    }

    fn send_result(&mut self, id: MessageID, op: fn(LdapResult<'static>) -> ProtocolOp<'static>) {
        self.send(&LdapMessage {
            message_id: id,
            protocol_op: op(success()),
            controls: None,
        });
    }

    fn send_entry(&mut self, id: MessageID, dn: &str, attr: &str, values: &[&str]) {
        let entry = SearchResultEntry {
            object_name: LdapDN(Cow::Owned(dn.to_string())),
            attributes: vec![PartialAttribute {
                attr_type: LdapString(Cow::Owned(attr.to_string())),
                attr_vals: values
                    .iter()
                    .map(|v| AttributeValue(Cow::Owned(v.as_bytes().to_vec())))
                    .collect(),
            }],
        };
        self.send(&LdapMessage {
            message_id: id,
            protocol_op: ProtocolOp::SearchResultEntry(entry),
            controls: None,
        });
    }
}

fn success() -> LdapResult<'static> {
    LdapResult {
        result_code: ResultCode::Success,
        matched_dn: LdapDN(Cow::Borrowed("")),
        diagnostic_message: LdapString(Cow::Borrowed("")),
        referral: None,
    }
}

fn spawn_server<F>(handler: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(Wire) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handle = thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            handler(Wire {
                stream,
                buf: Vec::new(),
            });
        }
    });
    (format!("ldap://127.0.0.1:{}", port), handle)
}

fn quiet_config() -> DefaultsConfig {
    let mut config = DefaultsConfig::default();
    config.probe_root_dse = false;
    config
}

#[test]
fn test_bind_search_iterate() {
    let (uri, server) = spawn_server(|mut wire| {
        // bind
        let msg = wire.read_msg().expect("bind request");
        match &msg.protocol_op {
            ProtocolOp::BindRequest(req) => {
                assert_eq!(&req.name.0, "cn=admin,dc=example,dc=org");
                assert_eq!(
                    req.authentication,
                    AuthenticationChoice::Simple(Cow::Borrowed(b"secret"))
                );
            }
            other => panic!("expected bind, got {:?}", other),
        }
        wire.send(&LdapMessage {
            message_id: msg.message_id,
            protocol_op: ProtocolOp::BindResponse(BindResponse {
                result: success(),
                server_sasl_creds: None,
            }),
            controls: None,
        });
        // search
        let msg = wire.read_msg().expect("search request");
        match &msg.protocol_op {
            ProtocolOp::SearchRequest(req) => {
                assert_eq!(&req.base_object.0, "dc=example,dc=org");
                assert_eq!(req.scope, SearchScope::WholeSubtree);
                assert_eq!(req.attributes.len(), 1);
            }
            other => panic!("expected search, got {:?}", other),
        }
        let id = msg.message_id;
        wire.send_entry(id, "uid=alice,dc=example,dc=org", "uid", &["alice"]);
        wire.send_entry(id, "uid=bob,dc=example,dc=org", "uid", &["bob"]);
        wire.send_result(id, ProtocolOp::SearchResultDone);
        // unbind then EOF
        let msg = wire.read_msg().expect("unbind");
        assert!(matches!(msg.protocol_op, ProtocolOp::UnbindRequest));
    });

    let conn = LdapConnection::connect_with(&uri, quiet_config()).expect("connect");
    conn.simple_bind("cn=admin,dc=example,dc=org", "secret")
        .expect("bind");
    assert_eq!(conn.state(), ConnState::Bound);

    let mut stream = conn
        .search(
            "dc=example,dc=org",
            SearchScope::WholeSubtree,
            "(objectClass=posixAccount)",
            &["uid"],
        )
        .expect("search");
    let mut uids = Vec::new();
    while let Some(item) = stream.next().expect("stream") {
        match item {
            SearchItem::Entry(entry, _) => {
                assert_eq!(entry.attributes.len(), 1);
                assert_eq!(&entry.attributes[0].attr_type.0, "uid");
                uids.push(entry.attributes[0].attr_vals[0].0.to_vec());
            }
            SearchItem::Reference(urls, _) => panic!("unexpected reference {:?}", urls),
        }
    }
    assert_eq!(uids, vec![b"alice".to_vec(), b"bob".to_vec()]);
    let outcome = stream.take_outcome().expect("outcome");
    assert_eq!(outcome.result_code, ResultCode::Success);

    conn.unbind().expect("unbind");
    server.join().expect("server");
}

#[test]
fn test_abandon_mid_search() {
    let (uri, server) = spawn_server(|mut wire| {
        let msg = wire.read_msg().expect("search request");
        let search_id = msg.message_id;
        assert!(matches!(msg.protocol_op, ProtocolOp::SearchRequest(_)));
        wire.send_entry(search_id, "uid=a,dc=x", "uid", &["a"]);
        wire.send_entry(search_id, "uid=b,dc=x", "uid", &["b"]);
        // the next message on the socket must be the abandon for the search's ID
        let msg = wire.read_msg().expect("abandon request");
        match msg.protocol_op {
            ProtocolOp::AbandonRequest(abandoned) => assert_eq!(abandoned, search_id),
            other => panic!("expected abandon, got {:?}", other),
        }
        // a late entry for the abandoned ID must be discarded by the client
        wire.send_entry(search_id, "uid=late,dc=x", "uid", &["late"]);
        // the connection stays usable: answer the whoami that follows
        let msg = wire.read_msg().expect("whoami request");
        match &msg.protocol_op {
            ProtocolOp::ExtendedRequest(req) => assert_eq!(req.request_name.0, oid::WHO_AM_I),
            other => panic!("expected extended, got {:?}", other),
        }
        wire.send(&LdapMessage {
            message_id: msg.message_id,
            protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: success(),
                response_name: None,
                response_value: Some(Cow::Borrowed(b"dn:cn=admin,dc=x")),
            }),
            controls: None,
        });
        // drain until EOF
        while wire.read_msg().is_some() {}
    });

    let conn = LdapConnection::connect_with(&uri, quiet_config()).expect("connect");
    let mut stream = conn
        .search("dc=x", SearchScope::WholeSubtree, "(uid=*)", &["uid"])
        .expect("search");
    assert!(matches!(stream.next(), Ok(Some(SearchItem::Entry(_, _)))));
    assert!(matches!(stream.next(), Ok(Some(SearchItem::Entry(_, _)))));
    stream.abandon().expect("abandon");
    assert!(matches!(stream.next(), Err(Error::Abandoned)));

    let identity = conn.whoami().expect("whoami");
    assert_eq!(identity, "dn:cn=admin,dc=x");

    conn.unbind().expect("unbind");
    server.join().expect("server");
}

#[test]
fn test_nonstrict_add_attrs_dedup() {
    let (uri, server) = spawn_server(|mut wire| {
        // planner pre-fetch: base search for just the referenced attribute
        let msg = wire.read_msg().expect("prefetch search");
        let id = msg.message_id;
        match &msg.protocol_op {
            ProtocolOp::SearchRequest(req) => {
                assert_eq!(&req.base_object.0, "cn=foo,dc=example,dc=org");
                assert_eq!(req.scope, SearchScope::BaseObject);
                assert_eq!(req.attributes.len(), 1);
                assert_eq!(&req.attributes[0].0, "description");
            }
            other => panic!("expected search, got {:?}", other),
        }
        wire.send_entry(id, "cn=foo,dc=example,dc=org", "description", &["a"]);
        wire.send_result(id, ProtocolOp::SearchResultDone);
        // exactly one modify with exactly one add of ["b"]
        let msg = wire.read_msg().expect("modify request");
        match &msg.protocol_op {
            ProtocolOp::ModifyRequest(req) => {
                assert_eq!(&req.object.0, "cn=foo,dc=example,dc=org");
                assert_eq!(req.changes.len(), 1);
                let change = &req.changes[0];
                assert_eq!(change.operation, Operation::Add);
                assert_eq!(&change.modification.attr_type.0, "description");
                assert_eq!(
                    change.modification.attr_vals,
                    vec![AttributeValue(Cow::Borrowed(b"b"))]
                );
            }
            other => panic!("expected modify, got {:?}", other),
        }
        wire.send_result(msg.message_id, |r| {
            ProtocolOp::ModifyResponse(ModifyResponse { result: r })
        });
        while wire.read_msg().is_some() {}
    });

    let conn = LdapConnection::connect_with(&uri, quiet_config()).expect("connect");
    let mut object = LdapObject::attached(&conn, "cn=foo,dc=example,dc=org").expect("attach");
    object
        .add_attrs(vec![(
            "description".to_string(),
            vec![b"a".to_vec(), b"b".to_vec()],
        )])
        .expect("add_attrs");
    // the local state mirrors the applied change
    let values = object.attrs().get("description").expect("description");
    assert_eq!(values, &[b"a".to_vec(), b"b".to_vec()]);

    conn.unbind().expect("unbind");
    server.join().expect("server");
}

#[test]
fn test_unsolicited_disconnection_notice() {
    let (uri, server) = spawn_server(|mut wire| {
        let msg = wire.read_msg().expect("search request");
        assert!(matches!(msg.protocol_op, ProtocolOp::SearchRequest(_)));
        // no answer to the search; the server walks away instead
        wire.send(&LdapMessage {
            message_id: MessageID::UNSOLICITED,
            protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult {
                    result_code: ResultCode::Unavailable,
                    matched_dn: LdapDN(Cow::Borrowed("")),
                    diagnostic_message: LdapString(Cow::Borrowed("shutting down")),
                    referral: None,
                },
                response_name: Some(LdapOID(Cow::Borrowed(oid::NOTICE_OF_DISCONNECTION))),
                response_value: None,
            }),
            controls: None,
        });
    });

    let conn = LdapConnection::connect_with(&uri, quiet_config()).expect("connect");
    let mut stream = conn
        .search("dc=x", SearchScope::WholeSubtree, "(uid=*)", &["uid"])
        .expect("search");
    // the in-flight waiter fails and the connection transitions to Closed
    assert!(matches!(stream.next(), Err(Error::ConnectionClosed)));
    assert_eq!(conn.state(), ConnState::Closed);
    let notices = conn.take_unsolicited();
    assert_eq!(notices.len(), 1);
    assert_eq!(
        notices[0].response_name.as_ref().map(|n| n.0.as_ref()),
        Some(oid::NOTICE_OF_DISCONNECTION)
    );
    server.join().expect("server");
}

#[test]
fn test_unknown_critical_control_fails_locally() {
    let (uri, server) = spawn_server(|mut wire| {
        // root DSE probe
        let msg = wire.read_msg().expect("probe search");
        let id = msg.message_id;
        match &msg.protocol_op {
            ProtocolOp::SearchRequest(req) => assert_eq!(&req.base_object.0, ""),
            other => panic!("expected probe search, got {:?}", other),
        }
        wire.send_entry(id, "", "supportedControl", &["1.2.840.113556.1.4.319"]);
        wire.send_result(id, ProtocolOp::SearchResultDone);
        // nothing but the unbind may arrive after this point
        let msg = wire.read_msg().expect("final message");
        assert!(
            matches!(msg.protocol_op, ProtocolOp::UnbindRequest),
            "a request with an unsupported critical control reached the wire: {:?}",
            msg.protocol_op
        );
    });

    let conn = LdapConnection::connect(&uri).expect("connect");
    let mut options = ldap_client::conn::SearchOptions::default();
    options.controls = vec![Control {
        control_type: LdapOID(Cow::Borrowed("9.9.9.9")),
        criticality: true,
        control_value: None,
    }];
    let result = conn.search_with(
        "dc=x",
        SearchScope::WholeSubtree,
        "(uid=*)",
        &["uid"],
        options,
    );
    match result {
        Err(Error::UnsupportedControl(oid)) => assert_eq!(oid, "9.9.9.9"),
        other => panic!("expected UnsupportedControl, got {:?}", other.map(|_| ())),
    }

    conn.unbind().expect("unbind");
    server.join().expect("server");
}

#[test]
fn test_operation_timeout_sends_abandon() {
    let (uri, server) = spawn_server(|mut wire| {
        let msg = wire.read_msg().expect("del request");
        let del_id = msg.message_id;
        assert!(matches!(msg.protocol_op, ProtocolOp::DelRequest(_)));
        // never answer; the client must abandon on its own
        let msg = wire.read_msg().expect("abandon");
        match msg.protocol_op {
            ProtocolOp::AbandonRequest(abandoned) => assert_eq!(abandoned, del_id),
            other => panic!("expected abandon, got {:?}", other),
        }
        while wire.read_msg().is_some() {}
    });

    let mut config = quiet_config();
    config.operation_timeout = Some(Duration::from_millis(200));
    let conn = LdapConnection::connect_with(&uri, config).expect("connect");
    match conn.delete("cn=slow,dc=x", Vec::new()) {
        Err(Error::Timeout) => {}
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
    conn.unbind().expect("unbind");
    server.join().expect("server");
}

#[test]
fn test_interleaved_searches_route_by_id() {
    let (uri, server) = spawn_server(|mut wire| {
        let first = wire.read_msg().expect("first search");
        let second = wire.read_msg().expect("second search");
        let (a, b) = (first.message_id, second.message_id);
        assert_ne!(a, b);
        // interleave responses across the two outstanding searches
        wire.send_entry(b, "uid=b1,dc=x", "uid", &["b1"]);
        wire.send_entry(a, "uid=a1,dc=x", "uid", &["a1"]);
        wire.send_result(a, ProtocolOp::SearchResultDone);
        wire.send_entry(b, "uid=b2,dc=x", "uid", &["b2"]);
        wire.send_result(b, ProtocolOp::SearchResultDone);
        while wire.read_msg().is_some() {}
    });

    let conn = LdapConnection::connect_with(&uri, quiet_config()).expect("connect");
    let mut first = conn
        .search("dc=x", SearchScope::WholeSubtree, "(cn=a)", &["uid"])
        .expect("first search");
    let mut second = conn
        .search("dc=x", SearchScope::WholeSubtree, "(cn=b)", &["uid"])
        .expect("second search");

    let mut a_uids = Vec::new();
    while let Some(SearchItem::Entry(entry, _)) = first.next().expect("first stream") {
        a_uids.push(entry.attributes[0].attr_vals[0].0.to_vec());
    }
    let mut b_uids = Vec::new();
    while let Some(SearchItem::Entry(entry, _)) = second.next().expect("second stream") {
        b_uids.push(entry.attributes[0].attr_vals[0].0.to_vec());
    }
    assert_eq!(a_uids, vec![b"a1".to_vec()]);
    assert_eq!(b_uids, vec![b"b1".to_vec(), b"b2".to_vec()]);

    conn.unbind().expect("unbind");
    server.join().expect("server");
}

#[test]
fn test_delete_all_sentinel_on_wire() {
    let (uri, server) = spawn_server(|mut wire| {
        let msg = wire.read_msg().expect("modify request");
        match &msg.protocol_op {
            ProtocolOp::ModifyRequest(req) => {
                assert_eq!(req.changes.len(), 1);
                assert_eq!(req.changes[0].operation, Operation::Delete);
                assert!(req.changes[0].modification.attr_vals.is_empty());
            }
            other => panic!("expected modify, got {:?}", other),
        }
        wire.send_result(msg.message_id, |r| {
            ProtocolOp::ModifyResponse(ModifyResponse { result: r })
        });
        while wire.read_msg().is_some() {}
    });

    let conn = LdapConnection::connect_with(&uri, quiet_config()).expect("connect");
    let mut object = LdapObject::attached(&conn, "cn=foo,dc=x").expect("attach");
    object.mark_complete();
    object
        .delete_attrs(vec![("description".to_string(), AttrValues::All)])
        .expect("delete_attrs");
    assert!(!object.attrs().contains_attr("description"));
    conn.unbind().expect("unbind");
    server.join().expect("server");
}
