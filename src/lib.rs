//! # LDAP Client
//!
//! A Lightweight Directory Access Protocol (LDAP v3, [RFC4511]) client library: a BER codec for
//! the LDAP subset, a typed model of every protocol operation, textual filter and DN languages,
//! an RFC 4512 schema subsystem with RFC 4518 value preparation, and a multiplexing connection
//! that carries many interleaved operations over one socket.
//!
//! Decoding is implemented with the [nom](https://github.com/Geal/nom) parser combinator
//! framework via `asn1-rs`, is zero-copy, and aims to be panic-free. Encoding always emits
//! definite, minimal-length BER.
//!
//! ```rust,no_run
//! use ldap_client::conn::LdapConnection;
//! use ldap_client::conn::SearchItem;
//! use ldap_client::ldap::SearchScope;
//!
//! # fn main() -> Result<(), ldap_client::error::Error> {
//! let conn = LdapConnection::connect("ldap://localhost:389")?;
//! conn.simple_bind("cn=admin,dc=example,dc=org", "secret")?;
//! let mut results = conn.search(
//!     "dc=example,dc=org",
//!     SearchScope::WholeSubtree,
//!     "(objectClass=posixAccount)",
//!     &["uid"],
//! )?;
//! while let Some(item) = results.next()? {
//!     if let SearchItem::Entry(entry, _controls) = item {
//!         println!("{}", entry.object_name.0);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [RFC4511]: https://www.rfc-editor.org/rfc/rfc4511

#![deny(/*missing_docs,*/
        unstable_features,
        unused_import_braces, unused_qualifications)]
#![warn(
    missing_debug_implementations,
    /* missing_docs,
    rust_2018_idioms,*/
    unreachable_pub
)]
#![forbid(unsafe_code)]

mod filter_parser;
pub mod attrs;
pub mod ber;
pub mod conn;
pub mod dn;
pub mod error;
pub mod filter;
pub mod filter_text;
pub mod ldap;
pub mod modify;
pub mod object;
pub mod parser;
pub mod prep;
pub mod sasl;
pub mod schema;
pub mod ser;
pub mod transport;

pub use asn1_rs::nom;
pub use asn1_rs::nom::{Err, IResult};
pub use asn1_rs::FromBer;
