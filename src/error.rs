//! Error types for the codec and for client operations

use asn1_rs::nom;
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::IResult;

use crate::ldap::ResultCode;

/// Holds the result of wire-level parsing functions
///
/// Note that this type is also a `Result`, so usual functions (`map`, `unwrap` etc.) are
/// available.
///
/// Note that this type is not named `LdapResult` to avoid conflicts with the LDAP standard type
pub type Result<'a, T> = IResult<&'a [u8], T, LdapError>;

/// An error that can occur while encoding or decoding the BER representation of a message
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LdapError {
    #[error("Invalid LDAP String encoding")]
    InvalidString,

    #[error("Invalid LDAP Authentication Type")]
    InvalidAuthenticationType,

    #[error("Invalid DN encoding")]
    InvalidDN,

    #[error("Invalid Substring Type")]
    InvalidSubstring,

    #[error("Invalid Type for Filter")]
    InvalidFilterType,
    #[error("Invalid Type for Message")]
    InvalidMessageType,

    #[error("Malformed BER item")]
    MalformedBer,

    #[error("Declared length overruns the enclosing item")]
    InvalidLength,

    #[error("INTEGER outside implementation limits")]
    IntegerOverflow,

    #[error("Unknown error")]
    Unknown,

    #[error("BER error: {0}")]
    Ber(#[from] asn1_rs::Error),
    #[error("nom error: {0:?}")]
    NomError(ErrorKind),
}

impl From<LdapError> for nom::Err<LdapError> {
    fn from(e: LdapError) -> nom::Err<LdapError> {
        nom::Err::Error(e)
    }
}

impl From<ErrorKind> for LdapError {
    fn from(e: ErrorKind) -> LdapError {
        LdapError::NomError(e)
    }
}

impl<I> ParseError<I> for LdapError {
    fn from_error_kind(_input: I, kind: ErrorKind) -> Self {
        LdapError::NomError(kind)
    }
    fn append(_input: I, kind: ErrorKind, _other: Self) -> Self {
        LdapError::NomError(kind)
    }
}

impl<I, E> FromExternalError<I, E> for LdapError {
    fn from_external_error(_input: I, kind: ErrorKind, _e: E) -> LdapError {
        LdapError::NomError(kind)
    }
}

/// An error surfaced by client operations.
///
/// Input-validation variants (`FilterSyntax`, `InvalidDn`, `InvalidValue`, `SchemaConflict`,
/// `InvalidSyntax`, `UnsupportedControl`) are raised before any bytes reach the wire. Wire and
/// lifecycle variants complete the waiting caller; fatal ones also fail every other pending
/// operation with `ConnectionClosed`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] LdapError),

    #[error("operation failed: {result_code:?}: {diagnostic_message}")]
    OperationFailed {
        result_code: ResultCode,
        diagnostic_message: String,
        matched_dn: String,
    },

    #[error("referral to {0:?}")]
    Referral(Vec<String>),

    #[error("operation timed out")]
    Timeout,

    #[error("operation abandoned")]
    Abandoned,

    #[error("no free message identifiers")]
    TooManyOutstanding,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("a bind is in progress on this connection")]
    BindInProgress,

    #[error("filter syntax error at byte {position}: expected {expected}")]
    FilterSyntax {
        position: usize,
        expected: &'static str,
    },

    #[error("invalid DN: {0}")]
    InvalidDn(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("conflicting schema definition for {0}")]
    SchemaConflict(String),

    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),

    #[error("SASL negotiation failed: {0}")]
    SaslNegotiationFailed(String),

    #[error("critical control {0} is not supported")]
    UnsupportedControl(String),

    #[error("invalid LDAP URI: {0}")]
    InvalidUri(String),
}

impl From<nom::Err<LdapError>> for Error {
    fn from(e: nom::Err<LdapError>) -> Error {
        match e {
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::Protocol(e),
            nom::Err::Incomplete(_) => Error::Protocol(LdapError::InvalidLength),
        }
    }
}
