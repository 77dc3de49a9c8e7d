//! SASL provider interface (RFC 4513 bind loop collaborator)
//!
//! Mechanisms live outside the core; the connection drives the challenge/response loop through
//! this trait. The built-in `EXTERNAL` mechanism (the default for `ldapi://` sockets, where the
//! peer credentials authenticate the client) carries at most an authorization identity.

use crate::error::Error;

/// One SASL mechanism negotiation.
///
/// `start` may produce an initial response; each server challenge is handed to `step`;
/// `complete` runs after the server reports success, giving the mechanism a chance to reject
/// a negotiation that ended prematurely.
pub trait SaslMechanism: Send {
    /// Mechanism name as sent in the bind request, e.g. `EXTERNAL` or `SCRAM-SHA-256`.
    fn name(&self) -> &str;

    fn start(&mut self, host: &str) -> Result<Option<Vec<u8>>, Error>;

    fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error>;

    fn complete(&mut self) -> Result<(), Error>;
}

/// The EXTERNAL mechanism (RFC 4422 appendix A).
#[derive(Debug, Default)]
pub struct External {
    authz_id: String,
}

impl External {
    pub fn new() -> Self {
        External::default()
    }

    /// Request a specific authorization identity instead of the one derived by the server.
    pub fn with_authz_id(authz_id: &str) -> Self {
        External {
            authz_id: authz_id.to_string(),
        }
    }
}

impl SaslMechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn start(&mut self, _host: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(Some(self.authz_id.clone().into_bytes()))
    }

    fn step(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::SaslNegotiationFailed(
            "EXTERNAL does not expect a challenge".to_string(),
        ))
    }

    fn complete(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external() {
        let mut mech = External::with_authz_id("dn:cn=admin");
        assert_eq!(mech.name(), "EXTERNAL");
        assert_eq!(
            mech.start("example.org").unwrap(),
            Some(b"dn:cn=admin".to_vec())
        );
        assert!(mech.step(b"challenge").is_err());
        assert!(mech.complete().is_ok());
    }
}
