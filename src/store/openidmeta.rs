//! Payload type for the shoot OpenID discovery store.

/// OpenID discovery metadata of a single shoot issuer.
///
/// Both documents are kept exactly as received from the control plane so
/// that hashes and signatures over the served bytes remain stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    /// The openid-configuration discovery document.
    pub config: Vec<u8>,
    /// The JSON Web Key Set matching the discovery document.
    pub jwks: Vec<u8>,
}
