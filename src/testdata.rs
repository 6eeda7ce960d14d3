//! Shared fixtures for unit tests.

/// A JWKS with a single public RSA signing key.
pub fn rsa_jwks() -> String {
    format!(
        r#"{{"keys":[{{"kty":"RSA","alg":"RS256","use":"sig","kid":"shoot-sa-signing","n":"{}","e":"AQAB"}}]}}"#,
        rsa_modulus()
    )
}

/// A 2048-bit base64url modulus placeholder (structurally valid, not a real key).
fn rsa_modulus() -> String {
    let mut n = "A".repeat(340);
    n.push_str("EQ");
    n
}

/// A JWKS containing a symmetric key, which must never be served.
pub fn oct_jwks() -> &'static str {
    r#"{"keys":[{"kty":"oct","kid":"sym","k":"c2VjcmV0"}]}"#
}

/// An openid-configuration document for the given issuer.
pub fn openid_config(issuer: &str) -> String {
    format!(r#"{{"issuer":"{issuer}","jwks_uri":"{issuer}/jwks"}}"#)
}
