//! Small shared helpers: cache key parsing, OIDC document parsing and
//! JWKS key checks.

use std::time::Duration;

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;

/// Splits a cache key of the form `projectName--shootUID` into its parts.
///
/// Returns `None` unless the key consists of exactly two non-blank parts.
pub fn split_project_name_and_shoot_uid(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split("--");
    let project = parts.next()?;
    let uid = parts.next()?;
    if parts.next().is_some() || project.trim().is_empty() || uid.trim().is_empty() {
        return None;
    }
    Some((project, uid))
}

/// Minimal view of an OpenID discovery document, enough to check the
/// issuer and JWKS URIs.
#[derive(Debug, Default, Deserialize)]
pub struct OpenIdMetadata {
    /// The issuer URL the document claims.
    #[serde(default)]
    pub issuer: String,
    /// The URL under which the key set is published.
    #[serde(default)]
    pub jwks_uri: String,
}

/// Parses the openid configuration document.
pub fn load_openid_config(config: &[u8]) -> Result<OpenIdMetadata, serde_json::Error> {
    serde_json::from_slice(config)
}

/// Parses a JSON Web Key Set.
pub fn load_key_set(jwks: &[u8]) -> Result<JwkSet, serde_json::Error> {
    serde_json::from_slice(jwks)
}

/// Returns `true` if the key carries only public material.
///
/// Symmetric (`oct`) keys are the only representable non-public kind;
/// asymmetric JWK parameters hold the public half exclusively.
pub fn key_is_public(key: &Jwk) -> bool {
    !matches!(key.algorithm, AlgorithmParameters::OctetKey(_))
}

/// Returns `true` if the key is structurally usable for verification.
pub fn key_is_valid(key: &Jwk) -> bool {
    DecodingKey::from_jwk(key).is_ok()
}

/// Parses a human readable duration such as `30s`, `10m` or `1h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        _ => return Err(format!("invalid duration unit {unit:?}")),
    };
    Ok(Duration::from_secs(seconds))
}
