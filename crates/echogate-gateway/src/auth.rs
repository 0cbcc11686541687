//! Signed-cookie authentication: an HS256 JWT with `user_id` nested either
//! under a `data` object or at the token root, falling back to the standard
//! `sub` claim. No valid token produces a deterministic guest identity
//! derived from the connecting IP address.

use std::net::IpAddr;

use echogate_core::config::AuthConfig;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    data: Option<TokenData>,
    #[serde(default)]
    sub: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    #[serde(default)]
    user_id: Option<UserIdValue>,
}

/// The source accepts `user_id` as either a JSON string or number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserIdValue {
    Text(String),
    Number(i64),
}

impl UserIdValue {
    fn into_string(self) -> String {
        match self {
            UserIdValue::Text(s) => s,
            UserIdValue::Number(n) => n.to_string(),
        }
    }
}

/// Outcome of resolving a client's identity for a new session.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub is_authenticated: bool,
}

/// Decode `cookie_value` as an HS256 JWT signed with the configured secret,
/// returning the authenticated identity if valid. Expired or malformed
/// tokens are treated the same as "no token" by the caller.
pub fn decode_cookie(auth: &AuthConfig, cookie_value: &str) -> Option<String> {
    let secret = auth.resolve_jwt_secret()?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let token = decode::<TokenClaims>(cookie_value, &DecodingKey::from_secret(secret.as_bytes()), &validation).ok()?;
    let claims = token.claims;

    let user_id = claims
        .data
        .and_then(|d| d.user_id)
        .map(UserIdValue::into_string)
        .or(claims.sub);

    if user_id.is_none() {
        debug!("JWT decoded but carried no user_id/sub claim");
    }
    user_id
}

/// Resolve the identity for a new connection: a valid cookie yields an
/// authenticated user, otherwise a deterministic guest id derived from the
/// client IP (e.g. `user_203_0_113_7`).
pub fn resolve_identity(auth: &AuthConfig, cookie_value: Option<&str>, client_ip: IpAddr) -> Identity {
    if let Some(cookie) = cookie_value {
        if let Some(user_id) = decode_cookie(auth, cookie) {
            return Identity { user_id, is_authenticated: true };
        }
    }
    Identity { user_id: guest_user_id(client_ip), is_authenticated: false }
}

/// Deterministic guest identity: `user_<ip with dots/colons as underscores>`.
pub fn guest_user_id(ip: IpAddr) -> String {
    format!("user_{}", ip.to_string().replace(['.', ':'], "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::net::Ipv4Addr;

    fn auth_config(secret: &str) -> AuthConfig {
        AuthConfig { jwt_secret: Some(secret.to_string()), jwt_secret_env: None, cookie_name: None }
    }

    fn sign(secret: &str, claims: serde_json::Value) -> String {
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn decodes_user_id_nested_under_data() {
        let token = sign("s3cret", json!({"data": {"user_id": "u-42"}, "exp": 9999999999u64}));
        let user_id = decode_cookie(&auth_config("s3cret"), &token);
        assert_eq!(user_id.as_deref(), Some("u-42"));
    }

    #[test]
    fn falls_back_to_sub_claim_when_data_absent() {
        let token = sign("s3cret", json!({"sub": "u-99", "exp": 9999999999u64}));
        let user_id = decode_cookie(&auth_config("s3cret"), &token);
        assert_eq!(user_id.as_deref(), Some("u-99"));
    }

    #[test]
    fn numeric_user_id_is_stringified() {
        let token = sign("s3cret", json!({"data": {"user_id": 42}, "exp": 9999999999u64}));
        let user_id = decode_cookie(&auth_config("s3cret"), &token);
        assert_eq!(user_id.as_deref(), Some("42"));
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let token = sign("other-secret", json!({"sub": "u-1", "exp": 9999999999u64}));
        assert!(decode_cookie(&auth_config("s3cret"), &token).is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = sign("s3cret", json!({"sub": "u-1", "exp": 1}));
        assert!(decode_cookie(&auth_config("s3cret"), &token).is_none());
    }

    #[test]
    fn resolve_identity_falls_back_to_deterministic_guest_id() {
        let identity = resolve_identity(&auth_config("s3cret"), None, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(identity.user_id, "user_203_0_113_7");
        assert!(!identity.is_authenticated);
    }

    #[test]
    fn resolve_identity_prefers_valid_cookie_over_guest() {
        let token = sign("s3cret", json!({"sub": "u-1", "exp": 9999999999u64}));
        let identity = resolve_identity(&auth_config("s3cret"), Some(&token), IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(identity.user_id, "u-1");
        assert!(identity.is_authenticated);
    }
}
