//! Authentication for the management surface.
//!
//! Two mechanisms, both narrow by design:
//! - provider webhooks carry an HMAC-SHA256 of the raw body in
//!   `X-Hub-Signature-256`;
//! - management HTML/ops pages require an HS256 JWT in `X-API-Key` whose
//!   claims name the built-in operator identity. API call endpoints are
//!   deliberately unauthenticated.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Expected operator identity inside the management JWT.
const API_KEY_NAME: &str = "byoa";
const API_KEY_PASSWORD: &str = "astra";

/// Verify a webhook signature header of the form `sha256=<hex>` over the
/// raw body.
pub fn verify_hub_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    // Constant-time comparison.
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiKeyClaims {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

/// Verify the management JWT: HS256 with the deployment secret, claims
/// matching the operator identity. Expiry is optional on these tokens.
pub fn verify_api_key(token: &str, secret: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;

    match decode::<ApiKeyClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => data.claims.name == API_KEY_NAME && data.claims.password == API_KEY_PASSWORD,
        Err(_) => false,
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign_body(secret: &str, body: &[u8]) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn token(name: &str, password: &str, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &ApiKeyClaims {
                name: name.into(),
                password: password.into(),
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_signature_accepted() {
        let body = br#"{"event":"call_ended","callId":"C1"}"#;
        let header = sign_body("topsecret", body);
        assert!(verify_hub_signature("topsecret", body, &header));
    }

    #[test]
    fn tampered_body_rejected() {
        let header = sign_body("topsecret", b"original");
        assert!(!verify_hub_signature("topsecret", b"tampered", &header));
    }

    #[test]
    fn malformed_headers_rejected() {
        assert!(!verify_hub_signature("topsecret", b"body", ""));
        assert!(!verify_hub_signature("topsecret", b"body", "md5=abcd"));
        assert!(!verify_hub_signature("topsecret", b"body", "sha256=nothex"));
    }

    #[test]
    fn wrong_secret_rejected() {
        let header = sign_body("topsecret", b"body");
        assert!(!verify_hub_signature("othersecret", b"body", &header));
    }

    #[test]
    fn api_key_accepts_operator_identity() {
        let jwt = token("byoa", "astra", "deploy-secret");
        assert!(verify_api_key(&jwt, "deploy-secret"));
    }

    #[test]
    fn api_key_rejects_wrong_claims_or_secret() {
        assert!(!verify_api_key(&token("byoa", "wrong", "deploy-secret"), "deploy-secret"));
        assert!(!verify_api_key(&token("intruder", "astra", "deploy-secret"), "deploy-secret"));
        assert!(!verify_api_key(&token("byoa", "astra", "other-secret"), "deploy-secret"));
        assert!(!verify_api_key("not-a-jwt", "deploy-secret"));
    }
}
