//! Registration credentials: a shared static token, an HS256 JWT whose
//! subject is the sentinel's layer, or both.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no auth token presented")]
    Missing,
    #[error("auth token does not match")]
    Mismatch,
    #[error("auth token expired")]
    Expired,
    #[error("token subject '{found}' does not match layer '{expected}'")]
    Subject { expected: String, found: String },
    #[error("invalid auth token: {0}")]
    Jwt(#[source] jsonwebtoken::errors::Error),
}

/// Claims carried by sentinel registration tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Clone, Default)]
pub struct RegistrationAuth {
    token: Option<String>,
    jwt_secret: Option<String>,
}

impl RegistrationAuth {
    pub fn new(token: Option<String>, jwt_secret: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            jwt_secret: jwt_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.security.auth_token.clone(), config.jwt_secret())
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some() || self.jwt_secret.is_some()
    }

    /// Accept the registration of `layer` presenting `presented`. A static
    /// token match wins; otherwise the token must be a valid JWT for the layer.
    pub fn check(&self, layer: &str, presented: Option<&str>) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let presented = presented.map(str::trim).filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;

        if let Some(expected) = self.token.as_deref() {
            if token_matches(expected, presented) {
                return Ok(());
            }
        }
        match self.jwt_secret.as_deref() {
            Some(secret) => {
                let claims = verify_jwt(secret, presented)?;
                if claims.sub != layer {
                    return Err(AuthError::Subject {
                        expected: layer.to_string(),
                        found: claims.sub,
                    });
                }
                Ok(())
            }
            None => Err(AuthError::Mismatch),
        }
    }
}

/// Verify signature and expiry of an HS256 token.
pub fn verify_jwt(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Jwt(err),
        })
}

/// Compare digests so the check does not short-circuit on the raw token.
fn token_matches(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-32-characters-long";

    fn sign(secret: &str, sub: &str, ttl_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            exp: now + ttl_secs,
            iat: Some(now),
            iss: Some("starlight-sentinel".to_string()),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn disabled_auth_accepts_anything() {
        assert!(RegistrationAuth::default().check("janitor", None).is_ok());
    }

    #[test]
    fn static_token_comparison() {
        let auth = RegistrationAuth::new(Some("s3cret".to_string()), None);
        assert!(auth.check("janitor", Some("s3cret")).is_ok());
        assert!(matches!(auth.check("janitor", Some("guess")), Err(AuthError::Mismatch)));
        assert!(matches!(auth.check("janitor", None), Err(AuthError::Missing)));
    }

    #[test]
    fn signed_token_for_the_layer_is_accepted() {
        let auth = RegistrationAuth::new(None, Some(SECRET.to_string()));
        let token = sign(SECRET, "janitor", 3600);
        assert!(auth.check("janitor", Some(&token)).is_ok());
        assert_eq!(verify_jwt(SECRET, &token).unwrap().sub, "janitor");
    }

    #[test]
    fn expired_token_is_refused() {
        let auth = RegistrationAuth::new(None, Some(SECRET.to_string()));
        // Past the library's default clock-skew leeway.
        let token = sign(SECRET, "janitor", -600);
        assert!(matches!(auth.check("janitor", Some(&token)), Err(AuthError::Expired)));
    }

    #[test]
    fn token_signed_with_another_secret_is_refused() {
        let auth = RegistrationAuth::new(None, Some(SECRET.to_string()));
        let token = sign("some-other-secret-of-similar-length", "janitor", 3600);
        assert!(matches!(auth.check("janitor", Some(&token)), Err(AuthError::Jwt(_))));
    }

    #[test]
    fn token_for_another_layer_is_refused() {
        let auth = RegistrationAuth::new(None, Some(SECRET.to_string()));
        let token = sign(SECRET, "vision", 3600);
        assert!(matches!(
            auth.check("janitor", Some(&token)),
            Err(AuthError::Subject { .. })
        ));
    }

    #[test]
    fn static_token_and_jwt_can_coexist() {
        let auth = RegistrationAuth::new(Some("s3cret".to_string()), Some(SECRET.to_string()));
        assert!(auth.check("janitor", Some("s3cret")).is_ok());
        assert!(auth.check("janitor", Some(&sign(SECRET, "janitor", 60))).is_ok());
        assert!(auth.check("janitor", Some("guess")).is_err());
    }
}
