//! Access token validation and guest identities.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted; `exp` is validated
//! - An invalid token is rejected, never downgraded to a guest identity
//! - Generic error messages prevent information leakage

use crate::errors::RoomError;

use common::secret::{ExposeSecret, SecretBox};
use common::types::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Maximum accepted token length.
pub const MAX_TOKEN_SIZE: usize = 8192;

/// Display name given to guests who did not provide one.
pub const DEFAULT_GUEST_NAME: &str = "Guest";

/// Access token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token exceeds {MAX_TOKEN_SIZE} bytes")]
    TooLarge,

    #[error("token rejected: {0}")]
    Invalid(String),

    #[error("authentication required")]
    Missing,
}

impl From<AuthError> for RoomError {
    fn from(err: AuthError) -> Self {
        RoomError::Unauthorized(err.to_string())
    }
}

/// Who is on the other end of a connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub is_guest: bool,
}

/// Resolves bearer tokens into identities.
pub struct IdentityResolver {
    decoding_key: DecodingKey,
    allow_guests: bool,
}

impl IdentityResolver {
    pub fn new(secret: &SecretBox<Vec<u8>>, allow_guests: bool) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret()),
            allow_guests,
        }
    }

    /// Validate a token and return its claims.
    ///
    /// # Errors
    ///
    /// `AuthError::TooLarge` or `AuthError::Invalid`.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        if token.len() > MAX_TOKEN_SIZE {
            debug!(target: "rs.auth", size = token.len(), "Token rejected before parsing");
            return Err(AuthError::TooLarge);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!(target: "rs.auth", error = %e, "Token verification failed");
            AuthError::Invalid("The access token is invalid or expired".to_string())
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("token has no subject".to_string()));
        }
        Ok(data.claims)
    }

    /// Resolve an identity for a connection.
    ///
    /// A present token must be valid. Without one the caller becomes a guest
    /// named `display_name`, if guests are allowed.
    ///
    /// # Errors
    ///
    /// `RoomError::Unauthorized` on an invalid token, or on a missing token
    /// when guests are not allowed.
    #[instrument(skip_all)]
    pub fn resolve(
        &self,
        token: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Identity, RoomError> {
        let requested_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        match token.filter(|t| !t.is_empty()) {
            Some(token) => {
                let claims = self.validate(token)?;
                let display_name = claims
                    .name
                    .or(requested_name)
                    .unwrap_or_else(|| claims.sub.clone());
                Ok(Identity {
                    user_id: UserId::from(claims.sub),
                    display_name,
                    is_guest: false,
                })
            }
            None if self.allow_guests => Ok(Identity {
                user_id: UserId::guest(),
                display_name: requested_name.unwrap_or_else(|| DEFAULT_GUEST_NAME.to_string()),
                is_guest: true,
            }),
            None => Err(AuthError::Missing.into()),
        }
    }

    /// Resolve an authenticated identity. Guests are never accepted.
    ///
    /// # Errors
    ///
    /// `RoomError::Unauthorized` if the token is missing or invalid.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, RoomError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;
        let claims = self.validate(token)?;
        Ok(Identity {
            display_name: claims.name.unwrap_or_else(|| claims.sub.clone()),
            user_id: UserId::from(claims.sub),
            is_guest: false,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn resolver(allow_guests: bool) -> IdentityResolver {
        IdentityResolver::new(&SecretBox::new(Box::new(SECRET.to_vec())), allow_guests)
    }

    fn mint(sub: &str, name: Option<&str>, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            name: name.map(str::to_string),
            exp: now + exp_offset,
            iat: now,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_resolves_user() {
        let token = mint("user-1", Some("Ada"), 300);
        let identity = resolver(true).resolve(Some(&token), None).unwrap();
        assert_eq!(identity.user_id, UserId::from("user-1"));
        assert_eq!(identity.display_name, "Ada");
        assert!(!identity.is_guest);
    }

    #[test]
    fn test_missing_token_becomes_guest() {
        let identity = resolver(true).resolve(None, Some("  Visitor ")).unwrap();
        assert!(identity.is_guest);
        assert!(identity.user_id.is_guest());
        assert_eq!(identity.display_name, "Visitor");

        let unnamed = resolver(true).resolve(None, None).unwrap();
        assert_eq!(unnamed.display_name, DEFAULT_GUEST_NAME);
    }

    #[test]
    fn test_invalid_token_is_not_downgraded() {
        let result = resolver(true).resolve(Some("not.a.token"), Some("Mallory"));
        assert!(matches!(result, Err(RoomError::Unauthorized(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = mint("user-1", None, -3600);
        assert!(matches!(
            resolver(true).validate(&token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_guests_disabled() {
        let result = resolver(false).resolve(None, Some("Visitor"));
        assert!(matches!(result, Err(RoomError::Unauthorized(_))));
    }

    #[test]
    fn test_oversized_token_rejected_before_parsing() {
        let token = "a".repeat(MAX_TOKEN_SIZE + 1);
        assert!(matches!(
            resolver(true).validate(&token),
            Err(AuthError::TooLarge)
        ));
    }

    #[test]
    fn test_authenticate_refuses_guests() {
        assert!(resolver(true).authenticate(None).is_err());
        let token = mint("host-1", None, 300);
        let identity = resolver(true).authenticate(Some(&token)).unwrap();
        assert_eq!(identity.display_name, "host-1");
    }
}
