// common/src/token.rs
//! Session token verification and issuing.
//!
//! Tokens are HS256 JWTs minted by the identity service and carried in a
//! cookie. The proxy only reads them, except for `/initialize`, which
//! exchanges a one-off token for a fresh session cookie.

use std::fmt;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::TokenError;

/// Claims carried by a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier
    #[serde(alias = "sub")]
    pub netid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<usize>,
}

/// Outcome of checking one request's credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// No token was presented
    Anonymous,
    Authenticated(Claims),
    /// A token was presented but did not verify
    Invalid(TokenError),
}

impl Identity {
    pub fn subject(&self) -> Option<&str> {
        match self {
            Identity::Authenticated(claims) => Some(&claims.netid),
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => write!(f, "anonymous"),
            Identity::Authenticated(claims) => write!(f, "user={}", claims.netid),
            Identity::Invalid(err) => write!(f, "invalid ({})", err),
        }
    }
}

/// Verifies session tokens against the shared secret
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8], leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        Self::new(auth.secret_key.as_bytes(), auth.leeway_secs)
    }

    /// Check signature and time claims, returning the decoded claims
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }

    /// Classify an optional cookie value. Failures are logged here so
    /// callers only have to decide what to do with them.
    pub fn identify(&self, token: Option<&str>) -> Identity {
        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => return Identity::Anonymous,
        };

        match self.verify(token) {
            Ok(claims) => Identity::Authenticated(claims),
            Err(err) => {
                tracing::warn!("Session token rejected: {}", err);
                Identity::Invalid(err)
            }
        }
    }
}

/// Issues session tokens with a fixed lifetime
#[derive(Clone)]
pub struct TokenSigner {
    key: EncodingKey,
    ttl: chrono::Duration,
}

impl TokenSigner {
    pub fn new(secret: &[u8], ttl: chrono::Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        Self::new(
            auth.secret_key.as_bytes(),
            chrono::Duration::hours(auth.session_ttl_hours),
        )
    }

    /// Sign a token for `netid` expiring `ttl` from now
    pub fn issue(&self, netid: &str, session_id: Option<&str>) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            netid: netid.to_string(),
            session_id: session_id.map(str::to_string),
            exp: (now + self.ttl).timestamp() as usize,
            iat: Some(now.timestamp() as usize),
            nbf: None,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }
}
