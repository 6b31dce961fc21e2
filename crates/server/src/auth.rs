//! Token → [`Claims`] verification. Spec §1 treats the JWT validator as an
//! opaque external capability; this module ships the reference
//! implementation backed by `jsonwebtoken` so the gateway is runnable and
//! testable standalone. Production deployments are expected to supply their
//! own [`ClaimsVerifier`].

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use gatehouse_protocol::Claims;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};

use crate::error::UpgradeError;

/// Wire shape of the reference JWT. `roles` defaults to empty, `name` to
/// `None` (which [`Claims::new`] then defaults to `user_id`) — see spec §3.
#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    /// Subject — the user id.
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    /// Expiration time (Unix timestamp).
    exp: u64,
}

/// Verifies a bearer token and returns the post-verification [`Claims`].
/// Implementations MUST fail fast on invalid/expired/malformed tokens and
/// MUST NOT leak internal detail in the returned error — the core only ever
/// reports `UpgradeError::InvalidToken` to the client regardless of cause.
pub trait ClaimsVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, UpgradeError>;
}

/// Reference `ClaimsVerifier` backed by a single shared HMAC secret.
pub struct JwtClaimsVerifier {
    secret: String,
}

impl JwtClaimsVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl ClaimsVerifier for JwtClaimsVerifier {
    fn verify(&self, token: &str) -> Result<Claims, UpgradeError> {
        let validation = Validation::new(Algorithm::HS256);
        let token_data: TokenData<JwtClaims> = jsonwebtoken::decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            tracing::warn!("jwt verification failed: {e}");
            UpgradeError::InvalidToken
        })?;

        let claims = token_data.claims;
        if claims.sub.is_empty() {
            return Err(UpgradeError::InvalidToken);
        }
        Ok(Claims::new(claims.sub, claims.name, claims.roles))
    }
}

/// Mint a reference token. Not part of the gateway's runtime surface (no
/// login endpoint ships in this core — see spec §1) but used by tests and
/// offline tooling to produce tokens the reference verifier accepts.
pub fn generate_token(
    secret: &str,
    user_id: &str,
    name: Option<&str>,
    roles: &[String],
    ttl_secs: u64,
) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();

    let claims = JwtClaims {
        sub: user_id.to_string(),
        name: name.map(str::to_string),
        roles: roles.to_vec(),
        exp: now + ttl_secs,
    };

    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to encode JWT")
}

/// Generate a cryptographically secure random hex secret, used when no
/// `server.jwt_secret` is configured. Reads from `/dev/urandom` for a CSPRNG
/// source without adding a dedicated RNG dependency.
pub fn generate_secret() -> String {
    use std::fmt::Write;
    use std::io::Read;
    let mut bytes = [0u8; 32];
    let f = std::fs::File::open("/dev/urandom").expect("failed to open /dev/urandom");
    (&f)
        .read_exact(&mut bytes)
        .expect("failed to read random bytes");
    let mut hex = String::with_capacity(64);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}
