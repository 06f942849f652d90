use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use jwt::{Claims, Header, RegisteredClaims, SignWithKey, Token, VerifyWithKey};
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::model::{Ms, now_ms};
use crate::store::Store;

// ── Connection password ──────────────────────────────────

/// Cleartext password checked during the pgwire startup handshake.
#[derive(Debug)]
pub struct ServerPassword {
    password: String,
}

impl ServerPassword {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ServerPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Credential generation ────────────────────────────────

/// Salted SHA-256, hex encoded. Generates secret and token values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hasher {
    salt: String,
}

impl Hasher {
    pub fn new(salt: String) -> Self {
        Self { salt }
    }

    pub fn hash(&self, input: &str) -> String {
        let digest = Sha256::new()
            .chain_update(self.salt.as_bytes())
            .chain_update(input.as_bytes())
            .finalize();
        hex::encode(digest)
    }

    pub fn secret_value(&self, company: &str) -> String {
        self.hash(&format!("{company}:{}", random_string(16)))
    }

    pub fn token_value(&self, secret: &str) -> String {
        self.hash(&format!("{secret}:{}", random_string(8)))
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// ── Verification ─────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential: {0}")]
    Missing(&'static str),
    #[error("invalid JWT")]
    InvalidJwt,
    #[error("JWT subject is not a known customer")]
    UnknownCustomer,
    #[error("invalid API secret or token")]
    InvalidApiKey,
    #[error("API token expired")]
    Expired,
    #[error("not permitted: {0}")]
    Forbidden(&'static str),
    #[error("JWT signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Jwt,
    ApiKey,
}

/// A verified identity. `customer_id` is `None` only for an admin JWT
/// without a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub scheme: Scheme,
    pub customer_id: Option<Ulid>,
    pub admin: bool,
}

impl Principal {
    pub fn can_act_for(&self, customer_id: Ulid) -> bool {
        self.admin || self.customer_id == Some(customer_id)
    }
}

/// Verifies both credential schemes against the store.
pub struct Authenticator {
    store: Arc<dyn Store>,
    key: Hmac<Sha256>,
    issuer: String,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>, jwt_secret: &str, issuer: String) -> Result<Self, AuthError> {
        let key = Hmac::<Sha256>::new_from_slice(jwt_secret.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        Ok(Self { store, key, issuer })
    }

    /// HS256 with our issuer; `iat` must not be in the future and `nbf`/`exp`
    /// are honored when present. The subject must be an existing customer
    /// unless the private claim `admin` is `true`.
    pub async fn verify_jwt(&self, raw: &str) -> Result<Principal, AuthError> {
        let token: Token<Header, Claims, _> =
            raw.verify_with_key(&self.key).map_err(|_| AuthError::InvalidJwt)?;
        let claims = token.claims();
        let now = (now_ms() / 1000) as u64;

        if claims.registered.issuer.as_deref() != Some(self.issuer.as_str()) {
            return Err(AuthError::InvalidJwt);
        }
        match claims.registered.issued_at {
            Some(iat) if iat <= now => {}
            _ => return Err(AuthError::InvalidJwt),
        }
        if claims.registered.not_before.is_some_and(|nbf| nbf > now) {
            return Err(AuthError::InvalidJwt);
        }
        if claims.registered.expiration.is_some_and(|exp| exp < now) {
            return Err(AuthError::InvalidJwt);
        }

        let admin = claims
            .private
            .get("admin")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let subject = match claims.registered.subject.as_deref() {
            Some(sub) => Some(sub.parse::<Ulid>().map_err(|_| AuthError::InvalidJwt)?),
            None => None,
        };

        if !admin {
            let customer_id = subject.ok_or(AuthError::InvalidJwt)?;
            if self.store.get_customer(customer_id).await.is_none() {
                return Err(AuthError::UnknownCustomer);
            }
        }
        Ok(Principal {
            scheme: Scheme::Jwt,
            customer_id: subject,
            admin,
        })
    }

    /// The secret must exist and the token must belong to the same customer
    /// and still be valid at `now`.
    pub async fn verify_api_key(&self, secret: &str, token: &str, now: Ms) -> Result<Principal, AuthError> {
        let secret = self
            .store
            .find_secret(secret)
            .await
            .ok_or(AuthError::InvalidApiKey)?;
        let token = self
            .store
            .find_token(token)
            .await
            .ok_or(AuthError::InvalidApiKey)?;
        if token.customer_id != secret.customer_id {
            return Err(AuthError::InvalidApiKey);
        }
        if token.valid_until <= now {
            return Err(AuthError::Expired);
        }
        Ok(Principal {
            scheme: Scheme::ApiKey,
            customer_id: Some(secret.customer_id),
            admin: false,
        })
    }

    /// Mint a JWT under the configured key and issuer.
    pub fn sign_jwt(&self, subject: Option<Ulid>, admin: bool, ttl_secs: u64) -> Result<String, AuthError> {
        let now = (now_ms() / 1000) as u64;
        let mut claims = Claims::new(RegisteredClaims {
            issuer: Some(self.issuer.clone()),
            subject: subject.map(|id| id.to_string()),
            issued_at: Some(now),
            expiration: Some(now + ttl_secs),
            ..Default::default()
        });
        if admin {
            claims
                .private
                .insert("admin".into(), serde_json::Value::Bool(true));
        }
        claims
            .sign_with_key(&self.key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }
}
