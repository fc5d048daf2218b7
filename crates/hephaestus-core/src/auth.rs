//! Service-account authentication: keystore-backed JWT verification with
//! role assertion.
//!
//! The keystore is a JSON file of `{kid, principal, roles, secret,
//! expires_at?}` entries, loaded at startup and swapped atomically on reload;
//! in-flight verifications keep the snapshot they started with. Tokens are
//! compact HS256 JWTs whose header names the signing `kid`. Every transport
//! goes through the same [`Verifier`], so authorization decisions cannot
//! diverge between REST and RPC by construction.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("unknown key id: {0}")]
    UnknownKey(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("role denied: {required} not granted to {principal}")]
    RoleDenied { principal: String, required: Role },
}

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("failed to read keystore {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse keystore {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("duplicate key id in keystore: {0}")]
    DuplicateKid(String),
}

/// Operation families a service account may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    GuardRails,
    Cleanup,
    Analytics,
    Release,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::GuardRails => "guard-rails",
            Role::Cleanup => "cleanup",
            Role::Analytics => "analytics",
            Role::Release => "release",
        };
        f.write_str(name)
    }
}

/// One keystore entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    pub kid: String,
    pub principal: String,
    pub roles: Vec<Role>,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// JWT claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub roles: Vec<Role>,
    pub exp: i64,
}

/// The authenticated caller, produced by a successful verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub key_id: String,
    pub roles: Vec<Role>,
}

type KeyMap = HashMap<String, ServiceAccountKey>;

/// Read-mostly keystore with atomic snapshot replacement on reload.
pub struct Keystore {
    path: PathBuf,
    keys: RwLock<Arc<KeyMap>>,
}

impl Keystore {
    /// Load the keystore file. A missing file yields an empty keystore so a
    /// gateway can boot before provisioning; every verify then fails closed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, KeystoreError> {
        let path = path.into();
        let keys = Self::read_keys(&path)?;
        Ok(Self {
            path,
            keys: RwLock::new(Arc::new(keys)),
        })
    }

    fn read_keys(path: &Path) -> Result<KeyMap, KeystoreError> {
        if !path.exists() {
            tracing::warn!(target: "hephaestus::auth", path = %path.display(), "keystore file missing, starting empty");
            return Ok(KeyMap::new());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| KeystoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<ServiceAccountKey> =
            serde_json::from_str(&raw).map_err(|source| KeystoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let mut map = KeyMap::with_capacity(entries.len());
        for entry in entries {
            let kid = entry.kid.clone();
            if map.insert(kid.clone(), entry).is_some() {
                return Err(KeystoreError::DuplicateKid(kid));
            }
        }
        Ok(map)
    }

    /// Re-read the file and swap the snapshot. Verifications already holding
    /// the old snapshot complete against it.
    pub fn reload(&self) -> Result<usize, KeystoreError> {
        let keys = Self::read_keys(&self.path)?;
        let count = keys.len();
        let mut guard = self
            .keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(keys);
        tracing::info!(target: "hephaestus::auth", count, "keystore reloaded");
        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<KeyMap> {
        self.keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

/// Verifies bearer tokens against the keystore. Shared by every transport.
pub struct Verifier {
    keystore: Arc<Keystore>,
}

impl Verifier {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self { keystore }
    }

    /// Verify a compact token and assert `required_role`.
    ///
    /// The asserted role must be present both in the token claims and in the
    /// keystore entry, so a stale token cannot outlive a role revocation.
    pub fn verify(&self, token: &str, required_role: Role) -> Result<Principal, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;
        let kid = header.kid.ok_or(AuthError::Malformed)?;

        let keys = self.keystore.snapshot();
        let key = keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKey(kid.clone()))?;
        if let Some(expires_at) = key.expires_at {
            if expires_at <= Utc::now() {
                return Err(AuthError::Expired);
            }
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        let decoded = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(key.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            _ => AuthError::Malformed,
        })?;

        let claims = decoded.claims;
        let granted = claims
            .roles
            .iter()
            .any(|role| *role == required_role && key.roles.contains(role));
        if !granted {
            return Err(AuthError::RoleDenied {
                principal: claims.sub,
                required: required_role,
            });
        }
        Ok(Principal {
            name: claims.sub,
            key_id: kid,
            roles: claims
                .roles
                .into_iter()
                .filter(|role| key.roles.contains(role))
                .collect(),
        })
    }
}

/// Mint a token for a keystore entry. Used by provisioning tooling and tests.
pub fn issue_token(
    key: &ServiceAccountKey,
    roles: &[Role],
    ttl: std::time::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let mut header = jsonwebtoken::Header::new(Algorithm::HS256);
    header.kid = Some(key.kid.clone());
    let claims = AccessClaims {
        sub: key.principal.clone(),
        roles: roles.to_vec(),
        exp: (Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()))
            .timestamp(),
    };
    jsonwebtoken::encode(
        &header,
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(key.secret.as_bytes()),
    )
}
