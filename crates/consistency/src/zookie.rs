use crate::error::{ConsistencyError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use warden_models::Revision;

type HmacSha256 = Hmac<Sha256>;

/// Token version prefix, kept for format evolution.
const ZOOKIE_VERSION: &str = "v1";

/// Checksum key used when none is configured. Zookies are tamper-evident,
/// not secret, but deployments should still set their own key.
const DEV_MAC_KEY: &[u8] = b"warden-zookie-dev-key";

/// Decoded consistency token: a (tenant, revision) point in time.
///
/// Wire format: `v1.{b64url(tenant)}.{revision}.{created_at_ms}.{mac}`
/// where `mac` is the first 8 hex chars of
/// `HMAC-SHA256(key, "v1.{tenant}.{revision}.{created_at_ms}")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zookie {
    pub tenant_id: String,
    pub revision: Revision,
    pub created_at_ms: i64,
}

impl Zookie {
    /// Whether this token satisfies a minimum revision requirement.
    pub fn is_at_least(&self, min_revision: Revision) -> bool {
        self.revision >= min_revision
    }

    /// Milliseconds since the token was minted.
    pub fn age_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.created_at_ms
    }
}

/// Encodes and verifies zookies with a keyed MAC.
#[derive(Clone)]
pub struct ZookieSigner {
    key: Vec<u8>,
}

impl ZookieSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn from_env_or_default() -> Self {
        match std::env::var("WARDEN_ZOOKIE_MAC_KEY") {
            Ok(key) if !key.is_empty() => Self::new(key.into_bytes()),
            _ => {
                tracing::warn!("WARDEN_ZOOKIE_MAC_KEY not set, using built-in development key");
                Self::new(DEV_MAC_KEY.to_vec())
            }
        }
    }

    pub fn encode(&self, tenant_id: &str, revision: Revision) -> Result<String> {
        if tenant_id.is_empty() {
            return Err(ConsistencyError::InvalidZookie(
                "tenant must be non-empty".to_string(),
            ));
        }
        if revision < 0 {
            return Err(ConsistencyError::InvalidZookie(format!(
                "revision must be non-negative, got {}",
                revision
            )));
        }
        let created_at_ms = chrono::Utc::now().timestamp_millis();
        let tenant_b64 = URL_SAFE_NO_PAD.encode(tenant_id.as_bytes());
        let mac = self.checksum(tenant_id, revision, created_at_ms);
        Ok(format!(
            "{}.{}.{}.{}.{}",
            ZOOKIE_VERSION, tenant_b64, revision, created_at_ms, mac
        ))
    }

    pub fn decode(&self, token: &str) -> Result<Zookie> {
        if token.is_empty() {
            return Err(ConsistencyError::InvalidZookie(
                "token must be non-empty".to_string(),
            ));
        }

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 5 {
            return Err(ConsistencyError::InvalidZookie(format!(
                "expected 5 parts, got {}",
                parts.len()
            )));
        }
        let [version, tenant_b64, revision_str, created_at_str, mac] =
            [parts[0], parts[1], parts[2], parts[3], parts[4]];

        if version != ZOOKIE_VERSION {
            return Err(ConsistencyError::InvalidZookie(format!(
                "unsupported version: {}",
                version
            )));
        }

        let tenant_bytes = URL_SAFE_NO_PAD
            .decode(tenant_b64)
            .map_err(|e| ConsistencyError::InvalidZookie(format!("tenant encoding: {}", e)))?;
        let tenant_id = String::from_utf8(tenant_bytes)
            .map_err(|e| ConsistencyError::InvalidZookie(format!("tenant encoding: {}", e)))?;

        let revision: Revision = revision_str
            .parse()
            .map_err(|e| ConsistencyError::InvalidZookie(format!("revision: {}", e)))?;
        if revision < 0 {
            return Err(ConsistencyError::InvalidZookie(
                "revision must be non-negative".to_string(),
            ));
        }

        let created_at_ms: i64 = created_at_str
            .parse()
            .map_err(|e| ConsistencyError::InvalidZookie(format!("timestamp: {}", e)))?;

        let expected = self.checksum(&tenant_id, revision, created_at_ms);
        if !constant_time_eq(mac.as_bytes(), expected.as_bytes()) {
            return Err(ConsistencyError::InvalidZookie(
                "checksum mismatch".to_string(),
            ));
        }

        Ok(Zookie {
            tenant_id,
            revision,
            created_at_ms,
        })
    }

    fn checksum(&self, tenant_id: &str, revision: Revision, created_at_ms: i64) -> String {
        let payload = format!(
            "{}.{}.{}.{}",
            ZOOKIE_VERSION, tenant_id, revision, created_at_ms
        );
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any size");
        mac.update(payload.as_bytes());
        let digest = mac.finalize().into_bytes();
        hex::encode(digest)[..8].to_string()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
