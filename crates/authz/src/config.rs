use crate::error::{AuthzError, Result};
use crate::evaluator::EvaluatorConfig;
use serde::{Deserialize, Serialize};
use warden_bitmap::BitmapConfig;
use warden_cache::CacheSettings;
use warden_consistency::ConsistencyConfig;
use warden_store::BreakerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZookieConfig {
    /// Keyed MAC secret for zookies. Falls back to the environment, then a
    /// development key.
    pub mac_key: Option<String>,
}

/// Aggregated engine configuration.
///
/// Loadable from the environment with a `WARDEN` prefix and `__` as the
/// section separator, e.g. `WARDEN__CACHE__DEFAULT_TTL_MS=5000` or
/// `WARDEN__BREAKER__FAILURE_THRESHOLD=10`, optionally layered over a
/// `warden.toml` file in the working directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub bitmap: BitmapConfig,
    #[serde(default)]
    pub zookie: ZookieConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("warden").required(false))
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AuthzError::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| AuthzError::Config(e.to_string()))
    }
}
