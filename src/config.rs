use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub deployment: String,
    pub bind_address: String,
    pub log_format: String,
    // Scene catalog
    pub catalog_url: String,
    pub catalog_sign_url: Option<String>,
    pub catalog_token: Option<String>,
    pub catalog_max_retries: usize,
    // Asset downloads
    pub asset_max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    // Feature cache
    pub feature_cache_uri: String,
    pub feature_cache_ttl: u64, // Cache TTL in seconds, 0 = never expire
    pub population_lock_ttl: u64,
    pub population_poll_ms: u64,
    pub coordinate_precision: u32,
    // Pipeline defaults
    pub patch_size: usize,
    pub max_patch_size: usize,
    pub cloud_cover_max: f64,
    pub result_limit: usize,
    pub default_collection: String,
    pub max_scene_fallback: usize,
    pub include_full_stack: bool,
    // Environmental covariates
    pub environment_url: String,
    pub precipitation_url: String,
}

/// Reads `key` from the environment, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok(); // Load from .env file if available

        Config {
            app_name: env::var("APP_NAME").unwrap_or_else(|_| "canopy-features".to_string()),
            deployment: env::var("DEPLOYMENT").unwrap_or_else(|_| "local".to_string()),
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            catalog_url: env::var("CATALOG_URL").unwrap_or_else(|_| {
                "https://planetarycomputer.microsoft.com/api/stac/v1/search".to_string()
            }),
            // An explicitly empty CATALOG_SIGN_URL disables signing
            catalog_sign_url: match env::var("CATALOG_SIGN_URL") {
                Ok(url) if url.trim().is_empty() => None,
                Ok(url) => Some(url),
                Err(_) => Some(
                    "https://planetarycomputer.microsoft.com/api/sas/v1/sign".to_string(),
                ),
            },
            catalog_token: env_opt("CATALOG_TOKEN"),
            catalog_max_retries: env_or("CATALOG_MAX_RETRIES", 3),
            asset_max_retries: env_or("ASSET_MAX_RETRIES", 3),
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", 200),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30),
            feature_cache_uri: env::var("FEATURE_CACHE_URI")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            feature_cache_ttl: env_or("FEATURE_CACHE_TTL", 0),
            population_lock_ttl: env_or("POPULATION_LOCK_TTL", 120),
            population_poll_ms: env_or("POPULATION_POLL_MS", 500),
            coordinate_precision: env_or("COORDINATE_PRECISION", 4),
            patch_size: env_or("PATCH_SIZE", 64),
            max_patch_size: env_or("MAX_PATCH_SIZE", 512),
            cloud_cover_max: env_or("CLOUD_COVER_MAX", 10.0),
            result_limit: env_or("RESULT_LIMIT", 5),
            default_collection: env::var("DEFAULT_COLLECTION")
                .unwrap_or_else(|_| "sentinel-2-l2a".to_string()),
            max_scene_fallback: env_or("MAX_SCENE_FALLBACK", 3),
            include_full_stack: env_or("INCLUDE_FULL_STACK", false),
            environment_url: env::var("ENVIRONMENT_URL")
                .unwrap_or_else(|_| "https://api.open-meteo.com/v1/elevation".to_string()),
            precipitation_url: env::var("PRECIPITATION_URL")
                .unwrap_or_else(|_| "https://archive-api.open-meteo.com/v1/archive".to_string()),
        }
    }

    /// Fixed configuration for tests: no signing, no backoff delay, fast polling.
    pub fn for_tests() -> Self {
        Config {
            app_name: "canopy-features-test".to_string(),
            deployment: "test".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            log_format: "text".to_string(),
            catalog_url: "http://localhost:8081/search".to_string(),
            catalog_sign_url: None,
            catalog_token: None,
            catalog_max_retries: 3,
            asset_max_retries: 2,
            retry_base_delay_ms: 0,
            request_timeout_secs: 5,
            feature_cache_uri: env::var("FEATURE_CACHE_URI")
                .unwrap_or_else(|_| "redis://localhost:6379/1".to_string()),
            feature_cache_ttl: 60,
            population_lock_ttl: 10,
            population_poll_ms: 10,
            coordinate_precision: 4,
            patch_size: 1,
            max_patch_size: 16,
            cloud_cover_max: 10.0,
            result_limit: 5,
            default_collection: "LANDSAT_8_C2_L2".to_string(),
            max_scene_fallback: 3,
            include_full_stack: false,
            environment_url: "http://localhost:8082/elevation".to_string(),
            precipitation_url: "http://localhost:8082/archive".to_string(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Prefix shared by every key this deployment writes to the feature store.
    pub fn cache_prefix(&self) -> String {
        format!("{}-{}", self.app_name, self.deployment)
    }
}
