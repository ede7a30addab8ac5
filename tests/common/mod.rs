// Common test utilities and helpers

pub mod client;
pub mod mocks;

use canopy_features::config::Config;
use canopy_features::routes::features::cache::{CacheStore, RedisCacheStore};
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(|| {
        // Initialize tracing for tests
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// True when the Redis named by FEATURE_CACHE_URI answers a PING within a second.
pub async fn is_redis_available() -> bool {
    let config = Config::for_tests();
    let Ok(store) = RedisCacheStore::new(&config.feature_cache_uri) else {
        return false;
    };
    matches!(
        tokio::time::timeout(Duration::from_secs(1), store.ping()).await,
        Ok(Ok(()))
    )
}
