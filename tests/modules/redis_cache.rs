// Feature cache against a live Redis

use crate::common::mocks::*;
use crate::common::{init, is_redis_available};
use canopy_features::config::Config;
use canopy_features::routes::features::cache::{CacheStore, FeatureCache, RedisCacheStore};
use chrono::Utc;

/// Key unique to this test run so parallel runs do not collide.
fn unique_key(name: &str) -> String {
    let config = Config::for_tests();
    format!(
        "{}/it/{}-{}",
        config.cache_prefix(),
        name,
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

#[tokio::test]
async fn test_redis_store_set_get_and_claims() {
    init();
    if !is_redis_available().await {
        eprintln!("Skipping test_redis_store_set_get_and_claims: Redis not available");
        return;
    }
    let store = RedisCacheStore::new(&Config::for_tests().feature_cache_uri).unwrap();
    let key = unique_key("store");

    assert_eq!(store.get(&key).await.unwrap(), None);
    store.set(&key, "{\"a\":1}", 30).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), Some("{\"a\":1}".to_string()));

    let claim = format!("{}:populating", key);
    assert!(store.try_claim(&claim, "first", 30).await.unwrap());
    assert!(!store.try_claim(&claim, "second", 30).await.unwrap());

    // Only the holder may extend or release
    assert!(!store.renew_claim(&claim, "second", 30).await.unwrap());
    assert!(!store.release_claim(&claim, "second").await.unwrap());
    assert!(store.renew_claim(&claim, "first", 30).await.unwrap());
    assert!(store.release_claim(&claim, "first").await.unwrap());
    assert!(store.try_claim(&claim, "second", 30).await.unwrap());

    store.release_claim(&claim, "second").await.unwrap();
    store.delete(&key).await.unwrap();
}

#[tokio::test]
async fn test_pipeline_record_round_trips_through_redis() {
    init();
    if !is_redis_available().await {
        eprintln!("Skipping test_pipeline_record_round_trips_through_redis: Redis not available");
        return;
    }
    let config = Config::for_tests();
    let record = reference_pipeline(&config)
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap();

    let cache = FeatureCache::new(
        RedisCacheStore::new(&config.feature_cache_uri).unwrap(),
        &config,
    );
    let key = unique_key("record");
    cache.put(&key, &record).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(record.clone()));

    // Writing identical content again keeps the stored entry
    cache.put(&key, &record).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(record));

    cache.store().delete(&key).await.unwrap();
}
