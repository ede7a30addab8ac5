// End-to-end pipeline behaviour against in-memory backends

use crate::common::init;
use crate::common::mocks::*;
use approx::assert_abs_diff_eq;
use canopy_features::config::Config;
use canopy_features::routes::features::environment::{ELEVATION, PRECIPITATION};
use canopy_features::routes::features::models::GeoQuery;
use canopy_features::PipelineError;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_reference_location_yields_expected_ndvi() {
    init();
    let config = Config::for_tests();
    let pipeline = reference_pipeline(&config);

    let query = GeoQuery::new(location(), window(), COLLECTION).with_result_limit(1);
    let record = pipeline
        .prepare_features_for(&query, &bands(&["red", "nir08"]), 1)
        .await
        .unwrap();

    assert_eq!(record.scene_id, "LC08_L2SP_231067_20230715");
    assert_eq!(record.patch_size, 1);
    let ndvi = record.indices.ndvi.as_ref().unwrap();
    assert_eq!(ndvi.shape(), (1, 1));
    assert_abs_diff_eq!(ndvi.0[[0, 0]], 0.4286, epsilon = 1e-4);
    // EVI and NBR need bands that were not requested
    assert!(record.indices.evi.is_none());
    assert!(record.indices.nbr.is_none());
    assert!(record.low_confidence_indices.is_empty());
    assert!(!record.degraded);
    assert_eq!(record.environmental_features.get(ELEVATION), Some(142.0));
    assert_eq!(record.environmental_features.get(PRECIPITATION), Some(87.5));
    assert!(record.stack.is_none());
    assert_eq!(record.band_summaries.len(), 2);
}

#[tokio::test]
async fn test_second_request_is_served_from_cache() {
    init();
    let config = Config::for_tests();
    let pipeline = reference_pipeline(&config);

    let first = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap();
    let catalog_calls = pipeline.catalog().backend().calls.load(Ordering::SeqCst);
    let fetches = pipeline.assembler().fetcher().calls.load(Ordering::SeqCst);

    // Jittered coordinates and reordered bands hit the same entry
    let mut jittered = location();
    jittered.latitude += 1e-7;
    let second = pipeline
        .prepare_features(jittered, window(), &bands(&["nir08", "red"]), COLLECTION)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(pipeline.catalog().backend().calls.load(Ordering::SeqCst), catalog_calls);
    assert_eq!(pipeline.assembler().fetcher().calls.load(Ordering::SeqCst), fetches);
}

#[tokio::test]
async fn test_concurrent_requests_populate_once() {
    init();
    let config = Config::for_tests();
    let scene = scene("LC08_SLOW", 1.0, "2023-07-01T14:00:00Z", &["red", "nir08"]);
    let fetcher = MockFetcher::new()
        .with_asset("mem://LC08_SLOW/red", constant_band(0.2, 3))
        .with_asset("mem://LC08_SLOW/nir08", constant_band(0.5, 3))
        .with_delay(Duration::from_millis(100));
    let pipeline = Arc::new(pipeline_with(
        &config,
        MockCatalog::new(vec![scene]),
        fetcher,
        MockEnvironment::new(Some(10.0), Some(1.0)),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
                .await
        }));
    }
    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap().unwrap());
    }

    assert!(records.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(pipeline.catalog().backend().calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.assembler().fetcher().calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_population_slower_than_claim_ttl_runs_once() {
    init();
    let mut config = Config::for_tests();
    config.population_lock_ttl = 1;
    let scene = scene("LC08_SLOW", 1.0, "2023-07-01T14:00:00Z", &["red", "nir08"]);
    // Two sequential band reads take well over the claim TTL
    let fetcher = MockFetcher::new()
        .with_asset("mem://LC08_SLOW/red", constant_band(0.2, 3))
        .with_asset("mem://LC08_SLOW/nir08", constant_band(0.5, 3))
        .with_delay(Duration::from_millis(1200));
    let pipeline = Arc::new(pipeline_with(
        &config,
        MockCatalog::new(vec![scene]),
        fetcher,
        MockEnvironment::new(Some(10.0), Some(1.0)),
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
                .await
        }));
    }
    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap().unwrap());
    }

    assert!(records.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(pipeline.catalog().backend().calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.assembler().fetcher().calls.load(Ordering::SeqCst), 2);
    // The claim was released by its holder
    assert_eq!(pipeline.cache().store().len(), 1);
}

#[tokio::test]
async fn test_oversized_patch_is_rejected_before_io() {
    init();
    let config = Config::for_tests();
    let pipeline = reference_pipeline(&config);
    let query = GeoQuery::new(location(), window(), COLLECTION);

    let err = pipeline
        .prepare_features_for(&query, &bands(&["red", "nir08"]), config.max_patch_size + 1)
        .await
        .unwrap_err();
    match err {
        PipelineError::InvalidQuery { field, reason } => {
            assert_eq!(field, "patch_size");
            assert!(reason.contains(&config.max_patch_size.to_string()));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(pipeline.catalog().backend().calls.load(Ordering::SeqCst), 0);
    assert!(pipeline.cache().store().is_empty());

    let err = pipeline
        .prepare_features_for(&query, &bands(&["red", "nir08"]), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidQuery { field: "patch_size", .. }));
}

#[tokio::test]
async fn test_falls_back_to_next_scene() {
    init();
    let config = Config::for_tests();
    let scenes = vec![
        // Best ranked, but has no NIR asset
        scene("S1_NO_NIR", 0.5, "2023-07-20T14:00:00Z", &["red"]),
        // NIR download keeps failing
        scene("S2_BROKEN", 1.0, "2023-07-10T14:00:00Z", &["red", "nir08"]),
        scene("S3_GOOD", 2.0, "2023-07-01T14:00:00Z", &["red", "nir08"]),
    ];
    let fetcher = MockFetcher::new()
        .with_asset("mem://S1_NO_NIR/red", constant_band(0.1, 3))
        .with_asset("mem://S2_BROKEN/red", constant_band(0.1, 3))
        .with_asset("mem://S3_GOOD/red", constant_band(0.2, 3))
        .with_asset("mem://S3_GOOD/nir08", constant_band(0.5, 3));
    let pipeline = pipeline_with(
        &config,
        MockCatalog::new(scenes),
        fetcher,
        MockEnvironment::new(Some(10.0), Some(1.0)),
    );

    let record = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap();
    assert_eq!(record.scene_id, "S3_GOOD");
    assert_abs_diff_eq!(record.indices.ndvi.unwrap().0[[0, 0]], 0.4286, epsilon = 1e-4);
}

#[tokio::test]
async fn test_fallback_is_bounded() {
    init();
    let config = Config::for_tests();
    let scenes: Vec<_> = (0..5)
        .map(|i| scene(&format!("S{}", i), i as f64, "2023-07-01T14:00:00Z", &["red"]))
        .collect();
    let pipeline = pipeline_with(
        &config,
        MockCatalog::new(scenes),
        MockFetcher::new(),
        MockEnvironment::new(Some(10.0), Some(1.0)),
    );

    let err = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap_err();
    match err {
        PipelineError::NoUsableScene {
            attempted,
            last_error,
        } => {
            assert_eq!(attempted, vec!["S0", "S1", "S2"]);
            assert!(last_error.contains("nir08"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    // MissingBand is detected before any download
    assert_eq!(pipeline.assembler().fetcher().calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_scenes_found_is_terminal() {
    init();
    let config = Config::for_tests();
    let pipeline = pipeline_with(
        &config,
        MockCatalog::new(vec![]),
        MockFetcher::new(),
        MockEnvironment::new(Some(10.0), Some(1.0)),
    );

    let err = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoScenesFound { .. }));
    assert!(!err.is_retryable());
    assert!(err.to_string().contains(COLLECTION));
}

#[tokio::test]
async fn test_invalid_query_does_no_io() {
    init();
    let config = Config::for_tests();
    let pipeline = reference_pipeline(&config);

    let mut bad = location();
    bad.longitude = 200.0;
    let err = pipeline
        .prepare_features(bad, window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidQuery { field: "longitude", .. }));
    assert_eq!(pipeline.catalog().backend().calls.load(Ordering::SeqCst), 0);
    assert!(pipeline.cache().store().is_empty());
}

#[tokio::test]
async fn test_missing_covariates_degrade_record() {
    init();
    let config = Config::for_tests();
    let scene = scene("LC08_A", 1.0, "2023-07-01T14:00:00Z", &["red", "nir08"]);
    let fetcher = MockFetcher::new()
        .with_asset("mem://LC08_A/red", constant_band(0.2, 3))
        .with_asset("mem://LC08_A/nir08", constant_band(0.5, 3));
    let pipeline = pipeline_with(
        &config,
        MockCatalog::new(vec![scene]),
        fetcher,
        MockEnvironment::new(None, None),
    );

    let record = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap();
    assert!(record.degraded);
    assert!(record.environmental_features.values.is_empty());
    assert_eq!(record.environmental_features.missing, vec![ELEVATION, PRECIPITATION]);
    assert!(record.indices.ndvi.is_some());
}

#[tokio::test]
async fn test_catalog_outage_leaves_no_entry_and_next_call_recovers() {
    init();
    let config = Config::for_tests();
    let scene = scene("LC08_A", 1.0, "2023-07-01T14:00:00Z", &["red", "nir08"]);
    let fetcher = MockFetcher::new()
        .with_asset("mem://LC08_A/red", constant_band(0.2, 3))
        .with_asset("mem://LC08_A/nir08", constant_band(0.5, 3));
    // One more failure than the retry budget allows
    let pipeline = pipeline_with(
        &config,
        MockCatalog::new(vec![scene]).failing(config.catalog_max_retries + 1),
        fetcher,
        MockEnvironment::new(Some(10.0), Some(1.0)),
    );

    let err = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CatalogUnavailable { .. }));
    assert!(err.is_retryable());
    // Neither a record nor a dangling claim remains
    assert!(pipeline.cache().store().is_empty());

    let record = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap();
    assert_eq!(record.scene_id, "LC08_A");
}

#[tokio::test]
async fn test_cancelled_population_writes_nothing() {
    init();
    let mut config = Config::for_tests();
    config.population_lock_ttl = 1;
    let scene = scene("LC08_SLOW", 1.0, "2023-07-01T14:00:00Z", &["red", "nir08"]);
    let fetcher = MockFetcher::new()
        .with_asset("mem://LC08_SLOW/red", constant_band(0.2, 3))
        .with_asset("mem://LC08_SLOW/nir08", constant_band(0.5, 3))
        .with_delay(Duration::from_millis(300));
    let pipeline = Arc::new(pipeline_with(
        &config,
        MockCatalog::new(vec![scene]),
        fetcher,
        MockEnvironment::new(Some(10.0), Some(1.0)),
    ));

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let key = pipeline.cache().cache_key(
        location(),
        &window(),
        &bands(&["red", "nir08"]),
        COLLECTION,
        config.patch_size,
    );
    assert_eq!(pipeline.cache().get(&key).await.unwrap(), None);

    // The orphaned claim expires and a later caller populates
    let record = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap();
    assert_eq!(record.cache_key, key);
}

#[tokio::test]
async fn test_full_stack_is_kept_when_configured() {
    init();
    let mut config = Config::for_tests();
    config.include_full_stack = true;
    let pipeline = reference_pipeline(&config);

    let record = pipeline
        .prepare_features(location(), window(), &bands(&["red", "nir08"]), COLLECTION)
        .await
        .unwrap();
    let stack = record.stack.as_ref().unwrap();
    assert_eq!(stack.band_names(), vec!["red", "nir08"]);
    assert_eq!(stack.coordinate_reference, "EPSG:4326");

    // Survives the JSON round trip through the cache
    let cached = pipeline.cache().get(&record.cache_key).await.unwrap().unwrap();
    assert_eq!(cached, record);
}
