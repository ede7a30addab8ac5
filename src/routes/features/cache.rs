//! Feature record cache with per-key population claims.

use super::models::{FeatureRecord, Location, TimeWindow};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Key/value storage behind the feature cache. Values are whole serialized
/// records, written with a single command.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// `ttl_seconds == 0` stores without expiry.
    fn set(&self, key: &str, value: &str, ttl_seconds: u64)
    -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Sets `key` to `token` only if absent. Returns whether this caller now holds it.
    fn try_claim(
        &self,
        key: &str,
        token: &str,
        ttl_seconds: u64,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Resets the expiry of `key` if it still holds `token`.
    fn renew_claim(
        &self,
        key: &str,
        token: &str,
        ttl_seconds: u64,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Deletes `key` only if it still holds `token`.
    fn release_claim(&self, key: &str, token: &str) -> impl Future<Output = Result<bool>> + Send;

    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

const RENEW_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisCacheStore {
    client: redis::Client,
}

impl RedisCacheStore {
    pub fn new(uri: &str) -> Result<Self> {
        Ok(RedisCacheStore {
            client: redis::Client::open(uri)?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut con = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_seconds > 0 {
            cmd.arg("EX").arg(ttl_seconds);
        }
        let _: () = cmd.query_async(&mut con).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.connection().await?;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut con).await?;
        Ok(())
    }

    async fn try_claim(&self, key: &str, token: &str, ttl_seconds: u64) -> Result<bool> {
        let mut con = self.connection().await?;
        // SET NX EX replies OK when set, nil when the key already exists
        let claimed: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut con)
            .await?;
        Ok(claimed.is_some())
    }

    async fn renew_claim(&self, key: &str, token: &str, ttl_seconds: u64) -> Result<bool> {
        let mut con = self.connection().await?;
        let renewed: i64 = redis::Script::new(RENEW_IF_OWNER)
            .key(key)
            .arg(token)
            .arg(ttl_seconds.max(1))
            .invoke_async(&mut con)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_claim(&self, key: &str, token: &str) -> Result<bool> {
        let mut con = self.connection().await?;
        let released: i64 = redis::Script::new(DELETE_IF_OWNER)
            .key(key)
            .arg(token)
            .invoke_async(&mut con)
            .await?;
        Ok(released == 1)
    }

    async fn ping(&self) -> Result<()> {
        let mut con = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

/// In-process store with the same expiry semantics as Redis.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        MemoryCacheStore::default()
    }

    fn expiry(ttl_seconds: u64) -> Option<Instant> {
        (ttl_seconds > 0).then(|| Instant::now() + Duration::from_secs(ttl_seconds))
    }

    fn live_value(entries: &mut HashMap<String, (String, Option<Instant>)>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> anyhow::Error {
    anyhow::anyhow!("memory cache lock poisoned")
}

impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.insert(key.to_string(), (value.to_string(), Self::expiry(ttl_seconds)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn try_claim(&self, key: &str, token: &str, ttl_seconds: u64) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (token.to_string(), Self::expiry(ttl_seconds.max(1))));
        Ok(true)
    }

    async fn renew_claim(&self, key: &str, token: &str, ttl_seconds: u64) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        if Self::live_value(&mut entries, key).as_deref() != Some(token) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (token.to_string(), Self::expiry(ttl_seconds.max(1))));
        Ok(true)
    }

    async fn release_claim(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        if Self::live_value(&mut entries, key).as_deref() != Some(token) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Rounds to `precision` decimals; -0 becomes 0 so both map to one key.
fn round_coordinate(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Equal apart from when the record was built.
fn same_content(a: &FeatureRecord, b: &FeatureRecord) -> bool {
    let mut b = b.clone();
    b.created_at = a.created_at;
    *a == b
}

pub struct FeatureCache<S> {
    store: S,
    prefix: String,
    precision: u32,
    ttl_seconds: u64,
    claim_ttl_seconds: u64,
}

impl<S: CacheStore> FeatureCache<S> {
    pub fn new(store: S, config: &Config) -> Self {
        FeatureCache {
            store,
            prefix: config.cache_prefix(),
            precision: config.coordinate_precision,
            ttl_seconds: config.feature_cache_ttl,
            claim_ttl_seconds: config.population_lock_ttl,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Deterministic key over the rounded location, the window, the band set
    /// (order and duplicates ignored), the collection and the patch size.
    pub fn cache_key(
        &self,
        location: Location,
        window: &TimeWindow,
        bands: &[String],
        collection: &str,
        patch_size: usize,
    ) -> String {
        let mut bands: Vec<&str> = bands.iter().map(String::as_str).collect();
        bands.sort_unstable();
        bands.dedup();
        let precision = self.precision as usize;
        let canonical = format!(
            "{:.*}|{:.*}|{}|{}|{}|{}|{}",
            precision,
            round_coordinate(location.latitude, self.precision),
            precision,
            round_coordinate(location.longitude, self.precision),
            window.start_date,
            window.end_date,
            bands.join(","),
            collection,
            patch_size
        );
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes());
        format!("{}/features/{}", self.prefix, id)
    }

    fn claim_key(key: &str) -> String {
        format!("{}:populating", key)
    }

    /// Cached record for `key`. Unreadable entries count as a miss.
    pub async fn get(&self, key: &str) -> PipelineResult<Option<FeatureRecord>> {
        let Some(raw) = self.store.get(key).await.map_err(|e| cache_error(key, e))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(cache_key = key, error = %e, "Discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    /// Stores `record`. Same content again is a no-op; different content
    /// replaces the entry and is logged as an inconsistency.
    pub async fn put(&self, key: &str, record: &FeatureRecord) -> PipelineResult<()> {
        if let Some(existing) = self.get(key).await? {
            if same_content(&existing, record) {
                debug!(cache_key = key, "Record already cached");
                return Ok(());
            }
            warn!(
                cache_key = key,
                existing_scene = %existing.scene_id,
                new_scene = %record.scene_id,
                "Cache inconsistency: overwriting record with different content"
            );
        }
        let payload = serde_json::to_string(record).map_err(|e| PipelineError::Cache {
            key: key.to_string(),
            reason: format!("serialization failed: {}", e),
        })?;
        self.store
            .set(key, &payload, self.ttl_seconds)
            .await
            .map_err(|e| cache_error(key, e))?;
        debug!(cache_key = key, bytes = payload.len(), "Stored feature record");
        Ok(())
    }

    /// Tries to become the single populator of `key`.
    pub async fn claim(&self, key: &str) -> PipelineResult<Option<PopulationClaim>> {
        let claim = PopulationClaim {
            key: Self::claim_key(key),
            token: Uuid::new_v4().to_string(),
        };
        let claimed = self
            .store
            .try_claim(&claim.key, &claim.token, self.claim_ttl_seconds)
            .await
            .map_err(|e| cache_error(key, e))?;
        Ok(claimed.then_some(claim))
    }

    /// Pushes the claim's expiry forward. `false` once another caller owns it.
    pub async fn renew(&self, claim: &PopulationClaim) -> PipelineResult<bool> {
        self.store
            .renew_claim(&claim.key, &claim.token, self.claim_ttl_seconds)
            .await
            .map_err(|e| cache_error(&claim.key, e))
    }

    /// Drops the claim unless it already expired and was taken over.
    pub async fn release(&self, claim: &PopulationClaim) -> PipelineResult<()> {
        let released = self
            .store
            .release_claim(&claim.key, &claim.token)
            .await
            .map_err(|e| cache_error(&claim.key, e))?;
        if !released {
            debug!(claim_key = %claim.key, "Claim already expired or taken over");
        }
        Ok(())
    }

    /// How often a populator renews its claim: three times per TTL.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis((self.claim_ttl_seconds.max(1) * 1000 / 3).max(50))
    }
}

/// Proof of holding the population claim of one key.
#[derive(Debug, Clone)]
pub struct PopulationClaim {
    key: String,
    token: String,
}

impl PopulationClaim {
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn cache_error(key: &str, e: anyhow::Error) -> PipelineError {
    PipelineError::Cache {
        key: key.to_string(),
        reason: format!("{:#}", e),
    }
}
