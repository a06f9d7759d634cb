//! Stale-while-revalidate decision cache.
//!
//! Three states per key: fresh entries are served without touching the
//! origin, stale-but-usable entries are served immediately while a
//! single-flight background refresh runs, expired entries block on a
//! synchronous fetch. An origin failure never turns into an edge error
//! while any cached value exists.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use adloop_core::config::EdgeConfig;
use adloop_core::errors::InterfaceError;

use crate::origin::{Origin, Prediction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Hit,
    Stale,
    Miss,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Stale => "stale",
            Self::Miss => "miss",
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    prediction: Prediction,
    fetched_at: DateTime<Utc>,
    fresh_until: DateTime<Utc>,
    stale_until: DateTime<Utc>,
}

/// A served prediction plus its cache provenance and freshness window.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedPrediction {
    pub prediction: Prediction,
    pub cache_state: CacheState,
    pub fresh_until: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
}

struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    refreshing: DashMap<String, ()>,
    origin: Arc<dyn Origin>,
    fresh_ttl: Duration,
    stale_ttl: Duration,
    retry_after_secs: u64,
    max_entries: usize,
}

#[derive(Clone)]
pub struct DecisionCache {
    inner: Arc<CacheInner>,
}

impl DecisionCache {
    pub fn new(origin: Arc<dyn Origin>, config: &EdgeConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                refreshing: DashMap::new(),
                origin,
                fresh_ttl: Duration::seconds(config.fresh_ttl_secs as i64),
                stale_ttl: Duration::seconds(config.stale_ttl_secs as i64),
                retry_after_secs: config.retry_after_secs,
                max_entries: config.max_entries,
            }),
        }
    }

    pub async fn get(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CachedPrediction, InterfaceError> {
        let cached = self.inner.entries.get(entity_id).map(|entry| entry.clone());

        if let Some(entry) = &cached {
            if now < entry.fresh_until {
                return Ok(served(entry, CacheState::Hit));
            }
            if now < entry.stale_until {
                self.spawn_refresh(entity_id.to_string());
                return Ok(served(entry, CacheState::Stale));
            }
        }

        // Expired or never seen: fetch synchronously.
        match self.inner.origin.fetch_prediction(entity_id).await {
            Ok(prediction) => {
                let entry = self.store(prediction, now);
                Ok(served(&entry, CacheState::Miss))
            }
            Err(error) => match cached {
                // Past stale_until but still present: better stale than down.
                Some(entry) => {
                    warn!(
                        event_name = "edge.cache.serving_expired",
                        correlation_id = %entity_id,
                        error = %error,
                        "origin failed, serving the expired entry as stale"
                    );
                    Ok(served(&entry, CacheState::Stale))
                }
                None => Err(InterfaceError::Unavailable {
                    message: format!("no cached prediction for {entity_id} and origin failed"),
                    retry_after_secs: self.inner.retry_after_secs,
                }),
            },
        }
    }

    fn store(&self, prediction: Prediction, now: DateTime<Utc>) -> CacheEntry {
        self.evict_if_full(now);
        let entry = CacheEntry {
            fetched_at: now,
            fresh_until: now + self.inner.fresh_ttl,
            stale_until: now + self.inner.stale_ttl,
            prediction,
        };
        self.inner.entries.insert(entry.prediction.entity_id.clone(), entry.clone());
        entry
    }

    fn evict_if_full(&self, now: DateTime<Utc>) {
        if self.inner.entries.len() < self.inner.max_entries {
            return;
        }
        // Dead entries first, then the oldest fetch.
        self.inner.entries.retain(|_, entry| entry.stale_until > now);
        if self.inner.entries.len() >= self.inner.max_entries {
            let oldest = self
                .inner
                .entries
                .iter()
                .min_by_key(|entry| entry.fetched_at)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                self.inner.entries.remove(&key);
            }
        }
    }

    /// Single-flight: at most one in-flight refresh per key.
    fn spawn_refresh(&self, entity_id: String) {
        if self.inner.refreshing.insert(entity_id.clone(), ()).is_some() {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let result = cache.inner.origin.fetch_prediction(&entity_id).await;
            match result {
                Ok(prediction) => {
                    cache.store(prediction, Utc::now());
                    debug!(
                        event_name = "edge.cache.refreshed",
                        correlation_id = %entity_id,
                        "stale entry refreshed in the background"
                    );
                }
                Err(error) => {
                    // The stale entry stays; the next read retries.
                    debug!(
                        event_name = "edge.cache.refresh_failed",
                        correlation_id = %entity_id,
                        error = %error,
                        "background refresh failed, keeping stale entry"
                    );
                }
            }
            cache.inner.refreshing.remove(&entity_id);
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.entries.len()
    }
}

fn served(entry: &CacheEntry, cache_state: CacheState) -> CachedPrediction {
    CachedPrediction {
        prediction: entry.prediction.clone(),
        cache_state,
        fresh_until: entry.fresh_until,
        stale_until: entry.stale_until,
    }
}
