// Copyright 2025 The Kiln Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use kiln_config::CacheConfig;
use kiln_error::{Code, Error, ResultExt, make_err};
use kiln_util::instant_wrapper::InstantWrapper;
use kiln_util::spawn;
use kiln_util::task::JoinHandleDropGuard;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Counter snapshot of the cache. Returned to callers by value copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    /// Sum of the sizes of all live entries, in bytes.
    pub size: u64,
    pub max_size: u64,
    pub item_count: u64,
    pub eviction_count: u64,
}

impl CacheStats {
    fn update_hit_rate(&mut self) {
        let total = self.hit_count + self.miss_count;
        if total > 0 {
            self.hit_rate = self.hit_count as f64 / total as f64;
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
    last_accessed_s: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, CacheEntry>,
}

struct FileCacheInner<I: InstantWrapper> {
    cache_dir: PathBuf,
    config: CacheConfig,
    clock: I,
    state: RwLock<State>,
    stats: parking_lot::Mutex<CacheStats>,
}

/// On-disk cache of downloaded source files keyed by CID or URL, bounded by
/// a byte budget and a per-entry TTL.
///
/// Generic over the clock so tests can drive time themselves.
pub struct FileCache<I: InstantWrapper> {
    inner: Arc<FileCacheInner<I>>,
    // Aborted when the cache is dropped.
    _sweeper: Option<JoinHandleDropGuard<()>>,
}

fn sanitize_key(key: &str) -> String {
    key.replace(['/', ':'], "_")
}

impl<I: InstantWrapper> FileCache<I> {
    /// Creates the cache directory if needed and re-indexes any files already
    /// in it, using their mtime as last-accessed time.
    pub fn new(config: &CacheConfig, clock: I) -> Result<Self, Error> {
        let cache_dir = PathBuf::from(&config.cache_dir);
        std::fs::create_dir_all(&cache_dir)
            .err_tip(|| format!("Failed to create cache directory {}", config.cache_dir))?;

        let inner = Arc::new(FileCacheInner {
            cache_dir,
            config: config.clone(),
            clock,
            state: RwLock::new(State::default()),
            stats: parking_lot::Mutex::new(CacheStats {
                max_size: config.max_cache_size,
                ..Default::default()
            }),
        });
        inner.index_existing_files()?;

        let sweeper = (config.cleanup_interval_s > 0).then(|| {
            let inner = inner.clone();
            let interval = Duration::from_secs(config.cleanup_interval_s);
            spawn!("file_cache_sweeper", async move {
                loop {
                    tokio::time::sleep(interval).await;
                    inner.remove_stale().await;
                }
            })
        });

        Ok(Self {
            inner,
            _sweeper: sweeper,
        })
    }

    /// Returns the cached path for `key`, or fetches the content with
    /// `fetch_fn` and stores it. The bool is true on a cache hit.
    pub async fn get_or_download<F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
    ) -> Result<(PathBuf, bool), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, Error>>,
    {
        let now_s = self.inner.now_s();
        let known = {
            let state = self.inner.state.read().await;
            state
                .entries
                .get(key)
                .map(|entry| (entry.path.clone(), entry.last_accessed_s))
        };

        if let Some((path, last_accessed_s)) = known {
            let fresh = now_s.saturating_sub(last_accessed_s) <= self.inner.config.file_ttl_s;
            let on_disk = tokio::fs::metadata(&path).await.is_ok();
            if fresh && on_disk {
                let mut state = self.inner.state.write().await;
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.last_accessed_s = now_s;
                }
                drop(state);
                let mut stats = self.inner.stats.lock();
                stats.hit_count += 1;
                stats.update_hit_rate();
                drop(stats);
                debug!(key, "File cache hit");
                return Ok((path, true));
            }
            // Stale on-disk content must never be served. Drop the entry and
            // fall through to the miss path.
            debug!(key, fresh, on_disk, "Dropping unusable cache entry");
            self.inner.remove_entries(&[key.to_string()]).await;
        }

        {
            let mut stats = self.inner.stats.lock();
            stats.miss_count += 1;
            stats.update_hit_rate();
        }

        let content = fetch_fn().await?;
        let path = self.inner.store(key, &content).await?;
        Ok((path, false))
    }

    /// Read-only lookup. Never downloads and never refreshes access time.
    pub async fn get_by_key(&self, key: &str) -> Result<PathBuf, Error> {
        let now_s = self.inner.now_s();
        let state = self.inner.state.read().await;
        let entry = state
            .entries
            .get(key)
            .err_tip_with_code(|_| (Code::NotFound, format!("No cache entry for key {key}")))?;
        if now_s.saturating_sub(entry.last_accessed_s) > self.inner.config.file_ttl_s {
            return Err(make_err!(Code::NotFound, "Cache entry for key {key} is stale"));
        }
        Ok(entry.path.clone())
    }

    /// Drops all entries whose TTL has lapsed. Also run periodically by the
    /// background sweeper.
    pub async fn remove_stale(&self) {
        self.inner.remove_stale().await;
    }

    pub fn get_stats(&self) -> CacheStats {
        self.inner.stats.lock().clone()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }
}

impl<I: InstantWrapper> FileCacheInner<I> {
    fn now_s(&self) -> u64 {
        self.clock
            .now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Re-populates the index from the cache directory. Runs once at startup,
    /// before any concurrent access exists.
    fn index_existing_files(&self) -> Result<(), Error> {
        let entries = std::fs::read_dir(&self.cache_dir)
            .err_tip(|| format!("Failed to read cache directory {:?}", self.cache_dir))?;
        let mut state = self
            .state
            .try_write()
            .map_err(|_| make_err!(Code::Internal, "Cache index lock held during startup"))?;
        let mut stats = self.stats.lock();
        for dir_entry in entries {
            let Ok(dir_entry) = dir_entry else { continue };
            let path = dir_entry.path();
            let Ok(metadata) = dir_entry.metadata() else {
                warn!(?path, "Failed to stat pre-existing cache file");
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Some(key) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let last_accessed_s = metadata
                .modified()
                .ok()
                .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
                .map_or_else(|| self.now_s(), |d| d.as_secs());
            stats.item_count += 1;
            stats.size += metadata.len();
            state.entries.insert(
                key.to_string(),
                CacheEntry {
                    path,
                    size: metadata.len(),
                    last_accessed_s,
                },
            );
        }
        info!(count = state.entries.len(), "Indexed existing cached files");
        Ok(())
    }

    async fn store(&self, key: &str, content: &[u8]) -> Result<PathBuf, Error> {
        let mut state = self.state.write().await;
        self.ensure_space(&mut state, content.len() as u64).await?;

        let path = self.cache_dir.join(sanitize_key(key));
        tokio::fs::write(&path, content)
            .await
            .err_tip(|| format!("Failed to write cached file {path:?}"))?;

        let size = content.len() as u64;
        let replaced = state.entries.insert(
            key.to_string(),
            CacheEntry {
                path: path.clone(),
                size,
                last_accessed_s: self.now_s(),
            },
        );
        let mut stats = self.stats.lock();
        // Two concurrent misses on one key both land here. The second write
        // replaces the first, so only count the delta.
        if let Some(old) = replaced {
            stats.size -= old.size;
        } else {
            stats.item_count += 1;
        }
        stats.size += size;
        drop(stats);
        info!(key, size, "Stored file in cache");
        Ok(path)
    }

    /// Evicts oldest-last-accessed entries until `required` bytes fit under
    /// the budget. Caller holds the state write lock.
    async fn ensure_space(&self, state: &mut State, required: u64) -> Result<(), Error> {
        if required > self.config.max_cache_size {
            return Err(make_err!(
                Code::ResourceExhausted,
                "Content of {required} bytes cannot fit in cache of {} bytes",
                self.config.max_cache_size,
            ));
        }
        let current_size = self.stats.lock().size;
        if current_size + required <= self.config.max_cache_size {
            return Ok(());
        }
        let must_evict = current_size + required - self.config.max_cache_size;

        let mut candidates: Vec<(String, u64, u64)> = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_accessed_s, entry.size))
            .collect();
        candidates.sort_by_key(|(_, last_accessed_s, _)| *last_accessed_s);

        let mut evicted = 0u64;
        for (key, _, size) in candidates {
            if evicted >= must_evict {
                break;
            }
            self.drop_entry(state, &key).await;
            evicted += size;
        }
        info!(evicted, "Evicted bytes from cache to make space");
        Ok(())
    }

    async fn remove_stale(&self) {
        let now_s = self.now_s();
        let mut state = self.state.write().await;
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                now_s.saturating_sub(entry.last_accessed_s) > self.config.file_ttl_s
            })
            .map(|(key, _)| key.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "Sweeping stale cache entries");
        for key in &stale {
            self.drop_entry(&mut state, key).await;
        }
    }

    async fn remove_entries(&self, keys: &[String]) {
        let mut state = self.state.write().await;
        for key in keys {
            self.drop_entry(&mut state, key).await;
        }
    }

    /// Removes one entry from the index and best-effort from disk, keeping
    /// the counters in sync. Caller holds the state write lock.
    async fn drop_entry(&self, state: &mut State, key: &str) {
        let Some(entry) = state.entries.remove(key) else {
            return;
        };
        if let Err(err) = tokio::fs::remove_file(&entry.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(?err, path = ?entry.path, "Failed to remove cached file");
            }
        }
        let mut stats = self.stats.lock();
        stats.item_count -= 1;
        stats.size -= entry.size;
        stats.eviction_count += 1;
    }
}
