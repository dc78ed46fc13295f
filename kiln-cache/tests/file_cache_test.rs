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

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kiln_cache::FileCache;
use kiln_config::CacheConfig;
use kiln_error::{Code, Error};
use kiln_macro::kiln_test;
use kiln_util::instant_wrapper::MockInstantWrapped;
use mock_instant::thread_local::MockClock;
use pretty_assertions::assert_eq;

fn test_config(cache_dir: &std::path::Path, max_cache_size: u64, file_ttl_s: u64) -> CacheConfig {
    CacheConfig {
        cache_dir: cache_dir.to_string_lossy().into_owned(),
        max_cache_size,
        file_ttl_s,
        // Tests drive the clock themselves, no background sweeper.
        cleanup_interval_s: 0,
    }
}

fn counting_fetch(
    counter: &Arc<AtomicUsize>,
    content: &'static [u8],
) -> impl Future<Output = Result<Vec<u8>, Error>> {
    let counter = counter.clone();
    async move {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(content.to_vec())
    }
}

#[kiln_test]
async fn second_lookup_is_a_hit() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let cache = FileCache::new(
        &test_config(dir.path(), 1024 * 1024, 3600),
        MockInstantWrapped::default(),
    )?;
    let fetches = Arc::new(AtomicUsize::new(0));

    let (path, hit) = cache
        .get_or_download("file.py", || counting_fetch(&fetches, b"print(1)"))
        .await?;
    assert!(!hit);
    assert_eq!(tokio::fs::read(&path).await?, b"print(1)");

    let (_, hit) = cache
        .get_or_download("file.py", || counting_fetch(&fetches, b"print(1)"))
        .await?;
    assert!(hit);
    assert_eq!(fetches.load(Ordering::Relaxed), 1);

    let stats = cache.get_stats();
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.item_count, 1);
    Ok(())
}

#[kiln_test]
async fn stale_entry_is_fetched_again() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let cache = FileCache::new(
        &test_config(dir.path(), 1024 * 1024, 100),
        MockInstantWrapped::default(),
    )?;
    let fetches = Arc::new(AtomicUsize::new(0));

    let (_, hit) = cache
        .get_or_download("file.py", || counting_fetch(&fetches, b"print(1)"))
        .await?;
    assert!(!hit);

    // Within the TTL the entry is served as-is.
    MockClock::advance(Duration::from_secs(100));
    let (_, hit) = cache
        .get_or_download("file.py", || counting_fetch(&fetches, b"print(1)"))
        .await?;
    assert!(hit);

    // The hit above refreshed the access time, so staleness counts from it.
    MockClock::advance(Duration::from_secs(101));
    let (_, hit) = cache
        .get_or_download("file.py", || counting_fetch(&fetches, b"print(2)"))
        .await?;
    assert!(!hit);
    assert_eq!(fetches.load(Ordering::Relaxed), 2);
    Ok(())
}

#[kiln_test]
async fn vanished_file_is_fetched_again() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let cache = FileCache::new(
        &test_config(dir.path(), 1024 * 1024, 3600),
        MockInstantWrapped::default(),
    )?;
    let fetches = Arc::new(AtomicUsize::new(0));

    let (path, _) = cache
        .get_or_download("file.py", || counting_fetch(&fetches, b"print(1)"))
        .await?;
    tokio::fs::remove_file(&path).await?;

    let (_, hit) = cache
        .get_or_download("file.py", || counting_fetch(&fetches, b"print(1)"))
        .await?;
    assert!(!hit);
    assert_eq!(fetches.load(Ordering::Relaxed), 2);
    Ok(())
}

#[kiln_test]
async fn oldest_entries_are_evicted_first() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let cache = FileCache::new(
        &test_config(dir.path(), 100, 100_000),
        MockInstantWrapped::default(),
    )?;
    let fetches = Arc::new(AtomicUsize::new(0));

    cache
        .get_or_download("a.py", || counting_fetch(&fetches, &[0u8; 40]))
        .await?;
    MockClock::advance(Duration::from_secs(10));
    cache
        .get_or_download("b.py", || counting_fetch(&fetches, &[0u8; 40]))
        .await?;
    MockClock::advance(Duration::from_secs(10));
    // 40 more bytes do not fit under the 100 byte budget, so the least
    // recently accessed entry goes.
    cache
        .get_or_download("c.py", || counting_fetch(&fetches, &[0u8; 40]))
        .await?;

    let stats = cache.get_stats();
    assert_eq!(stats.eviction_count, 1);
    assert_eq!(stats.item_count, 2);
    assert_eq!(stats.size, 80);

    assert_eq!(
        cache.get_by_key("a.py").await.unwrap_err().code,
        Code::NotFound
    );
    cache.get_by_key("b.py").await?;
    cache.get_by_key("c.py").await?;
    Ok(())
}

#[kiln_test]
async fn content_larger_than_the_cache_is_rejected() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let cache = FileCache::new(
        &test_config(dir.path(), 100, 3600),
        MockInstantWrapped::default(),
    )?;

    let err = cache
        .get_or_download("big.py", || async { Ok(vec![0u8; 200]) })
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);
    Ok(())
}

#[kiln_test]
async fn pre_existing_files_are_indexed_at_startup() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    tokio::fs::write(dir.path().join("old.py"), b"print(0)").await?;

    let cache = FileCache::new(
        &test_config(dir.path(), 1024 * 1024, 3600),
        MockInstantWrapped::default(),
    )?;
    let path = cache.get_by_key("old.py").await?;
    assert_eq!(tokio::fs::read(&path).await?, b"print(0)");

    let stats = cache.get_stats();
    assert_eq!(stats.item_count, 1);
    assert_eq!(stats.size, 8);
    Ok(())
}

#[kiln_test]
async fn keys_with_separators_map_to_flat_file_names() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let cache = FileCache::new(
        &test_config(dir.path(), 1024 * 1024, 3600),
        MockInstantWrapped::default(),
    )?;

    let (path, _) = cache
        .get_or_download("https://host/dir/file.py", || async {
            Ok(b"print(1)".to_vec())
        })
        .await?;
    assert_eq!(path.parent(), Some(dir.path()));
    assert_eq!(
        path.file_name().and_then(|n| n.to_str()),
        Some("https___host_dir_file.py")
    );
    Ok(())
}
