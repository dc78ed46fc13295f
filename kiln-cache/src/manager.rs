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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_config::{EngineConfig, FeeConfig, Language};
use kiln_error::{Error, ResultExt};
use kiln_util::execution::{ExecutionContext, PerformanceMetrics};
use kiln_util::instant_wrapper::InstantWrapper;
use tracing::{debug, warn};

use crate::cache::{CacheStats, FileCache};
use crate::downloader::{Downloader, HttpFetcher};
use crate::validator::{CodeValidator, ValidationResult};

/// Front door of the file layer: cache, downloader and validator behind one
/// handle, with rolling metrics over its calls.
pub struct FileManager<I: InstantWrapper> {
    cache: Arc<FileCache<I>>,
    validator: Arc<CodeValidator>,
    downloader: Downloader<I>,
    fees: FeeConfig,
    stats: parking_lot::Mutex<PerformanceMetrics>,
}

impl<I: InstantWrapper> FileManager<I> {
    pub fn new(
        config: &EngineConfig,
        fetcher: Arc<dyn HttpFetcher>,
        clock: I,
    ) -> Result<Self, Error> {
        let cache = Arc::new(
            FileCache::new(&config.cache, clock).err_tip(|| "Failed to create file cache")?,
        );
        let validator = Arc::new(CodeValidator::new(config.validation.clone()));
        let downloader = Downloader::new(cache.clone(), validator.clone(), fetcher);
        Ok(Self {
            cache,
            validator,
            downloader,
            fees: config.fees.clone(),
            stats: parking_lot::Mutex::new(PerformanceMetrics::default()),
        })
    }

    /// Resolves a context's file for execution, filling its metadata in
    /// place. A validation failure produces `validation_errors` metadata
    /// rather than an error, so the pipeline can report a soft failure to
    /// the caller.
    pub async fn resolve(&self, context: &mut ExecutionContext) -> Result<(), Error> {
        let start = std::time::Instant::now();
        let file_url = context.file_url.clone();
        debug!(file_url, "Processing file");

        let result = match self.downloader.download(&file_url, &file_url).await {
            Ok(result) => result,
            Err(err) => {
                self.record(false, start.elapsed(), 0.0);
                return Err(err.append(format!("While processing {file_url}")));
            }
        };

        let metadata = &mut context.metadata;
        metadata.insert("is_cached".to_string(), result.is_cached.to_string());
        if !result.validation.is_valid {
            warn!(file_url, errors = ?result.validation.errors, "File validation failed");
            self.record(false, start.elapsed(), 0.0);
            metadata.insert(
                "validation_errors".to_string(),
                result.validation.errors.join("; "),
            );
            return Ok(());
        }

        metadata.insert(
            "file_path".to_string(),
            result.file_path.to_string_lossy().into_owned(),
        );
        metadata.insert("file_hash".to_string(), result.hash);
        metadata.insert("file_size".to_string(), result.size.to_string());
        metadata.insert(
            "complexity".to_string(),
            format!("{:.2}", result.validation.complexity),
        );
        metadata.insert(
            "warnings".to_string(),
            result.validation.warnings.join("; "),
        );

        self.record(true, start.elapsed(), result.validation.complexity);
        debug!(
            file_url,
            cached = result.is_cached,
            size = result.size,
            "File processed",
        );
        Ok(())
    }

    pub async fn validate_file(&self, path: &Path) -> Result<ValidationResult, Error> {
        self.validator.validate_file(path).await
    }

    pub fn validate_content(
        &self,
        content: &[u8],
        language: Option<Language>,
    ) -> ValidationResult {
        self.validator.validate_content(content, language)
    }

    pub async fn get_file_by_key(&self, key: &str) -> Result<PathBuf, Error> {
        self.cache.get_by_key(key).await
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    pub fn get_performance_stats(&self) -> PerformanceMetrics {
        self.stats.lock().clone()
    }

    /// Running-cost estimate of one call: time and complexity priced per
    /// unit, plus the fixed overhead.
    pub fn calculate_cost(&self, duration: Duration, complexity: f64) -> f64 {
        duration.as_secs_f64() * self.fees.price_per_unit
            + complexity * self.fees.price_per_unit
            + self.fees.fixed_cost
    }

    fn record(&self, success: bool, duration: Duration, complexity: f64) {
        let cost = self.calculate_cost(duration, complexity);
        self.stats
            .lock()
            .record(success, duration, cost, std::time::SystemTime::now());
    }
}
