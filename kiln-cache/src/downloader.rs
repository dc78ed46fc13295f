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

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_config::Retry;
use kiln_error::{Code, Error, ResultExt, make_err};
use kiln_util::instant_wrapper::InstantWrapper;
use kiln_util::retry::{Retrier, RetryResult};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::FileCache;
use crate::validator::{CodeValidator, ValidationResult};

/// The HTTP boundary, injected so tests never talk to a network.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetches `url`, treating any non-2xx response as an error.
    async fn get(&self, url: &str) -> Result<Vec<u8>, Error>;
}

/// Production fetcher with retry/backoff on transient failures.
pub struct ReqwestFetcher {
    client: reqwest::Client,
    retrier: Retrier,
}

impl ReqwestFetcher {
    pub fn new(retry: Retry) -> Self {
        Self {
            client: reqwest::Client::new(),
            retrier: Retrier::default_with(retry),
        }
    }

    async fn get_once(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .err_tip(|| format!("Failed to request {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let code = match status.as_u16() {
                404 => Code::NotFound,
                400..=499 => Code::InvalidArgument,
                _ => Code::Unavailable,
            };
            return Err(make_err!(code, "Fetch of {url} returned status {status}"));
        }
        let body = response
            .bytes()
            .await
            .err_tip(|| format!("Failed to read body of {url}"))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>, Error> {
        self.retrier
            .retry(futures::stream::unfold((), move |()| async move {
                let result = match self.get_once(url).await {
                    Ok(body) => RetryResult::Ok(body),
                    Err(err) => RetryResult::Retry(err),
                };
                Some((result, ()))
            }))
            .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    /// Hex sha256 of the file content.
    pub hash: String,
    pub size: u64,
    pub is_cached: bool,
    pub validation: ValidationResult,
}

/// Fetch-into-cache plus validation of whatever came back.
pub struct Downloader<I: InstantWrapper> {
    cache: Arc<FileCache<I>>,
    validator: Arc<CodeValidator>,
    fetcher: Arc<dyn HttpFetcher>,
}

impl<I: InstantWrapper> Downloader<I> {
    pub fn new(
        cache: Arc<FileCache<I>>,
        validator: Arc<CodeValidator>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        Self {
            cache,
            validator,
            fetcher,
        }
    }

    /// Resolves `key` through the cache, fetching `url` on a miss, then
    /// validates the on-disk file. Validation failures are reported in the
    /// result, not as errors.
    pub async fn download(&self, key: &str, url: &str) -> Result<DownloadResult, Error> {
        let (file_path, is_cached) = self
            .cache
            .get_or_download(key, || async {
                debug!(url, "Downloading file");
                self.fetcher.get(url).await
            })
            .await
            .err_tip(|| format!("Failed to resolve {url}"))?;

        let content = tokio::fs::read(&file_path)
            .await
            .err_tip(|| format!("Failed to read downloaded file {file_path:?}"))?;
        let validation = self.validator.validate_file(&file_path).await?;

        Ok(DownloadResult {
            hash: hex::encode(Sha256::digest(&content)),
            size: content.len() as u64,
            file_path,
            is_cached,
            validation,
        })
    }
}
