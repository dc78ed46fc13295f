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
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use kiln_config::{EngineConfig, Language};
use kiln_error::{Code, Error, ResultExt, make_err, make_input_err};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::container::PoolStats;
use crate::pool::ContainerPool;
use crate::runtime::{ContainerRuntime, ContainerUsage};
use crate::scripts;

const WORKING_DIR: &str = "/code";

/// Outcome of running user code inside a pooled container.
#[derive(Debug, Clone)]
pub struct ContainerExecution {
    pub exec_id: String,
    pub exit_code: i64,
    /// Output between the execution markers only.
    pub output: String,
    /// Wall time of the execution script, setup excluded.
    pub execution_time: Duration,
    /// Resource usage sampled while the exec was winding down. Zeroed when
    /// the runtime could not report it.
    pub usage: ContainerUsage,
}

/// Owns one [`ContainerPool`] per configured language and runs staged code
/// in containers borrowed from them.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    pools: HashMap<Language, Arc<ContainerPool>>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: &EngineConfig,
    ) -> Result<Self, Error> {
        let mut pools = HashMap::new();
        for language in config.languages() {
            let pool_config = config.pool_for(language);
            pools.insert(
                language,
                ContainerPool::new(language, pool_config, config.retry.clone(), runtime.clone())?,
            );
        }
        Ok(Self { runtime, pools })
    }

    /// Initializes every pool concurrently. One failing language does not
    /// stop the others, but the first error is still reported.
    pub async fn initialize_pools(&self) -> Result<(), Error> {
        let results = join_all(
            self.pools
                .values()
                .map(|pool| async move { pool.initialize().await }),
        )
        .await;
        let mut first_err = None;
        for result in results {
            if let Err(err) = result {
                warn!(?err, "Pool initialization failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err.append("While initializing container pools")),
            None => Ok(()),
        }
    }

    pub fn supported_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.pools.keys().copied().collect();
        languages.sort_by_key(|language| language.as_str());
        languages
    }

    pub async fn get_container(
        &self,
        language: Language,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        self.pool(language)?.get_container(cancel).await
    }

    pub async fn return_container(
        &self,
        language: Language,
        container_id: &str,
        healthy: bool,
    ) -> Result<(), Error> {
        self.pool(language)?
            .return_container(container_id, healthy)
            .await;
        Ok(())
    }

    pub fn mark_container_failed(
        &self,
        language: Language,
        container_id: &str,
        reason: &str,
    ) -> Result<(), Error> {
        self.pool(language)?.mark_error(container_id, reason);
        Ok(())
    }

    /// Stages `code` into the container and runs it, returning the output
    /// between the execution markers. The setup stage runs first and its
    /// overhead is excluded from the reported execution time.
    pub async fn execute_in_container(
        &self,
        container_id: &str,
        language: Language,
        code: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ContainerExecution, Error> {
        let state = self
            .runtime
            .inspect(container_id)
            .await
            .err_tip(|| format!("While verifying container {container_id}"))?;
        if !state.running {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Container {container_id} is not running (status: {})",
                state.status
            ));
        }

        self.runtime
            .put_file(container_id, WORKING_DIR, language.source_file_name(), code)
            .await
            .err_tip(|| format!("While staging code into {container_id}"))?;

        self.run_setup(container_id, language).await?;

        let exec_id = self
            .runtime
            .exec_create(container_id, scripts::execution_script(language))
            .await
            .err_tip(|| format!("While preparing execution in {container_id}"))?;
        debug!(container_id, exec_id, %language, "Starting execution");

        let started = Instant::now();
        let result = self.runtime.exec_run(&exec_id, cancel).await;
        let execution_time = started.elapsed();

        let exec_output = match result {
            Ok(output) => output,
            Err(err) => {
                if err.code == Code::Cancelled {
                    // Best effort only. The container is destroyed on the
                    // unhealthy return path either way.
                    if let Err(kill_err) = self.runtime.kill_exec(&exec_id).await {
                        warn!(exec_id, ?kill_err, "Failed to kill cancelled exec");
                    }
                }
                return Err(err.append(format!("While executing in {container_id}")));
            }
        };

        // Best effort. A container with no stats still produced a result.
        let usage = match self.runtime.stats(container_id).await {
            Ok(usage) => usage,
            Err(err) => {
                warn!(container_id, ?err, "Failed to sample container stats");
                ContainerUsage::default()
            }
        };

        let output = extract_marked_output(&exec_output.output);
        Ok(ContainerExecution {
            exec_id,
            exit_code: exec_output.exit_code,
            output,
            execution_time,
            usage,
        })
    }

    pub fn get_pool_stats(&self) -> HashMap<Language, PoolStats> {
        self.pools
            .iter()
            .map(|(&language, pool)| (language, pool.get_stats()))
            .collect()
    }

    pub async fn shutdown(&self) {
        join_all(self.pools.values().map(|pool| pool.shutdown())).await;
    }

    fn pool(&self, language: Language) -> Result<&Arc<ContainerPool>, Error> {
        self.pools
            .get(&language)
            .ok_or_else(|| make_input_err!("No container pool for language {language}"))
    }

    async fn run_setup(&self, container_id: &str, language: Language) -> Result<(), Error> {
        let exec_id = self
            .runtime
            .exec_create(container_id, scripts::setup_script(language))
            .await
            .err_tip(|| format!("While preparing setup in {container_id}"))?;
        let output = self
            .runtime
            .exec_run(&exec_id, &CancellationToken::new())
            .await
            .err_tip(|| format!("While running setup in {container_id}"))?;
        if output.exit_code != 0 {
            return Err(make_err!(
                Code::Internal,
                "Setup in {container_id} exited with {}: {}",
                output.exit_code,
                output.output.trim()
            ));
        }
        Ok(())
    }
}

/// Keeps only the lines between the start and end markers. Output without
/// both markers is returned as-is, trimmed.
fn extract_marked_output(raw: &str) -> String {
    let Some(start) = raw.find(scripts::START_MARKER) else {
        return raw.trim().to_string();
    };
    let after_start = &raw[start + scripts::START_MARKER.len()..];
    let Some(end) = after_start.find(scripts::END_MARKER) else {
        return after_start.trim().to_string();
    };
    after_start[..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_output_is_extracted() {
        let raw = "warmup noise\nSTART_EXECUTION\nhello\nworld\nEND_EXECUTION\n";
        assert_eq!(extract_marked_output(raw), "hello\nworld");
    }

    #[test]
    fn output_without_markers_is_passed_through() {
        assert_eq!(extract_marked_output("  plain \n"), "plain");
    }

    #[test]
    fn missing_end_marker_keeps_the_tail() {
        let raw = "START_EXECUTION\npartial output";
        assert_eq!(extract_marked_output(raw), "partial output");
    }
}
