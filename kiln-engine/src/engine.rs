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
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kiln_cache::{CacheStats, FileManager, HttpFetcher};
use kiln_config::{EngineConfig, Language};
use kiln_error::{Code, Error, ResultExt, make_err};
use kiln_pool::{ContainerManager, ContainerRuntime, PoolStats};
use kiln_util::execution::{ExecutionContext, ExecutionResult, PerformanceMetrics};
use kiln_util::instant_wrapper::InstantWrapper;
use tracing::info;

use crate::monitor::{Alert, AlertSeverity, ExecutionMonitor, HealthStatus};
use crate::pipeline::ExecutionPipeline;

/// The whole engine behind one handle: file layer, container pools,
/// pipeline and monitor, wired together from one [`EngineConfig`].
///
/// Call [`initialize`](Self::initialize) before executing and
/// [`shutdown`](Self::shutdown) when done. Both are idempotent.
pub struct ExecutionEngine<I: InstantWrapper> {
    config: EngineConfig,
    container_manager: Arc<ContainerManager>,
    pipeline: Arc<ExecutionPipeline<I>>,
    monitor: Arc<ExecutionMonitor<I>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl<I: InstantWrapper> ExecutionEngine<I> {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn HttpFetcher>,
        clock: I,
    ) -> Result<Self, Error> {
        let file_manager = Arc::new(
            FileManager::new(&config, fetcher, clock).err_tip(|| "Failed to build file layer")?,
        );
        let container_manager = Arc::new(ContainerManager::new(runtime, &config)?);
        let pipeline = Arc::new(ExecutionPipeline::new(
            file_manager,
            container_manager.clone(),
            config.fees.clone(),
        ));
        let monitor = ExecutionMonitor::new(config.monitor.clone(), &pipeline);
        Ok(Self {
            config,
            container_manager,
            pipeline,
            monitor,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Warms the container pools and starts the monitor.
    pub async fn initialize(&self) -> Result<(), Error> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.container_manager.initialize_pools().await?;
        self.monitor.start();
        info!(
            languages = ?self.container_manager.supported_languages(),
            "Engine initialized"
        );
        Ok(())
    }

    pub async fn execute(
        &self,
        file_url: &str,
        language: Language,
        attester_count: u32,
    ) -> Result<ExecutionResult, Error> {
        self.check_open()?;
        self.pipeline
            .execute(file_url, language, attester_count)
            .await
    }

    pub fn cancel_execution(&self, trace_id: &str) -> bool {
        self.pipeline.cancel_execution(trace_id)
    }

    pub fn get_active_executions(&self) -> Vec<ExecutionContext> {
        self.pipeline.get_active_executions()
    }

    pub fn get_stats(&self) -> PerformanceMetrics {
        self.pipeline.get_stats()
    }

    pub fn get_pool_stats(&self) -> HashMap<Language, PoolStats> {
        self.container_manager.get_pool_stats()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.pipeline.file_manager().get_cache_stats()
    }

    pub fn get_health_status(&self) -> HealthStatus {
        self.monitor.get_health_status()
    }

    pub fn get_alerts(&self, severity: Option<AlertSeverity>, limit: usize) -> Vec<Alert> {
        self.monitor.get_alerts(severity, limit)
    }

    /// Drains in-flight work and tears down every pool. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Engine shutting down");
        self.monitor.stop();
        self.pipeline
            .shutdown(Duration::from_secs(self.config.shutdown_timeout_s))
            .await;
        self.container_manager.shutdown().await;
        info!("Engine shut down");
    }

    fn check_open(&self) -> Result<(), Error> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Engine has not been initialized"
            ));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(make_err!(Code::FailedPrecondition, "Engine is shut down"));
        }
        Ok(())
    }
}
