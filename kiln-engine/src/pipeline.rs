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
use std::time::{Duration, Instant, SystemTime};

use kiln_cache::FileManager;
use kiln_config::{FeeConfig, Language};
use kiln_error::{Code, Error, ResultExt, make_err};
use kiln_pool::ContainerManager;
use kiln_util::execution::{ExecutionContext, ExecutionResult, PerformanceMetrics, ResourceStats};
use kiln_util::instant_wrapper::InstantWrapper;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one request through its four stages: resolve the file, borrow a
/// container, execute, assemble the result.
///
/// Every in-flight request is registered under its trace id so it can be
/// cancelled and so shutdown can drain the set.
pub struct ExecutionPipeline<I: InstantWrapper> {
    file_manager: Arc<FileManager<I>>,
    container_manager: Arc<ContainerManager>,
    fees: FeeConfig,
    shutting_down: AtomicBool,
    active: Mutex<HashMap<String, ExecutionContext>>,
    stats: Mutex<PerformanceMetrics>,
}

impl<I: InstantWrapper> ExecutionPipeline<I> {
    pub fn new(
        file_manager: Arc<FileManager<I>>,
        container_manager: Arc<ContainerManager>,
        fees: FeeConfig,
    ) -> Self {
        Self {
            file_manager,
            container_manager,
            fees,
            shutting_down: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
            stats: Mutex::new(PerformanceMetrics::default()),
        }
    }

    pub async fn execute(
        &self,
        file_url: &str,
        language: Language,
        attester_count: u32,
    ) -> Result<ExecutionResult, Error> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Pipeline is shutting down, rejecting {file_url}"
            ));
        }
        let started = Instant::now();

        // Registered before any blocking work so the execution is
        // cancellable from its very first stage.
        let mut context =
            ExecutionContext::new(file_url.to_string(), language, attester_count);
        let trace_id = context.trace_id.clone();
        let cancel = context.cancellation.clone();
        self.active.lock().insert(trace_id.clone(), context.clone());
        let result = self.execute_registered(&mut context, started).await;
        context.completed_at = Some(SystemTime::now());
        self.active.lock().remove(&trace_id);

        match &result {
            Ok(outcome) => {
                self.record(outcome.success, started.elapsed(), outcome.stats.total_cost);
            }
            Err(err) => {
                self.record(false, started.elapsed(), 0.0);
                if err.code == Code::Cancelled || cancel.is_cancelled() {
                    debug!(trace_id, "Execution cancelled");
                }
            }
        }
        result
    }

    /// Cancels an in-flight execution. Returns false when the trace id is
    /// unknown (already finished or never started).
    pub fn cancel_execution(&self, trace_id: &str) -> bool {
        let active = self.active.lock();
        match active.get(trace_id) {
            Some(context) => {
                info!(trace_id, "Cancelling execution");
                context.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_active_executions(&self) -> Vec<ExecutionContext> {
        self.active.lock().values().cloned().collect()
    }

    pub fn get_stats(&self) -> PerformanceMetrics {
        self.stats.lock().clone()
    }

    pub fn file_manager(&self) -> &Arc<FileManager<I>> {
        &self.file_manager
    }

    /// Stops accepting work, cancels every in-flight execution and waits
    /// up to `timeout` for the active set to drain. A timeout is logged,
    /// never an error.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        for context in self.active.lock().values() {
            context.cancellation.cancel();
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.active.lock().len();
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Shutdown deadline hit with executions outstanding");
                return;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    async fn execute_registered(
        &self,
        context: &mut ExecutionContext,
        started: Instant,
    ) -> Result<ExecutionResult, Error> {
        let file_url = context.file_url.clone();
        let cancel = context.cancellation.clone();
        tokio::select! {
            result = self.file_manager.resolve(context) => result?,
            () = cancel.cancelled() => {
                return Err(make_err!(
                    Code::Cancelled,
                    "Execution cancelled while resolving {file_url}"
                ));
            }
        }
        if let Some(errors) = context.metadata.get("validation_errors") {
            return Ok(ExecutionResult::rejected(
                format!("Validation failed: {errors}"),
                Vec::new(),
            ));
        }

        let file_path = context
            .metadata
            .get("file_path")
            .ok_or_else(|| make_err!(Code::Internal, "Resolved context carries no file path"))?;
        // The file's extension wins over the caller's declared language
        // when both are known.
        let language = std::path::Path::new(file_path.as_str())
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Language::from_extension)
            .unwrap_or(context.language);
        let code = tokio::fs::read(file_path)
            .await
            .err_tip(|| format!("Failed to read cached file {file_path}"))?;

        let container_id = self
            .container_manager
            .get_container(language, &context.cancellation)
            .await
            .err_tip(|| format!("While acquiring a {language} container"))?;
        if let Some(active) = self.active.lock().get_mut(&context.trace_id) {
            active.container_id = Some(container_id.clone());
        }

        let execution = match self
            .container_manager
            .execute_in_container(&container_id, language, &code, &context.cancellation)
            .await
        {
            Ok(execution) => {
                context.exec_id = Some(execution.exec_id.clone());
                // The container ran the script to completion, so it goes
                // back to the pool even when the user code failed.
                if let Err(err) = self
                    .container_manager
                    .return_container(language, &container_id, true)
                    .await
                {
                    warn!(container_id, ?err, "Healthy return failed");
                }
                execution
            }
            Err(err) => {
                if let Err(mark_err) = self.container_manager.mark_container_failed(
                    language,
                    &container_id,
                    &err.to_string(),
                ) {
                    warn!(container_id, ?mark_err, "Failed to mark container");
                }
                if let Err(return_err) = self
                    .container_manager
                    .return_container(language, &container_id, false)
                    .await
                {
                    warn!(container_id, ?return_err, "Unhealthy return failed");
                }
                return Err(err);
            }
        };

        let complexity = context
            .metadata
            .get("complexity")
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(0.0);
        let warnings: Vec<String> = context
            .metadata
            .get("warnings")
            .filter(|joined| !joined.is_empty())
            .map(|joined| joined.split("; ").map(str::to_string).collect())
            .unwrap_or_default();

        let success = execution.exit_code == 0;
        let total_duration = started.elapsed();
        let fee = self.calculate_fee(
            execution.execution_time,
            complexity,
            execution.usage.memory_bytes,
            context.attester_count,
        );
        debug!(
            trace_id = context.trace_id,
            container_id,
            exit_code = execution.exit_code,
            fee,
            "Execution finished"
        );

        Ok(ExecutionResult {
            success,
            output: execution.output,
            error: (!success)
                .then(|| format!("Code exited with status {}", execution.exit_code)),
            warnings,
            stats: ResourceStats {
                execution_time: execution.execution_time,
                total_duration,
                memory_bytes: execution.usage.memory_bytes,
                cpu_percent: execution.usage.cpu_percent,
                complexity,
                total_cost: fee,
            },
        })
    }

    /// Fee for one execution: the compute portion (time, complexity and
    /// memory, each priced per unit; memory in 128 MiB blocks) is attested
    /// by every participant, so it scales with the attester count. Fixed
    /// and overhead costs are paid once.
    fn calculate_fee(
        &self,
        execution_time: Duration,
        complexity: f64,
        memory_bytes: u64,
        attester_count: u32,
    ) -> f64 {
        let memory_mb = memory_bytes as f64 / (1024.0 * 1024.0);
        let compute = execution_time.as_secs_f64() * self.fees.price_per_unit
            + complexity * self.fees.price_per_unit
            + memory_mb / 128.0 * self.fees.price_per_unit;
        compute * f64::from(1 + attester_count) + self.fees.fixed_cost + self.fees.overhead_cost
    }

    fn record(&self, success: bool, duration: Duration, cost: f64) {
        self.stats
            .lock()
            .record(success, duration, cost, SystemTime::now());
    }
}
