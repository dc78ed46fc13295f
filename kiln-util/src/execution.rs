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
use std::time::{Duration, SystemTime};

use kiln_config::Language;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything known about one execution request as it moves through the
/// pipeline. Registered under `trace_id` while the execution is in flight.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub trace_id: String,
    pub file_url: String,
    pub language: Language,
    pub attester_count: u32,
    pub started_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    /// Free-form facts attached by pipeline stages (file path, content hash,
    /// validation errors, ...).
    pub metadata: HashMap<String, String>,
    /// Cancelling this token aborts the execution at its next blocking point.
    pub cancellation: CancellationToken,
    /// Runtime exec handle, once the code is actually running.
    pub exec_id: Option<String>,
    pub container_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(file_url: String, language: Language, attester_count: u32) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            file_url,
            language,
            attester_count,
            started_at: SystemTime::now(),
            completed_at: None,
            metadata: HashMap::new(),
            cancellation: CancellationToken::new(),
            exec_id: None,
            container_id: None,
        }
    }
}

/// Outcome of one execution. A `success: false` result means the submitted
/// code was rejected or failed; infrastructure faults are reported as errors
/// instead, never as a result value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub stats: ResourceStats,
}

impl ExecutionResult {
    /// A soft failure carrying the reason back to the caller.
    pub fn rejected(error: String, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            warnings,
            stats: ResourceStats::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceStats {
    /// Time the user code itself ran, excluding container overhead.
    pub execution_time: Duration,
    /// Wall time of the whole pipeline pass.
    pub total_duration: Duration,
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub complexity: f64,
    pub total_cost: f64,
}

/// Rolling counters over completed executions. Held under a lock and
/// returned to callers by value copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Running mean over successful executions only.
    pub average_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub total_cost: f64,
    pub average_cost: f64,
    pub last_execution: Option<SystemTime>,
}

impl PerformanceMetrics {
    pub fn record(&mut self, success: bool, duration: Duration, cost: f64, now: SystemTime) {
        self.total_executions += 1;
        self.last_execution = Some(now);
        self.total_cost += cost;
        self.average_cost = self.total_cost / self.total_executions as f64;
        if !success {
            self.failed_executions += 1;
            return;
        }
        self.successful_executions += 1;
        if self.successful_executions == 1 {
            self.average_duration = duration;
            self.min_duration = duration;
            self.max_duration = duration;
            return;
        }
        let n = self.successful_executions as f64;
        self.average_duration = Duration::from_secs_f64(
            (self.average_duration.as_secs_f64() * (n - 1.0) + duration.as_secs_f64()) / n,
        );
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 1.0;
        }
        self.successful_executions as f64 / self.total_executions as f64
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn metrics_average_over_successful_only() {
        let mut metrics = PerformanceMetrics::default();
        let now = SystemTime::now();
        metrics.record(true, Duration::from_secs(2), 1.0, now);
        metrics.record(true, Duration::from_secs(4), 1.0, now);
        metrics.record(false, Duration::from_secs(100), 0.5, now);

        assert_eq!(metrics.total_executions, 3);
        assert_eq!(metrics.successful_executions, 2);
        assert_eq!(metrics.failed_executions, 1);
        assert_eq!(metrics.average_duration, Duration::from_secs(3));
        assert_eq!(metrics.min_duration, Duration::from_secs(2));
        assert_eq!(metrics.max_duration, Duration::from_secs(4));
        assert_eq!(metrics.total_cost, 2.5);
    }

    #[test]
    fn success_rate_of_empty_metrics_is_one() {
        let metrics = PerformanceMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);
    }
}
