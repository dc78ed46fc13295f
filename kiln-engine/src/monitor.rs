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

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use kiln_config::MonitorConfig;
use kiln_util::spawn;
use kiln_util::instant_wrapper::InstantWrapper;
use kiln_util::task::JoinHandleDropGuard;
use parking_lot::Mutex;
use tracing::warn;

use crate::pipeline::ExecutionPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
}

/// Point-in-time health summary derived from the alert buffer.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub state: HealthState,
    /// 0 to 100. Each buffered critical alert costs 20 points, each
    /// warning 5.
    pub score: u32,
    pub warning_alerts: usize,
    pub critical_alerts: usize,
    pub active_executions: usize,
}

/// Watches the pipeline in the background and raises alerts for stuck
/// executions, poor success rates and slow averages.
pub struct ExecutionMonitor<I: InstantWrapper> {
    config: MonitorConfig,
    pipeline: Weak<ExecutionPipeline<I>>,
    alerts: Mutex<VecDeque<Alert>>,
    watch_task: Mutex<Option<JoinHandleDropGuard<()>>>,
}

impl<I: InstantWrapper> ExecutionMonitor<I> {
    pub fn new(config: MonitorConfig, pipeline: &Arc<ExecutionPipeline<I>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pipeline: Arc::downgrade(pipeline),
            alerts: Mutex::new(VecDeque::new()),
            watch_task: Mutex::new(None),
        })
    }

    /// Starts the periodic check loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.watch_task.lock();
        if task.is_some() || self.config.check_interval_s == 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.check_interval_s);
        *task = Some(spawn!("execution_monitor", async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                monitor.run_checks();
            }
        }));
    }

    /// Stops the check loop. The alert buffer is left intact.
    pub fn stop(&self) {
        self.watch_task.lock().take();
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let (warnings, criticals) = {
            let alerts = self.alerts.lock();
            let criticals = alerts
                .iter()
                .filter(|alert| alert.severity == AlertSeverity::Critical)
                .count();
            (alerts.len() - criticals, criticals)
        };
        let penalty = 20 * criticals + 5 * warnings;
        let score = 100_usize.saturating_sub(penalty) as u32;
        let state = if score >= 80 {
            HealthState::Healthy
        } else if score >= 50 {
            HealthState::Warning
        } else {
            HealthState::Critical
        };
        let active_executions = self
            .pipeline
            .upgrade()
            .map_or(0, |pipeline| pipeline.get_active_executions().len());
        HealthStatus {
            state,
            score,
            warning_alerts: warnings,
            critical_alerts: criticals,
            active_executions,
        }
    }

    /// Most recent alerts first, optionally filtered by severity.
    pub fn get_alerts(&self, severity: Option<AlertSeverity>, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.lock();
        alerts
            .iter()
            .rev()
            .filter(|alert| severity.is_none_or(|wanted| alert.severity == wanted))
            .take(limit)
            .cloned()
            .collect()
    }

    fn run_checks(&self) {
        let Some(pipeline) = self.pipeline.upgrade() else {
            return;
        };

        let max_execution_time = Duration::from_secs(self.config.max_execution_time_s);
        for context in pipeline.get_active_executions() {
            let age = context
                .started_at
                .elapsed()
                .unwrap_or(Duration::ZERO);
            if age > max_execution_time {
                self.raise(
                    AlertSeverity::Warning,
                    format!(
                        "Execution {} has been running for {}s",
                        context.trace_id,
                        age.as_secs()
                    ),
                );
            }
        }

        let stats = pipeline.get_stats();
        if stats.total_executions > 0 {
            let success_rate = stats.success_rate();
            if success_rate < self.config.min_success_rate {
                self.raise(
                    AlertSeverity::Critical,
                    format!("Success rate dropped to {:.0}%", success_rate * 100.0),
                );
            }
            let max_average = Duration::from_secs(self.config.max_average_time_s);
            if stats.average_duration > max_average {
                self.raise(
                    AlertSeverity::Warning,
                    format!(
                        "Average execution time is {:.1}s",
                        stats.average_duration.as_secs_f64()
                    ),
                );
            }
        }
    }

    fn raise(&self, severity: AlertSeverity, message: String) {
        warn!(?severity, message, "Monitor alert");
        let mut alerts = self.alerts.lock();
        while alerts.len() >= self.config.max_alerts {
            alerts.pop_front();
        }
        alerts.push_back(Alert {
            severity,
            message,
            timestamp: SystemTime::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_for_test(max_alerts: usize) -> Arc<ExecutionMonitor<SystemTime>> {
        // A pipeline is only needed for the live checks, which these tests
        // do not exercise. A dropped Arc leaves a dangling Weak, which the
        // monitor treats as "no pipeline".
        let config = MonitorConfig {
            max_alerts,
            ..MonitorConfig::default()
        };
        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::new(dummy_file_manager()),
            Arc::new(dummy_container_manager()),
            kiln_config::FeeConfig::default(),
        ));
        ExecutionMonitor::new(config, &pipeline)
    }

    fn dummy_file_manager() -> kiln_cache::FileManager<SystemTime> {
        struct NoFetch;
        #[async_trait::async_trait]
        impl kiln_cache::HttpFetcher for NoFetch {
            async fn get(&self, _url: &str) -> Result<Vec<u8>, kiln_error::Error> {
                Err(kiln_error::make_err!(
                    kiln_error::Code::Unavailable,
                    "no fetcher in this test"
                ))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let config = kiln_config::EngineConfig {
            cache: kiln_config::CacheConfig {
                cache_dir: dir.path().to_string_lossy().into_owned(),
                // No runtime in these tests, so no background sweeper.
                cleanup_interval_s: 0,
                ..kiln_config::CacheConfig::default()
            },
            ..kiln_config::EngineConfig::default()
        };
        kiln_cache::FileManager::new(&config, Arc::new(NoFetch), SystemTime::now()).unwrap()
    }

    fn dummy_container_manager() -> kiln_pool::ContainerManager {
        struct NoRuntime;
        #[async_trait::async_trait]
        impl kiln_pool::ContainerRuntime for NoRuntime {
            async fn ensure_image(&self, _image: &str) -> Result<(), kiln_error::Error> {
                Ok(())
            }
            async fn create_container(
                &self,
                _spec: &kiln_pool::ContainerSpec,
            ) -> Result<String, kiln_error::Error> {
                unimplemented!()
            }
            async fn start_container(&self, _id: &str) -> Result<(), kiln_error::Error> {
                unimplemented!()
            }
            async fn stop_container(&self, _id: &str) -> Result<(), kiln_error::Error> {
                unimplemented!()
            }
            async fn remove_container(&self, _id: &str) -> Result<(), kiln_error::Error> {
                unimplemented!()
            }
            async fn inspect(
                &self,
                _id: &str,
            ) -> Result<kiln_pool::ContainerState, kiln_error::Error> {
                unimplemented!()
            }
            async fn stats(
                &self,
                _id: &str,
            ) -> Result<kiln_pool::ContainerUsage, kiln_error::Error> {
                unimplemented!()
            }
            async fn put_file(
                &self,
                _id: &str,
                _dir: &str,
                _file_name: &str,
                _content: &[u8],
            ) -> Result<(), kiln_error::Error> {
                unimplemented!()
            }
            async fn exec_create(
                &self,
                _id: &str,
                _script: &str,
            ) -> Result<String, kiln_error::Error> {
                unimplemented!()
            }
            async fn exec_run(
                &self,
                _exec_id: &str,
                _cancel: &tokio_util::sync::CancellationToken,
            ) -> Result<kiln_pool::ExecOutput, kiln_error::Error> {
                unimplemented!()
            }
            async fn exec_running(&self, _exec_id: &str) -> Result<bool, kiln_error::Error> {
                unimplemented!()
            }
            async fn kill_exec(&self, _exec_id: &str) -> Result<(), kiln_error::Error> {
                unimplemented!()
            }
        }
        kiln_pool::ContainerManager::new(
            Arc::new(NoRuntime),
            &kiln_config::EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn alert_buffer_drops_oldest_past_the_cap() {
        let monitor = monitor_for_test(3);
        for i in 0..5 {
            monitor.raise(AlertSeverity::Warning, format!("alert {i}"));
        }
        let alerts = monitor.get_alerts(None, 10);
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].message, "alert 4");
        assert_eq!(alerts[2].message, "alert 2");
    }

    #[test]
    fn health_score_degrades_with_alerts() {
        let monitor = monitor_for_test(100);
        assert_eq!(monitor.get_health_status().state, HealthState::Healthy);
        assert_eq!(monitor.get_health_status().score, 100);

        monitor.raise(AlertSeverity::Critical, "bad".to_string());
        let status = monitor.get_health_status();
        assert_eq!(status.score, 80);
        assert_eq!(status.state, HealthState::Healthy);

        monitor.raise(AlertSeverity::Critical, "worse".to_string());
        monitor.raise(AlertSeverity::Warning, "meh".to_string());
        let status = monitor.get_health_status();
        assert_eq!(status.score, 55);
        assert_eq!(status.state, HealthState::Warning);

        for _ in 0..3 {
            monitor.raise(AlertSeverity::Critical, "down".to_string());
        }
        let status = monitor.get_health_status();
        assert_eq!(status.state, HealthState::Critical);
    }

    #[test]
    fn severity_filter_only_returns_matching_alerts() {
        let monitor = monitor_for_test(100);
        monitor.raise(AlertSeverity::Warning, "w".to_string());
        monitor.raise(AlertSeverity::Critical, "c".to_string());
        let criticals = monitor.get_alerts(Some(AlertSeverity::Critical), 10);
        assert_eq!(criticals.len(), 1);
        assert_eq!(criticals[0].message, "c");
    }
}
