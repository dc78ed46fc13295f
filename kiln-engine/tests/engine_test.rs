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
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kiln_cache::HttpFetcher;
use kiln_config::{CacheConfig, EngineConfig, Language, PoolConfig};
use kiln_engine::ExecutionEngine;
use kiln_error::{Code, Error, make_err};
use kiln_macro::kiln_test;
use kiln_pool::{ContainerRuntime, ContainerSpec, ContainerState, ContainerUsage, ExecOutput};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

/// Serves canned file content and counts how often each URL is fetched.
#[derive(Default)]
struct MockFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fetch_count: AtomicUsize,
}

impl MockFetcher {
    fn insert(&self, url: &str, content: &[u8]) {
        self.files.lock().insert(url.to_string(), content.to_vec());
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>, Error> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        self.files
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| make_err!(Code::NotFound, "No such file {url}"))
    }
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, bool>,
    execs: HashMap<String, String>,
    next_id: u64,
}

/// Container engine fake. User-code executions produce a fixed markered
/// output; every other script succeeds silently.
#[derive(Default)]
struct MockRuntime {
    state: Mutex<MockState>,
    /// When set, user-code executions block until their token cancels.
    hang_executions: AtomicBool,
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, _image: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, Error> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(id.clone(), true);
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), Error> {
        if let Some(running) = self.state.lock().containers.get_mut(container_id) {
            *running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), Error> {
        if let Some(running) = self.state.lock().containers.get_mut(container_id) {
            *running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), Error> {
        self.state.lock().containers.remove(container_id);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, Error> {
        let state = self.state.lock();
        let running = *state
            .containers
            .get(container_id)
            .ok_or_else(|| make_err!(Code::NotFound, "No container {container_id}"))?;
        Ok(ContainerState {
            running,
            status: "running".to_string(),
        })
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerUsage, Error> {
        if !self.state.lock().containers.contains_key(container_id) {
            return Err(make_err!(Code::NotFound, "No container {container_id}"));
        }
        Ok(ContainerUsage {
            memory_bytes: 64 * 1024 * 1024,
            cpu_percent: 37.5,
        })
    }

    async fn put_file(
        &self,
        _container_id: &str,
        _dir: &str,
        _file_name: &str,
        _content: &[u8],
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn exec_create(&self, _container_id: &str, script: &str) -> Result<String, Error> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let exec_id = format!("exec-{}", state.next_id);
        state.execs.insert(exec_id.clone(), script.to_string());
        Ok(exec_id)
    }

    async fn exec_run(
        &self,
        exec_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, Error> {
        let script = self
            .state
            .lock()
            .execs
            .get(exec_id)
            .cloned()
            .ok_or_else(|| make_err!(Code::NotFound, "No exec {exec_id}"))?;
        if script.contains("START_EXECUTION") {
            if self.hang_executions.load(Ordering::Relaxed) {
                cancel.cancelled().await;
                return Err(make_err!(Code::Cancelled, "Exec {exec_id} cancelled"));
            }
            return Ok(ExecOutput {
                exit_code: 0,
                output: "noise\nSTART_EXECUTION\nhi from sandbox\nEND_EXECUTION\n".to_string(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            output: "ok".to_string(),
        })
    }

    async fn exec_running(&self, _exec_id: &str) -> Result<bool, Error> {
        Ok(false)
    }

    async fn kill_exec(&self, _exec_id: &str) -> Result<(), Error> {
        Ok(())
    }
}

fn test_config(cache_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            cache_dir: cache_dir.to_string_lossy().into_owned(),
            max_cache_size: 1024 * 1024,
            file_ttl_s: 3600,
            cleanup_interval_s: 0,
        },
        pool: PoolConfig {
            max_containers: 2,
            min_containers: 0,
            pre_warm_count: 1,
            max_wait_time_s: 1,
            cleanup_interval_s: 0,
            health_check_interval_s: 0,
            image: Some("python:test".to_string()),
            ..PoolConfig::default()
        },
        languages: Some(vec![Language::Python]),
        shutdown_timeout_s: 1,
        ..EngineConfig::default()
    }
}

struct TestHarness {
    engine: Arc<ExecutionEngine<SystemTime>>,
    fetcher: Arc<MockFetcher>,
    runtime: Arc<MockRuntime>,
    _cache_dir: tempfile::TempDir,
}

async fn start_engine() -> Result<TestHarness, Error> {
    let cache_dir = tempfile::tempdir()?;
    let fetcher = Arc::new(MockFetcher::default());
    let runtime = Arc::new(MockRuntime::default());
    let engine = Arc::new(ExecutionEngine::new(
        test_config(cache_dir.path()),
        runtime.clone(),
        fetcher.clone(),
        SystemTime::now(),
    )?);
    engine.initialize().await?;
    Ok(TestHarness {
        engine,
        fetcher,
        runtime,
        _cache_dir: cache_dir,
    })
}

#[kiln_test]
async fn valid_code_runs_and_is_charged() -> Result<(), Error> {
    let harness = start_engine().await?;
    harness.fetcher.insert("http://files/app.py", b"print('hi')\n");

    let result = harness
        .engine
        .execute("http://files/app.py", Language::Python, 2)
        .await?;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "hi from sandbox");
    assert_eq!(result.error, None);
    assert!(result.stats.complexity > 0.0);
    // Usage sampled from the container lands in the result stats.
    assert_eq!(result.stats.memory_bytes, 64 * 1024 * 1024);
    assert!(
        (result.stats.cpu_percent - 37.5).abs() < f64::EPSILON,
        "{}",
        result.stats.cpu_percent
    );
    // Fixed and overhead costs apply even to a near-instant execution.
    assert!(result.stats.total_cost >= 1.1, "{}", result.stats.total_cost);

    let stats = harness.engine.get_stats();
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.successful_executions, 1);
    Ok(())
}

#[kiln_test]
async fn second_execution_hits_the_cache() -> Result<(), Error> {
    let harness = start_engine().await?;
    harness.fetcher.insert("http://files/app.py", b"print('hi')\n");

    harness
        .engine
        .execute("http://files/app.py", Language::Python, 0)
        .await?;
    harness
        .engine
        .execute("http://files/app.py", Language::Python, 0)
        .await?;

    assert_eq!(harness.fetcher.fetch_count.load(Ordering::Relaxed), 1);
    let cache_stats = harness.engine.get_cache_stats();
    assert_eq!(cache_stats.hit_count, 1);
    assert_eq!(cache_stats.miss_count, 1);
    Ok(())
}

#[kiln_test]
async fn dangerous_code_is_rejected_softly() -> Result<(), Error> {
    let harness = start_engine().await?;
    harness
        .fetcher
        .insert("http://files/bad.py", b"import os\nos.system('rm -rf /')\n");

    let result = harness
        .engine
        .execute("http://files/bad.py", Language::Python, 0)
        .await?;
    assert!(!result.success);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Validation failed")),
        "{result:?}"
    );
    assert_eq!(result.output, "");

    let stats = harness.engine.get_stats();
    assert_eq!(stats.failed_executions, 1);
    Ok(())
}

#[kiln_test]
async fn in_flight_execution_can_be_cancelled() -> Result<(), Error> {
    let harness = start_engine().await?;
    harness.fetcher.insert("http://files/slow.py", b"print('hi')\n");
    harness.runtime.hang_executions.store(true, Ordering::Relaxed);

    let engine = harness.engine.clone();
    let task = tokio::spawn(async move {
        engine
            .execute("http://files/slow.py", Language::Python, 0)
            .await
    });

    let mut trace_id = None;
    for _ in 0..500 {
        let active = harness.engine.get_active_executions();
        if let Some(context) = active.first() {
            trace_id = Some(context.trace_id.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let trace_id = trace_id.expect("execution never became active");

    assert!(harness.engine.cancel_execution(&trace_id));
    let err = task.await?.unwrap_err();
    assert_eq!(err.code, Code::Cancelled);

    // Cancelling an already-finished execution reports false.
    assert!(!harness.engine.cancel_execution(&trace_id));
    Ok(())
}

#[kiln_test]
async fn shutdown_is_terminal_and_idempotent() -> Result<(), Error> {
    let harness = start_engine().await?;
    harness.fetcher.insert("http://files/app.py", b"print('hi')\n");
    harness
        .engine
        .execute("http://files/app.py", Language::Python, 0)
        .await?;

    harness.engine.shutdown().await;
    harness.engine.shutdown().await;

    let err = harness
        .engine
        .execute("http://files/app.py", Language::Python, 0)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    let pool_stats = harness.engine.get_pool_stats();
    assert_eq!(pool_stats[&Language::Python].total_containers, 0);
    Ok(())
}

#[kiln_test]
async fn shutdown_cancels_in_flight_executions() -> Result<(), Error> {
    let harness = start_engine().await?;
    harness.fetcher.insert("http://files/slow.py", b"print('hi')\n");
    harness.runtime.hang_executions.store(true, Ordering::Relaxed);

    let engine = harness.engine.clone();
    let task = tokio::spawn(async move {
        engine
            .execute("http://files/slow.py", Language::Python, 0)
            .await
    });
    for _ in 0..500 {
        if !harness.engine.get_active_executions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!harness.engine.get_active_executions().is_empty());

    harness.engine.shutdown().await;
    let err = task.await?.unwrap_err();
    assert_eq!(err.code, Code::Cancelled);
    Ok(())
}

#[kiln_test]
async fn uninitialized_engine_rejects_work() -> Result<(), Error> {
    let cache_dir = tempfile::tempdir()?;
    let engine = ExecutionEngine::new(
        test_config(cache_dir.path()),
        Arc::new(MockRuntime::default()),
        Arc::new(MockFetcher::default()),
        SystemTime::now(),
    )?;
    let err = engine
        .execute("http://files/app.py", Language::Python, 0)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    Ok(())
}
