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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use kiln_config::{Language, PoolConfig, Retry};
use kiln_error::{Code, Error, ResultExt, error_if, make_err};
use kiln_util::spawn;
use kiln_util::retry::{Retrier, RetryResult};
use kiln_util::task::JoinHandleDropGuard;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{ContainerStatus, PoolStats, PooledContainer};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::scripts;

const WORKING_DIR: &str = "/code";
const STARTUP_POLL_ATTEMPTS: u32 = 20;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Warm pool of containers for a single language.
///
/// Containers are created up front, handed out one at a time, reset on
/// return, and swept in the background for idleness and health.
pub struct ContainerPool {
    language: Language,
    config: PoolConfig,
    image: String,
    pull_retrier: Retrier,
    runtime: Arc<dyn ContainerRuntime>,
    containers: Mutex<HashMap<String, PooledContainer>>,
    // Containers being created but not yet in the map. Counted so the
    // max_containers bound holds across concurrent acquisitions.
    creating: AtomicUsize,
    created_count: AtomicUsize,
    destroyed_count: AtomicUsize,
    // Waiters park on this channel. Returning a container offers one
    // non-blocking token; a full channel is fine since every waiter
    // rescans the ready set on wake.
    wait_tx: mpsc::Sender<()>,
    wait_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    sweeps: Mutex<Vec<JoinHandleDropGuard<()>>>,
}

impl ContainerPool {
    pub fn new(
        language: Language,
        config: PoolConfig,
        retry: Retry,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Arc<Self>, Error> {
        error_if!(
            config.max_containers == 0,
            "Pool for {language} configured with max_containers = 0"
        );
        let image = config
            .image
            .clone()
            .unwrap_or_else(|| language.default_image().to_string());
        let (wait_tx, wait_rx) = mpsc::channel(config.max_containers);
        Ok(Arc::new(Self {
            language,
            config,
            image,
            pull_retrier: Retrier::default_with(retry),
            runtime,
            containers: Mutex::new(HashMap::new()),
            creating: AtomicUsize::new(0),
            created_count: AtomicUsize::new(0),
            destroyed_count: AtomicUsize::new(0),
            wait_tx,
            wait_rx: tokio::sync::Mutex::new(wait_rx),
            sweeps: Mutex::new(Vec::new()),
        }))
    }

    /// Pulls the image, pre-warms containers and starts the background
    /// sweeps. Pre-warm failures are logged and skipped so one bad create
    /// does not sink the whole pool.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), Error> {
        self.pull_retrier
            .retry(futures::stream::unfold((), move |()| async move {
                let result = match self.runtime.ensure_image(&self.image).await {
                    Ok(()) => RetryResult::Ok(()),
                    Err(err) => RetryResult::Retry(err),
                };
                Some((result, ()))
            }))
            .await
            .err_tip(|| format!("While initializing {} pool", self.language))?;

        let pre_warm = self
            .config
            .pre_warm_count
            .min(self.config.max_containers);
        let results = join_all((0..pre_warm).map(|_| self.create_prepared_container())).await;
        let warmed = results.iter().filter(|res| res.is_ok()).count();
        for err in results.into_iter().filter_map(Result::err) {
            warn!(language = %self.language, ?err, "Pre-warm create failed");
        }
        info!(
            language = %self.language,
            warmed,
            requested = pre_warm,
            "Pool initialized"
        );

        self.spawn_sweeps();
        Ok(())
    }

    fn spawn_sweeps(self: &Arc<Self>) {
        let mut sweeps = self.sweeps.lock();
        if !sweeps.is_empty() {
            return;
        }
        if self.config.cleanup_interval_s > 0 {
            let weak = Arc::downgrade(self);
            let interval = Duration::from_secs(self.config.cleanup_interval_s);
            sweeps.push(spawn!("pool_idle_sweep", async move {
                Self::sweep_loop(weak, interval, |pool| async move {
                    pool.cleanup_idle().await;
                })
                .await;
            }));
        }
        if self.config.health_check_interval_s > 0 {
            let weak = Arc::downgrade(self);
            let interval = Duration::from_secs(self.config.health_check_interval_s);
            sweeps.push(spawn!("pool_health_sweep", async move {
                Self::sweep_loop(weak, interval, |pool| async move {
                    pool.health_check().await;
                })
                .await;
            }));
        }
    }

    async fn sweep_loop<F, Fut>(weak: Weak<Self>, interval: Duration, mut tick: F)
    where
        F: FnMut(Arc<Self>) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            tokio::time::sleep(interval).await;
            let Some(pool) = weak.upgrade() else {
                return;
            };
            tick(pool).await;
        }
    }

    /// Acquires a ready container, creating one on demand while under the
    /// pool bound, otherwise waiting up to `max_wait_time_s` for a return.
    pub async fn get_container(&self, cancel: &CancellationToken) -> Result<String, Error> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.max_wait_time_s);
        loop {
            // Fast path: take a ready container and re-verify it against
            // the engine before handing it out.
            while let Some(container_id) = self.take_ready() {
                match self.runtime.inspect(&container_id).await {
                    Ok(state) if state.running => return Ok(container_id),
                    Ok(state) => {
                        warn!(
                            container_id,
                            status = state.status,
                            "Ready container not running, marking errored"
                        );
                        self.mark_error(&container_id, "not running at acquisition");
                    }
                    Err(err) => {
                        warn!(container_id, ?err, "Inspect failed, marking errored");
                        self.mark_error(&container_id, "inspect failed at acquisition");
                    }
                }
            }

            match self.create_prepared_container().await {
                Ok(container_id) => {
                    // The freshly created container goes straight to this
                    // caller, never through the ready set.
                    let mut containers = self.containers.lock();
                    if let Some(container) = containers.get_mut(&container_id) {
                        container.status = ContainerStatus::Running;
                        container.is_ready = false;
                    }
                    return Ok(container_id);
                }
                // At capacity. Fall through to wait for a return.
                Err(err) if err.code == Code::ResourceExhausted => {}
                Err(err) => {
                    return Err(err.append(format!(
                        "While creating on-demand {} container",
                        self.language
                    )));
                }
            }

            let mut wait_rx = self.wait_rx.lock().await;
            tokio::select! {
                signal = wait_rx.recv() => {
                    if signal.is_none() {
                        return Err(make_err!(
                            Code::Internal,
                            "Pool wait channel closed for {}",
                            self.language
                        ));
                    }
                }
                () = cancel.cancelled() => {
                    return Err(make_err!(
                        Code::Cancelled,
                        "Acquisition cancelled for {}",
                        self.language
                    ));
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(make_err!(
                        Code::ResourceExhausted,
                        "No {} container became available within {}s",
                        self.language,
                        self.config.max_wait_time_s
                    ));
                }
            }
        }
    }

    /// Returns a container to the pool. Healthy returns are reset and go
    /// back to the ready set; anything else is destroyed.
    pub async fn return_container(&self, container_id: &str, healthy: bool) {
        if !healthy {
            debug!(container_id, "Unhealthy return, destroying");
            self.destroy_container(container_id).await;
            return;
        }
        match self.reset_container(container_id).await {
            Ok(()) => {
                let mut containers = self.containers.lock();
                if let Some(container) = containers.get_mut(container_id) {
                    container.status = ContainerStatus::Ready;
                    container.is_ready = true;
                    container.last_used = SystemTime::now();
                    container.last_error = None;
                }
                drop(containers);
                // Wake one waiter if any are parked.
                let _ = self.wait_tx.try_send(());
            }
            Err(err) => {
                warn!(container_id, ?err, "Reset failed, destroying");
                self.destroy_container(container_id).await;
            }
        }
    }

    /// Restarts the container and wipes its staged code. A container that
    /// fails any step must never go back to the ready set.
    async fn reset_container(&self, container_id: &str) -> Result<(), Error> {
        self.runtime.stop_container(container_id).await?;
        self.runtime.start_container(container_id).await?;
        self.wait_until_running(container_id).await?;
        self.run_script(container_id, scripts::reset_script(self.language))
            .await
    }

    /// Flags a container so it is never handed out again. Removal happens
    /// on return or in the sweeps.
    pub fn mark_error(&self, container_id: &str, reason: &str) {
        self.flag(container_id, ContainerStatus::Error, reason);
    }

    fn mark_stopped(&self, container_id: &str, reason: &str) {
        self.flag(container_id, ContainerStatus::Stopped, reason);
    }

    fn flag(&self, container_id: &str, status: ContainerStatus, reason: &str) {
        let mut containers = self.containers.lock();
        if let Some(container) = containers.get_mut(container_id) {
            container.status = status;
            container.is_ready = false;
            container.last_error = Some(reason.to_string());
        }
    }

    pub fn get_stats(&self) -> PoolStats {
        let containers = self.containers.lock();
        let mut stats = PoolStats::new(self.language);
        stats.total_containers = containers.len();
        for container in containers.values() {
            match container.status {
                ContainerStatus::Ready if container.is_ready => stats.ready_containers += 1,
                ContainerStatus::Running => stats.busy_containers += 1,
                ContainerStatus::Stopped => stats.stopped_containers += 1,
                ContainerStatus::Error => stats.error_containers += 1,
                _ => {}
            }
        }
        if stats.total_containers > 0 {
            stats.utilization_rate =
                stats.busy_containers as f64 / stats.total_containers as f64;
        }
        stats.created_count = self.created_count.load(Ordering::Relaxed) as u64;
        stats.destroyed_count = self.destroyed_count.load(Ordering::Relaxed) as u64;
        stats
    }

    /// Destroys every container and stops the sweeps.
    pub async fn shutdown(&self) {
        self.sweeps.lock().clear();
        let ids: Vec<String> = self.containers.lock().keys().cloned().collect();
        for container_id in ids {
            self.destroy_container(&container_id).await;
        }
        info!(language = %self.language, "Pool shut down");
    }

    fn take_ready(&self) -> Option<String> {
        let mut containers = self.containers.lock();
        let candidate = containers
            .values()
            .find(|container| container.is_ready && container.status == ContainerStatus::Ready)
            .map(|container| container.id.clone())?;
        if let Some(container) = containers.get_mut(&candidate) {
            container.status = ContainerStatus::Running;
            container.is_ready = false;
            container.last_used = SystemTime::now();
        }
        Some(candidate)
    }

    /// Claims a creation slot if the pool is still under its bound. The
    /// map lock serializes the check against concurrent claimants.
    fn reserve_create_slot(&self) -> bool {
        let containers = self.containers.lock();
        let in_flight = self.creating.load(Ordering::Acquire);
        if containers.len() + in_flight >= self.config.max_containers {
            return false;
        }
        self.creating.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Creates one container, tracks it as pending while it starts and
    /// initializes, and flips it ready once verified.
    async fn create_prepared_container(&self) -> Result<String, Error> {
        if !self.reserve_create_slot() {
            return Err(make_err!(
                Code::ResourceExhausted,
                "Pool for {} is at capacity",
                self.language
            ));
        }
        let result = self.create_prepared_container_inner().await;
        self.creating.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn create_prepared_container_inner(&self) -> Result<String, Error> {
        let spec = ContainerSpec {
            image: self.image.clone(),
            memory_bytes: self.config.memory_limit_bytes(),
            nano_cpus: self.config.nano_cpus(),
            network_mode: self.config.network_mode.clone(),
            working_dir: WORKING_DIR.to_string(),
        };
        let container_id = self.runtime.create_container(&spec).await?;
        let now = SystemTime::now();
        self.containers.lock().insert(
            container_id.clone(),
            PooledContainer {
                id: container_id.clone(),
                status: ContainerStatus::Pending,
                is_ready: false,
                language: self.language,
                image: self.image.clone(),
                working_dir: WORKING_DIR.to_string(),
                created_at: now,
                last_used: now,
                last_error: None,
            },
        );
        if let Err(err) = self.prepare_container(&container_id).await {
            // Never leak a half-prepared container.
            self.containers.lock().remove(&container_id);
            if let Err(remove_err) = self.runtime.remove_container(&container_id).await {
                warn!(container_id, ?remove_err, "Failed to remove broken container");
            }
            return Err(err.append(format!("While preparing container {container_id}")));
        }

        {
            let mut containers = self.containers.lock();
            if let Some(container) = containers.get_mut(&container_id) {
                container.status = ContainerStatus::Ready;
                container.is_ready = true;
                container.last_used = SystemTime::now();
            }
        }
        self.created_count.fetch_add(1, Ordering::Relaxed);
        debug!(container_id, language = %self.language, "Container ready");
        Ok(container_id)
    }

    async fn prepare_container(&self, container_id: &str) -> Result<(), Error> {
        self.runtime.start_container(container_id).await?;
        self.wait_until_running(container_id).await?;
        self.run_script(container_id, scripts::initialization_script(self.language))
            .await
            .err_tip(|| "Initialization script failed")?;
        self.run_script(container_id, scripts::verify_command(self.language))
            .await
            .err_tip(|| "Toolchain verification failed")?;
        Ok(())
    }

    async fn wait_until_running(&self, container_id: &str) -> Result<(), Error> {
        for _ in 0..STARTUP_POLL_ATTEMPTS {
            let state = self.runtime.inspect(container_id).await?;
            if state.running {
                return Ok(());
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
        Err(make_err!(
            Code::Unavailable,
            "Container {container_id} did not reach running state"
        ))
    }

    async fn run_script(&self, container_id: &str, script: &str) -> Result<(), Error> {
        let exec_id = self.runtime.exec_create(container_id, script).await?;
        let output = self
            .runtime
            .exec_run(&exec_id, &CancellationToken::new())
            .await?;
        if output.exit_code != 0 {
            return Err(make_err!(
                Code::Internal,
                "Script in {container_id} exited with {}: {}",
                output.exit_code,
                output.output.trim()
            ));
        }
        Ok(())
    }

    async fn destroy_container(&self, container_id: &str) {
        let removed = self.containers.lock().remove(container_id).is_some();
        if let Err(err) = self.runtime.remove_container(container_id).await {
            warn!(container_id, ?err, "Failed to remove container");
        }
        if removed {
            self.destroyed_count.fetch_add(1, Ordering::Relaxed);
            // A slot opened up.
            let _ = self.wait_tx.try_send(());
        }
    }

    /// Destroys ready containers idle past the timeout while keeping the
    /// configured minimum warm, and clears out stopped and errored
    /// containers.
    async fn cleanup_idle(&self) {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_s);
        let now = SystemTime::now();
        let mut to_remove = Vec::new();
        {
            let containers = self.containers.lock();
            let mut ready: Vec<&PooledContainer> = containers
                .values()
                .filter(|container| {
                    container.is_ready && container.status == ContainerStatus::Ready
                })
                .collect();
            // Oldest idle first, so the freshest stay warm.
            ready.sort_by_key(|container| container.last_used);
            let mut remaining = ready.len();
            for container in ready {
                if remaining <= self.config.min_containers {
                    break;
                }
                let idle = now
                    .duration_since(container.last_used)
                    .unwrap_or(Duration::ZERO);
                if idle > idle_timeout {
                    to_remove.push(container.id.clone());
                    remaining -= 1;
                }
            }
            for container in containers.values() {
                if container.status == ContainerStatus::Error
                    || container.status == ContainerStatus::Stopped
                {
                    to_remove.push(container.id.clone());
                }
            }
        }
        for container_id in to_remove {
            debug!(container_id, "Sweeping container");
            self.destroy_container(&container_id).await;
        }
    }

    /// Flags containers whose engine state went bad: a clean exit marks
    /// the container stopped, a failed inspect marks it errored. Marks
    /// only; removal is the idle sweep's job.
    async fn health_check(&self) {
        let candidates: Vec<String> = {
            let containers = self.containers.lock();
            containers
                .values()
                .filter(|container| {
                    container.status != ContainerStatus::Running
                        && container.status != ContainerStatus::Pending
                })
                .map(|container| container.id.clone())
                .collect()
        };
        for container_id in candidates {
            match self.runtime.inspect(&container_id).await {
                Ok(state) if state.running => {}
                Ok(state) => {
                    warn!(container_id, status = state.status, "Container exited");
                    self.mark_stopped(&container_id, "health check: not running");
                }
                Err(err) => {
                    warn!(container_id, ?err, "Health inspect failed");
                    self.mark_error(&container_id, "health check: inspect failed");
                }
            }
        }
    }
}
