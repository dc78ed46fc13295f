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

use async_trait::async_trait;
use kiln_error::Error;
use tokio_util::sync::CancellationToken;

/// What a pool asks of a new container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub memory_bytes: u64,
    pub nano_cpus: i64,
    pub network_mode: String,
    pub working_dir: String,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: bool,
    pub status: String,
}

/// Result of one completed exec inside a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout/stderr, line-joined.
    pub output: String,
}

/// Point-in-time resource usage sampled from a running container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerUsage {
    pub memory_bytes: u64,
    /// Percent of one CPU. Can exceed 100 on multi-core containers.
    pub cpu_percent: f64,
}

/// The container engine boundary. Production uses the Docker daemon; tests
/// substitute an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes `image` available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), Error>;

    /// Creates a stopped container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, Error>;

    async fn start_container(&self, container_id: &str) -> Result<(), Error>;

    async fn stop_container(&self, container_id: &str) -> Result<(), Error>;

    /// Force-removes the container.
    async fn remove_container(&self, container_id: &str) -> Result<(), Error>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, Error>;

    /// Samples current resource usage. Containers that report no stats
    /// yield zeroed usage.
    async fn stats(&self, container_id: &str) -> Result<ContainerUsage, Error>;

    /// Uploads one file into `dir` inside the container.
    async fn put_file(
        &self,
        container_id: &str,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), Error>;

    /// Prepares a shell command for execution and returns its exec id.
    async fn exec_create(&self, container_id: &str, script: &str) -> Result<String, Error>;

    /// Starts the exec and streams its output to completion. Cancelling the
    /// token aborts the wait with `Code::Cancelled`.
    async fn exec_run(
        &self,
        exec_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, Error>;

    async fn exec_running(&self, exec_id: &str) -> Result<bool, Error>;

    /// Best-effort termination of a running exec.
    async fn kill_exec(&self, exec_id: &str) -> Result<(), Error>;
}
