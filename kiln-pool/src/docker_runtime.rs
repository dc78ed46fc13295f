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

use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ContainerStatsResponse, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListImagesOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use futures::StreamExt;
use kiln_error::{Code, Error, ResultExt, make_err};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState, ContainerUsage, ExecOutput};

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new() -> Result<Self, Error> {
        let docker = Docker::connect_with_local_defaults()
            .err_tip(|| "Failed to connect to the Docker daemon")?;
        Ok(Self { docker })
    }

    fn build_tar(file_name: &str, content: &[u8]) -> Result<Vec<u8>, Error> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        builder
            .append_data(&mut header, file_name, content)
            .err_tip(|| format!("Failed to add {file_name} to tar archive"))?;
        builder
            .into_inner()
            .err_tip(|| "Failed to finish tar archive")
    }

    /// Polls the exec until the process exits and returns its exit code.
    async fn wait_exec_exit(&self, exec_id: &str) -> Result<i64, Error> {
        loop {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .err_tip(|| format!("Failed to inspect exec {exec_id}"))?;
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), Error> {
        match self.docker.list_images(None::<ListImagesOptions>).await {
            Ok(images) => {
                let latest = format!("{image}:latest");
                let present = images.iter().any(|summary| {
                    summary
                        .repo_tags
                        .iter()
                        .any(|tag| tag == image || *tag == latest)
                });
                if present {
                    debug!(image, "Image already present, skipping pull");
                    return Ok(());
                }
            }
            Err(err) => warn!(?err, "Failed to list images, attempting pull"),
        }

        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(image.to_string()),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.err_tip(|| format!("Failed to pull image {image}"))?;
        }
        info!(image, "Pulled image");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, Error> {
        let host_config = HostConfig {
            memory: (spec.memory_bytes > 0).then(|| spec.memory_bytes as i64),
            nano_cpus: Some(spec.nano_cpus),
            network_mode: Some(spec.network_mode.clone()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            // Keep-alive so the container accepts execs until removed.
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "tail -f /dev/null".to_string(),
            ]),
            tty: Some(true),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .err_tip(|| format!("Failed to create container from {}", spec.image))?;
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), Error> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .err_tip(|| format!("Failed to start container {container_id}"))
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), Error> {
        self.docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .err_tip(|| format!("Failed to stop container {container_id}"))
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), Error> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .err_tip(|| format!("Failed to remove container {container_id}"))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, Error> {
        let response = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .err_tip(|| format!("Failed to inspect container {container_id}"))?;
        let state = response.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            status: state
                .status
                .map(|status| status.to_string())
                .unwrap_or_default(),
        })
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerUsage, Error> {
        let mut samples = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        match samples.next().await {
            Some(sample) => {
                let sample = sample
                    .err_tip(|| format!("Failed to sample stats of container {container_id}"))?;
                Ok(usage_from_stats(&sample))
            }
            None => Ok(ContainerUsage::default()),
        }
    }

    async fn put_file(
        &self,
        container_id: &str,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), Error> {
        let archive = Self::build_tar(file_name, content)?;
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                bollard::body_full(archive.into()),
            )
            .await
            .err_tip(|| format!("Failed to upload {file_name} to container {container_id}"))
    }

    async fn exec_create(&self, container_id: &str, script: &str) -> Result<String, Error> {
        let response = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        script.to_string(),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .err_tip(|| format!("Failed to create exec in container {container_id}"))?;
        Ok(response.id)
    }

    async fn exec_run(
        &self,
        exec_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, Error> {
        let results = self
            .docker
            .start_exec(exec_id, None::<StartExecOptions>)
            .await
            .err_tip(|| format!("Failed to start exec {exec_id}"))?;
        let StartExecResults::Attached { mut output, .. } = results else {
            return Err(make_err!(
                Code::Internal,
                "Exec {exec_id} started detached, no output stream"
            ));
        };

        let mut collected = String::new();
        loop {
            tokio::select! {
                chunk = output.next() => {
                    match chunk {
                        Some(Ok(log)) => collected.push_str(&log.to_string()),
                        Some(Err(err)) => {
                            return Err(Error::from(err)
                                .append(format!("While streaming exec {exec_id}")));
                        }
                        None => break,
                    }
                }
                () = cancel.cancelled() => {
                    return Err(make_err!(Code::Cancelled, "Exec {exec_id} cancelled"));
                }
            }
        }

        let exit_code = self.wait_exec_exit(exec_id).await?;
        Ok(ExecOutput {
            exit_code,
            output: collected,
        })
    }

    async fn exec_running(&self, exec_id: &str) -> Result<bool, Error> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .err_tip(|| format!("Failed to inspect exec {exec_id}"))?;
        Ok(inspect.running == Some(true))
    }

    async fn kill_exec(&self, exec_id: &str) -> Result<(), Error> {
        // The engine offers no direct way to kill an exec process. Checking
        // that it still runs and leaving teardown to the daemon (or to the
        // container's removal) is the best that can be done.
        if self.exec_running(exec_id).await? {
            warn!(exec_id, "Exec still running, relying on container teardown");
        }
        Ok(())
    }
}

/// Memory usage is read directly; CPU percent is derived from the usage
/// deltas against the previous sample, scaled by the online CPU count.
fn usage_from_stats(stats: &ContainerStatsResponse) -> ContainerUsage {
    let memory_bytes = stats
        .memory_stats
        .as_ref()
        .and_then(|memory| memory.usage)
        .unwrap_or(0);

    let cpu = stats.cpu_stats.as_ref();
    let precpu = stats.precpu_stats.as_ref();
    let total_usage = cpu
        .and_then(|stats| stats.cpu_usage.as_ref())
        .and_then(|usage| usage.total_usage)
        .unwrap_or(0);
    let pre_total_usage = precpu
        .and_then(|stats| stats.cpu_usage.as_ref())
        .and_then(|usage| usage.total_usage)
        .unwrap_or(0);
    let system_usage = cpu.and_then(|stats| stats.system_cpu_usage).unwrap_or(0);
    let pre_system_usage = precpu
        .and_then(|stats| stats.system_cpu_usage)
        .unwrap_or(0);
    let online_cpus = cpu
        .and_then(|stats| stats.online_cpus)
        .filter(|&count| count > 0)
        .unwrap_or(1);

    let cpu_delta = total_usage.saturating_sub(pre_total_usage) as f64;
    let system_delta = system_usage.saturating_sub(pre_system_usage) as f64;
    let cpu_percent = if system_delta > 0.0 {
        cpu_delta / system_delta * f64::from(online_cpus) * 100.0
    } else {
        0.0
    };

    ContainerUsage {
        memory_bytes,
        cpu_percent,
    }
}

#[cfg(test)]
mod tests {
    use bollard::models::{ContainerCpuStats, ContainerCpuUsage, ContainerMemoryStats};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn usage_is_derived_from_a_stats_sample() {
        let stats = ContainerStatsResponse {
            memory_stats: Some(ContainerMemoryStats {
                usage: Some(32 * 1024 * 1024),
                ..Default::default()
            }),
            cpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(400),
                    ..Default::default()
                }),
                system_cpu_usage: Some(2000),
                online_cpus: Some(2),
                ..Default::default()
            }),
            precpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(200),
                    ..Default::default()
                }),
                system_cpu_usage: Some(1000),
                ..Default::default()
            }),
            ..Default::default()
        };

        let usage = usage_from_stats(&stats);
        assert_eq!(usage.memory_bytes, 32 * 1024 * 1024);
        // 200 of 1000 delta ticks across 2 CPUs.
        assert!((usage.cpu_percent - 40.0).abs() < 1e-9, "{}", usage.cpu_percent);
    }

    #[test]
    fn empty_stats_sample_yields_zero_usage() {
        let usage = usage_from_stats(&ContainerStatsResponse::default());
        assert_eq!(usage, ContainerUsage::default());
    }
}
