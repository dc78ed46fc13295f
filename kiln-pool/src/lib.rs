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

pub mod container;
pub mod docker_runtime;
pub mod manager;
pub mod pool;
pub mod runtime;
pub mod scripts;

pub use container::{ContainerStatus, PoolStats, PooledContainer};
pub use docker_runtime::DockerRuntime;
pub use manager::{ContainerExecution, ContainerManager};
pub use pool::ContainerPool;
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerState, ContainerUsage, ExecOutput};
