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

use std::time::SystemTime;

use kiln_config::Language;

/// Lifecycle of a pooled container:
/// pending -> ready -> running -> ready | error | stopped -> removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Pending,
    Ready,
    Running,
    Stopped,
    Error,
}

/// One container owned by exactly one language pool.
#[derive(Debug, Clone)]
pub struct PooledContainer {
    pub id: String,
    pub status: ContainerStatus,
    pub is_ready: bool,
    pub language: Language,
    pub image: String,
    pub working_dir: String,
    pub created_at: SystemTime,
    pub last_used: SystemTime,
    pub last_error: Option<String>,
}

/// Counter snapshot of one pool. Returned to callers by value copy.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub language: Language,
    pub total_containers: usize,
    pub ready_containers: usize,
    pub busy_containers: usize,
    /// Containers the health sweep found exited cleanly, awaiting removal.
    pub stopped_containers: usize,
    pub error_containers: usize,
    pub utilization_rate: f64,
    pub created_count: u64,
    pub destroyed_count: u64,
}

impl PoolStats {
    pub(crate) const fn new(language: Language) -> Self {
        Self {
            language,
            total_containers: 0,
            ready_containers: 0,
            busy_containers: 0,
            stopped_containers: 0,
            error_containers: 0,
            utilization_rate: 0.0,
            created_count: 0,
            destroyed_count: 0,
        }
    }
}
