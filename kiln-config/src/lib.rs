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

use serde::Deserialize;

pub mod serde_utils;

use crate::serde_utils::{convert_numeric_with_shellexpand, convert_string_with_shellexpand};

/// Source languages the engine can execute.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Go,
    Python,
    JavaScript,
    TypeScript,
    Node,
}

impl Language {
    pub const fn all() -> &'static [Self] {
        &[
            Self::Go,
            Self::Python,
            Self::JavaScript,
            Self::TypeScript,
            Self::Node,
        ]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Node => "node",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "go" => Some(Self::Go),
            "py" | "python" => Some(Self::Python),
            "js" | "javascript" => Some(Self::JavaScript),
            "ts" | "typescript" => Some(Self::TypeScript),
            "node" => Some(Self::Node),
            _ => None,
        }
    }

    /// Maps a file extension (without the dot) to a language.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "go" => Some(Self::Go),
            "py" => Some(Self::Python),
            "js" => Some(Self::JavaScript),
            "ts" => Some(Self::TypeScript),
            "mjs" | "cjs" => Some(Self::Node),
            _ => None,
        }
    }

    pub const fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Go => &["go"],
            Self::Python => &["py"],
            Self::JavaScript => &["js"],
            Self::TypeScript => &["ts"],
            Self::Node => &["js", "mjs", "cjs"],
        }
    }

    pub const fn default_image(self) -> &'static str {
        match self {
            Self::Go => "golang:1.21-alpine",
            Self::Python => "python:3.12-alpine",
            Self::JavaScript | Self::TypeScript | Self::Node => "node:22-alpine",
        }
    }

    /// The filename the source is staged under inside a container.
    pub const fn source_file_name(self) -> &'static str {
        match self {
            Self::Go => "code.go",
            Self::Python => "code.py",
            Self::JavaScript | Self::Node => "code.js",
            Self::TypeScript => "code.ts",
        }
    }
}

impl core::fmt::Display for Language {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory cached files are stored in.
    #[serde(
        default = "default_cache_dir",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub cache_dir: String,

    /// Total on-disk byte budget. Oldest entries are evicted to stay under it.
    /// Default: 100mb.
    #[serde(
        default = "default_max_cache_size",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub max_cache_size: u64,

    /// Entries older than this (since last access) are treated as stale.
    /// Default: 1 hour.
    #[serde(default = "default_file_ttl_s")]
    pub file_ttl_s: u64,

    /// How often the background sweeper looks for stale entries.
    #[serde(default = "default_cache_cleanup_interval_s")]
    pub cleanup_interval_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_cache_size: default_max_cache_size(),
            file_ttl_s: default_file_ttl_s(),
            cleanup_interval_s: default_cache_cleanup_interval_s(),
        }
    }
}

fn default_cache_dir() -> String {
    "data/cache".to_string()
}
const fn default_max_cache_size() -> u64 {
    100 * 1024 * 1024
}
const fn default_file_ttl_s() -> u64 {
    60 * 60
}
const fn default_cache_cleanup_interval_s() -> u64 {
    10 * 60
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub enable_code_validation: bool,

    /// Largest source file accepted, in bytes. Default: 1mb.
    #[serde(
        default = "default_max_file_size",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub max_file_size: u64,

    /// Extensions (with leading dot) accepted for execution.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Patterns that reject the file outright. A multi-word pattern matches a
    /// line when all of its whitespace-separated tokens appear on that line.
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enable_code_validation: true,
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            blocked_patterns: default_blocked_patterns(),
        }
    }
}

const fn default_true() -> bool {
    true
}
const fn default_max_file_size() -> u64 {
    1024 * 1024
}
fn default_allowed_extensions() -> Vec<String> {
    [".go", ".py", ".js", ".ts"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_blocked_patterns() -> Vec<String> {
    [
        "os.RemoveAll",
        "os.Exit",
        "exec.Command",
        "syscall",
        "runtime.GC",
        "panic(",
        "rm -rf",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Per-language container pool sizing and maintenance knobs.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Hard cap on containers a pool may own at once.
    #[serde(default = "default_max_containers")]
    pub max_containers: usize,

    /// Ready containers the idle sweep will never go below.
    #[serde(default = "default_min_containers")]
    pub min_containers: usize,

    /// Containers created eagerly at pool initialization.
    #[serde(default = "default_pre_warm_count")]
    pub pre_warm_count: usize,

    /// How long an acquire blocks for a returned container before failing.
    #[serde(default = "default_max_wait_time_s")]
    pub max_wait_time_s: u64,

    /// Ready containers unused for this long become removal candidates.
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u64,

    #[serde(default = "default_pool_cleanup_interval_s")]
    pub cleanup_interval_s: u64,

    #[serde(default = "default_health_check_interval_s")]
    pub health_check_interval_s: u64,

    /// Image override. When unset the language's default image is used.
    #[serde(default)]
    pub image: Option<String>,

    /// Memory limit in the "1024m" / "2g" format.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// CPU cores granted to each container.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    #[serde(default = "default_network_mode")]
    pub network_mode: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_containers: default_max_containers(),
            min_containers: default_min_containers(),
            pre_warm_count: default_pre_warm_count(),
            max_wait_time_s: default_max_wait_time_s(),
            idle_timeout_s: default_idle_timeout_s(),
            cleanup_interval_s: default_pool_cleanup_interval_s(),
            health_check_interval_s: default_health_check_interval_s(),
            image: None,
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            network_mode: default_network_mode(),
        }
    }
}

impl PoolConfig {
    /// Parses `memory_limit` ("512m", "100mb", "2g", "1gb") into bytes.
    /// Unparseable limits are treated as unlimited.
    pub fn memory_limit_bytes(&self) -> u64 {
        let limit = self.memory_limit.trim().to_ascii_lowercase();
        let (number, multiplier) = if let Some(rest) = limit
            .strip_suffix("gb")
            .or_else(|| limit.strip_suffix('g'))
        {
            (rest, 1024 * 1024 * 1024)
        } else if let Some(rest) = limit
            .strip_suffix("mb")
            .or_else(|| limit.strip_suffix('m'))
        {
            (rest, 1024 * 1024)
        } else {
            return 0;
        };
        number.parse::<u64>().map_or(0, |n| n * multiplier)
    }

    /// `cpu_limit` expressed in Docker's nano-cpu units.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1e9) as i64
    }
}

const fn default_max_containers() -> usize {
    5
}
const fn default_min_containers() -> usize {
    2
}
const fn default_pre_warm_count() -> usize {
    3
}
const fn default_max_wait_time_s() -> u64 {
    60
}
const fn default_idle_timeout_s() -> u64 {
    30 * 60
}
const fn default_pool_cleanup_interval_s() -> u64 {
    30 * 60
}
const fn default_health_check_interval_s() -> u64 {
    30
}
fn default_memory_limit() -> String {
    "1024m".to_string()
}
const fn default_cpu_limit() -> f64 {
    1.0
}
fn default_network_mode() -> String {
    "bridge".to_string()
}

/// Retry/backoff policy for calls to external boundaries (HTTP fetches,
/// image pulls).
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    /// Maximum retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base delay before the first retry. Doubles each attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,

    /// Fraction of the delay randomized to spread out retries. 0 disables.
    #[serde(default = "default_retry_jitter")]
    pub jitter: f32,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay_ms(),
            jitter: default_retry_jitter(),
        }
    }
}

const fn default_max_retries() -> usize {
    3
}
const fn default_retry_delay_ms() -> u64 {
    100
}
const fn default_retry_jitter() -> f32 {
    0.5
}

/// Inputs of the execution fee formula.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FeeConfig {
    #[serde(default = "default_price_per_unit")]
    pub price_per_unit: f64,

    #[serde(default = "default_fixed_cost")]
    pub fixed_cost: f64,

    #[serde(default = "default_overhead_cost")]
    pub overhead_cost: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            price_per_unit: default_price_per_unit(),
            fixed_cost: default_fixed_cost(),
            overhead_cost: default_overhead_cost(),
        }
    }
}

const fn default_price_per_unit() -> f64 {
    0.0001
}
const fn default_fixed_cost() -> f64 {
    1.0
}
const fn default_overhead_cost() -> f64 {
    0.1
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_check_interval_s")]
    pub check_interval_s: u64,

    /// Active executions older than this raise a warning alert.
    #[serde(default = "default_max_execution_time_s")]
    pub max_execution_time_s: u64,

    /// Success rate below this raises a critical alert.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,

    /// Average execution time above this raises a warning alert.
    #[serde(default = "default_max_average_time_s")]
    pub max_average_time_s: u64,

    /// Alerts kept in memory. Oldest are dropped past this.
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_s: default_check_interval_s(),
            max_execution_time_s: default_max_execution_time_s(),
            min_success_rate: default_min_success_rate(),
            max_average_time_s: default_max_average_time_s(),
            max_alerts: default_max_alerts(),
        }
    }
}

const fn default_check_interval_s() -> u64 {
    30
}
const fn default_max_execution_time_s() -> u64 {
    5 * 60
}
const fn default_min_success_rate() -> f64 {
    0.8
}
const fn default_max_average_time_s() -> u64 {
    2 * 60
}
const fn default_max_alerts() -> usize {
    100
}

/// Top-level configuration of the execution engine.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    /// Base pool settings applied to every language.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-language overrides of the base pool settings.
    #[serde(default)]
    pub pools: HashMap<Language, PoolConfig>,

    #[serde(default)]
    pub fees: FeeConfig,

    /// Retry policy for file downloads and image pulls.
    #[serde(default)]
    pub retry: Retry,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Languages pools are created for. Defaults to all supported languages.
    #[serde(default)]
    pub languages: Option<Vec<Language>>,

    /// Bound on how long shutdown waits for in-flight executions.
    #[serde(default = "default_shutdown_timeout_s")]
    pub shutdown_timeout_s: u64,
}

const fn default_shutdown_timeout_s() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            validation: ValidationConfig::default(),
            pool: PoolConfig::default(),
            pools: HashMap::new(),
            fees: FeeConfig::default(),
            retry: Retry::default(),
            monitor: MonitorConfig::default(),
            languages: None,
            shutdown_timeout_s: default_shutdown_timeout_s(),
        }
    }
}

impl EngineConfig {
    /// Resolved pool configuration for one language, with the image default
    /// filled in.
    pub fn pool_for(&self, language: Language) -> PoolConfig {
        let mut cfg = self
            .pools
            .get(&language)
            .unwrap_or(&self.pool)
            .clone();
        if cfg.image.is_none() {
            cfg.image = Some(language.default_image().to_string());
        }
        cfg
    }

    pub fn languages(&self) -> Vec<Language> {
        self.languages
            .clone()
            .unwrap_or_else(|| Language::all().to_vec())
    }
}
