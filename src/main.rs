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

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kiln_cache::ReqwestFetcher;
use kiln_config::{EngineConfig, Language};
use kiln_engine::ExecutionEngine;
use kiln_error::{Error, ResultExt, make_input_err};
use kiln_pool::DockerRuntime;
use kiln_util::instant_wrapper::default_instant_wrapper;
use tracing::{error, info, warn};

/// Sandboxed code execution engine. Downloads a source file, validates it
/// and runs it in a pooled container.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Config file in JSON5 format. Defaults are used when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// URL of the source file to execute.
    #[arg(long)]
    url: String,

    /// Language the file is written in (go, python, javascript,
    /// typescript, node).
    #[arg(long)]
    language: String,

    /// Number of attesters verifying this execution.
    #[arg(long, default_value_t = 0)]
    attesters: u32,
}

async fn inner_main(args: Args) -> Result<(), Error> {
    let config: EngineConfig = match &args.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .err_tip(|| format!("Failed to read config file {}", path.display()))?;
            serde_json5::from_str(&raw)
                .map_err(|err| make_input_err!("Invalid config: {err:?}"))?
        }
        None => EngineConfig::default(),
    };
    let language = Language::from_name(&args.language)
        .ok_or_else(|| make_input_err!("Unknown language {}", args.language))?;

    let runtime = Arc::new(DockerRuntime::new()?);
    let fetcher = Arc::new(ReqwestFetcher::new(config.retry.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        config,
        runtime,
        fetcher,
        default_instant_wrapper(),
    )?);
    engine.initialize().await?;

    let outcome = tokio::select! {
        outcome = engine.execute(&args.url, language, args.attesters) => Some(outcome),
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(?err, "Failed to listen for interrupt");
            }
            warn!("Interrupted, shutting down");
            None
        }
    };
    engine.shutdown().await;

    let result = match outcome {
        Some(result) => result?,
        None => return Ok(()),
    };
    info!(
        success = result.success,
        execution_time = ?result.stats.execution_time,
        total_duration = ?result.stats.total_duration,
        cost = result.stats.total_cost,
        "Execution complete"
    );
    for warning in &result.warnings {
        warn!(warning, "Validation warning");
    }
    if let Some(err) = &result.error {
        error!(err, "Execution failed");
    }
    println!("{}", result.output);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    kiln_util::init_tracing()?;
    inner_main(args).await
}
