// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<FunnelConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static FunnelConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = FunnelConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static FunnelConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = FunnelConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static FunnelConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("FUNNEL_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("funnel.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $FUNNEL_CONFIG or create ./funnel.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct FunnelConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "funnel=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl FunnelConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: FunnelConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

fn default_gather_wait_step_ms() -> u64 {
    50
}

fn default_tuple_queue_capacity() -> usize {
    64
}

fn default_worker_pool_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Step used for the gather merge loop's blocking wait, so the external
    /// cancel flag is observed between steps.
    #[serde(default = "default_gather_wait_step_ms")]
    pub gather_wait_step_ms: u64,

    /// Per-worker tuple queue capacity, in chunks. Senders block once full.
    #[serde(default = "default_tuple_queue_capacity")]
    pub tuple_queue_capacity: usize,

    /// Threads backing the shared worker pool. Spare capacity bounds how many
    /// workers a single gather can launch.
    #[serde(default = "default_worker_pool_threads")]
    pub worker_pool_threads: usize,

    /// When true, the gather node accounts per-tuple fetch latency and logs a
    /// summary at end of stream.
    #[serde(default)]
    pub enable_statistic: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gather_wait_step_ms: default_gather_wait_step_ms(),
            tuple_queue_capacity: default_tuple_queue_capacity(),
            worker_pool_threads: default_worker_pool_threads(),
            enable_statistic: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_defaults_are_sane() {
        let cfg = FunnelConfig::default();
        assert!(cfg.runtime.gather_wait_step_ms > 0);
        assert!(cfg.runtime.tuple_queue_capacity > 0);
        assert!(cfg.runtime.worker_pool_threads >= 1);
        assert!(!cfg.runtime.enable_statistic);
    }

    #[test]
    fn parse_partial_toml_falls_back_to_defaults() {
        let cfg: FunnelConfig =
            toml::from_str("log_level = \"debug\"\n[runtime]\ntuple_queue_capacity = 4\n")
                .expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.runtime.tuple_queue_capacity, 4);
        assert_eq!(
            cfg.runtime.gather_wait_step_ms,
            default_gather_wait_step_ms()
        );
    }
}
