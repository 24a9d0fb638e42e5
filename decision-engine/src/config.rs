//! Engine configuration.
//!
//! Every section has defaults so an empty file (or no file at all) yields a
//! working engine. Thread counts of zero are clamped to one when read.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runner: RunnerConfig,
    pub recognition: RecognitionConfig,
    pub scheduler: SchedulerConfig,
    pub triggers: TriggerConfig,
    pub registry: RegistryConfig,
    pub rpc: RpcConfig,
    pub apps: AppsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub workers: usize,
    pub base_backoff_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            base_backoff_ms: 100,
        }
    }
}

impl RunnerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub threads: usize,
    /// Upper bound on how long a recognition request waits for stragglers
    /// before answering with the best match seen so far.
    pub aggregation_window_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            aggregation_window_ms: 250,
        }
    }
}

impl RecognitionConfig {
    pub fn thread_count(&self) -> usize {
        self.threads.max(1)
    }

    pub fn aggregation_window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_ms: 100 }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub poll_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { poll_ms: 100 }
    }
}

impl TriggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Shared capability manifest directories.
    pub capability_dirs: Vec<PathBuf>,
    /// Root of the per-app layout `<apps_dir>/<app>/capabilities/*.json`.
    pub apps_dir: Option<PathBuf>,
    pub default_rpc_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capability_dirs: vec![PathBuf::from("data/capabilities")],
            apps_dir: Some(PathBuf::from("apps")),
            default_rpc_timeout_ms: 4000,
        }
    }
}

impl RegistryConfig {
    /// Directories walked by `load_default_capability_manifests`.
    pub fn manifest_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.capability_dirs.clone();
        if let Some(apps) = &self.apps_dir {
            paths.push(apps.clone());
        }
        paths
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub io_threads: usize,
    /// Upper bound on a whole HTTP response, headers included.
    pub max_response_bytes: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            io_threads: 2,
            max_response_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsConfig {
    /// SQLite database holding the `apps` table. Absent means an empty
    /// in-memory directory.
    pub database: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}
