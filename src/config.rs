use crate::ids::WorkerId;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access the config file or work directory")]
    Io(#[from] std::io::Error),
    #[error("config file is invalid")]
    Parse(#[from] serde_yaml::Error),
    #[error("worker command is empty")]
    EmptyWorkerCommand,
}

/// Settings shared by every executor backend.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Command prefix that starts a worker process on a cluster node;
    /// the worker id is appended as the final argument.
    pub worker: Vec<String>,

    /// Directory holding all communication artifacts. Must live on a
    /// filesystem shared with the worker nodes.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Polling rate of the completion watcher. The only source of
    /// completion latency, traded against filesystem load.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Verbose submission/completion tracing, see [`init_tracing`].
    #[serde(default)]
    pub debug: bool,

    /// Keep backend capture files instead of deleting them after a job
    /// finishes.
    #[serde(default)]
    pub keep_logs: bool,

    /// Free-form lines forwarded verbatim into every job description,
    /// e.g. `#SBATCH` resource requests.
    #[serde(default)]
    pub directives: Vec<String>,
}

impl ClusterConfig {
    pub fn new(worker: Vec<String>) -> Self {
        Self {
            worker,
            work_dir: default_work_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            debug: false,
            keep_logs: false,
            directives: Vec::new(),
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Self = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.is_empty() {
            error!("worker command is empty, the scheduler would have nothing to run");
            return Err(ConfigError::EmptyWorkerCommand);
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Input artifact for one unit of work.
    pub fn input_artifact(&self, worker: &WorkerId) -> PathBuf {
        self.work_dir.join(format!("cfut.in.{worker}.blob"))
    }

    /// Output artifact whose appearance signals completion.
    pub fn output_artifact(&self, worker: &WorkerId) -> PathBuf {
        self.work_dir.join(format!("cfut.out.{worker}.blob"))
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".cfut")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Install a fmt subscriber honoring `RUST_LOG`, falling back to a
/// default level picked from the debug flag.
pub fn init_tracing(debug: bool) {
    let fallback = if debug { "cfut=debug" } else { "cfut=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
