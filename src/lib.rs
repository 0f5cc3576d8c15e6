//! Futures for batch-scheduled clusters.
//!
//! `cfut` hands units of work to an external scheduler (Slurm or
//! HTCondor) and resolves one future per job. Such schedulers offer no
//! channel back to the submitting process, so every result travels over
//! the shared filesystem: submission writes an input artifact, the
//! worker writes an output artifact, and a polling watcher thread turns
//! the appearance of that artifact into a resolved future.
//!
//! ```no_run
//! use cfut::{ClusterConfig, ClusterExecutor, SlurmBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClusterConfig::new(vec!["./my-worker".to_string()]);
//! let executor = ClusterExecutor::new(SlurmBackend::new(&config), config)?;
//!
//! let future = executor.submit::<i64, i64>("square", &12)?;
//! assert_eq!(future.wait()?, 144);
//!
//! executor.shutdown(true);
//! # Ok(())
//! # }
//! ```
//!
//! The worker side is a binary the caller builds around
//! [`TaskRegistry`], registering the same function names submitted
//! here; the scheduler starts it with the worker id as its single
//! argument.

pub mod backends;
pub mod config;
pub mod executor;
pub mod future;
pub mod ids;
pub mod map;
pub mod payload;
pub mod watcher;
pub mod worker;

pub use backends::{condor::CondorBackend, slurm::SlurmBackend, Backend, BackendError};
pub use config::{init_tracing, ClusterConfig, ConfigError};
pub use executor::{ClusterExecutor, SubmitError};
pub use future::{BatchFuture, JobError, JobFuture};
pub use ids::{JobId, WorkerId};
pub use map::{map, map_array, JobArrayStream, JobStream, YieldOrder};
pub use worker::{TaskRegistry, WorkerError};
