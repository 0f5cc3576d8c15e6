//! Scheduler backends.
//!
//! Each backend knows how to hand a job description to one scheduler's
//! submission tool and how to reclaim the capture files that scheduler
//! produces. Everything else, lifecycle, completion, artifact handling,
//! lives in [`crate::executor`] and is shared across backends.

pub mod condor;
pub mod slurm;

use crate::ids::{JobId, WorkerId};
use std::{
    io::Write,
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to run {tool}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} rejected the job: {stderr}")]
    Rejected { tool: &'static str, stderr: String },
    #[error("could not parse a job id out of {tool} output {output:?}")]
    MalformedJobId {
        tool: &'static str,
        output: String,
    },
}

/// Capability interface of one scheduler backend.
///
/// The lifecycle engine is generic over this trait, so a backend only
/// concerns itself with starting jobs and removing its own capture
/// files.
pub trait Backend: Send + Sync + 'static {
    /// Submit one job that runs the worker entry point with `worker` as
    /// its sole trailing argument. Returns the scheduler-assigned id
    /// synchronously.
    fn start(&self, worker: &WorkerId, directives: &[String]) -> Result<JobId, BackendError>;

    /// Submit an array of `slots` jobs. Slot `i` must run the worker
    /// entry point with `"{base}_{i}"`; per-slot job ids derive from
    /// the returned group id the same way.
    fn start_array(
        &self,
        base: &WorkerId,
        slots: usize,
        directives: &[String],
    ) -> Result<JobId, BackendError>;

    /// Remove the capture files this backend produced for a finished
    /// job. May run twice for the same id, and the files may already be
    /// gone; neither is an error.
    fn cleanup(&self, job: &JobId);

    /// Executor shutdown hook for backend artifacts that live for the
    /// whole executor rather than one job.
    fn shutdown(&self) {}
}

/// Run a submission tool, feeding `description` through stdin, and
/// return its captured stdout.
fn submit_tool(
    tool: &'static str,
    args: &[&str],
    description: &str,
) -> Result<String, BackendError> {
    debug!(tool, description, "submitting job description");
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| BackendError::Spawn { tool, source })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(description.as_bytes())
            .map_err(|source| BackendError::Spawn { tool, source })?;
        // dropping stdin closes the descriptor so the tool sees the end
        // of its input
    }

    let output = child
        .wait_with_output()
        .map_err(|source| BackendError::Spawn { tool, source })?;
    if !output.status.success() {
        return Err(BackendError::Rejected {
            tool,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
