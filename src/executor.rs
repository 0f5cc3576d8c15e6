//! Job lifecycle engine: submission, completion, shutdown.

use crate::{
    backends::{Backend, BackendError},
    config::{ClusterConfig, ConfigError},
    future::{BatchFuture, JobError, JobFuture, ResultSlot},
    ids::{JobId, WorkerId},
    payload::{self, CallSpec, PayloadError, RunOutcome, WorkItem},
    watcher::FileWatcher,
};
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, fs, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Failures raised synchronously by `submit`/`submit_array`. None of
/// these leave a job-table entry behind.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("{items} work items cannot be split into batches of {batch_size}")]
    UnevenBatch { items: usize, batch_size: usize },
    #[error("{contexts} context values were supplied for {items} work items")]
    ContextMismatch { items: usize, contexts: usize },
    #[error("failed to encode the call payload")]
    Encode(#[from] PayloadError),
    #[error("failed to write the input artifact")]
    InputArtifact(#[from] std::io::Error),
    #[error("the scheduler did not accept the job")]
    Backend(#[from] BackendError),
}

struct JobRecord {
    slot: Arc<ResultSlot>,
    worker: WorkerId,
}

struct Inner<B> {
    backend: B,
    config: ClusterConfig,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    jobs_empty: Condvar,
}

/// Futures-producing facade over one scheduler backend.
///
/// Owns the job table and the completion watcher. Submission writes the
/// input artifact, starts the job through the backend and hands back a
/// future; the watcher thread resolves that future once the worker's
/// output artifact appears, then reclaims both artifacts.
pub struct ClusterExecutor<B: Backend> {
    inner: Arc<Inner<B>>,
    watcher: FileWatcher,
}

impl<B: Backend> ClusterExecutor<B> {
    /// Create the work directory, start the completion watcher and hand
    /// back a ready executor.
    pub fn new(backend: B, config: ClusterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        fs::create_dir_all(&config.work_dir)?;

        let poll_interval = config.poll_interval();
        let inner = Arc::new(Inner {
            backend,
            config,
            jobs: Mutex::new(HashMap::new()),
            jobs_empty: Condvar::new(),
        });
        let watcher = FileWatcher::spawn(poll_interval, {
            let inner = Arc::clone(&inner);
            move |job| inner.complete(job)
        });

        Ok(Self { inner, watcher })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Submit one call of `function` with `args` and return its future
    /// immediately.
    pub fn submit<A, R>(&self, function: &str, args: &A) -> Result<JobFuture<R>, SubmitError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.submit_with(function, args, &[])
    }

    /// Like [`ClusterExecutor::submit`] with extra setup directives for
    /// this one job.
    pub fn submit_with<A, R>(
        &self,
        function: &str,
        args: &A,
        directives: &[String],
    ) -> Result<JobFuture<R>, SubmitError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let worker = WorkerId::random();
        let spec = CallSpec {
            function: function.to_string(),
            items: vec![WorkItem {
                args: payload::encode(args)?,
                context: None,
            }],
        };
        self.write_input(&worker, &spec)?;

        let directives = self.merged_directives(directives);
        let job = match self.inner.backend.start(&worker, &directives) {
            Ok(job) => job,
            Err(submit_error) => {
                self.discard_input(&worker);
                return Err(submit_error.into());
            }
        };
        debug!(job = %job, worker = %worker, "job submitted");

        Ok(JobFuture::new(self.track(job, worker)))
    }

    /// Partition `args` into contiguous batches of `batch_size`, write
    /// one input artifact per batch and submit a single array job
    /// covering all of them. Returns one future per batch, in batch
    /// order; each future yields that batch's results in input order.
    pub fn submit_array<A, R>(
        &self,
        function: &str,
        args: &[A],
        batch_size: usize,
    ) -> Result<Vec<BatchFuture<R>>, SubmitError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.submit_array_with::<A, (), R>(function, args, None, batch_size, &[])
    }

    /// Array submission with optional per-item context values and extra
    /// setup directives. A supplied context sequence must match `args`
    /// in length.
    pub fn submit_array_with<A, K, R>(
        &self,
        function: &str,
        args: &[A],
        contexts: Option<&[K]>,
        batch_size: usize,
        directives: &[String],
    ) -> Result<Vec<BatchFuture<R>>, SubmitError>
    where
        A: Serialize,
        K: Serialize,
        R: DeserializeOwned,
    {
        if batch_size == 0 || args.len() % batch_size != 0 {
            return Err(SubmitError::UnevenBatch {
                items: args.len(),
                batch_size,
            });
        }
        if let Some(contexts) = contexts {
            if contexts.len() != args.len() {
                return Err(SubmitError::ContextMismatch {
                    items: args.len(),
                    contexts: contexts.len(),
                });
            }
        }
        if args.is_empty() {
            return Ok(Vec::new());
        }

        // encode everything up front so a bad item cannot leave partial
        // artifacts behind
        let mut items = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let context = match contexts {
                Some(contexts) => Some(payload::encode(&contexts[index])?),
                None => None,
            };
            items.push(WorkItem {
                args: payload::encode(arg)?,
                context,
            });
        }

        let base = WorkerId::random();
        let batches = items.chunks(batch_size).collect_vec();
        let workers = (0..batches.len()).map(|index| base.slot(index)).collect_vec();
        for (index, (worker, batch)) in workers.iter().zip(&batches).enumerate() {
            let spec = CallSpec {
                function: function.to_string(),
                items: batch.to_vec(),
            };
            if let Err(write_error) = self.write_input(worker, &spec) {
                for written in &workers[..index] {
                    self.discard_input(written);
                }
                return Err(write_error);
            }
        }

        let directives = self.merged_directives(directives);
        let group = match self
            .inner
            .backend
            .start_array(&base, batches.len(), &directives)
        {
            Ok(group) => group,
            Err(submit_error) => {
                for worker in &workers {
                    self.discard_input(worker);
                }
                return Err(submit_error.into());
            }
        };
        debug!(group = %group, slots = batches.len(), "job array submitted");

        let futures = workers
            .into_iter()
            .enumerate()
            .map(|(index, worker)| BatchFuture::new(self.track(group.slot(index), worker)))
            .collect_vec();

        Ok(futures)
    }

    /// Wait for in-flight jobs to drain (when `wait`), then stop the
    /// watcher and run the backend's shutdown hook. No submissions may
    /// follow a shutdown.
    pub fn shutdown(mut self, wait: bool) {
        if wait {
            let mut jobs = self.inner.jobs.lock();
            while !jobs.is_empty() {
                self.inner.jobs_empty.wait(&mut jobs);
            }
        }
        self.watcher.stop();
        self.inner.backend.shutdown();
    }

    fn write_input(&self, worker: &WorkerId, spec: &CallSpec) -> Result<(), SubmitError> {
        let bytes = payload::encode(spec)?;
        fs::write(self.inner.config.input_artifact(worker), bytes)?;

        Ok(())
    }

    fn discard_input(&self, worker: &WorkerId) {
        let input = self.inner.config.input_artifact(worker);
        if let Err(remove_error) = fs::remove_file(&input) {
            warn!(
                artifact = %input.display(),
                error = %remove_error,
                "input artifact was not removed after a failed submission"
            );
        }
    }

    fn merged_directives(&self, extra: &[String]) -> Vec<String> {
        self.inner
            .config
            .directives
            .iter()
            .chain(extra)
            .cloned()
            .collect_vec()
    }

    /// Insert the job record, then register the watch entry. Table
    /// first, so the watcher can never deliver a completion for a job
    /// the table does not know.
    fn track(&self, job: JobId, worker: WorkerId) -> Arc<ResultSlot> {
        let slot = ResultSlot::new();
        let output = self.inner.config.output_artifact(&worker);
        self.inner.jobs.lock().insert(
            job.clone(),
            JobRecord {
                slot: Arc::clone(&slot),
                worker,
            },
        );
        self.watcher.register(output, job);

        slot
    }
}

impl<B: Backend> Inner<B> {
    /// Completion handler, run on the watcher thread once per job.
    fn complete(&self, job: JobId) {
        let record = match self.jobs.lock().remove(&job) {
            Some(record) => record,
            // watch entries are removed before this handler runs, so a
            // second invocation for the same id has nothing left to do
            None => return,
        };

        let outcome = self.read_outcome(&record.worker);
        if let Err(job_error) = &outcome {
            error!(job = %job, error = %job_error, "job finished without a usable result");
        }

        // communication artifacts are reclaimed even when the result
        // payload was unusable
        self.reclaim(self.config.input_artifact(&record.worker));
        self.reclaim(self.config.output_artifact(&record.worker));
        if !self.config.keep_logs {
            self.backend.cleanup(&job);
        }

        debug!(job = %job, "job completed");
        record.slot.resolve(outcome);

        // signalled only after the record is fully processed, so a
        // drained table implies resolved futures and reclaimed
        // artifacts
        let jobs = self.jobs.lock();
        if jobs.is_empty() {
            self.jobs_empty.notify_all();
        }
    }

    fn read_outcome(&self, worker: &WorkerId) -> Result<Vec<Vec<u8>>, JobError> {
        let output = self.config.output_artifact(worker);
        let bytes = fs::read(&output).map_err(|read_error| JobError::Malformed(read_error.to_string()))?;

        match payload::decode::<RunOutcome>(&bytes) {
            Ok(RunOutcome::Success(values)) => Ok(values),
            Ok(RunOutcome::Failure(message)) => Err(JobError::Remote(message)),
            Err(decode_error) => Err(JobError::Malformed(decode_error.to_string())),
        }
    }

    fn reclaim(&self, artifact: PathBuf) {
        if let Err(remove_error) = fs::remove_file(&artifact) {
            warn!(
                artifact = %artifact.display(),
                error = %remove_error,
                "communication artifact was not removed"
            );
        }
    }
}
