//! Worker-side half of the artifact protocol.
//!
//! A worker process cannot receive closures, so callers register named
//! task functions in a [`TaskRegistry`] and build their own worker
//! binary around [`TaskRegistry::run_from_args`]. The scheduler starts
//! that binary with a worker id; the registry reads the matching input
//! artifact, executes the named task for every item and publishes the
//! outcome artifact the submitting process is polling for.

use crate::{
    config::ClusterConfig,
    ids::WorkerId,
    payload::{self, CallSpec, PayloadError, RunOutcome, WorkItem},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;
use tracing::{debug, error};

/// Worker infrastructure failures. Task failures never surface here;
/// they travel back to the submitter inside the outcome artifact.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("no worker id was passed on the command line")]
    MissingWorkerId,
    #[error("failed to read the input artifact")]
    ReadInput(#[source] std::io::Error),
    #[error("input artifact did not decode")]
    DecodeInput(#[from] PayloadError),
    #[error("outcome payload did not encode")]
    EncodeOutcome(#[source] PayloadError),
    #[error("failed to write the output artifact")]
    WriteOutput(#[source] std::io::Error),
}

type Task = Box<dyn Fn(&WorkItem) -> Result<Vec<u8>, String> + Send + Sync>;

/// Name to task table for a worker process.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task taking one decoded argument value.
    pub fn register<A, R, F>(&mut self, name: &str, task: F)
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, String> + Send + Sync + 'static,
    {
        self.tasks.insert(
            name.to_string(),
            Box::new(move |item| {
                let args: A =
                    payload::decode(&item.args).map_err(|decode_error| decode_error.to_string())?;
                let value = task(args)?;

                payload::encode(&value).map_err(|encode_error| encode_error.to_string())
            }),
        );
    }

    /// Register a task that also receives the optional per-item context
    /// value.
    pub fn register_with_context<A, K, R, F>(&mut self, name: &str, task: F)
    where
        A: DeserializeOwned,
        K: DeserializeOwned,
        R: Serialize,
        F: Fn(A, Option<K>) -> Result<R, String> + Send + Sync + 'static,
    {
        self.tasks.insert(
            name.to_string(),
            Box::new(move |item| {
                let args: A =
                    payload::decode(&item.args).map_err(|decode_error| decode_error.to_string())?;
                let context = match &item.context {
                    Some(bytes) => {
                        Some(payload::decode(bytes).map_err(|decode_error| decode_error.to_string())?)
                    }
                    None => None,
                };
                let value = task(args, context)?;

                payload::encode(&value).map_err(|encode_error| encode_error.to_string())
            }),
        );
    }

    /// Execute the call named by `worker`'s input artifact and publish
    /// the outcome artifact. Task failures and panics become a
    /// [`RunOutcome::Failure`]; only infrastructure problems are
    /// returned as errors.
    pub fn run(&self, config: &ClusterConfig, worker: &WorkerId) -> Result<(), WorkerError> {
        let input = config.input_artifact(worker);
        let bytes = fs::read(&input).map_err(WorkerError::ReadInput)?;
        let spec: CallSpec = payload::decode(&bytes)?;
        debug!(
            worker = %worker,
            function = %spec.function,
            items = spec.items.len(),
            "executing call"
        );

        let outcome = self.execute(&spec);
        if let RunOutcome::Failure(message) = &outcome {
            error!(worker = %worker, cause = %message, "call failed");
        }

        // published via rename so the poller never sees a half-written
        // artifact
        let output = config.output_artifact(worker);
        let staged = output.with_extension("blob.tmp");
        let encoded = payload::encode(&outcome).map_err(WorkerError::EncodeOutcome)?;
        fs::write(&staged, encoded).map_err(WorkerError::WriteOutput)?;
        fs::rename(&staged, &output).map_err(WorkerError::WriteOutput)?;

        Ok(())
    }

    /// Entry point for a worker binary: takes the worker id from the
    /// command line and runs it against `config`.
    pub fn run_from_args(&self, config: &ClusterConfig) -> Result<(), WorkerError> {
        let id = env::args().nth(1).ok_or(WorkerError::MissingWorkerId)?;

        self.run(config, &WorkerId::from(id))
    }

    fn execute(&self, spec: &CallSpec) -> RunOutcome {
        let task = match self.tasks.get(&spec.function) {
            Some(task) => task,
            None => return RunOutcome::Failure(format!("unknown function {:?}", spec.function)),
        };

        let mut values = Vec::with_capacity(spec.items.len());
        for item in &spec.items {
            match panic::catch_unwind(AssertUnwindSafe(|| task(item))) {
                Ok(Ok(value)) => values.push(value),
                Ok(Err(message)) => return RunOutcome::Failure(message),
                Err(cause) => return RunOutcome::Failure(panic_message(cause)),
            }
        }

        RunOutcome::Success(values)
    }
}

fn panic_message(cause: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("double", |x: i64| -> Result<i64, String> { Ok(x * 2) });
        registry.register_with_context("scale", |x: i64, factor: Option<i64>| -> Result<i64, String> {
            Ok(x * factor.unwrap_or(1))
        });
        registry.register("fail", |_: i64| -> Result<i64, String> {
            Err("nope".to_string())
        });

        registry
    }

    fn config_in(dir: &TempDir) -> ClusterConfig {
        let mut config = ClusterConfig::new(vec!["unused".to_string()]);
        config.work_dir = dir.path().to_path_buf();

        config
    }

    fn write_call(config: &ClusterConfig, worker: &WorkerId, spec: &CallSpec) {
        fs::write(
            config.input_artifact(worker),
            payload::encode(spec).unwrap(),
        )
        .unwrap();
    }

    fn read_outcome(config: &ClusterConfig, worker: &WorkerId) -> RunOutcome {
        payload::decode(&fs::read(config.output_artifact(worker)).unwrap()).unwrap()
    }

    #[test]
    fn runs_every_item_of_a_batch_in_order() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let worker = WorkerId::random();

        let spec = CallSpec {
            function: "double".to_string(),
            items: (1i64..=3)
                .map(|x| WorkItem {
                    args: payload::encode(&x).unwrap(),
                    context: None,
                })
                .collect(),
        };
        write_call(&config, &worker, &spec);
        registry().run(&config, &worker).unwrap();

        let outcome = read_outcome(&config, &worker);
        let RunOutcome::Success(values) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        let decoded: Vec<i64> = values
            .iter()
            .map(|value| payload::decode(value).unwrap())
            .collect();
        assert_eq!(decoded, vec![2, 4, 6]);
    }

    #[test]
    fn context_values_reach_the_task() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let worker = WorkerId::random();

        let spec = CallSpec {
            function: "scale".to_string(),
            items: vec![WorkItem {
                args: payload::encode(&7i64).unwrap(),
                context: Some(payload::encode(&10i64).unwrap()),
            }],
        };
        write_call(&config, &worker, &spec);
        registry().run(&config, &worker).unwrap();

        let RunOutcome::Success(values) = read_outcome(&config, &worker) else {
            panic!("expected success");
        };
        assert_eq!(payload::decode::<i64>(&values[0]).unwrap(), 70);
    }

    #[test]
    fn task_failure_becomes_a_failure_outcome() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let worker = WorkerId::random();

        let spec = CallSpec {
            function: "fail".to_string(),
            items: vec![WorkItem {
                args: payload::encode(&1i64).unwrap(),
                context: None,
            }],
        };
        write_call(&config, &worker, &spec);
        registry().run(&config, &worker).unwrap();

        assert_eq!(
            read_outcome(&config, &worker),
            RunOutcome::Failure("nope".to_string())
        );
    }

    #[test]
    fn unknown_function_becomes_a_failure_outcome() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let worker = WorkerId::random();

        let spec = CallSpec {
            function: "missing".to_string(),
            items: Vec::new(),
        };
        write_call(&config, &worker, &spec);
        registry().run(&config, &worker).unwrap();

        assert!(matches!(
            read_outcome(&config, &worker),
            RunOutcome::Failure(message) if message.contains("missing")
        ));
    }

    #[test]
    fn panics_are_caught_and_stringified() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let worker = WorkerId::random();

        let mut registry = TaskRegistry::new();
        registry.register("explode", |_: i64| -> Result<i64, String> {
            panic!("blew up at item 0")
        });

        let spec = CallSpec {
            function: "explode".to_string(),
            items: vec![WorkItem {
                args: payload::encode(&1i64).unwrap(),
                context: None,
            }],
        };
        write_call(&config, &worker, &spec);
        registry.run(&config, &worker).unwrap();

        assert!(matches!(
            read_outcome(&config, &worker),
            RunOutcome::Failure(message) if message.contains("blew up")
        ));
    }

    #[test]
    fn missing_input_is_an_infrastructure_error() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let result = registry().run(&config, &WorkerId::random());
        assert!(matches!(result, Err(WorkerError::ReadInput(_))));
    }
}
