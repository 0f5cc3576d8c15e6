use super::{submit_tool, Backend, BackendError};
use crate::{
    config::ClusterConfig,
    ids::{JobId, WorkerId},
};
use itertools::Itertools;
use std::{fs, path::PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Backend speaking to HTCondor through `condor_submit`.
///
/// One event log file is created per executor lifetime and handed to
/// every submission; [`Backend::shutdown`] removes it again. Per-job
/// stdout/stderr land in `cfut.condor.{out,err}.<cluster>.<process>.txt`.
#[derive(Debug, Clone)]
pub struct CondorBackend {
    work_dir: PathBuf,
    worker: Vec<String>,
    log_file: PathBuf,
}

impl CondorBackend {
    pub fn new(config: &ClusterConfig) -> Self {
        let log_file = config
            .work_dir
            .join(format!("cfut.log.{}.txt", Uuid::new_v4().simple()));

        Self {
            work_dir: config.work_dir.clone(),
            worker: config.worker.clone(),
            log_file,
        }
    }

    fn description(&self, worker_argument: &str, directives: &[String], queue: usize) -> String {
        let executable = self.worker.first().cloned().unwrap_or_default();
        let arguments = self
            .worker
            .iter()
            .skip(1)
            .map(String::as_str)
            .chain([worker_argument])
            .join(" ");

        let mut lines = vec![
            format!("executable = {executable}"),
            format!("arguments = {arguments}"),
            format!("log = {}", self.log_file.display()),
            format!(
                "output = {}",
                self.work_dir
                    .join("cfut.condor.out.$(Cluster).$(Process).txt")
                    .display()
            ),
            format!(
                "error = {}",
                self.work_dir
                    .join("cfut.condor.err.$(Cluster).$(Process).txt")
                    .display()
            ),
            "getenv = true".to_string(),
        ];
        lines.extend(directives.iter().cloned());
        lines.push(format!("queue {queue}"));

        lines.join("\n") + "\n"
    }

    /// Single jobs are captured under process 0, array slots under
    /// their slot index.
    fn capture_files(&self, job: &JobId) -> [PathBuf; 2] {
        let (cluster, process) = match job.as_str().split_once('_') {
            Some((cluster, process)) => (cluster, process),
            None => (job.as_str(), "0"),
        };

        [
            self.work_dir
                .join(format!("cfut.condor.out.{cluster}.{process}.txt")),
            self.work_dir
                .join(format!("cfut.condor.err.{cluster}.{process}.txt")),
        ]
    }
}

impl Backend for CondorBackend {
    fn start(&self, worker: &WorkerId, directives: &[String]) -> Result<JobId, BackendError> {
        let description = self.description(worker.as_str(), directives, 1);
        let stdout = submit_tool("condor_submit", &["-terse"], &description)?;

        parse_cluster_id(&stdout)
    }

    fn start_array(
        &self,
        base: &WorkerId,
        slots: usize,
        directives: &[String],
    ) -> Result<JobId, BackendError> {
        let description = self.description(&format!("{base}_$(Process)"), directives, slots);
        let stdout = submit_tool("condor_submit", &["-terse"], &description)?;

        parse_cluster_id(&stdout)
    }

    fn cleanup(&self, job: &JobId) {
        for capture in self.capture_files(job) {
            if let Err(error) = fs::remove_file(&capture) {
                debug!(capture = %capture.display(), error = %error, "condor capture file was not removed");
            }
        }
    }

    fn shutdown(&self) {
        if let Err(error) = fs::remove_file(&self.log_file) {
            debug!(log = %self.log_file.display(), error = %error, "condor event log was not removed");
        }
    }
}

/// `-terse` prints `first.proc - last.proc`; the cluster number is the
/// group id.
fn parse_cluster_id(stdout: &str) -> Result<JobId, BackendError> {
    stdout
        .split(|c: char| c == '.' || c.is_whitespace())
        .next()
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .map(JobId::new)
        .ok_or_else(|| BackendError::MalformedJobId {
            tool: "condor_submit",
            output: stdout.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_ids_parse_from_terse_output() {
        assert_eq!(parse_cluster_id("97.0 - 97.0").unwrap(), JobId::new("97"));
        assert_eq!(parse_cluster_id("97.0 - 97.3").unwrap(), JobId::new("97"));
        assert!(parse_cluster_id("ERROR: no schedd").is_err());
        assert!(parse_cluster_id("").is_err());
    }

    #[test]
    fn descriptions_route_capture_files_into_the_work_dir() {
        let mut config = ClusterConfig::new(vec!["./worker".to_string()]);
        config.work_dir = PathBuf::from("/shared");
        let backend = CondorBackend::new(&config);

        let description = backend.description("w1", &["request_memory = 4G".to_string()], 1);

        assert!(description.contains("executable = ./worker\n"));
        assert!(description.contains("arguments = w1\n"));
        assert!(description.contains("output = /shared/cfut.condor.out.$(Cluster).$(Process).txt\n"));
        assert!(description.contains("request_memory = 4G\n"));
        assert!(description.ends_with("queue 1\n"));
    }

    #[test]
    fn capture_files_follow_the_slot_id_form() {
        let mut config = ClusterConfig::new(vec!["./worker".to_string()]);
        config.work_dir = PathBuf::from("/shared");
        let backend = CondorBackend::new(&config);

        let [out, err] = backend.capture_files(&JobId::new("97"));
        assert_eq!(out, PathBuf::from("/shared/cfut.condor.out.97.0.txt"));
        assert_eq!(err, PathBuf::from("/shared/cfut.condor.err.97.0.txt"));

        let [out, _] = backend.capture_files(&JobId::new("97_2"));
        assert_eq!(out, PathBuf::from("/shared/cfut.condor.out.97.2.txt"));
    }
}
