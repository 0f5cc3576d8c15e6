use super::{submit_tool, Backend, BackendError};
use crate::{
    config::ClusterConfig,
    ids::{JobId, WorkerId},
};
use std::{fs, path::PathBuf};
use tracing::debug;

/// Backend speaking to Slurm through `sbatch`.
///
/// Capture files are written as `cfut.slurm.<jobid>.out` in the work
/// directory. Array tasks are captured under the `%A_%a` pattern, which
/// expands to the same `<group>_<index>` form the per-slot job ids use,
/// so [`Backend::cleanup`] finds them by id alone.
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    work_dir: PathBuf,
    worker: Vec<String>,
}

impl SlurmBackend {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            worker: config.worker.clone(),
        }
    }

    fn script(
        &self,
        capture_pattern: &str,
        array_slots: Option<usize>,
        directives: &[String],
        worker_argument: &str,
    ) -> String {
        let mut lines = vec![
            "#!/bin/sh".to_string(),
            format!(
                "#SBATCH --output={}",
                self.work_dir.join(capture_pattern).display()
            ),
        ];
        if let Some(slots) = array_slots {
            lines.push(format!("#SBATCH --array=0-{}", slots - 1));
        }
        lines.extend(directives.iter().cloned());
        lines.push(format!("{} {}", self.worker.join(" "), worker_argument));

        lines.join("\n") + "\n"
    }
}

impl Backend for SlurmBackend {
    fn start(&self, worker: &WorkerId, directives: &[String]) -> Result<JobId, BackendError> {
        let script = self.script("cfut.slurm.%j.out", None, directives, worker.as_str());
        let stdout = submit_tool("sbatch", &["--parsable"], &script)?;

        parse_job_id(&stdout)
    }

    fn start_array(
        &self,
        base: &WorkerId,
        slots: usize,
        directives: &[String],
    ) -> Result<JobId, BackendError> {
        let script = self.script(
            "cfut.slurm.%A_%a.out",
            Some(slots),
            directives,
            &format!("{base}_$SLURM_ARRAY_TASK_ID"),
        );
        let stdout = submit_tool("sbatch", &["--parsable"], &script)?;

        parse_job_id(&stdout)
    }

    fn cleanup(&self, job: &JobId) {
        let capture = self.work_dir.join(format!("cfut.slurm.{job}.out"));
        if let Err(error) = fs::remove_file(&capture) {
            // capture files may be gone already, e.g. on a second
            // cleanup for the same job
            debug!(capture = %capture.display(), error = %error, "slurm capture file was not removed");
        }
    }
}

/// `sbatch --parsable` prints `jobid` or `jobid;cluster`.
fn parse_job_id(stdout: &str) -> Result<JobId, BackendError> {
    let id = stdout.split(';').next().unwrap_or(stdout).trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(BackendError::MalformedJobId {
            tool: "sbatch",
            output: stdout.to_string(),
        });
    }

    Ok(JobId::new(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_parse_with_and_without_cluster_suffix() {
        assert_eq!(parse_job_id("4242").unwrap(), JobId::new("4242"));
        assert_eq!(parse_job_id("4242;cluster0").unwrap(), JobId::new("4242"));
        assert!(parse_job_id("").is_err());
        assert!(parse_job_id("sbatch: error").is_err());
    }

    #[test]
    fn scripts_carry_directives_and_the_worker_command() {
        let mut config = ClusterConfig::new(vec!["./worker".to_string(), "--quiet".to_string()]);
        config.work_dir = PathBuf::from("/shared");
        let backend = SlurmBackend::new(&config);

        let script = backend.script(
            "cfut.slurm.%j.out",
            None,
            &["#SBATCH --mem=4G".to_string()],
            "w1",
        );

        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("#SBATCH --output=/shared/cfut.slurm.%j.out\n"));
        assert!(script.contains("#SBATCH --mem=4G\n"));
        assert!(script.ends_with("./worker --quiet w1\n"));
    }

    #[test]
    fn array_scripts_cover_every_slot() {
        let config = ClusterConfig::new(vec!["./worker".to_string()]);
        let backend = SlurmBackend::new(&config);

        let script = backend.script(
            "cfut.slurm.%A_%a.out",
            Some(3),
            &[],
            "base_$SLURM_ARRAY_TASK_ID",
        );

        assert!(script.contains("#SBATCH --array=0-2\n"));
        assert!(script.ends_with("./worker base_$SLURM_ARRAY_TASK_ID\n"));
    }
}
