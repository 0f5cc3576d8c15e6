//! Completion detection by polling for artifact appearance.
//!
//! Batch schedulers offer no push channel back to the submitter; the
//! only reliable completion signal is the result artifact showing up on
//! the shared filesystem. One background thread polls the registered
//! paths and reports each one that appears, exactly once.

use crate::ids::JobId;
use itertools::Itertools;
use parking_lot::Mutex;
use std::{collections::HashMap, path::PathBuf, sync::Arc, thread, time::Duration};
use tracing::{debug, warn};

type Callback = Box<dyn Fn(JobId) + Send + 'static>;

#[derive(Default)]
struct WatchSet {
    waiting: HashMap<PathBuf, JobId>,
    stop: bool,
}

/// Polls the filesystem for registered artifact paths and invokes the
/// completion callback for each path that appears.
pub struct FileWatcher {
    shared: Arc<Mutex<WatchSet>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FileWatcher {
    /// Start the polling thread. `callback` runs on that thread for
    /// every artifact that appears, with the value the artifact was
    /// registered under.
    pub fn spawn<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn(JobId) + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(WatchSet::default()));
        let handle = thread::Builder::new()
            .name("cfut-watcher".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                let callback: Callback = Box::new(callback);
                move || poll_loop(&shared, interval, &callback)
            })
            .expect("failed to spawn the watcher thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Watch `path`, reporting `job` when it first exists.
    /// Re-registering the same path replaces the previous entry.
    pub fn register(&self, path: PathBuf, job: JobId) {
        self.shared.lock().waiting.insert(path, job);
    }

    /// Ask the polling thread to stop and wait for it to finish.
    /// Entries that never completed are abandoned; their values are not
    /// reported.
    pub fn stop(&mut self) {
        self.shared.lock().stop = true;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("watcher thread panicked before it could be joined");
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(shared: &Mutex<WatchSet>, interval: Duration, callback: &Callback) {
    loop {
        {
            let mut set = shared.lock();
            if set.stop {
                if !set.waiting.is_empty() {
                    debug!(
                        abandoned = set.waiting.len(),
                        "watcher stopped with unfinished entries"
                    );
                }
                return;
            }

            // existence check, report and removal all happen under the
            // same lock as register, so an entry is reported at most
            // once and never lost to a concurrent registration
            let ready = set
                .waiting
                .keys()
                .filter(|path| path.exists())
                .cloned()
                .collect_vec();
            for path in ready {
                if let Some(job) = set.waiting.remove(&path) {
                    debug!(artifact = %path.display(), job = %job, "artifact appeared");
                    callback(job);
                }
            }
        }

        thread::sleep(interval);
    }
}
