//! Single-assignment futures handed out by the executor.

use crate::payload;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use std::{
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

/// How a finished job can fail from the caller's point of view.
///
/// Both variants arrive through a resolved future; neither is ever
/// raised synchronously by `submit`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The worker caught a failure while running user code. The payload
    /// is the stringified remote error.
    #[error("job failed on the worker:\n{0}")]
    Remote(String),
    /// The output artifact was unreadable or its payload did not
    /// decode.
    #[error("result artifact was malformed: {0}")]
    Malformed(String),
}

type Resolution = Result<Vec<Vec<u8>>, JobError>;

/// Single-assignment result cell. Resolved at most once; every waiter
/// observes the same resolution.
#[derive(Debug, Default)]
pub(crate) struct ResultSlot {
    state: Mutex<Option<Resolution>>,
    ready: Condvar,
}

impl ResultSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// First resolution wins, later calls are ignored.
    pub(crate) fn resolve(&self, resolution: Resolution) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(resolution);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Resolution {
        let mut state = self.state.lock();
        loop {
            if let Some(resolution) = state.as_ref() {
                return resolution.clone();
            }
            self.ready.wait(&mut state);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<Resolution> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(resolution) = state.as_ref() {
                return Some(resolution.clone());
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return state.clone();
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.state.lock().is_some()
    }
}

/// Handle to the eventual result of one submitted job.
///
/// Clones share the same underlying cell; it is safe to wait from
/// several threads at once.
pub struct JobFuture<R> {
    slot: Arc<ResultSlot>,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for JobFuture<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            _result: PhantomData,
        }
    }
}

impl<R> JobFuture<R> {
    pub(crate) fn new(slot: Arc<ResultSlot>) -> Self {
        Self {
            slot,
            _result: PhantomData,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }
}

impl<R: DeserializeOwned> JobFuture<R> {
    /// Block until the job resolves.
    pub fn wait(&self) -> Result<R, JobError> {
        decode_single(self.slot.wait())
    }

    /// Like [`JobFuture::wait`] but gives up after `timeout`. A timed
    /// out job stays registered and may resolve later.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R, JobError>> {
        self.slot.wait_timeout(timeout).map(decode_single)
    }
}

/// Handle to the result batch of one array slot, yielding the batch in
/// input order.
pub struct BatchFuture<R> {
    slot: Arc<ResultSlot>,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for BatchFuture<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            _result: PhantomData,
        }
    }
}

impl<R> BatchFuture<R> {
    pub(crate) fn new(slot: Arc<ResultSlot>) -> Self {
        Self {
            slot,
            _result: PhantomData,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }
}

impl<R: DeserializeOwned> BatchFuture<R> {
    /// Block until the slot resolves.
    pub fn wait(&self) -> Result<Vec<R>, JobError> {
        decode_batch(self.slot.wait())
    }

    /// Like [`BatchFuture::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Vec<R>, JobError>> {
        self.slot.wait_timeout(timeout).map(decode_batch)
    }
}

fn decode_single<R: DeserializeOwned>(resolution: Resolution) -> Result<R, JobError> {
    let values = resolution?;
    let first = values
        .first()
        .ok_or_else(|| JobError::Malformed("result batch is empty".to_string()))?;

    payload::decode(first).map_err(|error| JobError::Malformed(error.to_string()))
}

fn decode_batch<R: DeserializeOwned>(resolution: Resolution) -> Result<Vec<R>, JobError> {
    resolution?
        .iter()
        .map(|value| payload::decode(value).map_err(|error| JobError::Malformed(error.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn resolved_with(value: i64) -> Arc<ResultSlot> {
        let slot = ResultSlot::new();
        slot.resolve(Ok(vec![payload::encode(&value).unwrap()]));
        slot
    }

    #[test]
    fn first_resolution_wins() {
        let slot = resolved_with(1);
        slot.resolve(Ok(vec![payload::encode(&2i64).unwrap()]));

        let future: JobFuture<i64> = JobFuture::new(slot);
        assert_eq!(future.wait(), Ok(1));
    }

    #[test]
    fn every_waiter_observes_the_same_resolution() {
        let slot = ResultSlot::new();
        let future: JobFuture<i64> = JobFuture::new(Arc::clone(&slot));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let future = future.clone();
                thread::spawn(move || future.wait())
            })
            .collect();

        slot.resolve(Ok(vec![payload::encode(&99i64).unwrap()]));
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(99));
        }
    }

    #[test]
    fn wait_timeout_returns_none_while_pending() {
        let future: JobFuture<i64> = JobFuture::new(ResultSlot::new());

        assert!(!future.is_ready());
        assert_eq!(future.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn remote_failures_pass_through() {
        let slot = ResultSlot::new();
        slot.resolve(Err(JobError::Remote("division by zero".to_string())));

        let future: JobFuture<i64> = JobFuture::new(slot);
        assert_eq!(
            future.wait(),
            Err(JobError::Remote("division by zero".to_string()))
        );
    }

    #[test]
    fn batches_decode_in_input_order() {
        let slot = ResultSlot::new();
        slot.resolve(Ok(vec![
            payload::encode(&10i64).unwrap(),
            payload::encode(&20i64).unwrap(),
            payload::encode(&30i64).unwrap(),
        ]));

        let batch: BatchFuture<i64> = BatchFuture::new(slot);
        assert_eq!(batch.wait(), Ok(vec![10, 20, 30]));
    }

    #[test]
    fn type_mismatch_is_a_malformed_result() {
        let slot = ResultSlot::new();
        slot.resolve(Ok(vec![payload::encode(&"text").unwrap()]));

        let future: JobFuture<Vec<u64>> = JobFuture::new(slot);
        assert!(matches!(future.wait(), Err(JobError::Malformed(_))));
    }
}
