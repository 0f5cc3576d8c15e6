//! Lazy result streams over many submissions.
//!
//! [`map`] submits one job per item, [`map_array`] one array slot per
//! batch; both submit everything eagerly and hand back an iterator that
//! resolves futures lazily. Closing the stream (exhaustion or drop)
//! shuts the executor down.

use crate::{
    backends::Backend,
    executor::{ClusterExecutor, SubmitError},
    future::{BatchFuture, JobError, JobFuture},
};
use itertools::Itertools;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::VecDeque, thread, time::Duration};
use tracing::debug;

/// Order in which a stream yields results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldOrder {
    /// One result per input, in submission order. A yield blocks until
    /// that specific job resolves, even when a later one finished
    /// first.
    Submission,
    /// Results as their jobs finish.
    Completion,
}

/// Submit one job per item eagerly and return a lazy stream of results.
///
/// The executor is consumed. It is shut down, waiting for stragglers,
/// when the stream is exhausted or dropped; see
/// [`JobStream::detach_on_close`] for the non-blocking variant.
pub fn map<B, A, R, I>(
    executor: ClusterExecutor<B>,
    function: &str,
    items: I,
    order: YieldOrder,
) -> Result<JobStream<B, R>, SubmitError>
where
    B: Backend,
    A: Serialize,
    R: DeserializeOwned,
    I: IntoIterator<Item = A>,
{
    let mut futures = VecDeque::new();
    for item in items {
        match executor.submit(function, &item) {
            Ok(future) => futures.push_back(future),
            Err(submit_error) => {
                // jobs submitted so far still finish; wait for them so
                // their artifacts are reclaimed
                executor.shutdown(true);
                return Err(submit_error);
            }
        }
    }
    debug!(jobs = futures.len(), "map submitted");

    let poll_interval = executor.config().poll_interval();
    Ok(JobStream {
        executor: Some(executor),
        futures,
        order,
        poll_interval,
        wait_on_close: true,
    })
}

/// Like [`map`] but through a single array submission, one slot per
/// `batch_size` items. Results of every slot are flattened into the
/// overall sequence in input order; a failed slot yields exactly one
/// `Err`.
pub fn map_array<B, A, R, I>(
    executor: ClusterExecutor<B>,
    function: &str,
    items: I,
    batch_size: usize,
    order: YieldOrder,
) -> Result<JobArrayStream<B, R>, SubmitError>
where
    B: Backend,
    A: Serialize,
    R: DeserializeOwned,
    I: IntoIterator<Item = A>,
{
    let items = items.into_iter().collect_vec();
    let batches = match executor.submit_array(function, &items, batch_size) {
        Ok(batches) => batches,
        Err(submit_error) => {
            executor.shutdown(true);
            return Err(submit_error);
        }
    };
    debug!(jobs = items.len(), slots = batches.len(), "map_array submitted");

    let poll_interval = executor.config().poll_interval();
    Ok(JobArrayStream {
        executor: Some(executor),
        batches: batches.into(),
        buffered: VecDeque::new(),
        order,
        poll_interval,
        wait_on_close: true,
    })
}

/// Lazy stream over single-job futures. Finite, not restartable.
pub struct JobStream<B: Backend, R> {
    executor: Option<ClusterExecutor<B>>,
    futures: VecDeque<JobFuture<R>>,
    order: YieldOrder,
    poll_interval: Duration,
    wait_on_close: bool,
}

impl<B: Backend, R> JobStream<B, R> {
    /// Do not block on unfinished jobs when the stream closes; their
    /// futures are abandoned unresolved.
    pub fn detach_on_close(mut self) -> Self {
        self.wait_on_close = false;
        self
    }

    fn close(&mut self) {
        if let Some(executor) = self.executor.take() {
            executor.shutdown(self.wait_on_close);
        }
    }
}

impl<B: Backend, R: DeserializeOwned> Iterator for JobStream<B, R> {
    type Item = Result<R, JobError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match self.order {
            YieldOrder::Submission => self.futures.pop_front(),
            YieldOrder::Completion => self.take_finished(),
        };
        match next {
            Some(future) => Some(future.wait()),
            None => {
                self.close();
                None
            }
        }
    }
}

impl<B: Backend, R: DeserializeOwned> JobStream<B, R> {
    /// Next future in completion order: whichever is ready first, found
    /// by scanning at the watcher's own poll granularity.
    fn take_finished(&mut self) -> Option<JobFuture<R>> {
        while !self.futures.is_empty() {
            if let Some(index) = self.futures.iter().position(JobFuture::is_ready) {
                return self.futures.remove(index);
            }
            thread::sleep(self.poll_interval);
        }

        None
    }
}

impl<B: Backend, R> Drop for JobStream<B, R> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lazy stream over array-slot futures, flattening each resolved batch.
pub struct JobArrayStream<B: Backend, R> {
    executor: Option<ClusterExecutor<B>>,
    batches: VecDeque<BatchFuture<R>>,
    buffered: VecDeque<Result<R, JobError>>,
    order: YieldOrder,
    poll_interval: Duration,
    wait_on_close: bool,
}

impl<B: Backend, R> JobArrayStream<B, R> {
    /// Do not block on unfinished slots when the stream closes; their
    /// futures are abandoned unresolved.
    pub fn detach_on_close(mut self) -> Self {
        self.wait_on_close = false;
        self
    }

    fn close(&mut self) {
        if let Some(executor) = self.executor.take() {
            executor.shutdown(self.wait_on_close);
        }
    }
}

impl<B: Backend, R: DeserializeOwned> Iterator for JobArrayStream<B, R> {
    type Item = Result<R, JobError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(item);
            }

            let next = match self.order {
                YieldOrder::Submission => self.batches.pop_front(),
                YieldOrder::Completion => self.take_finished(),
            };
            let Some(batch) = next else {
                self.close();
                return None;
            };
            match batch.wait() {
                Ok(values) => self.buffered.extend(values.into_iter().map(Ok)),
                Err(job_error) => self.buffered.push_back(Err(job_error)),
            }
        }
    }
}

impl<B: Backend, R: DeserializeOwned> JobArrayStream<B, R> {
    fn take_finished(&mut self) -> Option<BatchFuture<R>> {
        while !self.batches.is_empty() {
            if let Some(index) = self.batches.iter().position(BatchFuture::is_ready) {
                return self.batches.remove(index);
            }
            thread::sleep(self.poll_interval);
        }

        None
    }
}

impl<B: Backend, R> Drop for JobArrayStream<B, R> {
    fn drop(&mut self) {
        self.close();
    }
}
