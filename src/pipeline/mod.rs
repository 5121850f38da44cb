//! Bounded-concurrency part pipeline
//!
//! Executes a finite sequence of indexed jobs under a semaphore-bounded
//! worker pool with per-job retry, fail-fast on the first terminal error,
//! index-ordered result collection, an optional non-blocking progress sink
//! and cooperative external cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::warn;

use crate::s3::error::{Result, S3Error};

/// Bounded-concurrency executor for partitioned work
pub struct PartPipeline {
    thread_num: usize,
    max_retry_num: usize,
    progress: Option<mpsc::Sender<usize>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl PartPipeline {
    pub fn new(thread_num: usize, max_retry_num: usize) -> Self {
        Self {
            thread_num: thread_num.max(1),
            max_retry_num: max_retry_num.max(1),
            progress: None,
            cancel: None,
        }
    }

    /// Attach a progress sink. On each successful job completion the job
    /// total is pushed with a non-blocking send; when no consumer keeps up
    /// the notification is dropped.
    pub fn with_progress(mut self, progress: Option<mpsc::Sender<usize>>) -> Self {
        self.progress = progress;
        self
    }

    /// Attach an external cancel signal. Once it observes `true` no further
    /// jobs are dispatched and the pipeline returns [`S3Error::Cancelled`]
    /// after in-flight jobs drain.
    pub fn with_cancel(mut self, cancel: Option<watch::Receiver<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `total` jobs, at most `thread_num` in flight at once.
    ///
    /// `job(index)` is invoked up to `max_retry_num` times for retryable
    /// errors. The first terminal failure is published once, stops further
    /// dispatch, and becomes the return value after every in-flight job has
    /// drained. On success the results are returned in index order.
    pub async fn run<T, F, Fut>(&self, total: usize, job: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if total == 0 {
            return Ok(Vec::new());
        }

        let parallelism = self.thread_num.min(total);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let fail_fast = Arc::new(AtomicBool::new(false));
        let first_error: Arc<Mutex<Option<S3Error>>> = Arc::new(Mutex::new(None));
        let job = Arc::new(job);
        let max_retry_num = self.max_retry_num;

        let mut workers: JoinSet<Option<(usize, T)>> = JoinSet::new();

        for index in 0..total {
            if fail_fast.load(Ordering::Acquire) {
                break;
            }
            if let Some(rx) = &self.cancel {
                if *rx.borrow() {
                    publish_once(&first_error, &fail_fast, S3Error::Cancelled);
                    break;
                }
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("pipeline semaphore never closed");
            // A worker may have failed while this dispatch waited for a slot.
            if fail_fast.load(Ordering::Acquire) {
                break;
            }

            let job = Arc::clone(&job);
            let fail_fast = Arc::clone(&fail_fast);
            let first_error = Arc::clone(&first_error);
            let progress = self.progress.clone();

            workers.spawn(async move {
                let _permit = permit;
                let mut outcome = None;
                for attempt in 1..=max_retry_num {
                    match (job.as_ref())(index).await {
                        Ok(value) => {
                            outcome = Some(Ok(value));
                            break;
                        }
                        Err(err) if err.is_retryable() && attempt < max_retry_num => {
                            warn!(index, attempt, error = %err, "part attempt failed, retrying");
                        }
                        Err(err) => {
                            outcome = Some(Err(err));
                            break;
                        }
                    }
                }
                match outcome.expect("retry loop always produces an outcome") {
                    Ok(value) => {
                        if let Some(tx) = &progress {
                            let _ = tx.try_send(total);
                        }
                        Some((index, value))
                    }
                    Err(err) => {
                        publish_once(&first_error, &fail_fast, err);
                        None
                    }
                }
            });
        }

        // Barrier: every dispatched job drains before results are read.
        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some((index, value))) => slots[index] = Some(value),
                Ok(None) => {}
                Err(err) => {
                    publish_once(
                        &first_error,
                        &fail_fast,
                        S3Error::Transport(format!("pipeline worker panicked: {err}")),
                    );
                }
            }
        }

        if let Some(err) = first_error
            .lock()
            .expect("first-error mutex never poisoned")
            .take()
        {
            return Err(err);
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| S3Error::Protocol("missing part result".to_string())))
            .collect()
    }
}

fn publish_once(slot: &Mutex<Option<S3Error>>, fail_fast: &AtomicBool, err: S3Error) {
    let mut guard = slot.lock().expect("first-error mutex never poisoned");
    if guard.is_none() {
        *guard = Some(err);
    }
    fail_fast.store(true, Ordering::Release);
}

/// Split an object into inclusive byte ranges of `part_size`, the last
/// range clamped to the object end. Part `k` (1-indexed) covers
/// `[(k-1)*part_size, min(k*part_size, object_size) - 1]`.
pub fn split_ranges(object_size: u64, part_size: u64) -> Vec<(u64, u64)> {
    if object_size == 0 || part_size == 0 {
        return Vec::new();
    }
    let total = object_size.div_ceil(part_size);
    (0..total)
        .map(|k| {
            let start = k * part_size;
            let end = ((k + 1) * part_size).min(object_size) - 1;
            (start, end)
        })
        .collect()
}

/// Atomic outcome counters shared by batch workers
#[derive(Debug, Default)]
pub struct BatchCounters {
    finish: AtomicU64,
    skip: AtomicU64,
    size: AtomicU64,
}

impl BatchCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_finish(&self) {
        self.finish.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_finish_n(&self, n: u64) {
        self.finish.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skip(&self) {
        self.skip.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_size(&self, n: u64) {
        self.size.fetch_add(n, Ordering::Relaxed);
    }

    pub fn finish(&self) -> u64 {
        self.finish.load(Ordering::Relaxed)
    }

    pub fn skip(&self) -> u64 {
        self.skip.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ranges_exact_multiple() {
        let ranges = split_ranges(10 * 1024, 5 * 1024);
        assert_eq!(ranges, vec![(0, 5 * 1024 - 1), (5 * 1024, 10 * 1024 - 1)]);
    }

    #[test]
    fn test_split_ranges_remainder() {
        let mib = 1024 * 1024;
        let ranges = split_ranges(12 * mib, 5 * mib);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], (0, 5 * mib - 1));
        assert_eq!(ranges[1], (5 * mib, 10 * mib - 1));
        assert_eq!(ranges[2], (10 * mib, 12 * mib - 1));
    }

    #[test]
    fn test_split_ranges_single_small_object() {
        assert_eq!(split_ranges(2, 5), vec![(0, 1)]);
        assert!(split_ranges(0, 5).is_empty());
    }

    #[tokio::test]
    async fn test_results_are_index_ordered() {
        let pipeline = PartPipeline::new(4, 1);
        let results = pipeline
            .run(8, |index| async move {
                // Later parts finish first.
                tokio::time::sleep(std::time::Duration::from_millis(
                    (8 - index as u64) * 5,
                ))
                .await;
                Ok(index * 10)
            })
            .await
            .unwrap();
        assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_dispatch_stops() {
        use std::sync::atomic::AtomicUsize;

        let dispatched = Arc::new(AtomicUsize::new(0));
        let dispatched_in_job = Arc::clone(&dispatched);
        let pipeline = PartPipeline::new(1, 1);
        let err = pipeline
            .run(100, move |index| {
                let dispatched = Arc::clone(&dispatched_in_job);
                async move {
                    dispatched.fetch_add(1, Ordering::SeqCst);
                    if index == 2 {
                        Err(S3Error::Input("boom".to_string()))
                    } else {
                        Ok(index)
                    }
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Input(_)));
        // Serial pool: jobs 0..=2 dispatched, at most one more slips past the
        // flag before the coordinator observes it.
        assert!(dispatched.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_retry_bound_respected() {
        use std::sync::atomic::AtomicUsize;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_job = Arc::clone(&attempts);
        let pipeline = PartPipeline::new(2, 3);
        let err = pipeline
            .run(1, move |_| {
                let attempts = Arc::clone(&attempts_in_job);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(S3Error::Transport("flaky".to_string()))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Transport(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        use std::sync::atomic::AtomicUsize;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_job = Arc::clone(&attempts);
        let pipeline = PartPipeline::new(2, 3);
        let results = pipeline
            .run(1, move |index| {
                let attempts = Arc::clone(&attempts_in_job);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(S3Error::Status {
                            status: 500,
                            code: "InternalError".to_string(),
                            message: String::new(),
                            request_id: String::new(),
                        })
                    } else {
                        Ok(index)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(results, vec![0]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        use std::sync::atomic::AtomicUsize;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_job = Arc::clone(&attempts);
        let pipeline = PartPipeline::new(1, 3);
        let err = pipeline
            .run(1, move |_| {
                let attempts = Arc::clone(&attempts_in_job);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(S3Error::Cancelled)
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_cancel_stops_dispatch() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let pipeline = PartPipeline::new(2, 1).with_cancel(Some(rx));
        let err = pipeline
            .run(10, |index| async move { Ok(index) })
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Cancelled));
    }

    #[tokio::test]
    async fn test_progress_pushes_total_and_never_blocks() {
        let (tx, mut rx) = mpsc::channel(2);
        let pipeline = PartPipeline::new(2, 1).with_progress(Some(tx));
        // More completions than channel capacity: overflow is dropped.
        pipeline
            .run(8, |index| async move { Ok(index) })
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(8));
    }

    #[tokio::test]
    async fn test_batch_counters_accumulate() {
        let counters = Arc::new(BatchCounters::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let counters = Arc::clone(&counters);
            handles.push(tokio::spawn(async move {
                counters.add_finish();
                counters.add_size(100);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        counters.add_skip();
        assert_eq!(counters.finish(), 10);
        assert_eq!(counters.size(), 1000);
        assert_eq!(counters.skip(), 1);
    }
}
