//! Pipeline properties: partition arithmetic, attempt accounting and
//! dispatch behavior under fail-fast.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use s3flux::pipeline::{split_ranges, PartPipeline};
use s3flux::S3Error;

#[test]
fn test_partition_count_and_ranges() {
    // ceil(S / P) parts, part k covering [(k-1)P, min(kP, S) - 1]
    for (object_size, part_size) in [
        (1u64, 5u64),
        (5, 5),
        (6, 5),
        (12 * 1024 * 1024, 5 * 1024 * 1024),
        (100, 7),
        (999, 1000),
    ] {
        let ranges = split_ranges(object_size, part_size);
        assert_eq!(ranges.len() as u64, object_size.div_ceil(part_size));

        for (index, (start, end)) in ranges.iter().enumerate() {
            let k = index as u64 + 1;
            assert_eq!(*start, (k - 1) * part_size);
            assert_eq!(*end, (k * part_size).min(object_size) - 1);
        }

        // Dense cover, no gaps or overlaps.
        let mut expected_start = 0;
        for (start, end) in &ranges {
            assert_eq!(*start, expected_start);
            expected_start = end + 1;
        }
        assert_eq!(expected_start, object_size);
    }
}

#[tokio::test]
async fn test_attempt_accounting_with_persistent_failures() {
    // N jobs of which K fail every attempt: the failing jobs issue at most
    // K * max_retry attempts, the rest exactly one each.
    const N: usize = 12;
    const MAX_RETRY: usize = 3;
    let failing: &[usize] = &[3, 7];

    let attempts = Arc::new(AtomicUsize::new(0));
    let job_attempts = Arc::clone(&attempts);
    let pipeline = PartPipeline::new(4, MAX_RETRY);
    let result = pipeline
        .run(N, move |index| {
            let attempts = Arc::clone(&job_attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if failing.contains(&index) {
                    Err(S3Error::Transport("persistent".to_string()))
                } else {
                    Ok(index)
                }
            }
        })
        .await;

    assert!(result.is_err());
    let total_attempts = attempts.load(Ordering::SeqCst);
    assert!(total_attempts <= failing.len() * MAX_RETRY + (N - failing.len()));
}

#[tokio::test]
async fn test_no_dispatch_after_fail_fast() {
    // With a serial pool and an early terminal failure, later indexes are
    // never dispatched.
    let dispatched = Arc::new(AtomicUsize::new(0));
    let job_dispatched = Arc::clone(&dispatched);
    let pipeline = PartPipeline::new(1, 1);
    let err = pipeline
        .run(50, move |index| {
            let dispatched = Arc::clone(&job_dispatched);
            async move {
                dispatched.fetch_add(1, Ordering::SeqCst);
                if index == 0 {
                    Err(S3Error::Protocol("terminal".to_string()))
                } else {
                    Ok(index)
                }
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, S3Error::Protocol(_)));
    // Job 0 plus at most one already-queued dispatch.
    assert!(dispatched.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_concurrency_stays_bounded() {
    const THREADS: usize = 3;
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let job_in_flight = Arc::clone(&in_flight);
    let job_peak = Arc::clone(&peak);
    let pipeline = PartPipeline::new(THREADS, 1);
    pipeline
        .run(20, move |index| {
            let in_flight = Arc::clone(&job_in_flight);
            let peak = Arc::clone(&job_peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(index)
            }
        })
        .await
        .unwrap();

    assert!(peak.load(Ordering::SeqCst) <= THREADS);
}
