//! Bounded-concurrency batch runner with per-batch retry.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use campaign_core::config::BatchConfig;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Total attempts per batch, including the first.
    pub max_retries: u32,
    /// Multiplied by the attempt number before the next attempt.
    pub retry_delay: Duration,
    /// Pause a worker takes after a batch when more batches remain.
    pub delay_between_batches: Duration,
}

impl From<&BatchConfig> for BatchOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            concurrency: config.max_concurrency,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            delay_between_batches: Duration::from_millis(config.delay_between_batches_ms),
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}

/// A batch that exhausted its attempts.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub items: usize,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug)]
pub struct BatchOutcome<R> {
    /// Results of successful batches, in batch order.
    pub results: Vec<R>,
    pub failures: Vec<BatchFailure>,
    pub batches: usize,
    pub total_items: usize,
    pub processed_items: usize,
    pub failed_items: usize,
    pub elapsed: Duration,
}

impl<R> BatchOutcome<R> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

type BatchResult<R> = Result<Vec<R>, BatchFailure>;

/// Splits `items` into batches and runs `processor` over them with at most
/// `options.concurrency` batches in flight. Workers claim batch indices from
/// a shared atomic cursor.
pub async fn process_batches<T, R, F, Fut>(
    items: Vec<T>,
    processor: F,
    options: &BatchOptions,
) -> BatchOutcome<R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
{
    let started = Instant::now();
    let total_items = items.len();
    let batch_size = options.batch_size.max(1);

    let mut batches: Vec<Vec<T>> = Vec::with_capacity(total_items.div_ceil(batch_size));
    let mut iter = items.into_iter();
    loop {
        let chunk: Vec<T> = iter.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        batches.push(chunk);
    }

    let batch_count = batches.len();
    if batch_count == 0 {
        return BatchOutcome {
            results: Vec::new(),
            failures: Vec::new(),
            batches: 0,
            total_items: 0,
            processed_items: 0,
            failed_items: 0,
            elapsed: started.elapsed(),
        };
    }

    let workers = options.concurrency.max(1).min(batch_count);
    info!(total_items, batch_count, batch_size, workers, "Starting batch processing");

    let batches = Arc::new(batches);
    let cursor = Arc::new(AtomicUsize::new(0));
    let processor = Arc::new(processor);

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let batches = batches.clone();
        let cursor = cursor.clone();
        let processor = processor.clone();
        let options = options.clone();

        handles.push(tokio::spawn(async move {
            let mut done: Vec<(usize, BatchResult<R>)> = Vec::new();
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(batch) = batches.get(index) else {
                    break;
                };

                debug!(worker_id, batch_index = index, items = batch.len(), "Processing batch");
                let outcome = run_with_retry(processor.as_ref(), batch, index, &options).await;
                done.push((index, outcome));

                if !options.delay_between_batches.is_zero()
                    && cursor.load(Ordering::SeqCst) < batches.len()
                {
                    tokio::time::sleep(options.delay_between_batches).await;
                }
            }
            done
        }));
    }

    let mut slots: Vec<Option<BatchResult<R>>> = (0..batch_count).map(|_| None).collect();
    for handle in handles {
        match handle.await {
            Ok(done) => {
                for (index, outcome) in done {
                    slots[index] = Some(outcome);
                }
            }
            Err(e) => error!(error = %e, "Batch worker terminated abnormally"),
        }
    }

    let mut results = Vec::new();
    let mut failures = Vec::new();
    let mut processed_items = 0;
    let mut failed_items = 0;

    for (index, slot) in slots.into_iter().enumerate() {
        let items = batches[index].len();
        match slot {
            Some(Ok(mut batch_results)) => {
                processed_items += items;
                results.append(&mut batch_results);
            }
            Some(Err(failure)) => {
                failed_items += items;
                failures.push(failure);
            }
            None => {
                failed_items += items;
                failures.push(BatchFailure {
                    batch_index: index,
                    items,
                    attempts: 0,
                    error: "batch worker terminated before completing the batch".into(),
                });
            }
        }
    }

    let elapsed = started.elapsed();
    info!(
        processed_items,
        failed_items,
        failed_batches = failures.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Batch processing finished"
    );

    BatchOutcome {
        results,
        failures,
        batches: batch_count,
        total_items,
        processed_items,
        failed_items,
        elapsed,
    }
}

async fn run_with_retry<T, R, F, Fut>(
    processor: &F,
    batch: &[T],
    index: usize,
    options: &BatchOptions,
) -> BatchResult<R>
where
    T: Clone,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<Vec<R>>>,
{
    let attempts = options.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match processor(batch.to_vec()).await {
            Ok(results) => {
                metrics::counter!("batch.batches_processed").increment(1);
                return Ok(results);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    let delay = options.retry_delay * attempt;
                    warn!(
                        batch_index = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "Batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    metrics::counter!("batch.batches_failed").increment(1);
    error!(batch_index = index, attempts, error = %last_error, "Batch failed permanently");
    Err(BatchFailure {
        batch_index: index,
        items: batch.len(),
        attempts,
        error: last_error,
    })
}

/// Batch runner bound to a fixed set of options.
#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(BatchOptions::from(config))
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub async fn process_batches<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
    ) -> BatchOutcome<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
    {
        process_batches(items, processor, &self.options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn fast_options(batch_size: usize, concurrency: usize) -> BatchOptions {
        BatchOptions {
            batch_size,
            concurrency,
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
            delay_between_batches: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_results_keep_batch_order() {
        let items: Vec<u32> = (0..25).collect();
        let outcome = process_batches(
            items,
            |batch: Vec<u32>| async move {
                // Later batches finish first
                let wait = 20u64.saturating_sub(batch[0] as u64);
                tokio::time::sleep(Duration::from_millis(wait)).await;
                Ok::<_, anyhow::Error>(batch.into_iter().map(|n| n * 2).collect::<Vec<u32>>())
            },
            &fast_options(10, 3),
        )
        .await;

        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.total_items, 25);
        assert_eq!(outcome.processed_items, 25);
        assert!(outcome.is_complete());
        assert_eq!(outcome.results, (0..25).map(|n| n * 2).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (f, p) = (in_flight.clone(), peak.clone());
        let outcome = process_batches(
            (0..40).collect::<Vec<u32>>(),
            move |batch: Vec<u32>| {
                let (f, p) = (f.clone(), p.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &fast_options(4, 2),
        )
        .await;

        assert_eq!(outcome.processed_items, 40);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(Mutex::new(HashMap::<u32, u32>::new()));
        let c = calls.clone();

        let outcome = process_batches(
            (0..6).collect::<Vec<u32>>(),
            move |batch: Vec<u32>| {
                let c = c.clone();
                async move {
                    let attempt = {
                        let mut calls = c.lock().unwrap();
                        let n = calls.entry(batch[0]).or_insert(0);
                        *n += 1;
                        *n
                    };
                    // Second batch fails twice before succeeding
                    if batch[0] == 3 && attempt < 3 {
                        anyhow::bail!("transient failure");
                    }
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &fast_options(3, 1),
        )
        .await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.results.len(), 6);
        assert_eq!(calls.lock().unwrap()[&3], 3);
        assert_eq!(calls.lock().unwrap()[&0], 1);
    }

    #[tokio::test]
    async fn test_exhausted_batch_is_reported_and_others_continue() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let outcome = process_batches(
            (0..9).collect::<Vec<u32>>(),
            move |batch: Vec<u32>| {
                let a = a.clone();
                async move {
                    if batch.contains(&4) {
                        a.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("bad row in batch");
                    }
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &fast_options(3, 2),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.processed_items, 6);
        assert_eq!(outcome.failed_items, 3);
        assert_eq!(
            outcome.failures,
            vec![BatchFailure {
                batch_index: 1,
                items: 3,
                attempts: 3,
                error: "bad row in batch".into(),
            }]
        );
        assert_eq!(outcome.results, vec![0, 1, 2, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_empty_input_and_zero_sizes() {
        let outcome = process_batches(
            Vec::<u32>::new(),
            |batch: Vec<u32>| async move { Ok::<_, anyhow::Error>(batch) },
            &fast_options(0, 0),
        )
        .await;
        assert_eq!(outcome.batches, 0);
        assert!(outcome.results.is_empty());

        let processor = BatchProcessor::new(fast_options(0, 0));
        let outcome = processor
            .process_batches(vec![1u32, 2, 3], |batch: Vec<u32>| async move {
                Ok::<_, anyhow::Error>(batch)
            })
            .await;
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.results, vec![1, 2, 3]);
    }

    #[test]
    fn test_options_from_config() {
        let options = BatchOptions::from(&BatchConfig::default());
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.concurrency, 3);
        assert_eq!(options.retry_delay, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_grows_linearly() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let options = BatchOptions {
            batch_size: 10,
            concurrency: 1,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            delay_between_batches: Duration::ZERO,
        };

        let started = tokio::time::Instant::now();
        let outcome = process_batches(
            (0..5).collect::<Vec<u32>>(),
            move |batch: Vec<u32>| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient failure");
                    }
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &options,
        )
        .await;
        let elapsed = started.elapsed();

        // 100ms after the first failure, 200ms after the second
        assert!(outcome.is_complete());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(350), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pauses_between_batches() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let s = starts.clone();
        let options = BatchOptions {
            batch_size: 2,
            concurrency: 1,
            max_retries: 1,
            retry_delay: Duration::ZERO,
            delay_between_batches: Duration::from_millis(50),
        };

        let started = tokio::time::Instant::now();
        let outcome = process_batches(
            (0..6).collect::<Vec<u32>>(),
            move |batch: Vec<u32>| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(tokio::time::Instant::now());
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &options,
        )
        .await;
        let elapsed = started.elapsed();

        assert_eq!(outcome.batches, 3);
        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
        // No pause after the last batch
        assert!(elapsed >= Duration::from_millis(100), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "elapsed {:?}", elapsed);
    }
}
