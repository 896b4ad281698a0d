//! Bounded fan-out/fan-in over a list of independent items.
//!
//! Used for parallel capture (degree 1 or N devices) and for hashing payload
//! files. The first error in completion order wins; items not yet started when
//! it occurs are skipped.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::unbounded;
use log::debug;

/// Outcome of a fan-out, keyed by input index.
#[derive(Debug)]
pub struct FanOut<T, E> {
    /// Successful results, sorted by input index.
    pub completed: Vec<(usize, T)>,
    /// The error that completed first.
    pub first_error: Option<(usize, E)>,
    /// Errors from items that were already running when the first error hit.
    pub other_errors: Vec<(usize, E)>,
    /// Items never started because an error had already occurred.
    pub skipped: Vec<usize>,
}

impl<T, E> FanOut<T, E> {
    pub fn is_ok(&self) -> bool {
        self.first_error.is_none()
    }

    /// Results in input order, or the winning error.
    pub fn into_result(self) -> Result<Vec<T>, E> {
        match self.first_error {
            Some((_, err)) => Err(err),
            None => Ok(self.completed.into_iter().map(|(_, t)| t).collect()),
        }
    }
}

/// Runs `task` over `items` with at most `degree` items in flight.
///
/// `degree <= 1` runs sequentially on the calling thread. All worker threads
/// are joined before this returns.
pub fn fan_out<I, T, E, F>(items: Vec<I>, degree: usize, task: F) -> FanOut<T, E>
where
    I: Send,
    T: Send,
    E: Send,
    F: Fn(usize, I) -> Result<T, E> + Sync,
{
    let total = items.len();
    let mut outcome = FanOut {
        completed: Vec::with_capacity(total),
        first_error: None,
        other_errors: Vec::new(),
        skipped: Vec::new(),
    };

    if degree <= 1 || total <= 1 {
        for (idx, item) in items.into_iter().enumerate() {
            if outcome.first_error.is_some() {
                outcome.skipped.push(idx);
                continue;
            }
            match task(idx, item) {
                Ok(value) => outcome.completed.push((idx, value)),
                Err(err) => outcome.first_error = Some((idx, err)),
            }
        }
        return outcome;
    }

    let workers = degree.min(total);
    let (job_tx, job_rx) = unbounded::<(usize, I)>();
    let (result_tx, result_rx) = unbounded::<(usize, Option<Result<T, E>>)>();
    for job in items.into_iter().enumerate() {
        // Receiver is alive until the scope below ends
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let failed = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for worker_id in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let failed = &failed;
            let task = &task;
            scope.spawn(move || {
                for (idx, item) in job_rx.iter() {
                    if failed.load(Ordering::SeqCst) {
                        let _ = result_tx.send((idx, None));
                        continue;
                    }
                    let result = task(idx, item);
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    let _ = result_tx.send((idx, Some(result)));
                }
                debug!("Fan-out worker {} finished", worker_id);
            });
        }
        drop(result_tx);

        for (idx, result) in result_rx.iter() {
            match result {
                Some(Ok(value)) => outcome.completed.push((idx, value)),
                Some(Err(err)) if outcome.first_error.is_none() => {
                    outcome.first_error = Some((idx, err))
                }
                Some(Err(err)) => outcome.other_errors.push((idx, err)),
                None => outcome.skipped.push(idx),
            }
        }
    });

    outcome.completed.sort_by_key(|(idx, _)| *idx);
    outcome.skipped.sort_unstable();
    outcome
}

/// Pool size for `jobs` CPU-bound items.
pub fn cpu_degree(jobs: usize) -> usize {
    jobs.min(num_cpus::get()).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[test]
    fn test_results_keep_input_order() {
        let outcome = fan_out((0..20).collect(), 4, |_, n: u32| -> Result<u32, String> {
            std::thread::sleep(Duration::from_millis(u64::from(20 - n)));
            Ok(n * 2)
        });
        assert_eq!(
            outcome.into_result().unwrap(),
            (0..20).map(|n| n * 2).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_parallel_degree_overlaps_work() {
        let start = Instant::now();
        let outcome = fan_out(vec![(); 2], 2, |_, _| -> Result<(), ()> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        assert!(outcome.is_ok());
        assert!(start.elapsed() < Duration::from_millis(190));
    }

    #[test]
    fn test_sequential_stops_at_first_error() {
        let calls = AtomicUsize::new(0);
        let outcome = fan_out(vec![1, 2, 3], 1, |_, n: i32| {
            calls.fetch_add(1, Ordering::SeqCst);
            if n == 2 {
                Err(format!("item {} failed", n))
            } else {
                Ok(n)
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.completed, vec![(0, 1)]);
        assert_eq!(outcome.skipped, vec![2]);
        assert_eq!(outcome.first_error.unwrap().1, "item 2 failed");
    }

    #[test]
    fn test_first_error_by_completion_wins() {
        let outcome = fan_out(vec![150u64, 10], 2, |_, ms| -> Result<(), u64> {
            std::thread::sleep(Duration::from_millis(ms));
            Err(ms)
        });
        assert_eq!(outcome.first_error.map(|(_, e)| e), Some(10));
        assert_eq!(outcome.other_errors.len(), 1);
    }

    #[test]
    fn test_cpu_degree_bounds() {
        assert_eq!(cpu_degree(0), 1);
        assert_eq!(cpu_degree(1), 1);
        assert!(cpu_degree(10_000) <= num_cpus::get());
    }
}
