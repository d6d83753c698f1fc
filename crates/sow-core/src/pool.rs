//! Bounded per-section worker pool
//!
//! Sections of one stage run concurrently up to a permit limit. The pool is
//! a barrier: it returns once every section has finished, with results
//! ordered by section name regardless of completion order.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Section jobs dispatched
    pub dispatched: usize,
    /// Highest number of jobs observed running together
    pub peak_in_flight: usize,
}

/// Section worker pool
#[derive(Debug)]
pub struct SectionPool {
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    dispatched: AtomicUsize,
    peak: AtomicUsize,
}

impl SectionPool {
    /// Pool admitting `max_concurrent` sections at once (at least one)
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: AtomicUsize::new(0),
            dispatched: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            peak_in_flight: self.peak.load(Ordering::Relaxed),
        }
    }

    /// Run one job per `(section, input)` and join them all
    pub async fn run<I, T, F, Fut>(&self, jobs: Vec<(String, I)>, job: F) -> Vec<(String, T)>
    where
        F: Fn(String, I) -> Fut,
        Fut: Future<Output = T>,
    {
        let futures = jobs.into_iter().map(|(section, input)| {
            let permits = Arc::clone(&self.permits);
            let work = job(section.clone(), input);
            async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                self.peak.fetch_max(now, Ordering::AcqRel);
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                let out = work.await;
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                (section, out)
            }
        });
        let mut results = join_all(futures).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

impl Default for SectionPool {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn results_are_sorted_and_concurrency_is_bounded() {
        let pool = SectionPool::new(2);
        let jobs: Vec<(String, u64)> = vec![
            ("Scope".into(), 30),
            ("Assumptions".into(), 10),
            ("Pricing".into(), 20),
            ("Liability".into(), 5),
        ];
        let out = pool
            .run(jobs, |name, delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                name.len()
            })
            .await;
        let names: Vec<_> = out.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Assumptions", "Liability", "Pricing", "Scope"]);
        let stats = pool.stats();
        assert_eq!(stats.dispatched, 4);
        assert_eq!(stats.peak_in_flight, 2);
    }

    #[tokio::test]
    async fn zero_is_clamped_to_one() {
        let pool = SectionPool::new(0);
        assert_eq!(pool.max_concurrent(), 1);
        let out = pool.run(vec![("A".to_string(), ())], |_, ()| async { 1 }).await;
        assert_eq!(out, vec![("A".to_string(), 1)]);
    }
}
