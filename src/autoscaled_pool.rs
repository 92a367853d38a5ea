//! The AutoscaledPool (§4.F): a closed-loop concurrency controller driving
//! a single-threaded cooperative task loop. The absolute-time
//! `sleep_until` scheduling tick is the same idiom this codebase's worker
//! loop used for staggered request firing, generalized here from firing
//! HTTP requests to spawning crawler tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::CrawlerError;
use crate::system_status::{SystemStatus, SystemStatusOptions};

#[derive(Debug, Clone, Copy)]
pub struct AutoscaledPoolOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency_ratio: f64,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    pub maybe_run_interval_millis: u64,
    /// `None` = unbounded.
    pub max_tasks_per_minute: Option<u32>,
    pub logging_interval_millis: Option<u64>,
    pub abort_timeout_millis: u64,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        AutoscaledPoolOptions {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency_ratio: 0.90,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval_millis: 500,
            max_tasks_per_minute: None,
            logging_interval_millis: Some(60_000),
            abort_timeout_millis: 30_000,
        }
    }
}

/// A token-bucket rate limiter enforcing `maxTasksPerMinute` on task
/// *starts*. Refills continuously rather than in discrete per-minute
/// resets, so a task starting at second 59 doesn't get a full new
/// allotment one second later.
struct TokenBucket {
    capacity: f64,
    tokens: Mutex<(f64, Instant)>,
    refill_per_sec: f64,
}

impl TokenBucket {
    fn new(max_per_minute: u32) -> Self {
        let capacity = max_per_minute as f64;
        TokenBucket {
            capacity,
            tokens: Mutex::new((capacity, Instant::now())),
            refill_per_sec: capacity / 60.0,
        }
    }

    async fn try_take(&self) -> bool {
        let mut guard = self.tokens.lock().await;
        let (tokens, last) = *guard;
        let elapsed = last.elapsed().as_secs_f64();
        let refilled = (tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if refilled >= 1.0 {
            *guard = (refilled - 1.0, Instant::now());
            true
        } else {
            *guard = (refilled, Instant::now());
            false
        }
    }
}

type AsyncBoolFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;
type AsyncUnitFn = Box<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), CrawlerError>> + Send>> + Send + Sync,
>;

/// Hooks supplied by the crawler runtime (§4.F): `isFinishedFunction`,
/// `isTaskReadyFunction`, `runTaskFunction`.
pub struct PoolHooks {
    pub is_finished: AsyncBoolFn,
    pub is_task_ready: AsyncBoolFn,
    pub run_task: AsyncUnitFn,
}

/// The concurrency controller. `current_concurrency` and
/// `desired_concurrency` are atomics so the scaling tick and task
/// completion callbacks can update them without holding the whole pool's
/// lock across an await.
pub struct AutoscaledPool {
    options: AutoscaledPoolOptions,
    desired_concurrency: AtomicUsize,
    current_concurrency: Arc<AtomicUsize>,
    finished_latch: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    rate_limiter: Option<Arc<TokenBucket>>,
}

impl AutoscaledPool {
    pub fn new(options: AutoscaledPoolOptions) -> Self {
        let rate_limiter = options.max_tasks_per_minute.map(|n| Arc::new(TokenBucket::new(n)));
        AutoscaledPool {
            desired_concurrency: AtomicUsize::new(options.min_concurrency),
            current_concurrency: Arc::new(AtomicUsize::new(0)),
            finished_latch: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
            rate_limiter,
            options,
        }
    }

    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::SeqCst)
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired_concurrency.load(Ordering::SeqCst)
    }

    /// Prevents future task starts; `run()` resolves once in-flight tasks
    /// drain, up to `abort_timeout_millis`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// A shared handle onto the abort flag this pool checks on every tick,
    /// so `isFinishedFunction`/`isTaskReadyFunction` hooks built outside the
    /// pool can observe abort without a back-reference to the pool itself.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.aborted.clone()
    }

    /// Drives the loop until `isFinishedFunction()` returns true, the
    /// abort timeout elapses after `abort()`, or a spawned task panics
    /// (`PoolFatal`, §7).
    pub async fn run(
        &self,
        hooks: PoolHooks,
        system_status: &SystemStatus<'_>,
    ) -> Result<(), CrawlerError> {
        let mut join_set: JoinSet<Result<(), CrawlerError>> = JoinSet::new();
        let mut interval = time::interval(Duration::from_millis(self.options.maybe_run_interval_millis));
        let mut last_log = Instant::now();
        let abort_deadline_base = Duration::from_millis(self.options.abort_timeout_millis);
        let mut aborting_since: Option<Instant> = None;

        loop {
            interval.tick().await;

            if (hooks.is_finished)().await {
                self.finished_latch.store(true, Ordering::SeqCst);
            }

            if self.aborted.load(Ordering::SeqCst) {
                if aborting_since.is_none() {
                    aborting_since = Some(Instant::now());
                }
            }

            let finished = self.finished_latch.load(Ordering::SeqCst);
            let aborted = self.aborted.load(Ordering::SeqCst);

            if finished && join_set.is_empty() {
                break;
            }
            if aborted {
                if join_set.is_empty() {
                    break;
                }
                if aborting_since.unwrap().elapsed() >= abort_deadline_base {
                    warn!("abort timeout elapsed with tasks still in flight; dropping them");
                    join_set.abort_all();
                    break;
                }
            }

            // Step 2: spawn tasks up to desired_concurrency while ready
            // and (if configured) the rate limiter permits.
            if !finished && !aborted {
                while self.current_concurrency.load(Ordering::SeqCst)
                    < self.desired_concurrency.load(Ordering::SeqCst)
                {
                    if !(hooks.is_task_ready)().await {
                        break;
                    }
                    if let Some(bucket) = &self.rate_limiter {
                        if !bucket.try_take().await {
                            break;
                        }
                    }
                    self.current_concurrency.fetch_add(1, Ordering::SeqCst);
                    let current_concurrency = self.current_concurrency.clone();
                    let run_task_result = (hooks.run_task)();
                    join_set.spawn(async move {
                        let result = run_task_result.await;
                        current_concurrency.fetch_sub(1, Ordering::SeqCst);
                        result
                    });
                }
            }

            // Drain completed tasks without blocking the tick; propagate
            // the first PoolFatal.
            while let Some(joined) = join_set.try_join_next() {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(join_err) => {
                        return Err(CrawlerError::PoolFatal(join_err.to_string()));
                    }
                }
            }

            // Step 3: autoscale off the *historical* window only (§5).
            let historical = system_status.get_historical_status().await;
            let desired = self.desired_concurrency.load(Ordering::SeqCst);
            let current = self.current_concurrency.load(Ordering::SeqCst);
            let busy_threshold = (desired as f64 * self.options.desired_concurrency_ratio).floor() as usize;

            if historical.is_system_idle && current >= busy_threshold {
                let step = ((desired as f64 * self.options.scale_up_step_ratio).ceil() as usize).max(1);
                let new_desired = (desired + step).min(self.options.max_concurrency);
                if new_desired != desired {
                    debug!(from = desired, to = new_desired, "scaling up");
                }
                self.desired_concurrency.store(new_desired, Ordering::SeqCst);
            } else if !historical.is_system_idle {
                let step = ((desired as f64 * self.options.scale_down_step_ratio).ceil() as usize).max(1);
                let new_desired = desired.saturating_sub(step).max(self.options.min_concurrency);
                if new_desired != desired {
                    debug!(from = desired, to = new_desired, "scaling down");
                }
                self.desired_concurrency.store(new_desired, Ordering::SeqCst);
            }

            if let Some(log_interval) = self.options.logging_interval_millis {
                if last_log.elapsed() >= Duration::from_millis(log_interval) {
                    info!(
                        current_concurrency = current,
                        desired_concurrency = self.desired_concurrency.load(Ordering::SeqCst),
                        "autoscaled pool status"
                    );
                    last_log = Instant::now();
                }
            }
        }

        // Drain any remaining joined results after the loop's final break.
        while let Some(joined) = join_set.try_join_next() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(join_err) => return Err(CrawlerError::PoolFatal(join_err.to_string())),
            }
        }

        Ok(())
    }
}
