use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::error::{BusError, Result};

/// Count of accepted one-shot jobs that have not finished yet.
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(Arc::clone(self))
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no job is in flight or `timeout` elapses.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |c| *c > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

struct ScheduleState {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Handle to a periodic job created by [`TaskManager::schedule`].
#[derive(Clone)]
pub struct ScheduleHandle {
    description: Arc<str>,
    state: Arc<ScheduleState>,
    abort: AbortHandle,
}

impl ScheduleHandle {
    /// Stop future runs. A run that is already executing completes.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// `true` once no further runs will happen, whether because of a
    /// failure or a cancellation.
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire) || self.abort.is_finished()
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for ScheduleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("description", &self.description)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Bounded pool executing fire-and-forget and periodic jobs.
///
/// Jobs are synchronous closures returning `anyhow::Result<()>`. They run on
/// at most `worker_threads` pool threads at a time; further jobs queue. A
/// failing or panicking job is logged and contained: it never reaches the
/// submitter and never takes down a pool thread.
///
/// Periodic jobs are fail-stop. The first failed run ends the schedule for
/// good; runs of one schedule never overlap, and a slow run pushes the next
/// tick back instead of skipping it.
///
/// [`stop`](Self::stop) and dropping the manager must happen outside the
/// pool's own jobs.
pub struct TaskManager {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    accepting: AtomicBool,
    in_flight: Arc<InFlight>,
    schedules: Mutex<Vec<ScheduleHandle>>,
    shutdown_timeout: Duration,
}

impl TaskManager {
    /// Start a pool sized from `config`.
    pub fn new(config: &BusConfig) -> Result<Self> {
        let workers = config.worker_threads.max(1);
        // One async worker drives timers; jobs run on the bounded blocking pool.
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();

        info!(workers, "task manager started");

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(InFlight::new()),
            schedules: Mutex::new(Vec::new()),
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Submit a one-shot job. Returns once the job is queued.
    pub fn execute<F>(&self, description: impl Into<String>, job: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let guard = self.in_flight.enter();
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        let description = description.into();
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            run_once(&description, job);
        });
        Ok(())
    }

    /// Run `job` every `interval`, starting one interval from now.
    pub fn schedule<F>(
        &self,
        interval: Duration,
        description: impl Into<String>,
        job: F,
    ) -> Result<ScheduleHandle>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        let description: Arc<str> = description.into().into();
        let period = interval.max(Duration::from_millis(1));
        let state = Arc::new(ScheduleState {
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let loop_state = Arc::clone(&state);
        let loop_description = Arc::clone(&description);
        let task = self.handle.spawn(async move {
            run_schedule(period, &loop_description, job, &loop_state).await;
            loop_state.finished.store(true, Ordering::Release);
        });

        let handle = ScheduleHandle {
            description,
            state,
            abort: task.abort_handle(),
        };
        debug!(task = %handle.description, period_ms = period.as_millis() as u64, "task scheduled");
        let mut schedules = self.schedules.lock().expect("schedule list poisoned");
        schedules.retain(|s| !s.is_finished());
        schedules.push(handle.clone());
        Ok(handle)
    }

    /// Shut the pool down.
    ///
    /// New work is rejected from this point, schedules are cancelled, and
    /// jobs already accepted get up to the configured shutdown timeout to
    /// finish. Calling `stop` twice is harmless.
    pub fn stop(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let deadline = Instant::now() + self.shutdown_timeout;

        let schedules = std::mem::take(&mut *self.schedules.lock().expect("schedule list poisoned"));
        for schedule in &schedules {
            schedule.cancel();
        }

        if !self.in_flight.wait_idle(self.shutdown_timeout) {
            warn!(
                remaining = self.in_flight.current(),
                "shutdown timeout elapsed with jobs still running"
            );
        }

        let runtime = self.runtime.lock().expect("runtime slot poisoned").take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(deadline.saturating_duration_since(Instant::now()));
        }
        info!("task manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    /// One-shot jobs accepted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("stopped", &self.is_stopped())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

async fn run_schedule<F>(period: Duration, description: &Arc<str>, job: F, state: &ScheduleState)
where
    F: FnMut() -> anyhow::Result<()> + Send + 'static,
{
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut job = job;
    let mut runs: u64 = 0;

    loop {
        ticker.tick().await;
        if state.cancelled.load(Ordering::Acquire) {
            break;
        }
        let run_description = Arc::clone(description);
        let outcome = tokio::task::spawn_blocking(move || {
            let ok = run_once(&run_description, &mut job);
            (job, ok)
        })
        .await;

        match outcome {
            Ok((returned, true)) => {
                job = returned;
                runs += 1;
            }
            Ok((_, false)) => {
                warn!(task = %description, runs, "scheduled task failed; no further runs");
                break;
            }
            Err(e) => {
                error!(task = %description, error = %e, "scheduled task aborted");
                break;
            }
        }
    }
}

/// Execute one job at the task boundary. Returns `true` on success.
fn run_once<F>(description: &str, job: F) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    debug!(task = description, "task started");
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => {
            debug!(task = description, "task succeeded");
            true
        }
        Ok(Err(e)) => {
            error!(task = description, error = %format!("{e:#}"), "task failed");
            false
        }
        Err(payload) => {
            error!(task = description, panic = panic_message(payload.as_ref()), "task panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
