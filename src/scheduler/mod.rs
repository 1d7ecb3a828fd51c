//! Daily scheduling loop.
//!
//! Wakes at least every poll interval (and exactly at the start of the target
//! hour), asks the [`DailyTrigger`] whether a run is due and spawns it. A
//! failed or panicked run is logged; the loop keeps going until shutdown.

mod trigger;

pub use trigger::{Clock, DailyTrigger, SystemClock};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::emit;
use crate::error::PipelineError;
use crate::metrics::events::{RunTriggered, TriggerKind};

/// Something the scheduler can run once per day.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Execute one run. `shutdown` is cancelled when the process stops.
    async fn execute(&self, shutdown: CancellationToken) -> Result<(), PipelineError>;
}

type RunHandle = JoinHandle<Result<(), PipelineError>>;

/// Long-lived loop invoking a [`Runner`] at most once per calendar date.
pub struct Scheduler<R: Runner, C: Clock = SystemClock> {
    runner: Arc<R>,
    clock: C,
    trigger: DailyTrigger,
    poll_interval: Duration,
    run_on_start: bool,
}

impl<R: Runner> Scheduler<R> {
    pub fn new(runner: Arc<R>, config: &ScheduleConfig) -> Self {
        Self::with_clock(runner, config, SystemClock)
    }
}

impl<R: Runner, C: Clock> Scheduler<R, C> {
    pub fn with_clock(runner: Arc<R>, config: &ScheduleConfig, clock: C) -> Self {
        Self {
            runner,
            clock,
            trigger: DailyTrigger::new(config.target_hour),
            poll_interval: config.poll_interval(),
            run_on_start: config.run_on_start,
        }
    }

    pub fn trigger(&self) -> &DailyTrigger {
        &self.trigger
    }

    /// Run until `shutdown` is cancelled, then wait for any in-flight run.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            target_hour = self.trigger.target_hour(),
            run_on_start = self.run_on_start,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Scheduler started"
        );

        if self.run_on_start {
            self.trigger.mark(self.clock.now().date());
            emit!(RunTriggered {
                kind: TriggerKind::Startup
            });
            info!("Running on startup");
            report(self.spawn(&shutdown).await);
        }

        let mut in_flight: Option<RunHandle> = None;
        loop {
            if let Some(handle) = in_flight.take_if(|handle| handle.is_finished()) {
                report(handle.await);
            }

            let now = self.clock.now();
            if self.trigger.should_trigger(now) {
                if in_flight.is_some() {
                    warn!(date = %now.date(), "Previous run still in progress, skipping");
                    emit!(RunTriggered {
                        kind: TriggerKind::Skipped
                    });
                } else {
                    info!(date = %now.date(), "Triggering daily run");
                    emit!(RunTriggered {
                        kind: TriggerKind::Scheduled
                    });
                    in_flight = Some(self.spawn(&shutdown));
                }
            }

            let wait = self.poll_interval.min(self.trigger.until_next(now));
            debug!(wait_secs = wait.as_secs(), "Waiting for next tick");
            if shutdown
                .run_until_cancelled(tokio::time::sleep(wait))
                .await
                .is_none()
            {
                info!("Shutdown requested, stopping scheduler");
                break;
            }
        }

        if let Some(handle) = in_flight {
            info!("Waiting for in-flight run to finish");
            report(handle.await);
        }
    }

    fn spawn(&self, shutdown: &CancellationToken) -> RunHandle {
        let runner = self.runner.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move { runner.execute(token).await })
    }
}

fn report(result: Result<Result<(), PipelineError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => debug!("Run finished"),
        Ok(Err(e)) => error!(error = %e, "Run failed"),
        Err(e) => error!(error = %e, "Run task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted times, cancelling `done` once the script runs out.
    struct ScriptedClock {
        times: Mutex<VecDeque<NaiveDateTime>>,
        last: Mutex<Option<NaiveDateTime>>,
        done: CancellationToken,
    }

    impl ScriptedClock {
        fn new(times: Vec<NaiveDateTime>, done: CancellationToken) -> Self {
            Self {
                times: Mutex::new(times.into()),
                last: Mutex::new(None),
                done,
            }
        }
    }

    impl Clock for ScriptedClock {
        fn now(&self) -> NaiveDateTime {
            let mut times = self.times.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = times.pop_front() {
                *last = Some(next);
            }
            if times.is_empty() {
                self.done.cancel();
            }
            last.expect("clock script is empty")
        }
    }

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
        fail: bool,
        hold: Option<Duration>,
    }

    #[async_trait]
    impl Runner for CountingRunner {
        async fn execute(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = self.hold {
                shutdown.run_until_cancelled(tokio::time::sleep(hold)).await;
            }
            if self.fail {
                return Err(PipelineError::Timeout {
                    table: "orders".into(),
                    secs: 1,
                });
            }
            Ok(())
        }
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn config(run_on_start: bool) -> ScheduleConfig {
        ScheduleConfig {
            target_hour: 3,
            run_on_start,
            ..Default::default()
        }
    }

    async fn drive(runner: Arc<CountingRunner>, times: Vec<NaiveDateTime>, run_on_start: bool) {
        let shutdown = CancellationToken::new();
        let clock = ScriptedClock::new(times, shutdown.clone());
        let mut scheduler = Scheduler::with_clock(runner, &config(run_on_start), clock);
        scheduler.run(shutdown).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_run_per_day() {
        let runner = Arc::new(CountingRunner::default());
        drive(
            runner.clone(),
            vec![at(9, 2), at(9, 3), at(9, 3), at(9, 3), at(9, 4)],
            false,
        )
        .await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        let runner = Arc::new(CountingRunner::default());
        drive(
            runner.clone(),
            vec![at(9, 2), at(9, 3), at(9, 3), at(9, 4), at(10, 3), at(10, 4)],
            false,
        )
        .await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_run_keeps_loop_alive() {
        let runner = Arc::new(CountingRunner {
            fail: true,
            ..Default::default()
        });
        drive(
            runner.clone(),
            vec![at(9, 3), at(9, 4), at(10, 3), at(10, 4), at(11, 3), at(11, 4)],
            false,
        )
        .await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_start_marks_today() {
        let runner = Arc::new(CountingRunner::default());
        drive(runner.clone(), vec![at(9, 3), at(9, 3), at(9, 4)], true).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_trigger_is_skipped() {
        let runner = Arc::new(CountingRunner {
            hold: Some(Duration::from_secs(10 * 24 * 3600)),
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        let clock = ScriptedClock::new(
            vec![at(9, 3), at(9, 4), at(10, 3), at(10, 4)],
            shutdown.clone(),
        );
        let mut scheduler = Scheduler::with_clock(runner.clone(), &config(false), clock);
        scheduler.run(shutdown).await;

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.trigger().last_triggered(),
            NaiveDate::from_ymd_opt(2024, 3, 10)
        );
    }
}
