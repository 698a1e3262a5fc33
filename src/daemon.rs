use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EchoNotesError;
use crate::jobs::JobRunner;
use crate::schedule_config::{ConfigStore, ScheduleConfig};
use crate::time_gate::{should_process, should_summarize, Clock};

/// Default gap between scheduling decisions
pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// How often the loop checks for a stop request while sleeping
pub const DEFAULT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    Stopped,
}

/// Why the daemon loop exited. Both are graceful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    StopRequested,
    Disabled,
}

/// When each job last completed. Starts empty on every daemon start, so
/// both jobs are immediately eligible after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    pub last_process_run: Option<NaiveDateTime>,
    pub last_summary_run: Option<NaiveDateTime>,
}

/// The scheduling control loop.
///
/// Each tick reloads the schedule from its `ConfigStore`, exits if the daemon
/// was disabled, then runs whichever jobs are due, one after the other. Between
/// ticks it sleeps in short slices so a cancelled `stop_token` is honored
/// within one poll interval. A job that is already running is never
/// interrupted.
pub struct DaemonLoop {
    store: Box<dyn ConfigStore>,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    stop_token: CancellationToken,
    tick: Duration,
    poll: Duration,
    state: DaemonState,
    run_state: RunState,
    config: ScheduleConfig,
}

impl DaemonLoop {
    pub fn new(
        store: Box<dyn ConfigStore>,
        runner: JobRunner,
        clock: Arc<dyn Clock>,
        stop_token: CancellationToken,
    ) -> Self {
        DaemonLoop {
            store,
            runner,
            clock,
            stop_token,
            tick: DEFAULT_TICK,
            poll: DEFAULT_POLL,
            state: DaemonState::Starting,
            run_state: RunState::default(),
            config: ScheduleConfig::default(),
        }
    }

    /// Override the tick and stop-poll granularity
    pub fn with_timing(mut self, tick: Duration, poll: Duration) -> Self {
        self.tick = tick;
        self.poll = poll.min(tick).max(Duration::from_millis(1));
        self
    }

    /// Seed the last-known-good schedule used when a reload fails
    pub fn with_config(mut self, config: ScheduleConfig) -> Self {
        self.config = config;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> DaemonState {
        self.state
    }

    #[cfg(test)]
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    #[cfg(test)]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    /// Install termination signal handlers, then run the loop on a blocking
    /// thread until it exits. Signals cancel the stop token; they never
    /// interrupt a running job.
    pub async fn run_with_signals(self) -> Result<DaemonExit, EchoNotesError> {
        let watcher = match spawn_signal_watcher(self.stop_token.clone()) {
            Ok(watcher) => watcher,
            Err(e) => {
                // Jobs may hold blocking HTTP clients, which must not be dropped on a
                // runtime thread
                let _ = tokio::task::spawn_blocking(move || drop(self)).await;
                return Err(e);
            }
        };

        let mut daemon = self;
        let result = tokio::task::spawn_blocking(move || daemon.run())
            .await
            .map_err(|e| {
                EchoNotesError::Error(format!("Daemon loop terminated abnormally: {}", e))
            });

        watcher.abort();
        result
    }

    /// Run until a stop is requested or the schedule disables the daemon
    pub fn run(&mut self) -> DaemonExit {
        self.set_state(DaemonState::Running);
        info!("Starting Echo-Notes daemon...");
        info!("Current schedule configuration: {:?}", self.config);

        let exit = loop {
            if self.stop_token.is_cancelled() {
                break DaemonExit::StopRequested;
            }
            if let Some(exit) = self.tick() {
                break exit;
            }
            self.sleep_until_next_tick();
        };

        self.set_state(DaemonState::Stopped);
        match exit {
            DaemonExit::StopRequested => info!("Stop requested. Daemon shutting down."),
            DaemonExit::Disabled => info!("Daemon is disabled in configuration. Exiting..."),
        }
        exit
    }

    /// One scheduling pass. Returns an exit reason when the loop should stop.
    pub(crate) fn tick(&mut self) -> Option<DaemonExit> {
        self.reload_config();

        if !self.config.daemon_enabled {
            return Some(DaemonExit::Disabled);
        }

        let now = self.clock.now();

        if should_process(self.run_state.last_process_run, &self.config, now) {
            match self.runner.run_note_processing() {
                Some(finished) => self.run_state.last_process_run = Some(finished),
                None => warn!("Note processing failed; will retry on the next eligible tick"),
            }
        }

        if should_summarize(self.run_state.last_summary_run, &self.config, now) {
            match self.runner.run_summary_generation() {
                Some(finished) => self.run_state.last_summary_run = Some(finished),
                None => warn!("Summary generation failed; will retry on the next eligible tick"),
            }
        }

        None
    }

    fn set_state(&mut self, next: DaemonState) {
        debug!("Daemon state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn reload_config(&mut self) {
        match self.store.reload() {
            Ok(config) => {
                if config != self.config {
                    info!("Schedule configuration changed: {:?}", config);
                }
                self.config = config;
            }
            Err(e) => warn!(
                "Failed to reload schedule configuration: {}. Keeping previous settings.",
                e
            ),
        }
    }

    fn sleep_until_next_tick(&self) {
        let started = Instant::now();
        loop {
            if self.stop_token.is_cancelled() {
                return;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.tick {
                return;
            }
            thread::sleep(self.poll.min(self.tick - elapsed));
        }
    }
}

/// Cancel `token` on SIGTERM, SIGINT or SIGHUP
#[cfg(unix)]
fn spawn_signal_watcher(token: CancellationToken) -> Result<JoinHandle<()>, EchoNotesError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => "SIGHUP",
            _ = token.cancelled() => return,
        };
        info!("Received termination signal ({}). Shutting down...", name);
        token.cancel();
    }))
}

#[cfg(not(unix))]
fn spawn_signal_watcher(token: CancellationToken) -> Result<JoinHandle<()>, EchoNotesError> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    debug!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received termination signal (Ctrl+C). Shutting down...");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::{ManualClock, Outcome, ScriptedJob};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Store whose next reload result is set by the test
    struct ScriptedStore {
        next: Arc<Mutex<Result<ScheduleConfig, String>>>,
    }

    impl ConfigStore for ScriptedStore {
        fn reload(&self) -> Result<ScheduleConfig, EchoNotesError> {
            self.next.lock().unwrap().clone().map_err(EchoNotesError::Config)
        }
    }

    struct Harness {
        daemon: DaemonLoop,
        clock: Arc<ManualClock>,
        config: Arc<Mutex<Result<ScheduleConfig, String>>>,
        process_calls: Arc<AtomicUsize>,
        summary_calls: Arc<AtomicUsize>,
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn harness(process: Outcome, summary: Outcome, now: NaiveDateTime) -> Harness {
        let clock = Arc::new(ManualClock::new(now));
        let config = Arc::new(Mutex::new(Ok(ScheduleConfig::default())));
        let process_job = ScriptedJob::new("note processing", process);
        let summary_job = ScriptedJob::new("summary generation", summary);
        let process_calls = Arc::clone(&process_job.calls);
        let summary_calls = Arc::clone(&summary_job.calls);

        let runner = JobRunner::new(Box::new(process_job), Box::new(summary_job), clock.clone());
        let daemon = DaemonLoop::new(
            Box::new(ScriptedStore {
                next: Arc::clone(&config),
            }),
            runner,
            clock.clone(),
            CancellationToken::new(),
        )
        .with_timing(Duration::from_millis(20), Duration::from_millis(5));

        Harness {
            daemon,
            clock,
            config,
            process_calls,
            summary_calls,
        }
    }

    #[test]
    fn test_pre_cancelled_token_exits_without_running_jobs() {
        let mut h = harness(Outcome::Succeed, Outcome::Succeed, at(2024, 1, 7, 12, 0));
        h.daemon.stop_token().cancel();

        assert_eq!(h.daemon.run(), DaemonExit::StopRequested);
        assert_eq!(h.daemon.state(), DaemonState::Stopped);
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.summary_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disabled_config_stops_loop() {
        let mut h = harness(Outcome::Succeed, Outcome::Succeed, at(2024, 1, 7, 12, 0));
        *h.config.lock().unwrap() = Ok(ScheduleConfig {
            daemon_enabled: false,
            ..ScheduleConfig::default()
        });

        assert_eq!(h.daemon.run(), DaemonExit::Disabled);
        assert_eq!(h.daemon.state(), DaemonState::Stopped);
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_tick_processes_but_waits_for_summary_slot() {
        // Sunday 08:00, summary is due Sunday 12:00
        let mut h = harness(Outcome::Succeed, Outcome::Succeed, at(2024, 1, 7, 8, 0));

        assert_eq!(h.daemon.tick(), None);
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.summary_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.daemon.run_state().last_process_run, Some(at(2024, 1, 7, 8, 0)));
        assert_eq!(h.daemon.run_state().last_summary_run, None);

        // Half an hour later nothing is due
        h.clock.set(at(2024, 1, 7, 8, 30));
        h.daemon.tick();
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 1);

        // At noon both jobs run
        h.clock.set(at(2024, 1, 7, 12, 0));
        h.daemon.tick();
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.summary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.daemon.run_state().last_summary_run, Some(at(2024, 1, 7, 12, 0)));
    }

    #[test]
    fn test_failed_job_is_retried_next_tick() {
        let mut h = harness(Outcome::Fail, Outcome::Succeed, at(2024, 1, 7, 8, 0));

        h.daemon.tick();
        assert_eq!(h.daemon.run_state().last_process_run, None);

        h.clock.set(at(2024, 1, 7, 8, 1));
        h.daemon.tick();
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.daemon.run_state().last_process_run, None);
    }

    #[test]
    fn test_failing_job_does_not_block_the_other() {
        let mut h = harness(Outcome::Panic, Outcome::Succeed, at(2024, 1, 7, 12, 0));

        h.daemon.tick();
        assert_eq!(h.daemon.run_state().last_process_run, None);
        assert_eq!(h.daemon.run_state().last_summary_run, Some(at(2024, 1, 7, 12, 0)));
    }

    #[test]
    fn test_reload_failure_keeps_last_known_good_config() {
        let mut h = harness(Outcome::Succeed, Outcome::Succeed, at(2024, 1, 7, 8, 0));
        *h.config.lock().unwrap() = Ok(ScheduleConfig {
            processing_interval: 5,
            ..ScheduleConfig::default()
        });
        h.daemon.tick();
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 1);

        *h.config.lock().unwrap() = Err("torn write".to_string());
        h.clock.set(at(2024, 1, 7, 8, 5));
        assert_eq!(h.daemon.tick(), None);

        // Still using the 5 minute interval rather than the 60 minute default
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_config_changes_are_picked_up_each_tick() {
        let mut h = harness(Outcome::Succeed, Outcome::Succeed, at(2024, 1, 7, 8, 0));
        h.daemon.tick();

        *h.config.lock().unwrap() = Ok(ScheduleConfig {
            summary_interval: 30,
            ..ScheduleConfig::default()
        });
        h.clock.set(at(2024, 1, 7, 8, 10));
        h.daemon.tick();
        assert_eq!(h.summary_calls.load(Ordering::SeqCst), 1);

        *h.config.lock().unwrap() = Ok(ScheduleConfig {
            daemon_enabled: false,
            ..ScheduleConfig::default()
        });
        assert_eq!(h.daemon.tick(), Some(DaemonExit::Disabled));
    }

    #[test]
    fn test_cancel_while_sleeping_stops_promptly() {
        let h = harness(Outcome::Succeed, Outcome::Succeed, at(2024, 1, 7, 8, 0));
        let mut daemon = h.daemon.with_timing(Duration::from_secs(60), Duration::from_millis(10));
        let token = daemon.stop_token();

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let exit = daemon.run();
            (exit, started.elapsed())
        });

        thread::sleep(Duration::from_millis(100));
        token.cancel();
        let (exit, elapsed) = handle.join().unwrap();

        assert_eq!(exit, DaemonExit::StopRequested);
        assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
        assert_eq!(h.process_calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn test_sigterm_cancels_the_loop() {
        let h = harness(Outcome::Succeed, Outcome::Succeed, at(2024, 1, 7, 8, 0));
        let daemon = h.daemon.with_timing(Duration::from_secs(60), Duration::from_millis(10));

        let rt = tokio::runtime::Runtime::new().unwrap();
        let exit = rt.block_on(async move {
            let task = tokio::spawn(daemon.run_with_signals());
            tokio::time::sleep(Duration::from_millis(200)).await;
            // SAFETY: signalling our own pid; the tokio handler installed by
            // run_with_signals intercepts SIGTERM
            unsafe {
                libc::kill(libc::getpid(), libc::SIGTERM);
            }
            tokio::time::timeout(Duration::from_secs(5), task).await
        });

        let exit = exit.expect("loop did not stop").unwrap().unwrap();
        assert_eq!(exit, DaemonExit::StopRequested);
    }
}
