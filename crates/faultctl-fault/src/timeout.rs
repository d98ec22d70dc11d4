//! Timeout emulation: holding the target stopped on the controller side.
//!
//! Timeout fault handlers stop the target with `SIGSTOP` when their probe
//! fires.  From the target's point of view the operation it was in the
//! middle of simply takes a very long time.  The [`TimeoutController`]
//! notices the stop, waits out the configured duration and resumes the
//! target, for as many stops as the target produces.
//!
//! ```text
//!   ┌──────┐ state == T ┌──────────┐       ┌────────────────┐
//!   │ Idle ├───────────►│ Detected ├──────►│ Suspended-Wait │
//!   └──▲───┘            └──────────┘       └───────┬────────┘
//!      │ poll 100ms                                │ duration
//!      │               ┌──────────┐                │
//!      └───────────────┤ Resuming │◄───────────────┘
//!                      └──────────┘
//!   any state ── target gone / cancelled ──► Terminating (SIGCONT once)
//! ```

use crate::plan::TimeoutSpec;
use crate::process::{ProcessControl, ProcessError, SchedState};
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default interval between scheduling-state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Blocking sleep, abstracted so the state machine can run on a fake clock.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// [`Sleeper`] backed by [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Configuration for the timeout controller.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Target process.
    pub pid: u32,
    /// How long to hold the target stopped per probe hit.
    pub duration: Duration,
    /// Poll interval while idle.  Also bounds how long a cancellation
    /// can go unnoticed during the suspended wait.
    pub poll_interval: Duration,
}

impl TimeoutConfig {
    pub fn new(pid: u32, duration: Duration) -> Self {
        Self {
            pid,
            duration,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Configuration for the timeout fault selected from a plan.
    pub fn for_spec(pid: u32, spec: &TimeoutSpec) -> Self {
        Self::new(pid, spec.duration)
    }
}

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Idle,
    Detected,
    SuspendedWait,
    Resuming,
    Terminating(ExitReason),
}

/// Why the controller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The target exited (stat file gone, zombie, or `ESRCH`).
    TargetExited,
    /// Cancelled from outside (SIGINT/SIGTERM).
    Cancelled,
    /// Reading the target's state failed for another reason.
    Failed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExitReason::TargetExited => "target exited",
            ExitReason::Cancelled => "interrupted",
            ExitReason::Failed => "state read failed",
        };
        f.write_str(text)
    }
}

/// Summary of a finished controller run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutReport {
    pub reason: ExitReason,
    /// Completed stop → wait → resume cycles.
    pub cycles: u64,
}

/// Runs the stop/wait/resume protocol against one target process.
pub struct TimeoutController<P, S = ThreadSleeper> {
    config: TimeoutConfig,
    process: P,
    sleeper: S,
    cycles: u64,
    error: Option<ProcessError>,
}

impl<P: ProcessControl> TimeoutController<P> {
    pub fn new(config: TimeoutConfig, process: P) -> Self {
        Self::with_sleeper(config, process, ThreadSleeper)
    }
}

impl<P: ProcessControl, S: Sleeper> TimeoutController<P, S> {
    pub fn with_sleeper(config: TimeoutConfig, process: P, sleeper: S) -> Self {
        Self {
            config,
            process,
            sleeper,
            cycles: 0,
            error: None,
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Completed cycles so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run until the target goes away or `cancel` is set.
    ///
    /// There is no bound on the number of cycles.  Whatever ends the
    /// loop, the target is sent one last `SIGCONT` so it is never left
    /// stopped.  Only unexpected read failures surface as an error, after
    /// that cleanup.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<TimeoutReport, ProcessError> {
        info!(
            "Monitoring process {} for timeout stops ({}s per hit)",
            self.config.pid,
            self.config.duration.as_secs()
        );
        let mut state = TimeoutState::Idle;
        loop {
            state = match state {
                TimeoutState::Terminating(reason) => {
                    self.terminate(reason);
                    return match self.error.take() {
                        Some(err) => Err(err),
                        None => Ok(TimeoutReport {
                            reason,
                            cycles: self.cycles,
                        }),
                    };
                }
                other => self.step(other, cancel),
            };
        }
    }

    /// Advance the state machine by one transition.
    pub fn step(&mut self, state: TimeoutState, cancel: &AtomicBool) -> TimeoutState {
        let pid = self.config.pid;
        match state {
            TimeoutState::Idle => {
                if cancel.load(Ordering::Relaxed) {
                    return TimeoutState::Terminating(ExitReason::Cancelled);
                }
                match self.process.state(pid) {
                    Ok(SchedState::Stopped) => TimeoutState::Detected,
                    Ok(s) if s.is_terminal() => {
                        debug!("process {pid} is {s}");
                        TimeoutState::Terminating(ExitReason::TargetExited)
                    }
                    Ok(_) => {
                        self.sleeper.sleep(self.config.poll_interval);
                        TimeoutState::Idle
                    }
                    Err(ProcessError::Gone(_)) => TimeoutState::Terminating(ExitReason::TargetExited),
                    Err(err) => {
                        self.error = Some(err);
                        TimeoutState::Terminating(ExitReason::Failed)
                    }
                }
            }
            TimeoutState::Detected => {
                info!("Probe hit! Process {pid} is now STOPPED");
                TimeoutState::SuspendedWait
            }
            TimeoutState::SuspendedWait => {
                info!(
                    "Holding process {pid} for {} seconds",
                    self.config.duration.as_secs()
                );
                if self.hold(cancel) {
                    TimeoutState::Resuming
                } else {
                    TimeoutState::Terminating(ExitReason::Cancelled)
                }
            }
            TimeoutState::Resuming => match self.process.resume(pid) {
                Ok(()) => {
                    self.cycles += 1;
                    info!("Process {pid} resumed with SIGCONT, waiting for the next hit");
                    self.sleeper.sleep(self.config.poll_interval);
                    TimeoutState::Idle
                }
                Err(ProcessError::Gone(_)) => TimeoutState::Terminating(ExitReason::TargetExited),
                Err(err) => {
                    warn!("Failed to resume process {pid}: {err}");
                    self.sleeper.sleep(self.config.poll_interval);
                    TimeoutState::Idle
                }
            },
            TimeoutState::Terminating(reason) => TimeoutState::Terminating(reason),
        }
    }

    /// Sleep out the configured duration without touching the target.
    /// Returns `false` if cancelled part-way.
    fn hold(&mut self, cancel: &AtomicBool) -> bool {
        let slice = self.config.poll_interval.max(Duration::from_millis(1));
        let mut remaining = self.config.duration;
        while !remaining.is_zero() {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            let nap = remaining.min(slice);
            self.sleeper.sleep(nap);
            remaining -= nap;
        }
        true
    }

    fn terminate(&mut self, reason: ExitReason) {
        let pid = self.config.pid;
        info!("Exiting timeout emulation ({reason}) after {} cycles", self.cycles);
        match self.process.resume(pid) {
            Ok(()) => debug!("sent final SIGCONT to process {pid}"),
            Err(ProcessError::Gone(_)) => debug!("process {pid} already gone"),
            Err(err) => warn!("final SIGCONT to process {pid} failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays a scripted sequence of states; gone once the script ends.
    struct Scripted {
        states: VecDeque<SchedState>,
        resumes: usize,
        resumes_after_exit: usize,
        polls: usize,
    }

    impl Scripted {
        fn new(states: &[SchedState]) -> Self {
            Self {
                states: states.iter().copied().collect(),
                resumes: 0,
                resumes_after_exit: 0,
                polls: 0,
            }
        }
    }

    impl ProcessControl for &mut Scripted {
        fn state(&mut self, pid: u32) -> Result<SchedState, ProcessError> {
            self.polls += 1;
            self.states.pop_front().ok_or(ProcessError::Gone(pid))
        }

        fn resume(&mut self, pid: u32) -> Result<(), ProcessError> {
            if self.states.is_empty() {
                self.resumes_after_exit += 1;
                return Err(ProcessError::Gone(pid));
            }
            self.resumes += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeClock {
        naps: Vec<Duration>,
        cancel_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl FakeClock {
        fn total(&self) -> Duration {
            self.naps.iter().sum()
        }
    }

    impl Sleeper for &mut FakeClock {
        fn sleep(&mut self, duration: Duration) {
            self.naps.push(duration);
            if let Some((n, ref flag)) = self.cancel_after {
                if self.naps.len() >= n {
                    flag.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn config(secs: u64) -> TimeoutConfig {
        TimeoutConfig::new(1234, Duration::from_secs(secs))
    }

    use crate::process::SchedState::{Running, Sleeping, Stopped, Zombie};

    #[test]
    fn stop_waits_full_duration_then_resumes_once() {
        let mut target = Scripted::new(&[Sleeping, Stopped, Running]);
        let mut clock = FakeClock::default();
        let cancel = AtomicBool::new(false);

        let report = TimeoutController::with_sleeper(config(30), &mut target, &mut clock)
            .run(&cancel)
            .unwrap();

        assert_eq!(report.reason, ExitReason::TargetExited);
        assert_eq!(report.cycles, 1);
        // one resume for the stop, one best-effort attempt at exit
        assert_eq!(target.resumes, 1);
        assert_eq!(target.resumes_after_exit, 1);

        // idle poll + 30s hold + post-resume poll + idle poll
        let poll = DEFAULT_POLL_INTERVAL;
        assert_eq!(clock.total(), Duration::from_secs(30) + poll * 3);
    }

    #[test]
    fn hold_is_exactly_the_configured_duration() {
        let mut target = Scripted::new(&[Stopped]);
        let mut clock = FakeClock::default();
        let cancel = AtomicBool::new(false);

        let mut ctl = TimeoutController::with_sleeper(config(90), &mut target, &mut clock);
        assert_eq!(ctl.step(TimeoutState::Idle, &cancel), TimeoutState::Detected);
        assert_eq!(ctl.step(TimeoutState::Detected, &cancel), TimeoutState::SuspendedWait);
        assert_eq!(ctl.step(TimeoutState::SuspendedWait, &cancel), TimeoutState::Resuming);
        drop(ctl);

        assert_eq!(clock.total(), Duration::from_secs(90));
        assert!(clock.naps.iter().all(|n| *n <= DEFAULT_POLL_INTERVAL));
        // no polls during the hold
        assert_eq!(target.polls, 1);
    }

    #[test]
    fn one_resume_per_stop() {
        let mut target = Scripted::new(&[Stopped, Running, Stopped, Sleeping, Stopped, Running]);
        let mut clock = FakeClock::default();
        let cancel = AtomicBool::new(false);

        let report = TimeoutController::with_sleeper(config(1), &mut target, &mut clock)
            .run(&cancel)
            .unwrap();

        assert_eq!(report.cycles, 3);
        assert_eq!(target.resumes, 3);
    }

    #[test]
    fn target_gone_while_idle_exits_cleanly() {
        let mut target = Scripted::new(&[Running, Running]);
        let mut clock = FakeClock::default();
        let cancel = AtomicBool::new(false);

        let report = TimeoutController::with_sleeper(config(30), &mut target, &mut clock)
            .run(&cancel)
            .unwrap();

        assert_eq!(
            report,
            TimeoutReport {
                reason: ExitReason::TargetExited,
                cycles: 0
            }
        );
        assert_eq!(target.resumes_after_exit, 1);
    }

    #[test]
    fn zombie_counts_as_exited() {
        let mut target = Scripted::new(&[Running, Zombie, Running]);
        let mut clock = FakeClock::default();
        let cancel = AtomicBool::new(false);

        let report = TimeoutController::with_sleeper(config(30), &mut target, &mut clock)
            .run(&cancel)
            .unwrap();

        assert_eq!(report.reason, ExitReason::TargetExited);
        // final SIGCONT still attempted
        assert_eq!(target.resumes, 1);
    }

    #[test]
    fn cancel_while_idle_resumes_target() {
        let mut target = Scripted::new(&[Running, Running, Running, Running]);
        let flag = Arc::new(AtomicBool::new(false));
        let mut clock = FakeClock {
            cancel_after: Some((2, flag.clone())),
            ..Default::default()
        };

        let report = TimeoutController::with_sleeper(config(30), &mut target, &mut clock)
            .run(&flag)
            .unwrap();

        assert_eq!(report.reason, ExitReason::Cancelled);
        assert_eq!(target.resumes, 1);
    }

    #[test]
    fn cancel_during_hold_resumes_target() {
        let mut target = Scripted::new(&[Stopped, Stopped]);
        let flag = Arc::new(AtomicBool::new(false));
        let mut clock = FakeClock {
            cancel_after: Some((5, flag.clone())),
            ..Default::default()
        };

        let report = TimeoutController::with_sleeper(config(30), &mut target, &mut clock)
            .run(&flag)
            .unwrap();

        assert_eq!(report.reason, ExitReason::Cancelled);
        assert_eq!(report.cycles, 0);
        assert_eq!(target.resumes, 1);
        assert_eq!(clock.total(), DEFAULT_POLL_INTERVAL * 5);
    }

    struct Broken;

    impl ProcessControl for Broken {
        fn state(&mut self, pid: u32) -> Result<SchedState, ProcessError> {
            Err(ProcessError::Malformed {
                pid,
                line: String::new(),
            })
        }

        fn resume(&mut self, _pid: u32) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    #[test]
    fn unexpected_read_error_surfaces_after_cleanup() {
        let mut clock = FakeClock::default();
        let cancel = AtomicBool::new(false);
        let err = TimeoutController::with_sleeper(config(30), Broken, &mut clock)
            .run(&cancel)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Malformed { pid: 1234, .. }));
    }

    #[test]
    fn exit_reason_display() {
        assert_eq!(ExitReason::TargetExited.to_string(), "target exited");
        assert_eq!(ExitReason::Cancelled.to_string(), "interrupted");
        assert_eq!(ExitReason::Failed.to_string(), "state read failed");
    }

    #[test]
    fn config_for_spec() {
        let spec = TimeoutSpec {
            fault_name: "CliReturnTimeOut90S".to_string(),
            duration: Duration::from_secs(90),
        };
        let cfg = TimeoutConfig::for_spec(7, &spec);
        assert_eq!(cfg.pid, 7);
        assert_eq!(cfg.duration, Duration::from_secs(90));
        assert_eq!(cfg.poll_interval, Duration::from_millis(100));
    }
}
