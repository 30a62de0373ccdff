//! Single-slot pulse job scheduler
//!
//! Request handlers call [`PulseScheduler::start_pulse_job`], which claims
//! the job slot, engages the motor and publishes the job. A worker running
//! on its own core (or thread) loops on [`PulseScheduler::next_job`] and
//! [`PulseScheduler::run_job`]. The handler never waits for the pulse train.
//!
//! ## Job slot
//!
//! The slot is an atomic token: `0` means idle, anything else is the token of
//! the job that currently owns the motor. What happens when a job is
//! requested while another one owns the slot is decided by
//! [`OverlapPolicy`].
//!
//! Claim-and-engage and release-and-clear each run inside one critical
//! section, so a finishing job can never clear Enable after a newer job has
//! asserted it.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::PulseProfile;
use crate::motor::{Direction, MotorControl, MotorError};
use crate::pulse::{PulseTrain, TrainEnd};

const IDLE: u32 = 0;

/// What to do with a job request while another job is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Refuse the new request; the running job and all lines are untouched
    RejectIfBusy,
    /// Supersede the running job: it stops at its next period without
    /// touching Enable, and the new job takes over with its own direction
    CancelAndRestart,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("a pulse job is already running")]
    Busy,
    #[error("motor error: {0}")]
    Motor(MotorError),
}

impl From<MotorError> for ScheduleError {
    fn from(value: MotorError) -> Self {
        Self::Motor(value)
    }
}

/// A unit of pulse work handed to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseJob {
    pub token: u32,
    pub direction: Direction,
    pub profile: PulseProfile,
}

/// Receipt returned to the requester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTicket {
    pub token: u32,
    /// Token of the job this one superseded, if any
    pub superseded: Option<u32>,
}

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Ran for its full duration and disabled the motor
    Completed { periods: u32 },
    /// Another job took the slot; Enable was left to the successor
    Superseded { periods: u32 },
    /// A pin write failed; the motor was disabled if the job still owned it
    Faulted(MotorError),
}

/// Atomic ownership token for the motor
pub struct JobSlot {
    active: AtomicU32,
    issued: AtomicU32,
}

impl JobSlot {
    pub const fn new() -> Self {
        Self {
            active: AtomicU32::new(IDLE),
            issued: AtomicU32::new(IDLE),
        }
    }

    fn next_token(&self) -> u32 {
        loop {
            let token = self.issued.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if token != IDLE {
                return token;
            }
        }
    }

    /// Claim for `token` if idle; returns the current owner otherwise
    fn try_claim(&self, token: u32) -> Result<(), u32> {
        self.active
            .compare_exchange(IDLE, token, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Unconditionally take the slot; returns the previous owner
    fn take_over(&self, token: u32) -> Option<u32> {
        match self.active.swap(token, Ordering::AcqRel) {
            IDLE => None,
            previous => Some(previous),
        }
    }

    /// Give the slot back if `token` still owns it
    fn clear(&self, token: u32) -> bool {
        self.active
            .compare_exchange(token, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn owner(&self) -> Option<u32> {
        match self.active.load(Ordering::Acquire) {
            IDLE => None,
            token => Some(token),
        }
    }

    pub fn is_owned_by(&self, token: u32) -> bool {
        self.active.load(Ordering::Acquire) == token
    }
}

impl Default for JobSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Job slot plus the hand-off channel to the pulse worker
pub struct PulseScheduler {
    slot: JobSlot,
    pending: Signal<CriticalSectionRawMutex, PulseJob>,
    policy: OverlapPolicy,
}

impl PulseScheduler {
    pub const fn new(policy: OverlapPolicy) -> Self {
        Self {
            slot: JobSlot::new(),
            pending: Signal::new(),
            policy,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.owner().is_some()
    }

    /// Claim the slot, set Direction and Enable, and publish the job.
    ///
    /// Returns as soon as the job is published; the pulse train itself runs
    /// on the worker.
    pub fn start_pulse_job<M>(
        &self,
        motor: &M,
        direction: Direction,
        profile: PulseProfile,
    ) -> Result<JobTicket, ScheduleError>
    where
        M: MotorControl + ?Sized,
    {
        let token = self.slot.next_token();

        let superseded = critical_section::with(|_| {
            let superseded = match self.policy {
                OverlapPolicy::RejectIfBusy => {
                    self.slot.try_claim(token).map_err(|owner| {
                        debug!("Pulse job {} rejected, job {} still running", token, owner);
                        ScheduleError::Busy
                    })?;
                    None
                }
                OverlapPolicy::CancelAndRestart => self.slot.take_over(token),
            };

            if let Err(e) = motor.engage(direction) {
                self.slot.clear(token);
                // Never leave a half-configured driver enabled
                let _ = motor.release();
                return Err(ScheduleError::Motor(e));
            }

            Ok(superseded)
        })?;

        if let Some(previous) = superseded {
            info!("Pulse job {} supersedes job {}", token, previous);
        }

        self.pending.signal(PulseJob {
            token,
            direction,
            profile,
        });

        info!(
            "Pulse job {} scheduled: {} for {} ms at {} us half-period",
            token,
            direction.label(),
            profile.duration_ms,
            profile.half_period_us
        );

        Ok(JobTicket { token, superseded })
    }

    /// Wait for the next published job (worker side)
    pub async fn next_job(&self) -> PulseJob {
        self.pending.wait().await
    }

    /// Take a published job without waiting (worker side)
    pub fn try_next_job(&self) -> Option<PulseJob> {
        self.pending.try_take()
    }

    /// Run a job to completion on the calling context.
    ///
    /// Blocks for up to `job.profile.duration_ms`. Disables the motor at the
    /// end only if the job still owns the slot.
    pub fn run_job<T, M>(&self, job: PulseJob, train: &mut T, motor: &M) -> JobOutcome
    where
        T: PulseTrain + ?Sized,
        M: MotorControl + ?Sized,
    {
        if !self.slot.is_owned_by(job.token) {
            debug!("Pulse job {} was superseded before it started", job.token);
            return JobOutcome::Superseded { periods: 0 };
        }

        let result = train.run(&job.profile, || self.slot.is_owned_by(job.token));

        let outcome = match result {
            Ok(report) => match report.end {
                TrainEnd::Completed => JobOutcome::Completed {
                    periods: report.periods,
                },
                TrainEnd::Interrupted => JobOutcome::Superseded {
                    periods: report.periods,
                },
            },
            Err(e) => JobOutcome::Faulted(e),
        };

        if matches!(outcome, JobOutcome::Superseded { .. }) {
            info!("Pulse job {} superseded", job.token);
            return outcome;
        }

        let released = critical_section::with(|_| {
            if !self.slot.is_owned_by(job.token) {
                return None;
            }
            let released = motor.release();
            self.slot.clear(job.token);
            Some(released)
        });

        match (released, outcome) {
            (None, JobOutcome::Completed { periods }) => {
                // Lost the slot between the last period and the release
                info!("Pulse job {} superseded at completion", job.token);
                JobOutcome::Superseded { periods }
            }
            (Some(Err(e)), _) => {
                warn!("Pulse job {} could not disable the motor: {}", job.token, e);
                JobOutcome::Faulted(e)
            }
            (_, outcome) => {
                match outcome {
                    JobOutcome::Completed { periods } => {
                        info!("Pulse job {} finished after {} periods", job.token, periods)
                    }
                    JobOutcome::Faulted(e) => warn!("Pulse job {} aborted: {}", job.token, e),
                    JobOutcome::Superseded { .. } => {}
                }
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::motor::testing::{RecordingPin, recording_motor};
    use crate::motor::{MotorLine, MotorLines, MotorState, SharedMotor};
    use crate::pulse::BusyWaitPulseTrain;
    use embassy_time::{Delay, Instant};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const SHORT: PulseProfile = PulseProfile::new(50, 40);

    fn train() -> (BusyWaitPulseTrain<RecordingPin, Delay>, RecordingPin) {
        let pin = RecordingPin::new();
        (BusyWaitPulseTrain::new(pin.clone(), Delay).unwrap(), pin)
    }

    #[test]
    fn test_start_engages_and_publishes() {
        let scheduler = PulseScheduler::new(OverlapPolicy::RejectIfBusy);
        let (motor, enable, direction) = recording_motor();

        let ticket = scheduler
            .start_pulse_job(&motor, Direction::Reverse, SHORT)
            .unwrap();

        assert!(scheduler.is_busy());
        assert!(!enable.is_high());
        assert!(!direction.is_high());
        assert_eq!(ticket.superseded, None);

        let job = scheduler.try_next_job().unwrap();
        assert_eq!(job.token, ticket.token);
        assert_eq!(job.direction, Direction::Reverse);
        assert_eq!(job.profile, SHORT);
    }

    #[test]
    fn test_start_returns_before_the_job_runs() {
        let scheduler = PulseScheduler::new(OverlapPolicy::RejectIfBusy);
        let (motor, _, _) = recording_motor();

        let started = Instant::now();
        scheduler
            .start_pulse_job(&motor, Direction::Forward, PulseProfile::new(500, 1_000))
            .unwrap();

        assert!(started.elapsed().as_millis() < 1_000);
    }

    #[test]
    fn test_completed_job_disables_and_frees_slot() {
        let scheduler = PulseScheduler::new(OverlapPolicy::RejectIfBusy);
        let (motor, enable, _) = recording_motor();
        let (mut train, pulse) = train();

        scheduler
            .start_pulse_job(&motor, Direction::Forward, SHORT)
            .unwrap();
        let job = scheduler.try_next_job().unwrap();
        let outcome = scheduler.run_job(job, &mut train, &motor);

        assert!(matches!(outcome, JobOutcome::Completed { periods } if periods > 0));
        assert!(enable.is_high(), "Enable must be inactive after the job");
        assert!(!pulse.is_high());
        assert!(!scheduler.is_busy());
        assert_eq!(motor.state(), MotorState::IDLE);

        // No further toggling until the next request
        let edges = pulse.rising_edges();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pulse.rising_edges(), edges);
    }

    #[test]
    fn test_reject_if_busy_leaves_lines_untouched() {
        let scheduler = PulseScheduler::new(OverlapPolicy::RejectIfBusy);
        let (motor, _, direction) = recording_motor();

        scheduler
            .start_pulse_job(&motor, Direction::Forward, SHORT)
            .unwrap();
        let writes = direction.writes();

        let second = scheduler.start_pulse_job(&motor, Direction::Reverse, SHORT);

        assert_eq!(second, Err(ScheduleError::Busy));
        assert_eq!(direction.writes(), writes);
        assert!(direction.is_high());
    }

    #[test]
    fn test_cancel_and_restart_supersedes_running_job() {
        let scheduler = PulseScheduler::new(OverlapPolicy::CancelAndRestart);
        let (motor, enable, direction) = recording_motor();
        let (mut train, _) = train();

        let first = scheduler
            .start_pulse_job(&motor, Direction::Forward, SHORT)
            .unwrap();
        let first_job = scheduler.try_next_job().unwrap();
        let second = scheduler
            .start_pulse_job(&motor, Direction::Reverse, SHORT)
            .unwrap();

        assert_eq!(second.superseded, Some(first.token));
        assert!(!direction.is_high());

        // The stale job notices immediately and does not touch Enable
        let outcome = scheduler.run_job(first_job, &mut train, &motor);
        assert_eq!(outcome, JobOutcome::Superseded { periods: 0 });
        assert!(!enable.is_high());

        let second_job = scheduler.try_next_job().unwrap();
        assert_eq!(second_job.token, second.token);
        let outcome = scheduler.run_job(second_job, &mut train, &motor);
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        assert!(enable.is_high());
    }

    #[test]
    fn test_engage_failure_frees_the_slot() {
        let scheduler = PulseScheduler::new(OverlapPolicy::RejectIfBusy);
        let lines = MotorLines::new(RecordingPin::new(), RecordingPin::new()).unwrap();
        let motor = SharedMotor::new(lines);
        let broken = BrokenMotor;

        let result = scheduler.start_pulse_job(&broken, Direction::Forward, SHORT);
        assert!(matches!(result, Err(ScheduleError::Motor(_))));
        assert!(!scheduler.is_busy());
        assert_eq!(scheduler.try_next_job(), None);

        assert!(
            scheduler
                .start_pulse_job(&motor, Direction::Forward, SHORT)
                .is_ok()
        );
    }

    struct BrokenMotor;

    impl MotorControl for BrokenMotor {
        fn engage(&self, _direction: Direction) -> Result<(), MotorError> {
            Err(MotorError::Pin(MotorLine::Direction))
        }

        fn release(&self) -> Result<(), MotorError> {
            Ok(())
        }

        fn state(&self) -> MotorState {
            MotorState::IDLE
        }
    }

    /// `/ena_f` then `/ena_r` 1 ms later, 1000 ms jobs, observed at 1500 ms.
    /// Time is scaled down 10x.
    fn overlap_scenario(
        policy: OverlapPolicy,
    ) -> (bool, bool, bool, Result<JobTicket, ScheduleError>) {
        let profile = PulseProfile::new(50, 100);
        let scheduler = Arc::new(PulseScheduler::new(policy));
        let (motor, enable, direction) = recording_motor();
        let motor = Arc::new(motor);
        let (mut train, pulse) = train();

        let worker = {
            let scheduler = scheduler.clone();
            let motor = motor.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + embassy_time::Duration::from_millis(300);
                while Instant::now() < deadline {
                    if let Some(job) = scheduler.try_next_job() {
                        scheduler.run_job(job, &mut train, motor.as_ref());
                    }
                }
            })
        };

        scheduler
            .start_pulse_job(motor.as_ref(), Direction::Forward, profile)
            .unwrap();
        thread::sleep(Duration::from_millis(1));
        let second = scheduler.start_pulse_job(motor.as_ref(), Direction::Reverse, profile);

        thread::sleep(Duration::from_millis(150));
        let observed = (enable.is_high(), direction.is_high(), pulse.is_high());
        worker.join().unwrap();

        (observed.0, observed.1, observed.2, second)
    }

    #[test]
    fn test_overlap_reject_if_busy() {
        let (enable_high, direction_high, pulse_high, second) =
            overlap_scenario(OverlapPolicy::RejectIfBusy);

        assert_eq!(second, Err(ScheduleError::Busy));
        assert!(enable_high, "motor disabled after the first job");
        assert!(direction_high, "direction still forward");
        assert!(!pulse_high);
    }

    #[test]
    fn test_overlap_cancel_and_restart() {
        let (enable_high, direction_high, pulse_high, second) =
            overlap_scenario(OverlapPolicy::CancelAndRestart);

        assert!(second.is_ok());
        assert!(enable_high, "motor disabled after the second job");
        assert!(!direction_high, "direction left at reverse");
        assert!(!pulse_high);
    }
}
