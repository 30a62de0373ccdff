//! Pulse-train generation
//!
//! [`PulseTrain`] is the seam between the scheduler and whatever actually
//! produces the step signal. The stock implementation,
//! [`BusyWaitPulseTrain`], is a deliberate tight loop: it never yields to an
//! executor, so it must run on a core (or thread) of its own.

use embassy_time::Instant;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::config::PulseProfile;
use crate::motor::{MotorError, MotorLine};

/// Why a pulse train returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainEnd {
    /// The full duration elapsed
    Completed,
    /// The caller asked the train to stop early
    Interrupted,
}

/// Summary of one pulse train run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainReport {
    pub end: TrainEnd,
    /// Number of full high/low periods emitted
    pub periods: u32,
    pub elapsed_ms: u64,
}

/// Generator of a square wave on the motor's Pulse line
pub trait PulseTrain {
    /// Emit periods of `2 * half_period_us` for `duration_ms`, measured from
    /// the moment this call starts. `keep_running` is consulted once per
    /// period; returning false stops the train with the line left low.
    fn run<F>(&mut self, profile: &PulseProfile, keep_running: F) -> Result<TrainReport, MotorError>
    where
        F: FnMut() -> bool;
}

/// Busy-wait pulse train driven by a blocking microsecond delay
pub struct BusyWaitPulseTrain<P, D> {
    pin: P,
    delay: D,
}

impl<P, D> BusyWaitPulseTrain<P, D>
where
    P: OutputPin,
    D: DelayNs,
{
    /// Take the Pulse line and park it low
    pub fn new(mut pin: P, delay: D) -> Result<Self, MotorError> {
        pin.set_low().map_err(|_| MotorError::Pin(MotorLine::Pulse))?;
        Ok(Self { pin, delay })
    }

    fn high(&mut self) -> Result<(), MotorError> {
        self.pin
            .set_high()
            .map_err(|_| MotorError::Pin(MotorLine::Pulse))
    }

    fn low(&mut self) -> Result<(), MotorError> {
        self.pin
            .set_low()
            .map_err(|_| MotorError::Pin(MotorLine::Pulse))
    }
}

impl<P, D> PulseTrain for BusyWaitPulseTrain<P, D>
where
    P: OutputPin,
    D: DelayNs,
{
    fn run<F>(
        &mut self,
        profile: &PulseProfile,
        mut keep_running: F,
    ) -> Result<TrainReport, MotorError>
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        let mut periods: u32 = 0;
        let mut end = TrainEnd::Completed;

        while start.elapsed().as_millis() < profile.duration_ms {
            if !keep_running() {
                end = TrainEnd::Interrupted;
                break;
            }

            self.high()?;
            self.delay.delay_us(profile.half_period_us);
            self.low()?;
            self.delay.delay_us(profile.half_period_us);
            periods = periods.wrapping_add(1);
        }

        Ok(TrainReport {
            end,
            periods,
            elapsed_ms: start.elapsed().as_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::testing::{BrokenPin, RecordingPin};
    use embassy_time::Delay;

    #[test]
    fn test_runs_for_the_requested_duration() {
        let pin = RecordingPin::new();
        let mut train = BusyWaitPulseTrain::new(pin.clone(), Delay).unwrap();

        let report = train.run(&PulseProfile::new(100, 30), || true).unwrap();

        assert_eq!(report.end, TrainEnd::Completed);
        assert!(report.elapsed_ms >= 30);
        assert!(report.periods > 0);
        assert_eq!(pin.rising_edges(), report.periods as usize);
        assert!(!pin.is_high(), "train must leave the line low");
    }

    #[test]
    fn test_each_period_is_at_least_two_half_periods() {
        let pin = RecordingPin::new();
        let mut train = BusyWaitPulseTrain::new(pin, Delay).unwrap();

        let report = train.run(&PulseProfile::new(1_000, 20), || true).unwrap();

        // 2 ms per period over 20 ms, plus one period started just before the deadline
        assert!(report.periods <= 11, "got {} periods", report.periods);
    }

    #[test]
    fn test_stops_when_asked() {
        let pin = RecordingPin::new();
        let mut train = BusyWaitPulseTrain::new(pin.clone(), Delay).unwrap();

        let mut budget = 3;
        let report = train
            .run(&PulseProfile::new(10, 10_000), || {
                budget -= 1;
                budget >= 0
            })
            .unwrap();

        assert_eq!(report.end, TrainEnd::Interrupted);
        assert_eq!(report.periods, 3);
        assert!(report.elapsed_ms < 10_000);
        assert!(!pin.is_high());
    }

    #[test]
    fn test_zero_duration_emits_nothing() {
        let pin = RecordingPin::new();
        let mut train = BusyWaitPulseTrain::new(pin.clone(), Delay).unwrap();

        let report = train.run(&PulseProfile::new(10, 0), || true).unwrap();

        assert_eq!(report.periods, 0);
        assert_eq!(pin.rising_edges(), 0);
    }

    #[test]
    fn test_broken_pulse_line() {
        let result = BusyWaitPulseTrain::new(BrokenPin, Delay);
        assert_eq!(result.err(), Some(MotorError::Pin(MotorLine::Pulse)));
    }
}
