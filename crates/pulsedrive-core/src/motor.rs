//! Motor driver control lines
//!
//! The Enable and Direction lines are written by request handlers and (for
//! Enable) by the pulse job when it finishes, so they live behind a
//! [`SharedMotor`]. The Pulse line is not part of this module: it is owned
//! outright by the pulse train of the worker that runs the jobs.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_hal::digital::OutputPin;
use thiserror_no_std::Error;

/// Rotation direction requested by the control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Forward => "Forward",
            Self::Reverse => "Reverse",
        }
    }

    /// Logic level driven on the Direction line (true = high)
    pub const fn level(self) -> bool {
        match self {
            Self::Forward => true,
            Self::Reverse => false,
        }
    }
}

/// Last state written to the control lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorState {
    pub enabled: bool,
    pub direction: Direction,
}

impl MotorState {
    pub const IDLE: Self = Self {
        enabled: false,
        direction: Direction::Forward,
    };
}

/// Identifies which output failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorLine {
    Enable,
    Direction,
    Pulse,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorError {
    #[error("failed to drive the {0:?} line")]
    Pin(MotorLine),
}

/// Enable + Direction outputs and the state they represent
pub struct MotorLines<EN, DIR> {
    enable: EN,
    direction: DIR,
    state: MotorState,
}

impl<EN, DIR> MotorLines<EN, DIR>
where
    EN: OutputPin,
    DIR: OutputPin,
{
    /// Take ownership of the lines and drive them to the idle state
    /// (Enable inactive, Direction forward).
    pub fn new(enable: EN, direction: DIR) -> Result<Self, MotorError> {
        let mut lines = Self {
            enable,
            direction,
            state: MotorState::IDLE,
        };
        lines.write_direction(Direction::Forward)?;
        lines.write_enable(false)?;
        Ok(lines)
    }

    /// Set the direction, then assert Enable (active-low)
    pub fn engage(&mut self, direction: Direction) -> Result<(), MotorError> {
        self.write_direction(direction)?;
        self.state.direction = direction;
        self.write_enable(true)?;
        self.state.enabled = true;
        Ok(())
    }

    /// Deassert Enable; Direction keeps its last level
    pub fn release(&mut self) -> Result<(), MotorError> {
        self.write_enable(false)?;
        self.state.enabled = false;
        Ok(())
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    fn write_enable(&mut self, active: bool) -> Result<(), MotorError> {
        // Active-low: driving the line low enables the driver stage.
        let result = if active {
            self.enable.set_low()
        } else {
            self.enable.set_high()
        };
        result.map_err(|_| MotorError::Pin(MotorLine::Enable))
    }

    fn write_direction(&mut self, direction: Direction) -> Result<(), MotorError> {
        let result = if direction.level() {
            self.direction.set_high()
        } else {
            self.direction.set_low()
        };
        result.map_err(|_| MotorError::Pin(MotorLine::Direction))
    }
}

/// Access to the Enable/Direction lines from any context
///
/// Implemented by [`SharedMotor`]; the scheduler and the control endpoint
/// only depend on this trait so they can be exercised without real pins.
pub trait MotorControl {
    fn engage(&self, direction: Direction) -> Result<(), MotorError>;
    fn release(&self) -> Result<(), MotorError>;
    fn state(&self) -> MotorState;
}

/// Interrupt- and multicore-safe wrapper around [`MotorLines`]
pub struct SharedMotor<EN, DIR> {
    lines: Mutex<CriticalSectionRawMutex, RefCell<MotorLines<EN, DIR>>>,
}

impl<EN, DIR> SharedMotor<EN, DIR> {
    pub const fn new(lines: MotorLines<EN, DIR>) -> Self {
        Self {
            lines: Mutex::new(RefCell::new(lines)),
        }
    }
}

impl<EN, DIR> MotorControl for SharedMotor<EN, DIR>
where
    EN: OutputPin,
    DIR: OutputPin,
{
    fn engage(&self, direction: Direction) -> Result<(), MotorError> {
        self.lines.lock(|lines| lines.borrow_mut().engage(direction))
    }

    fn release(&self) -> Result<(), MotorError> {
        self.lines.lock(|lines| lines.borrow_mut().release())
    }

    fn state(&self) -> MotorState {
        self.lines.lock(|lines| lines.borrow().state())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording pins shared by the unit tests of this crate.

    extern crate std;

    use core::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Output pin whose level and edge count can be inspected from the test
    #[derive(Clone, Default)]
    pub struct RecordingPin {
        high: Arc<AtomicBool>,
        rising_edges: Arc<AtomicUsize>,
        writes: Arc<AtomicUsize>,
    }

    impl RecordingPin {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn is_high(&self) -> bool {
            self.high.load(Ordering::SeqCst)
        }

        pub fn rising_edges(&self) -> usize {
            self.rising_edges.load(Ordering::SeqCst)
        }

        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl embedded_hal::digital::ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl embedded_hal::digital::OutputPin for RecordingPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.high.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if !self.high.swap(true, Ordering::SeqCst) {
                self.rising_edges.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    /// Pin that refuses every write
    pub struct BrokenPin;

    #[derive(Debug)]
    pub struct BrokenPinError;

    impl embedded_hal::digital::Error for BrokenPinError {
        fn kind(&self) -> embedded_hal::digital::ErrorKind {
            embedded_hal::digital::ErrorKind::Other
        }
    }

    impl embedded_hal::digital::ErrorType for BrokenPin {
        type Error = BrokenPinError;
    }

    impl embedded_hal::digital::OutputPin for BrokenPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Err(BrokenPinError)
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            Err(BrokenPinError)
        }
    }

    pub type RecordingMotor = super::SharedMotor<RecordingPin, RecordingPin>;

    /// Motor on recording pins plus handles to observe (enable, direction)
    pub fn recording_motor() -> (RecordingMotor, RecordingPin, RecordingPin) {
        let enable = RecordingPin::new();
        let direction = RecordingPin::new();
        let lines = super::MotorLines::new(enable.clone(), direction.clone())
            .expect("recording pins are infallible");
        (super::SharedMotor::new(lines), enable, direction)
    }
}
