//! Desktop simulator for the pulsedrive networked stepper controller.
//!
//! Runs the core link manager, scheduler and control endpoint on the host:
//! the radio is simulated, motor lines are logging pins and the endpoint is
//! served over a std TCP listener. Pulse jobs run on their own thread, the
//! way they get their own core on the device.
//!
//! # Environment
//!
//! | Variable                   | Meaning                                        |
//! |----------------------------|------------------------------------------------|
//! | `PULSEDRIVE_SIM_REACHABLE` | Comma-separated SSIDs the radio can join       |
//! | `PULSEDRIVE_SIM_BIND`      | Listen address, default `127.0.0.1:8080`       |
//! | `PULSEDRIVE_PRIMARY_SSID`  | Primary network, default `sim-primary`         |
//! | `PULSEDRIVE_BACKUP_SSID`   | Backup network, default `sim-backup`           |
//! | `RUST_LOG`                 | env_logger filter                              |

use std::convert::Infallible;
use std::fmt;
use std::io::{self, Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use embassy_futures::block_on;
use embassy_time::{Delay, Timer};
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_io_async::{ErrorType, Read, Write};
use log::{debug, info, trace, warn};

use pulsedrive_core::config::{DeviceConfig, LinkCredentials, LinkPolicy};
use pulsedrive_core::http::{ControlService, serve_connection};
use pulsedrive_core::link::{LinkManager, WifiDriver};
use pulsedrive_core::motor::{MotorLines, SharedMotor};
use pulsedrive_core::pulse::BusyWaitPulseTrain;
use pulsedrive_core::scheduler::PulseScheduler;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Time the simulated radio takes to associate
const ASSOCIATION_DELAY_MS: u64 = 150;

/// Shorter than the device policy so a failing boot takes seconds, not minutes
const SIM_LINK_POLICY: LinkPolicy = LinkPolicy {
    max_attempts: 5,
    attempt_timeout_ms: 1_000,
    poll_interval_ms: 50,
    retry_backoff_ms: 200,
};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Simulated radio
// ---------------------------------------------------------------------------

/// Radio that can only see the SSIDs it was given
struct SimulatedRadio {
    reachable: Vec<String>,
    joined: bool,
}

impl SimulatedRadio {
    fn new(reachable: Vec<String>) -> Self {
        Self {
            reachable,
            joined: false,
        }
    }
}

impl WifiDriver for SimulatedRadio {
    type Error = Infallible;

    async fn begin(&mut self, credentials: &LinkCredentials<'_>) -> Result<(), Self::Error> {
        Timer::after_millis(ASSOCIATION_DELAY_MS).await;
        self.joined = self.reachable.iter().any(|ssid| ssid == credentials.ssid);
        debug!(
            "Simulated radio: \"{}\" {}",
            credentials.ssid,
            if self.joined { "in range" } else { "not in range" }
        );
        Ok(())
    }

    async fn is_connected(&mut self) -> bool {
        self.joined
    }

    async fn disconnect(&mut self) {
        self.joined = false;
    }
}

fn parse_reachable(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|ssid| !ssid.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Logging pins
// ---------------------------------------------------------------------------

/// Output pin that logs level changes
struct SimPin {
    name: &'static str,
    high: bool,
    rising_edges: Option<&'static AtomicU32>,
}

impl SimPin {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            high: false,
            rising_edges: None,
        }
    }

    /// Pin that also counts its rising edges into `counter`
    fn counting(name: &'static str, counter: &'static AtomicU32) -> Self {
        Self {
            rising_edges: Some(counter),
            ..Self::new(name)
        }
    }

    fn set(&mut self, high: bool) {
        if let Some(counter) = self.rising_edges.filter(|_| high && !self.high) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if high != self.high {
            trace!("{} -> {}", self.name, if high { "HIGH" } else { "LOW" });
        }
        self.high = high;
    }
}

/// Motor lines log at info; the pulse line is too chatty for that
struct LoudPin(SimPin);

impl PinErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}

impl PinErrorType for LoudPin {
    type Error = Infallible;
}

impl OutputPin for LoudPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        info!("{} LOW", self.0.name);
        self.0.set_low()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        info!("{} HIGH", self.0.name);
        self.0.set_high()
    }
}

// ---------------------------------------------------------------------------
// TCP connection
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ConnectionError(io::Error);

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ConnectionError {}

impl embedded_io::Error for ConnectionError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                embedded_io::ErrorKind::TimedOut
            }
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// Blocking std stream behind the async I/O traits the endpoint expects
struct Connection(TcpStream);

impl ErrorType for Connection {
    type Error = ConnectionError;
}

impl Read for Connection {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf).map_err(ConnectionError)
    }
}

impl Write for Connection {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf).map_err(ConnectionError)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush().map_err(ConnectionError)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

static PULSE_EDGES: AtomicU32 = AtomicU32::new(0);

type SimMotor = SharedMotor<LoudPin, LoudPin>;

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Run link acquisition the way the device boots.
///
/// The result only decides what gets logged: the endpoint is served either way.
async fn bring_up_link<W: WifiDriver>(
    link: &mut LinkManager<W>,
    config: &DeviceConfig<'_>,
) -> bool {
    let joined = link
        .acquire_link(&config.primary, &config.backup, config.link.max_attempts)
        .await;
    match link.connected_with() {
        Some(slot) if joined => info!("Link up using the {} network", slot.label()),
        _ => warn!("No network joined; serving anyway"),
    }
    joined
}

fn sim_motor() -> io::Result<SimMotor> {
    let lines = MotorLines::new(
        LoudPin(SimPin::new("ENABLE")),
        LoudPin(SimPin::new("DIRECTION")),
    )
    .map_err(|e| io::Error::other(e.to_string()))?;
    Ok(SharedMotor::new(lines))
}

fn serve_stream(stream: TcpStream, service: &ControlService<'_, SimMotor>) {
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        warn!("Could not set read timeout: {}", e);
    }

    let mut conn = Connection(stream);
    if let Err(e) = block_on(serve_connection(&mut conn, service)) {
        warn!("Connection error: {}", e);
    }
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting pulsedrive simulator");

    let primary_ssid = env_or("PULSEDRIVE_PRIMARY_SSID", "sim-primary");
    let backup_ssid = env_or("PULSEDRIVE_BACKUP_SSID", "sim-backup");
    let reachable = parse_reachable(&env_or("PULSEDRIVE_SIM_REACHABLE", &backup_ssid));
    let bind = env_or("PULSEDRIVE_SIM_BIND", DEFAULT_BIND);

    let config = DeviceConfig::new(
        LinkCredentials::new(&primary_ssid, "simulated"),
        LinkCredentials::new(&backup_ssid, "simulated"),
    )
    .with_service_name("Simulator")
    .with_link_policy(SIM_LINK_POLICY)
    .without_fallback_ap();

    info!("Simulated radio can reach: {:?}", reachable);

    let mut link = LinkManager::new(SimulatedRadio::new(reachable), config.link);
    block_on(bring_up_link(&mut link, &config));

    let motor = sim_motor()?;
    let scheduler = PulseScheduler::new(config.overlap);
    let mut train = BusyWaitPulseTrain::new(SimPin::counting("PULSE", &PULSE_EDGES), Delay)
        .map_err(|e| io::Error::other(e.to_string()))?;

    let listener = TcpListener::bind(&bind)?;
    info!("Control endpoint listening on http://{}", bind);

    std::thread::scope(|scope| {
        // Pulse worker
        scope.spawn(|| {
            loop {
                let job = block_on(scheduler.next_job());
                let before = PULSE_EDGES.load(Ordering::Relaxed);
                let outcome = scheduler.run_job(job, &mut train, &motor);
                info!(
                    "Pulse job {}: {:?} ({} edges on PULSE)",
                    job.token,
                    outcome,
                    PULSE_EDGES.load(Ordering::Relaxed).wrapping_sub(before)
                );
            }
        });

        let service = ControlService::new(config.service_name, &motor, &scheduler, config.pulse);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => serve_stream(stream, &service),
                Err(e) => warn!("Accept error: {}", e),
            }
        }
    });

    Ok(())
}
