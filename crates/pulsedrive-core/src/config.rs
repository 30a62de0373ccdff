//! Device configuration
//!
//! Everything the firmware needs to know at boot lives in [`DeviceConfig`],
//! built once and handed to the components by reference.

use crate::scheduler::OverlapPolicy;

/// Wi-Fi credentials for a single network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCredentials<'a> {
    pub ssid: &'a str,
    pub passphrase: &'a str,
}

impl<'a> LinkCredentials<'a> {
    pub const fn new(ssid: &'a str, passphrase: &'a str) -> Self {
        Self { ssid, passphrase }
    }

    /// A credential set without an SSID is never attempted
    pub const fn is_configured(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// Retry and timing policy for link acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPolicy {
    /// Attempts per credential set before moving on
    pub max_attempts: u8,
    /// Upper bound for a single association attempt
    pub attempt_timeout_ms: u64,
    /// How often the link status is sampled during an attempt
    pub poll_interval_ms: u64,
    /// Pause between two failed attempts
    pub retry_backoff_ms: u64,
}

impl LinkPolicy {
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        attempt_timeout_ms: 10_000,
        poll_interval_ms: 500,
        retry_backoff_ms: 1_000,
    };
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// GPIO numbers of the three motor driver lines
///
/// Enable is active-low on the driver boards this firmware targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAssignment {
    pub enable: u8,
    pub direction: u8,
    pub pulse: u8,
}

impl PinAssignment {
    pub const DEFAULT: Self = Self {
        enable: 4,
        direction: 5,
        pulse: 6,
    };
}

/// Timing of a single pulse job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseProfile {
    /// Time each level (high, then low) is held
    pub half_period_us: u32,
    /// Total run time of the job, measured from the job's own start
    pub duration_ms: u64,
}

impl PulseProfile {
    pub const DEFAULT: Self = Self {
        half_period_us: 500,
        duration_ms: 1_000,
    };

    pub const fn new(half_period_us: u32, duration_ms: u64) -> Self {
        Self {
            half_period_us,
            duration_ms,
        }
    }
}

impl Default for PulseProfile {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Local access point raised when no configured network can be joined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPointSettings<'a> {
    pub ssid: &'a str,
    pub channel: u8,
    pub address: [u8; 4],
    pub prefix_len: u8,
}

impl AccessPointSettings<'_> {
    pub const DEFAULT: AccessPointSettings<'static> = AccessPointSettings {
        ssid: "pulsedrive-setup",
        channel: 6,
        address: [192, 168, 4, 1],
        prefix_len: 24,
    };
}

/// Top-level device configuration
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig<'a> {
    /// Name reported by the liveness route ("<name> Web Server")
    pub service_name: &'a str,
    pub primary: LinkCredentials<'a>,
    pub backup: LinkCredentials<'a>,
    pub link: LinkPolicy,
    pub pins: PinAssignment,
    pub pulse: PulseProfile,
    pub overlap: OverlapPolicy,
    pub http_port: u16,
    pub fallback_ap: Option<AccessPointSettings<'a>>,
}

impl<'a> DeviceConfig<'a> {
    /// Defaults for everything except the credentials
    pub const fn new(primary: LinkCredentials<'a>, backup: LinkCredentials<'a>) -> Self {
        Self {
            service_name: "ESP32",
            primary,
            backup,
            link: LinkPolicy::DEFAULT,
            pins: PinAssignment::DEFAULT,
            pulse: PulseProfile::DEFAULT,
            overlap: OverlapPolicy::RejectIfBusy,
            http_port: 80,
            fallback_ap: Some(AccessPointSettings::DEFAULT),
        }
    }

    pub const fn with_service_name(mut self, service_name: &'a str) -> Self {
        self.service_name = service_name;
        self
    }

    pub const fn with_link_policy(mut self, link: LinkPolicy) -> Self {
        self.link = link;
        self
    }

    pub const fn with_pulse(mut self, pulse: PulseProfile) -> Self {
        self.pulse = pulse;
        self
    }

    pub const fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub const fn with_http_port(mut self, http_port: u16) -> Self {
        self.http_port = http_port;
        self
    }

    pub const fn without_fallback_ap(mut self) -> Self {
        self.fallback_ap = None;
        self
    }
}
