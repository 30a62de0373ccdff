//! ESP32-S3 firmware-specific modules for pulsedrive
//!
//! This crate contains the code that only builds for the device: the
//! esp-radio Wi-Fi driver, the embassy-net tasks serving the control
//! endpoint, the fallback access point and the core-1 pulse worker.

#![no_std]

extern crate alloc;

pub mod net;
pub mod pulse_worker;
pub mod wifi;
pub mod wifi_secrets;

use esp_hal::gpio::Output;
use pulsedrive_core::motor::SharedMotor;

/// Enable and Direction lines as wired on the device
pub type FirmwareMotor = SharedMotor<Output<'static>, Output<'static>>;
