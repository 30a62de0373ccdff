//! Hardware-independent core library for pulsedrive
//!
//! This crate contains all platform-agnostic logic for the networked stepper
//! controller: device configuration, Wi-Fi link acquisition with credential
//! failover, the shared motor control lines, the busy-wait pulse train, the
//! single-slot pulse job scheduler and the plain-text HTTP control endpoint.
//!
//! It is `#![no_std]` so it compiles on both the ESP32-S3 target and desktop
//! hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod http;
pub mod link;
pub mod motor;
pub mod pulse;
pub mod scheduler;
