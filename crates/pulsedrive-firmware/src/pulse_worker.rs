//! Core-1 pulse worker
//!
//! Runs alone on the second core's embassy executor; `run_job` blocks that
//! executor for the whole job.

use embassy_time::Instant;
use esp_hal::delay::Delay;
use esp_hal::gpio::Output;
use log::{debug, info};
use pulsedrive_core::pulse::BusyWaitPulseTrain;
use pulsedrive_core::scheduler::PulseScheduler;

use crate::FirmwareMotor;

pub type FirmwarePulseTrain = BusyWaitPulseTrain<Output<'static>, Delay>;

#[embassy_executor::task]
pub async fn pulse_worker(
    scheduler: &'static PulseScheduler,
    motor: &'static FirmwareMotor,
    mut train: FirmwarePulseTrain,
) {
    info!("Pulse worker running on core 1");

    loop {
        let job = scheduler.next_job().await;
        let started = Instant::now();

        let outcome = scheduler.run_job(job, &mut train, motor);
        debug!(
            "Pulse job {} returned {:?} after {} ms",
            job.token,
            outcome,
            started.elapsed().as_millis()
        );
    }
}
