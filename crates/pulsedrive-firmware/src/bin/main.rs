#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{AnyPin, Level, Output, OutputConfig};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::rng::Rng;
use esp_hal::system::Stack;
use esp_hal::timer::timg::TimerGroup;
use log::{info, warn};
use rtt_target::rprintln;
use static_cell::StaticCell;

use pulsedrive_core::config::DeviceConfig;
use pulsedrive_core::link::LinkManager;
use pulsedrive_core::motor::{MotorLines, SharedMotor};
use pulsedrive_core::pulse::BusyWaitPulseTrain;
use pulsedrive_core::scheduler::PulseScheduler;
use pulsedrive_firmware::FirmwareMotor;
use pulsedrive_firmware::net::{self, AccessPointParts, ControlHandles, STATION_HTTP_WORKERS};
use pulsedrive_firmware::pulse_worker::pulse_worker;
use pulsedrive_firmware::wifi::EspWifiDriver;
use pulsedrive_firmware::wifi_secrets;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static CONFIG: DeviceConfig<'static> =
    DeviceConfig::new(wifi_secrets::PRIMARY, wifi_secrets::BACKUP);

static SCHEDULER: PulseScheduler = PulseScheduler::new(CONFIG.overlap);
static MOTOR: StaticCell<FirmwareMotor> = StaticCell::new();
static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static CORE1_EXECUTOR: StaticCell<esp_rtos::embassy::Executor> = StaticCell::new();

static mut CORE1_STACK: Stack<8192> = Stack::new();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    // Motor lines. Enable starts inactive (high), Direction forward, Pulse low.
    let pins = CONFIG.pins;
    // SAFETY: the motor GPIOs are not handed out anywhere else.
    let (enable, direction, pulse) = unsafe {
        (
            AnyPin::steal(pins.enable),
            AnyPin::steal(pins.direction),
            AnyPin::steal(pins.pulse),
        )
    };
    let enable = Output::new(enable, Level::High, OutputConfig::default());
    let direction = Output::new(direction, Level::High, OutputConfig::default());
    let pulse = Output::new(pulse, Level::Low, OutputConfig::default());

    let lines = MotorLines::new(enable, direction).expect("Failed to drive motor lines");
    let motor: &'static FirmwareMotor = MOTOR.init(SharedMotor::new(lines));
    let train =
        BusyWaitPulseTrain::new(pulse, Delay::new()).expect("Failed to drive the pulse line");

    info!(
        "Motor lines ready (enable=GPIO{}, direction=GPIO{}, pulse=GPIO{})",
        pins.enable, pins.direction, pins.pulse
    );

    // The pulse worker gets core 1 to itself.
    let sw_ints = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start_second_core(
        peripherals.CPU_CTRL,
        sw_ints.software_interrupt0,
        sw_ints.software_interrupt1,
        unsafe { &mut *core::ptr::addr_of_mut!(CORE1_STACK) },
        move || {
            let executor = CORE1_EXECUTOR.init(esp_rtos::embassy::Executor::new());
            executor.run(move |spawner| {
                spawner.spawn(
                    pulse_worker(&SCHEDULER, motor, train).expect("pulse_worker spawn"),
                );
            })
        },
    );

    let radio = RADIO.init(esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller"));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi controller");

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;

    let (station, station_runner) = net::station_stack(interfaces.sta, seed);
    spawner.spawn(net::net_task(station_runner).expect("net_task spawn"));

    let mut link = LinkManager::new(EspWifiDriver::new(wifi_controller, station), CONFIG.link);
    let joined = link
        .acquire_link(&CONFIG.primary, &CONFIG.backup, CONFIG.link.max_attempts)
        .await;

    if let Some(v4) = station.config_v4().filter(|_| joined) {
        info!("Wi-Fi link up: ip={}", v4.address.address());
    }

    let handles = ControlHandles {
        config: &CONFIG,
        motor,
        scheduler: &SCHEDULER,
    };

    // The control endpoint comes up whether or not a network was joined.
    for worker_id in 0..STATION_HTTP_WORKERS {
        spawner.spawn(net::http_worker(station, handles, worker_id).expect("http_worker spawn"));
    }

    if !joined {
        warn!("No network joined");
    }
    let access_point = CONFIG.fallback_ap.map(|_| AccessPointParts {
        device: interfaces.ap,
        seed,
    });
    spawner.spawn(
        net::link_supervisor(spawner, link, access_point, handles)
            .expect("link_supervisor spawn"),
    );

    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}
