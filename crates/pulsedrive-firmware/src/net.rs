//! Network tasks: stack runners, HTTP workers, link supervision and the
//! fallback access point's DHCP server

use core::fmt;
use core::net::Ipv4Addr;

use edge_dhcp::server::{Server as DhcpServer, ServerOptions as DhcpServerOptions};
use edge_dhcp::{Options as DhcpOptions, Packet as DhcpPacket};
use embassy_net::tcp::{self, TcpSocket};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_executor::{SpawnError, Spawner};
use embassy_net::{Config, Ipv4Address, Ipv4Cidr, Runner, Stack, StackResources, StaticConfigV4};
use embassy_time::{Duration, Timer};
use embedded_io_async::{ErrorType, Read, Write};
use esp_radio::wifi::{WifiDevice, WifiError};
use log::{info, warn};
use pulsedrive_core::config::{AccessPointSettings, DeviceConfig};
use pulsedrive_core::http::{ControlService, serve_connection};
use pulsedrive_core::link::{LinkManager, LinkState, Recovery};
use pulsedrive_core::scheduler::PulseScheduler;
use static_cell::StaticCell;
use thiserror_no_std::Error;

use crate::FirmwareMotor;
use crate::wifi::EspWifiDriver;

/// Workers accepting on the station stack
pub const STATION_HTTP_WORKERS: usize = 2;
const HTTP_WORKER_POOL: usize = STATION_HTTP_WORKERS + 1;

/// Pause before re-acquiring a lost link
const RELINK_DELAY_MS: u64 = 5_000;

const DHCP_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

static STATION_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static AP_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();

pub type NetRunner = Runner<'static, WifiDevice<'static>>;

/// Shared state every HTTP worker serves from
#[derive(Clone, Copy)]
pub struct ControlHandles {
    pub config: &'static DeviceConfig<'static>,
    pub motor: &'static FirmwareMotor,
    pub scheduler: &'static PulseScheduler,
}

/// What the fallback access point is built from, held until it is needed
pub struct AccessPointParts {
    pub device: WifiDevice<'static>,
    pub seed: u64,
}

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("radio refused access-point mode: {0:?}")]
    Radio(WifiError),
    #[error("failed to spawn access-point task: {0:?}")]
    Spawn(SpawnError),
}

impl From<SpawnError> for FallbackError {
    fn from(e: SpawnError) -> Self {
        FallbackError::Spawn(e)
    }
}

/// Station stack, configured through DHCP
pub fn station_stack(device: WifiDevice<'static>, seed: u64) -> (Stack<'static>, NetRunner) {
    embassy_net::new(
        device,
        Config::dhcpv4(Default::default()),
        STATION_RESOURCES.init(StackResources::new()),
        seed,
    )
}

/// Access-point stack with the static address from `settings`
pub fn access_point_stack(
    device: WifiDevice<'static>,
    settings: &AccessPointSettings<'_>,
    seed: u64,
) -> (Stack<'static>, NetRunner) {
    let [a, b, c, d] = settings.address;
    let address = Ipv4Address::new(a, b, c, d);
    let config = Config::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(address, settings.prefix_len),
        gateway: Some(address),
        dns_servers: Default::default(),
    });

    embassy_net::new(device, config, AP_RESOURCES.init(StackResources::new()), seed)
}

#[embassy_executor::task(pool_size = 2)]
pub async fn net_task(mut runner: NetRunner) {
    runner.run().await;
}

// ----------------------------------------------------------------------------
// HTTP
// ----------------------------------------------------------------------------

/// embedded-io-async view of a TCP socket
///
/// embassy-net implements an older embedded-io-async; this forwards to the
/// socket's inherent async methods.
pub struct SocketIo<'s, 'a> {
    socket: &'s mut TcpSocket<'a>,
}

impl<'s, 'a> SocketIo<'s, 'a> {
    pub fn new(socket: &'s mut TcpSocket<'a>) -> Self {
        Self { socket }
    }
}

#[derive(Debug)]
pub struct SocketError(pub tcp::Error);

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp error: {:?}", self.0)
    }
}

impl core::error::Error for SocketError {}

impl embedded_io::Error for SocketError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0 {
            tcp::Error::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl ErrorType for SocketIo<'_, '_> {
    type Error = SocketError;
}

impl Read for SocketIo<'_, '_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.socket.read(buf).await.map_err(SocketError)
    }
}

impl Write for SocketIo<'_, '_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.socket.write(buf).await.map_err(SocketError)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.socket.flush().await.map_err(SocketError)
    }
}

#[embassy_executor::task(pool_size = HTTP_WORKER_POOL)]
pub async fn http_worker(stack: Stack<'static>, handles: ControlHandles, worker_id: usize) {
    let ControlHandles {
        config,
        motor,
        scheduler,
    } = handles;
    let service = ControlService::new(config.service_name, motor, scheduler, config.pulse);
    let mut rx_buf = [0u8; 1024];
    let mut tx_buf = [0u8; 512];

    info!(
        "HTTP worker {} starting (port={})",
        worker_id, config.http_port
    );

    loop {
        stack.wait_config_up().await;

        let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
        socket.set_timeout(Some(Duration::from_secs(10)));

        match socket.accept(config.http_port).await {
            Ok(()) => {
                let mut io = SocketIo::new(&mut socket);
                if let Err(e) = serve_connection(&mut io, &service).await {
                    warn!("HTTP worker {} connection error: {}", worker_id, e);
                }
                socket.close();
                // Let the response drain before the socket is dropped
                let _ = socket.flush().await;
            }
            Err(e) => {
                warn!("HTTP worker {} accept error: {:?}", worker_id, e);
                Timer::after_millis(200).await;
            }
        }

        socket.abort();
    }
}

// ----------------------------------------------------------------------------
// Wi-Fi link
// ----------------------------------------------------------------------------

/// Switch the radio to access-point mode and serve the endpoint there.
///
/// Spawns the access-point stack runner, its DHCP server and one HTTP worker.
pub async fn fall_back_to_access_point(
    spawner: Spawner,
    driver: &mut EspWifiDriver,
    parts: AccessPointParts,
    settings: AccessPointSettings<'static>,
    handles: ControlHandles,
) -> Result<(), FallbackError> {
    driver
        .start_access_point(&settings)
        .await
        .map_err(FallbackError::Radio)?;

    let (ap, ap_runner) = access_point_stack(parts.device, &settings, parts.seed);
    spawner.spawn(net_task(ap_runner)?);
    spawner.spawn(dhcp_server(ap, settings)?);
    spawner.spawn(http_worker(ap, handles, STATION_HTTP_WORKERS)?);

    let [a, b, c, d] = settings.address;
    info!(
        "Control endpoint reachable on \"{}\" at {}.{}.{}.{}",
        settings.ssid, a, b, c, d
    );
    Ok(())
}

/// Owns the radio after boot.
///
/// Re-acquires the station link whenever it drops. Once both networks are
/// exhausted, at boot or later, the radio moves to the fallback access point
/// if `access_point` is set, and the supervisor then holds the controller.
#[embassy_executor::task]
pub async fn link_supervisor(
    spawner: Spawner,
    mut link: LinkManager<EspWifiDriver>,
    mut access_point: Option<AccessPointParts>,
    handles: ControlHandles,
) {
    let config = handles.config;
    let mut recovery = match link.state() {
        LinkState::Connected => Recovery::Rejoined,
        _ if access_point.is_some() => Recovery::FallBack,
        _ => Recovery::Retry,
    };

    loop {
        match recovery {
            Recovery::Rejoined => {
                link.driver_mut().wait_for_disconnect().await;
                warn!("Wi-Fi station disconnected; will retry");
                link.mark_disconnected();
            }
            Recovery::FallBack => {
                if let (Some(parts), Some(settings)) = (access_point.take(), config.fallback_ap) {
                    match fall_back_to_access_point(
                        spawner,
                        link.driver_mut(),
                        parts,
                        settings,
                        handles,
                    )
                    .await
                    {
                        Ok(()) => core::future::pending::<()>().await,
                        Err(e) => warn!("Fallback access point unavailable: {}", e),
                    }
                }
            }
            Recovery::Retry => {}
        }

        Timer::after_millis(RELINK_DELAY_MS).await;
        recovery = link
            .recover(
                &config.primary,
                &config.backup,
                config.link.max_attempts,
                access_point.is_some(),
            )
            .await;
    }
}

/// Hands out leases on the fallback access point's subnet
#[embassy_executor::task]
pub async fn dhcp_server(stack: Stack<'static>, settings: AccessPointSettings<'static>) {
    stack.wait_config_up().await;

    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buffer = [0u8; 600];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_buffer = [0u8; 600];

    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(e) = socket.bind(DHCP_PORT) {
        warn!("DHCP server could not bind port {}: {:?}", DHCP_PORT, e);
        return;
    }

    let [a, b, c, _] = settings.address;
    let server_ip = Ipv4Addr::from(settings.address);
    let mut gw_buf = [Ipv4Addr::UNSPECIFIED; 1];
    let server_options = DhcpServerOptions::new(server_ip, Some(&mut gw_buf));

    let mut server = DhcpServer::<_, 8>::new_with_et(server_ip);
    server.range_start = Ipv4Addr::new(a, b, c, 50);
    server.range_end = Ipv4Addr::new(a, b, c, 200);

    info!("DHCP server running on {}:{}", server_ip, DHCP_PORT);

    let mut buf = [0u8; 600];
    let mut reply_buf = [0u8; 600];

    loop {
        let (len, _meta) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => continue,
        };

        let request = match DhcpPacket::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("DHCP decode error: {:?}", e);
                continue;
            }
        };

        let mut opt_buf = DhcpOptions::buf();
        let Some(reply) = server.handle_request(&mut opt_buf, &server_options, &request) else {
            continue;
        };

        match reply.encode(&mut reply_buf) {
            Ok(encoded) => {
                let dest = (Ipv4Address::BROADCAST, DHCP_CLIENT_PORT);
                if let Err(e) = socket.send_to(encoded, dest).await {
                    warn!("DHCP send error: {:?}", e);
                }
            }
            Err(e) => warn!("DHCP encode error: {:?}", e),
        }
    }
}
