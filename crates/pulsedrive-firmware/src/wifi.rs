//! esp-radio backed [`WifiDriver`]

use alloc::string::ToString;

use embassy_net::Stack;
use esp_radio::wifi::{
    AccessPointConfig, AuthMethod, ClientConfig, ModeConfig, WifiController, WifiError,
    WifiEvent,
};
use log::{debug, info, warn};
use pulsedrive_core::config::{AccessPointSettings, LinkCredentials};
use pulsedrive_core::link::WifiDriver;

/// Station-mode driver over the esp-radio controller.
///
/// A link only counts as connected once the station stack also has an IPv4
/// configuration, so the control endpoint is reachable when `acquire_link`
/// reports success.
pub struct EspWifiDriver {
    controller: WifiController<'static>,
    stack: Stack<'static>,
}

impl EspWifiDriver {
    pub fn new(controller: WifiController<'static>, stack: Stack<'static>) -> Self {
        Self { controller, stack }
    }

    /// Resolves when the station loses its association
    pub async fn wait_for_disconnect(&mut self) {
        self.controller
            .wait_for_event(WifiEvent::StaDisconnected)
            .await;
    }

    /// Switch the radio from station to access-point mode
    pub async fn start_access_point(
        &mut self,
        settings: &AccessPointSettings<'_>,
    ) -> Result<(), WifiError> {
        if matches!(self.controller.is_started(), Ok(true)) {
            self.controller.stop_async().await?;
        }

        let config = ModeConfig::AccessPoint(
            AccessPointConfig::default()
                .with_ssid(settings.ssid.to_string())
                .with_auth_method(AuthMethod::None)
                .with_channel(settings.channel),
        );
        self.controller.set_config(&config)?;
        self.controller.start_async().await?;

        info!(
            "Access point \"{}\" up on channel {}",
            settings.ssid, settings.channel
        );
        Ok(())
    }
}

impl WifiDriver for EspWifiDriver {
    type Error = WifiError;

    async fn begin(&mut self, credentials: &LinkCredentials<'_>) -> Result<(), Self::Error> {
        let mut client = ClientConfig::default()
            .with_ssid(credentials.ssid.to_string())
            .with_password(credentials.passphrase.to_string());
        if credentials.passphrase.is_empty() {
            client = client.with_auth_method(AuthMethod::None);
        }
        self.controller.set_config(&ModeConfig::Client(client))?;

        if !matches!(self.controller.is_started(), Ok(true)) {
            debug!("Starting Wi-Fi STA");
            self.controller.start_async().await?;
        }

        self.controller.connect_async().await
    }

    async fn is_connected(&mut self) -> bool {
        matches!(self.controller.is_connected(), Ok(true)) && self.stack.is_config_up()
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.controller.disconnect_async().await {
            warn!("Wi-Fi disconnect error: {:?}", e);
        }
    }
}
