//! Wi-Fi link acquisition with primary/backup failover
//!
//! [`LinkManager`] owns the [`LinkState`] and drives a [`WifiDriver`]. It never
//! fails loudly: every outcome collapses to a `bool` the boot sequence logs
//! and then ignores, so the control endpoint comes up either way.

use core::fmt::Debug;

use embassy_time::{Duration, Instant, Timer, with_deadline};
use log::{debug, info, warn};

use crate::config::{LinkCredentials, LinkPolicy};

/// Association state of the station interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Radio abstraction used by the link manager
pub trait WifiDriver {
    type Error: Debug;

    /// Configure the station for `credentials` and start associating.
    ///
    /// May return before the link is usable; the manager polls
    /// [`WifiDriver::is_connected`] afterwards.
    fn begin(
        &mut self,
        credentials: &LinkCredentials<'_>,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Whether the link is associated and has an address
    fn is_connected(&mut self) -> impl Future<Output = bool>;

    /// Drop a half-open association after a failed attempt
    fn disconnect(&mut self) -> impl Future<Output = ()>;
}

/// Result of re-running acquisition after the link was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// A configured network was joined again
    Rejoined,
    /// Both networks are exhausted and a fallback access point can be raised
    FallBack,
    /// Both networks are exhausted and there is nothing to fall back to
    Retry,
}

/// Which credential set an attempt used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSlot {
    Primary,
    Backup,
}

impl CredentialSlot {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
        }
    }
}

/// Owns the radio driver and the link state
pub struct LinkManager<W> {
    driver: W,
    policy: LinkPolicy,
    state: LinkState,
    connected_with: Option<CredentialSlot>,
}

impl<W: WifiDriver> LinkManager<W> {
    pub fn new(driver: W, policy: LinkPolicy) -> Self {
        Self {
            driver,
            policy,
            state: LinkState::Disconnected,
            connected_with: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Credential set of the current link, if connected
    pub fn connected_with(&self) -> Option<CredentialSlot> {
        self.connected_with
    }

    pub fn driver(&self) -> &W {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut W {
        &mut self.driver
    }

    /// Mark the link as lost after the driver reported a disconnect
    pub fn mark_disconnected(&mut self) {
        self.state = LinkState::Disconnected;
        self.connected_with = None;
    }

    /// One association attempt bounded by `timeout_ms`.
    ///
    /// Polls the driver every `poll_interval_ms` until it reports a usable
    /// link or the timeout elapses.
    pub async fn connect(&mut self, credentials: &LinkCredentials<'_>, timeout_ms: u64) -> bool {
        self.state = LinkState::Connecting;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        match with_deadline(deadline, self.driver.begin(credentials)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Wi-Fi begin failed for \"{}\": {:?}", credentials.ssid, e);
                return self.fail_attempt().await;
            }
            Err(_) => {
                warn!("Wi-Fi begin timed out for \"{}\"", credentials.ssid);
                return self.fail_attempt().await;
            }
        }

        loop {
            if self.driver.is_connected().await {
                self.state = LinkState::Connected;
                return true;
            }
            if Instant::now() >= deadline {
                debug!("Wi-Fi \"{}\" not up within {} ms", credentials.ssid, timeout_ms);
                return self.fail_attempt().await;
            }
            let next_poll = Instant::now() + Duration::from_millis(self.policy.poll_interval_ms);
            Timer::at(deadline.min(next_poll)).await;
        }
    }

    /// Try `primary` up to `max_attempts` times, then `backup` up to
    /// `max_attempts` times. Returns true on the first successful attempt.
    pub async fn acquire_link(
        &mut self,
        primary: &LinkCredentials<'_>,
        backup: &LinkCredentials<'_>,
        max_attempts: u8,
    ) -> bool {
        for (slot, credentials) in [
            (CredentialSlot::Primary, primary),
            (CredentialSlot::Backup, backup),
        ] {
            if self.try_credentials(slot, credentials, max_attempts).await {
                self.connected_with = Some(slot);
                return true;
            }
        }

        warn!("Wi-Fi unavailable: primary and backup networks exhausted");
        self.state = LinkState::Disconnected;
        false
    }

    /// Run [`LinkManager::acquire_link`] again and decide what comes next.
    ///
    /// An exhausted acquisition maps to [`Recovery::FallBack`] whenever
    /// `fallback_available` is set, however long ago the link was last up.
    pub async fn recover(
        &mut self,
        primary: &LinkCredentials<'_>,
        backup: &LinkCredentials<'_>,
        max_attempts: u8,
        fallback_available: bool,
    ) -> Recovery {
        if self.acquire_link(primary, backup, max_attempts).await {
            Recovery::Rejoined
        } else if fallback_available {
            Recovery::FallBack
        } else {
            Recovery::Retry
        }
    }

    async fn try_credentials(
        &mut self,
        slot: CredentialSlot,
        credentials: &LinkCredentials<'_>,
        max_attempts: u8,
    ) -> bool {
        if !credentials.is_configured() {
            warn!("Wi-Fi {} credentials not configured, skipping", slot.label());
            return false;
        }

        for attempt in 1..=max_attempts {
            info!(
                "Connecting to {} Wi-Fi \"{}\" (attempt {}/{})",
                slot.label(),
                credentials.ssid,
                attempt,
                max_attempts
            );

            if self
                .connect(credentials, self.policy.attempt_timeout_ms)
                .await
            {
                info!("Wi-Fi connected to \"{}\"", credentials.ssid);
                return true;
            }

            if attempt < max_attempts && self.policy.retry_backoff_ms > 0 {
                Timer::after_millis(self.policy.retry_backoff_ms).await;
            }
        }

        warn!(
            "Wi-Fi {} network \"{}\" failed after {} attempts",
            slot.label(),
            credentials.ssid,
            max_attempts
        );
        false
    }

    async fn fail_attempt(&mut self) -> bool {
        self.driver.disconnect().await;
        self.state = LinkState::Disconnected;
        false
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use embassy_futures::block_on;
    use std::string::{String, ToString};
    use std::vec::Vec;

    const FAST: LinkPolicy = LinkPolicy {
        max_attempts: 5,
        attempt_timeout_ms: 20,
        poll_interval_ms: 2,
        retry_backoff_ms: 0,
    };

    /// Scripted radio: an SSID joins on the Nth `begin` for that SSID
    #[derive(Default)]
    struct ScriptedRadio {
        joins_on: Vec<(String, usize)>,
        begins: Vec<String>,
        disconnects: usize,
        fail_begin: bool,
        connected: bool,
    }

    impl ScriptedRadio {
        fn joining(ssid: &str, on_attempt: usize) -> Self {
            Self {
                joins_on: std::vec![(ssid.to_string(), on_attempt)],
                ..Default::default()
            }
        }

        fn attempts_for(&self, ssid: &str) -> usize {
            self.begins.iter().filter(|s| s.as_str() == ssid).count()
        }
    }

    impl WifiDriver for ScriptedRadio {
        type Error = &'static str;

        async fn begin(&mut self, credentials: &LinkCredentials<'_>) -> Result<(), Self::Error> {
            self.begins.push(credentials.ssid.to_string());
            if self.fail_begin {
                return Err("radio refused configuration");
            }
            let attempt = self.attempts_for(credentials.ssid);
            self.connected = self
                .joins_on
                .iter()
                .any(|(ssid, n)| ssid == credentials.ssid && *n == attempt);
            Ok(())
        }

        async fn is_connected(&mut self) -> bool {
            self.connected
        }

        async fn disconnect(&mut self) {
            self.disconnects += 1;
            self.connected = false;
        }
    }

    fn creds() -> (LinkCredentials<'static>, LinkCredentials<'static>) {
        (
            LinkCredentials::new("plant-main", "primary-pass"),
            LinkCredentials::new("plant-spare", "backup-pass"),
        )
    }

    #[test]
    fn test_connect_succeeds_when_link_comes_up() {
        let mut manager = LinkManager::new(ScriptedRadio::joining("plant-main", 1), FAST);
        let (primary, _) = creds();

        assert!(block_on(manager.connect(&primary, 20)));
        assert_eq!(manager.state(), LinkState::Connected);
    }

    #[test]
    fn test_connect_times_out() {
        let mut manager = LinkManager::new(ScriptedRadio::default(), FAST);
        let (primary, _) = creds();

        let started = Instant::now();
        assert!(!block_on(manager.connect(&primary, 20)));

        assert!(started.elapsed().as_millis() >= 20);
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(manager.driver().disconnects, 1);
    }

    #[test]
    fn test_begin_error_fails_the_attempt() {
        let radio = ScriptedRadio {
            fail_begin: true,
            ..Default::default()
        };
        let mut manager = LinkManager::new(radio, FAST);
        let (primary, _) = creds();

        assert!(!block_on(manager.connect(&primary, 1_000)));
        assert_eq!(manager.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_primary_exhausted_before_backup() {
        let mut manager = LinkManager::new(ScriptedRadio::joining("plant-spare", 1), FAST);
        let (primary, backup) = creds();

        assert!(block_on(manager.acquire_link(&primary, &backup, 3)));

        let begins = &manager.driver().begins;
        assert_eq!(
            begins.as_slice(),
            ["plant-main", "plant-main", "plant-main", "plant-spare"]
        );
        assert_eq!(manager.connected_with(), Some(CredentialSlot::Backup));
    }

    #[test]
    fn test_primary_success_never_touches_backup() {
        let mut manager = LinkManager::new(ScriptedRadio::joining("plant-main", 2), FAST);
        let (primary, backup) = creds();

        assert!(block_on(manager.acquire_link(&primary, &backup, 5)));
        assert_eq!(manager.driver().attempts_for("plant-main"), 2);
        assert_eq!(manager.driver().attempts_for("plant-spare"), 0);
        assert_eq!(manager.connected_with(), Some(CredentialSlot::Primary));
    }

    #[test]
    fn test_backup_joins_on_second_attempt() {
        let mut manager = LinkManager::new(ScriptedRadio::joining("plant-spare", 2), FAST);
        let (primary, backup) = creds();

        assert!(block_on(manager.acquire_link(&primary, &backup, 5)));

        let radio = manager.driver();
        assert_eq!(radio.attempts_for("plant-main"), 5);
        assert_eq!(radio.attempts_for("plant-spare"), 2);
        // 5 failed primary + 1 failed backup, each dropped before the next
        assert_eq!(radio.disconnects, 6);
        assert_eq!(manager.state(), LinkState::Connected);
    }

    #[test]
    fn test_both_exhausted() {
        let mut manager = LinkManager::new(ScriptedRadio::default(), FAST);
        let (primary, backup) = creds();

        assert!(!block_on(manager.acquire_link(&primary, &backup, 2)));

        assert_eq!(manager.driver().begins.len(), 4);
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(manager.connected_with(), None);
    }

    #[test]
    fn test_lost_link_falls_back_when_both_networks_are_gone() {
        let mut manager = LinkManager::new(ScriptedRadio::joining("plant-main", 1), FAST);
        let (primary, backup) = creds();

        assert!(block_on(manager.acquire_link(&primary, &backup, 2)));
        manager.mark_disconnected();

        let recovery = block_on(manager.recover(&primary, &backup, 2, true));

        assert_eq!(recovery, Recovery::FallBack);
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(manager.driver().attempts_for("plant-spare"), 2);
    }

    #[test]
    fn test_lost_link_without_fallback_keeps_retrying() {
        let mut manager = LinkManager::new(ScriptedRadio::default(), FAST);
        let (primary, backup) = creds();

        let recovery = block_on(manager.recover(&primary, &backup, 1, false));

        assert_eq!(recovery, Recovery::Retry);
    }

    #[test]
    fn test_lost_link_rejoins_backup() {
        let mut manager = LinkManager::new(ScriptedRadio::joining("plant-spare", 1), FAST);
        let (primary, backup) = creds();

        let recovery = block_on(manager.recover(&primary, &backup, 2, true));

        assert_eq!(recovery, Recovery::Rejoined);
        assert_eq!(manager.connected_with(), Some(CredentialSlot::Backup));
    }

    #[test]
    fn test_unconfigured_credentials_are_skipped() {
        let mut manager = LinkManager::new(ScriptedRadio::joining("plant-spare", 1), FAST);
        let (_, backup) = creds();

        assert!(block_on(manager.acquire_link(
            &LinkCredentials::default(),
            &backup,
            5
        )));
        assert_eq!(manager.driver().begins.as_slice(), ["plant-spare"]);
    }
}
