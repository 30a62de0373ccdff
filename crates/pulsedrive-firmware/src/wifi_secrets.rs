//! Wi-Fi credentials baked in at build time from `.env`

use pulsedrive_core::config::LinkCredentials;

pub const PRIMARY: LinkCredentials<'static> = LinkCredentials::new(
    env!("PULSEDRIVE_PRIMARY_SSID"),
    env!("PULSEDRIVE_PRIMARY_PASSWORD"),
);

pub const BACKUP: LinkCredentials<'static> = LinkCredentials::new(
    env!("PULSEDRIVE_BACKUP_SSID"),
    env!("PULSEDRIVE_BACKUP_PASSWORD"),
);
