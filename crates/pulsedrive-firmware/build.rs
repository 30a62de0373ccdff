//! Injects Wi-Fi credentials from `.env` (or the build environment) as
//! compile-time variables read by `wifi_secrets`.

use std::env;
use std::path::PathBuf;

const CREDENTIAL_VARS: [&str; 4] = [
    "PULSEDRIVE_PRIMARY_SSID",
    "PULSEDRIVE_PRIMARY_PASSWORD",
    "PULSEDRIVE_BACKUP_SSID",
    "PULSEDRIVE_BACKUP_PASSWORD",
];

fn main() {
    println!("cargo:rustc-link-arg=-Tlinkall.x");

    // The workspace root is two levels above this crate.
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_default());
    let env_path = manifest_dir.join("../../.env");
    if env_path.exists() {
        println!("cargo:rerun-if-changed={}", env_path.display());
        if let Err(e) = dotenvy::from_path(&env_path) {
            println!("cargo:warning=failed to read {}: {e}", env_path.display());
        }
    }

    for var in CREDENTIAL_VARS {
        println!("cargo:rerun-if-env-changed={var}");
        let value = env::var(var).unwrap_or_else(|_| {
            println!("cargo:warning={var} is not set; the credential will be skipped at runtime");
            String::new()
        });
        println!("cargo:rustc-env={var}={value}");
    }
}
