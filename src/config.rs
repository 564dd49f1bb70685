//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/ccs.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `CCS_DAQ_`, nested keys separated
//!    by a double underscore
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration.
//!
//! # Example
//! ```no_run
//! use ccs_daq::config::CcsConfig;
//!
//! // CCS_DAQ_ACQUISITION__INTEGRATION_TIME_S=0.1 overrides the file
//! let config = CcsConfig::load()?;
//! println!("Integration time: {} s", config.acquisition.integration_time_s);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::discovery::{FirmwareMap, RenumerationPolicy};
use crate::driver::{DriverSettings, ScanPolicy};
use crate::timing::{MAX_INTEGRATION_TIME, MIN_INTEGRATION_TIME};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/ccs.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CCS_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcsConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition defaults
    pub acquisition: AcquisitionConfig,
    /// Firmware bring-up
    pub firmware: FirmwareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "ccs-daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Integration time programmed on open, seconds
    #[serde(default = "default_integration_time")]
    pub integration_time_s: f64,
    /// Scan wait timeout; unset means integration time + 2 s
    #[serde(default)]
    pub scan_timeout_ms: Option<u64>,
    /// Delay between status polls
    #[serde(default = "default_scan_poll_interval")]
    pub scan_poll_interval_ms: u64,
    /// USB transfer timeout
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            integration_time_s: default_integration_time(),
            scan_timeout_ms: None,
            scan_poll_interval_ms: default_scan_poll_interval(),
            transfer_timeout_ms: default_transfer_timeout(),
        }
    }
}

/// Firmware configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Directory holding `CCS100.spt` ... `CCS200.spt`
    #[serde(default = "default_firmware_directory")]
    pub directory: PathBuf,
    /// Re-enumeration timeout
    #[serde(default = "default_renumeration_timeout")]
    pub renumeration_timeout_ms: u64,
    /// Delay between bus scans while waiting for re-enumeration
    #[serde(default = "default_renumeration_poll_interval")]
    pub renumeration_poll_interval_ms: u64,
    /// Per product id overrides, keyed by hex id such as `"0x8088"`
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            directory: default_firmware_directory(),
            renumeration_timeout_ms: default_renumeration_timeout(),
            renumeration_poll_interval_ms: default_renumeration_poll_interval(),
            files: BTreeMap::new(),
        }
    }
}

// Default value functions
fn default_integration_time() -> f64 {
    crate::timing::DEFAULT_INTEGRATION_TIME
}

fn default_scan_poll_interval() -> u64 {
    1
}

fn default_transfer_timeout() -> u64 {
    crate::protocol::DEFAULT_TRANSFER_TIMEOUT_MS
}

fn default_firmware_directory() -> PathBuf {
    PathBuf::from("firmware")
}

fn default_renumeration_timeout() -> u64 {
    10_000
}

fn default_renumeration_poll_interval() -> u64 {
    100
}

fn parse_product_id(key: &str) -> Result<u16, String> {
    let trimmed = key.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse::<u16>(),
    };
    parsed.map_err(|_| format!("Invalid product id '{}' in firmware.files", key))
}

impl CcsConfig {
    /// Load configuration from `config/ccs.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix CCS_DAQ_
    /// Example: CCS_DAQ_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path, ENV_PREFIX).extract()
    }

    /// Provider stack for `path` with environment overrides under `prefix`.
    pub fn figment<P: AsRef<Path>>(path: P, prefix: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(prefix).split("__"))
    }

    /// Render the configuration as TOML, in the layout of `config/ccs.toml`.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let t = self.acquisition.integration_time_s;
        if !(MIN_INTEGRATION_TIME..=MAX_INTEGRATION_TIME).contains(&t) {
            return Err(format!(
                "Invalid integration_time_s {}. Must be {}-{}",
                t, MIN_INTEGRATION_TIME, MAX_INTEGRATION_TIME
            ));
        }

        if self.acquisition.scan_timeout_ms == Some(0) {
            return Err("scan_timeout_ms must be positive".to_string());
        }
        if self.acquisition.transfer_timeout_ms == 0 {
            return Err("transfer_timeout_ms must be positive".to_string());
        }
        if self.firmware.renumeration_timeout_ms == 0 {
            return Err("renumeration_timeout_ms must be positive".to_string());
        }

        for key in self.firmware.files.keys() {
            parse_product_id(key)?;
        }

        Ok(())
    }

    /// Driver settings for opening a device.
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            integration_time: self.acquisition.integration_time_s,
            scan_policy: ScanPolicy {
                timeout: self.acquisition.scan_timeout_ms.map(Duration::from_millis),
                poll_interval: Duration::from_millis(self.acquisition.scan_poll_interval_ms),
            },
        }
    }

    /// USB transfer timeout.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.transfer_timeout_ms)
    }

    /// Re-enumeration wait settings.
    pub fn renumeration_policy(&self) -> RenumerationPolicy {
        RenumerationPolicy {
            timeout: Duration::from_millis(self.firmware.renumeration_timeout_ms),
            poll_interval: Duration::from_millis(self.firmware.renumeration_poll_interval_ms),
        }
    }

    /// Firmware files: the directory defaults, then the explicit overrides.
    /// Relative override paths are resolved against the directory.
    pub fn firmware_map(&self) -> Result<FirmwareMap, String> {
        let mut map = FirmwareMap::from_directory(&self.firmware.directory);
        for (key, path) in &self.firmware.files {
            let pid = parse_product_id(key)?;
            map.insert(pid, self.firmware.directory.join(path));
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = CcsConfig::load_from("/nonexistent/ccs.toml").unwrap();
        assert_eq!(config, CcsConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.integration_time_s, 0.01);
        assert_eq!(config.renumeration_policy(), RenumerationPolicy::default());
        assert_eq!(config.driver_settings(), DriverSettings::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[acquisition]
integration_time_s = 0.5
scan_timeout_ms = 4000

[firmware]
directory = "/opt/ccs"
files = {{ "0x8088" = "custom/CCS200.spt" }}
"#
        )
        .unwrap();

        let config = CcsConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "ccs-daq");
        assert_eq!(config.driver_settings().scan_policy.timeout, Some(Duration::from_millis(4000)));

        let map = config.firmware_map().unwrap();
        assert_eq!(map.get(0x8088), Some(Path::new("/opt/ccs/custom/CCS200.spt")));
        assert_eq!(map.get(0x8080), Some(Path::new("/opt/ccs/CCS100.spt")));
    }

    #[test]
    fn test_env_override() {
        let prefix = "CCS_DAQ_TEST_OVERRIDE_";
        std::env::set_var("CCS_DAQ_TEST_OVERRIDE_ACQUISITION__INTEGRATION_TIME_S", "0.25");
        let config: CcsConfig = CcsConfig::figment("/nonexistent/ccs.toml", prefix).extract().unwrap();
        std::env::remove_var("CCS_DAQ_TEST_OVERRIDE_ACQUISITION__INTEGRATION_TIME_S");
        assert_eq!(config.acquisition.integration_time_s, 0.25);
    }

    #[test]
    fn test_toml_rendering_loads_back() {
        let mut config = CcsConfig::default();
        config.acquisition.scan_timeout_ms = Some(2500);
        config.firmware.files.insert("0x8080".to_string(), PathBuf::from("CCS100_v2.spt"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", config.to_toml_string().unwrap()).unwrap();
        assert_eq!(CcsConfig::load_from(file.path()).unwrap(), config);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = CcsConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = CcsConfig::default();
        config.acquisition.integration_time_s = 120.0;
        assert!(config.validate().is_err());

        let mut config = CcsConfig::default();
        config.firmware.files.insert("CCS200".to_string(), PathBuf::from("x.spt"));
        assert!(config.validate().is_err());
        assert!(config.firmware_map().is_err());
    }
}
