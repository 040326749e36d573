use crate::commandline::CliArgs;
use anyhow::{Context, Result};
use dalyble_lib::acquisition::Settings;
use dalyble_lib::protocol::ChecksumKind;
use dalyble_lib::telemetry::{DeviceTarget, DEFAULT_ADDRESS, DEFAULT_NAME};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub address: String,
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_min: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    pub max_protocol_faults: u32,
    pub checksum: ChecksumKind,
    pub total_capacity_ah: f32,
    /// `None` disables the file mirror.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            name: DEFAULT_NAME.to_string(),
            poll_interval: settings.poll_interval,
            request_timeout: settings.request_timeout,
            scan_timeout: settings.scan_timeout,
            backoff_min: settings.backoff_min,
            backoff_max: settings.backoff_max,
            max_protocol_faults: settings.max_protocol_faults,
            checksum: settings.checksum,
            total_capacity_ah: settings.total_capacity_ah,
            data_dir: Some(std::env::temp_dir()),
        }
    }
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &str = "dalyble.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Loads the file named on the command line and applies the flag overrides.
    ///
    /// Only the default file may be absent.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut config = if args.config == Self::DEFAULT_CONFIG_FILE
            && !Path::new(&args.config).exists()
        {
            log::debug!("No {} found, using defaults", Self::DEFAULT_CONFIG_FILE);
            Self::default()
        } else {
            Self::load(&args.config)?
        };
        config.apply_args(args);
        Ok(config)
    }

    fn apply_args(&mut self, args: &CliArgs) {
        if let Some(address) = &args.address {
            self.address.clone_from(address);
        }
        if let Some(name) = &args.name {
            self.name.clone_from(name);
        }
        if let Some(data_dir) = &args.data_dir {
            self.data_dir = Some(data_dir.clone());
        }
        if let Some(interval) = args.interval {
            self.poll_interval = interval;
        }
        if let Some(timeout) = args.timeout {
            self.request_timeout = timeout;
        }
        if let Some(scan_timeout) = args.scan_timeout {
            self.scan_timeout = scan_timeout;
        }
    }

    pub fn target(&self) -> DeviceTarget {
        DeviceTarget::new(self.address.as_str(), self.name.as_str())
    }

    pub fn settings(&self) -> Settings {
        Settings {
            target: self.target(),
            poll_interval: self.poll_interval,
            request_timeout: self.request_timeout,
            scan_timeout: self.scan_timeout,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
            max_protocol_faults: self.max_protocol_faults,
            checksum: self.checksum,
            total_capacity_ah: self.total_capacity_ah,
            ..Settings::default()
        }
    }
}
