use crate::config::Config;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Scan for BLE devices and mark the ones matching the configured BMS
    Scan,
    /// Connect once, request the main info block and print it as JSON
    Read,
    /// Poll the BMS continuously and mirror the latest snapshot to the data directory
    Daemon,
    /// Print the snapshot and status files written by a running daemon
    Show,
}

const fn about_text() -> &'static str {
    "daly bms bluetooth telemetry tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// YAML configuration file; a missing default file is not an error
    #[arg(short, long, default_value_t = Config::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// BLE address of the BMS (e.g., "41:18:12:01:18:9F")
    #[arg(short, long)]
    pub address: Option<String>,

    /// Advertised name of the BMS, used when the address does not match (e.g., "DL-41181201189F")
    #[arg(short, long)]
    pub name: Option<String>,

    /// Directory for bms_latest.json and bms_status.json
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Interval between two polls (e.g., "5s", "1m")
    #[arg(value_parser = humantime::parse_duration, short, long)]
    pub interval: Option<Duration>,

    /// Time to wait for a complete response (e.g., "500ms", "3s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    /// How long to scan for the BMS (e.g., "10s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub scan_timeout: Option<Duration>,
}
