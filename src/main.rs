use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use dalyble_lib::bluetooth::BluestTransport;
use dalyble_lib::cache;
use dalyble_lib::protocol;
use dalyble_lib::session::{self, GattProfile, LinkSession, Transport};
use dalyble_lib::telemetry::Freshness;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;

use commandline::{CliArgs, CliCommands};
use config::Config;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

async fn scan(config: &Config) -> Result<()> {
    let target = config.target();
    let mut transport = BluestTransport::new();
    let advertisements = transport
        .scan(config.scan_timeout)
        .await
        .with_context(|| "Cannot scan for BLE devices")?;
    let selected = session::select_target(&advertisements, &target);
    println!("Found {} BLE devices:", advertisements.len());
    for (index, ad) in advertisements.iter().enumerate() {
        println!(
            "{} {} [{}] RSSI {}",
            if Some(index) == selected { "*" } else { " " },
            ad.name.as_deref().unwrap_or("Unknown"),
            ad.address,
            ad.rssi.map_or_else(|| "-".to_string(), |rssi| rssi.to_string()),
        );
    }
    if selected.is_none() {
        warn!("No device matches {target}");
    }
    Ok(())
}

async fn read(config: &Config) -> Result<()> {
    let target = config.target();
    let mut session = LinkSession::new(BluestTransport::new(), target.clone(), GattProfile::default());
    let request = protocol::build_main_info_request_with(config.checksum);

    let result: Result<protocol::RawResponse> = async {
        session
            .establish(config.scan_timeout)
            .await
            .with_context(|| format!("Cannot connect to {target}"))?;
        session
            .request(&request, config.request_timeout)
            .await
            .with_context(|| "Cannot read main info")
    }
    .await;
    session.close().await;

    let response = result?;
    let snapshot = protocol::parse_main_info_response(
        &response,
        config.checksum,
        &target,
        config.total_capacity_ah,
        Utc::now(),
    )
    .with_context(|| format!("Invalid response {response:?}"))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn show(config: &Config) -> Result<()> {
    let Some(dir) = &config.data_dir else {
        bail!("No data directory configured");
    };
    let (snapshot, status) =
        cache::read_mirror(dir).with_context(|| format!("Cannot read data from {dir:?}"))?;

    match status {
        Some(status) => println!(
            "Status: {} (consecutive failures: {}, last error: {})",
            status.state,
            status.consecutive_failures,
            status.last_error.as_deref().unwrap_or("-")
        ),
        None => println!("Status: no daemon has run yet"),
    }
    match snapshot {
        Some(snapshot) => {
            let age = snapshot.age(Utc::now());
            println!(
                "Snapshot: {:?}, {} s old",
                Freshness::classify(age),
                age.num_seconds()
            );
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        None => println!("Snapshot: not connected, no data yet"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = Config::from_args(&args)?;
    debug!("Configuration: {config:?}");

    match args.command {
        CliCommands::Scan => scan(&config).await,
        CliCommands::Read => read(&config).await,
        CliCommands::Daemon => daemon::run(config).await,
        CliCommands::Show => show(&config),
    }
}
