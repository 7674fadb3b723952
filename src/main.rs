use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

mod address;
mod battery;
mod clock;
mod config;
mod manager;
mod manufacturer;
mod messages;
mod mode;
mod mqtt;
mod publish;
mod registry;
mod scanner;

/// Exit status asking the service supervisor to start us again.
const RESTART_EXIT_CODE: i32 = 75;

#[derive(Parser, Debug)]
#[command(version, about = "Report nearby BLE devices over MQTT")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Start in provisioning mode even if the configuration is complete
    #[arg(long)]
    provision: bool,

    /// Maximum number of devices to track
    #[arg(long, default_value_t = registry::MAX_DEVICES)]
    max_devices: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        pretty_env_logger::init();
    }

    let args = Args::parse();

    let config = match config::AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            warn!("{:#}, starting unconfigured", err);
            config::AppConfig::default()
        }
    };

    let core = manager::Manager::new(args.config, config, args.provision, args.max_devices).await?;
    match core.run_loop().await? {
        manager::RunOutcome::Restart => {
            info!("Exiting for restart");
            std::process::exit(RESTART_EXIT_CODE);
        }
    }
}
