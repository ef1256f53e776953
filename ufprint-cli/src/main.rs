use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use anyhow::Result;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use ufprint::config::{Config, DEFAULT_CONFIG_PATH};
use ufprint_cli::commands::{
    delete::{DeleteAllArgs, DeleteArgs, command_delete, command_delete_all},
    devices::{DeviceArgs, command_devices, command_fingers},
    enroll::{EnrollArgs, command_enroll},
    helper::command_helper,
    policy::{TargetArgs, command_disable, command_enable, command_status},
};

#[derive(Subcommand)]
pub enum Commands {
    /// List fingerprint readers
    Devices,
    /// List enrolled fingers
    Fingers(DeviceArgs),
    /// Enroll a finger
    Enroll(EnrollArgs),
    /// Delete one enrolled finger
    Delete(DeleteArgs),
    /// Delete every enrolled finger
    DeleteAll(DeleteAllArgs),
    /// Enable fingerprint authentication for a target
    Enable(TargetArgs),
    /// Disable fingerprint authentication for a target
    Disable(TargetArgs),
    /// Show fingerprint authentication status of every target
    Status,
    /// Run the privileged helper (root)
    Helper,
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct UserArgs {
    /// verbose, repeat for debug output
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// configuration file
    #[arg(short, long, env = "UFPRINT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Command
    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = UserArgs::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    SimpleLogger::new().with_colors(true).with_level(log_level).init()?;

    let config = Config::load(&args.config)?;

    match args.command {
        Commands::Devices => command_devices(&config).await?,
        Commands::Fingers(a) => command_fingers(&config, a).await?,
        Commands::Enroll(a) => command_enroll(&config, a).await?,
        Commands::Delete(a) => command_delete(&config, a).await?,
        Commands::DeleteAll(a) => command_delete_all(&config, a).await?,
        Commands::Enable(a) => command_enable(&config, a).await?,
        Commands::Disable(a) => command_disable(&config, a).await?,
        Commands::Status => command_status(&config).await?,
        Commands::Helper => command_helper(&config).await?,
    }

    Ok(())
}
