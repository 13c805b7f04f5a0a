use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use stonerepl::{
    global_config, run_server, setup_tracing, AppError, AppResult, MmapSlaveManager,
    ServerConfig, GLOBAL_CONFIG,
};
use tokio::net::TcpListener;
use tokio::{runtime, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let _log_guard = setup_tracing(&commandline.log_dir, commandline.verbose)?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let server_config = ServerConfig::set_up_config(config_path)?;
    GLOBAL_CONFIG
        .set(server_config)
        .map_err(|_| AppError::IllegalStateError("global config already set".into()))?;
    let config = global_config()?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let listen_address = format!("{}:{}", config.network.ip, config.network.port);
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            error!("failed to bind {}: {}", listen_address, err);
            AppError::DetailedIoError(format!("bind {}: {}", listen_address, err))
        })?;
        info!(
            "slave node {} accepting replication streams on {}",
            config.general.id, listen_address
        );

        let manager = Arc::new(MmapSlaveManager::from_config(&config.storage));
        run_server(listener, manager, config, signal::ctrl_c()).await
    })
}
