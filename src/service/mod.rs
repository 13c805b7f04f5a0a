pub use app_error::{AppError, AppResult, FaultKind};
pub use config::{
    global_config, GeneralConfig, NetworkConfig, ReceiverConfig, ServerConfig, StorageConfig,
    GLOBAL_CONFIG,
};
pub use server::{run_server, ReceiverPool, ReplicationServer};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
