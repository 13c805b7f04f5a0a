pub mod network;
pub mod protocol;
pub mod replica;
pub mod service;

pub use network::{IoInterest, NonBlockingChannel, ReplicationStreamReceiver};
pub use protocol::ReplicationFrame;
pub use replica::{MmapSlaveManager, MmapSlaveWriter, ReplicationSlaveManager, SlaveWriter};
pub use service::{
    global_config, run_server, setup_local_tracing, setup_tracing, AppError, AppResult,
    FaultKind, ReceiverConfig, ServerConfig, Shutdown, GLOBAL_CONFIG,
};
