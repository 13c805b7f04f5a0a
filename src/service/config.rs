use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<ServerConfig> = OnceCell::new();

pub fn global_config() -> AppResult<&'static ServerConfig> {
    GLOBAL_CONFIG
        .get()
        .ok_or_else(|| AppError::IllegalStateError("global config is not initialized".into()))
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: 9270,
            max_connection: 64,
        }
    }
}

/// Limits applied by every replication stream receiver.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Largest data frame body accepted from the master, in bytes.
    pub max_frame_size: usize,
    /// Highest column end offset a data frame may write to.
    pub max_column_size: u64,
    /// Consecutive busy answers tolerated while leasing one table writer.
    pub max_lease_retries: u32,
    /// Pause before retrying a busy lease.
    pub lease_backoff_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_column_size: 1 << 40,
            max_lease_retries: 8,
            lease_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per replicated table.
    pub base_dir: String,
    /// Whether commit fsyncs the touched column files.
    pub sync_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: "./data".into(),
            sync_on_commit: true,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    pub storage: StorageConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.receiver.max_frame_size == 0 {
            return Err(AppError::InvalidValue(
                "receiver.max_frame_size must be greater than 0".into(),
            ));
        }
        if self.receiver.max_column_size == 0 {
            return Err(AppError::InvalidValue(
                "receiver.max_column_size must be greater than 0".into(),
            ));
        }
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE: &str = r#"
[general]
id = 2

[network]
ip = "0.0.0.0"
port = 9400
max_connection = 4

[receiver]
max_frame_size = 1024
max_lease_retries = 3
lease_backoff_ms = 10

[storage]
base_dir = "/tmp/stonerepl"
sync_on_commit = false
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() -> AppResult<()> {
        let file = write_config(SAMPLE);
        let config = ServerConfig::set_up_config(file.path())?;

        assert_eq!(config.general.id, 2);
        assert_eq!(config.network.port, 9400);
        assert_eq!(config.receiver.max_frame_size, 1024);
        assert_eq!(config.receiver.max_lease_retries, 3);
        assert_eq!(
            config.receiver.max_column_size,
            ReceiverConfig::default().max_column_size
        );
        assert_eq!(config.storage.base_dir, "/tmp/stonerepl");
        assert!(!config.storage.sync_on_commit);
        Ok(())
    }

    #[test]
    fn test_receiver_section_defaults() -> AppResult<()> {
        let without_receiver: String = SAMPLE
            .lines()
            .filter(|line| {
                !line.starts_with("[receiver]")
                    && !line.starts_with("max_frame_size")
                    && !line.starts_with("max_lease_retries")
                    && !line.starts_with("lease_backoff_ms")
            })
            .collect::<Vec<_>>()
            .join("\n");
        let file = write_config(&without_receiver);
        let config = ServerConfig::set_up_config(file.path())?;

        assert_eq!(
            config.receiver.max_frame_size,
            ReceiverConfig::default().max_frame_size
        );
        Ok(())
    }

    #[test]
    fn test_reject_zero_frame_size() {
        let file = write_config(&SAMPLE.replace("max_frame_size = 1024", "max_frame_size = 0"));
        let result = ServerConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
    }
}
