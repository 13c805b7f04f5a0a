use std::path::{Path, PathBuf};

use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use crate::service::StorageConfig;
use crate::{AppError, AppResult};

use super::{MmapSlaveWriter, ReplicationSlaveManager};

/// Leases [`MmapSlaveWriter`]s, one live lease per master table id.
///
/// Shared by every connection of the server. Writers given back are rolled
/// back to their last commit and parked, the next lease of the same id gets
/// the parked writer instead of reopening the table.
#[derive(Debug)]
pub struct MmapSlaveManager {
    base_dir: PathBuf,
    sync_on_commit: bool,
    leased: DashSet<i32>,
    idle_writers: DashMap<i32, MmapSlaveWriter>,
}

impl MmapSlaveManager {
    pub fn new<P: AsRef<Path>>(base_dir: P, sync_on_commit: bool) -> Self {
        MmapSlaveManager {
            base_dir: base_dir.as_ref().to_path_buf(),
            sync_on_commit,
            leased: DashSet::new(),
            idle_writers: DashMap::new(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        info!(
            "slave tables stored under {}, sync on commit: {}",
            storage.base_dir, storage.sync_on_commit
        );
        Self::new(&storage.base_dir, storage.sync_on_commit)
    }

    pub fn table_dir(&self, master_table_id: i32) -> PathBuf {
        self.base_dir.join(format!("table_{}", master_table_id))
    }

    pub fn is_leased(&self, master_table_id: i32) -> bool {
        self.leased.contains(&master_table_id)
    }

    pub fn idle_writer_count(&self) -> usize {
        self.idle_writers.len()
    }
}

impl ReplicationSlaveManager for MmapSlaveManager {
    type Writer = MmapSlaveWriter;

    fn get_slave_writer(&self, master_table_id: i32) -> AppResult<MmapSlaveWriter> {
        if master_table_id < 0 {
            return Err(AppError::LeaseFailure {
                table_id: master_table_id,
                reason: "negative master table id".into(),
            });
        }
        if !self.leased.insert(master_table_id) {
            return Err(AppError::WriterBusy(master_table_id));
        }
        if let Some((_, writer)) = self.idle_writers.remove(&master_table_id) {
            debug!("reusing idle writer of master table {}", master_table_id);
            return Ok(writer);
        }
        MmapSlaveWriter::open(
            self.table_dir(master_table_id),
            master_table_id,
            self.sync_on_commit,
        )
        .map_err(|e| {
            self.leased.remove(&master_table_id);
            AppError::LeaseFailure {
                table_id: master_table_id,
                reason: e.to_string(),
            }
        })
    }

    fn release_slave_writer(&self, master_table_id: i32, mut writer: MmapSlaveWriter) {
        writer.rollback_block();
        self.idle_writers.insert(master_table_id, writer);
        self.leased.remove(&master_table_id);
    }
}
