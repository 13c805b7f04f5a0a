use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace, warn};

use crate::{AppError, AppResult};

use super::SlaveWriter;

const TXN_FILE_NAME: &str = "_txn";
const TXN_FILE_VERSION: i8 = 1;

fn column_file_name(column_index: i32) -> String {
    format!("{}.d", column_index)
}

fn storage_error(table_id: i32) -> impl FnOnce(io::Error) -> AppError {
    move |source| AppError::StorageError { table_id, source }
}

/// One data frame's window into a column file.
#[derive(Debug)]
pub struct ColumnMapping {
    column_index: i32,
    data_offset: u64,
    // zero length frames get no mapping
    mmap: Option<MmapMut>,
}

impl Deref for ColumnMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..],
            None => &[],
        }
    }
}

impl DerefMut for ColumnMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.mmap {
            Some(mmap) => &mut mmap[..],
            None => &mut [],
        }
    }
}

#[derive(Debug)]
struct ColumnFile {
    file: File,
    /// bytes visible to readers, advanced on commit
    committed_size: u64,
    /// high-water mark of unmapped frames in the open block
    pending_size: u64,
}

#[derive(Debug, Default)]
struct BlockProgress {
    frames_applied: u32,
    frames_expected: Option<u32>,
    completion_reported: bool,
}

impl BlockProgress {
    fn try_complete(&mut self) -> bool {
        if self.completion_reported {
            return false;
        }
        if self.frames_expected == Some(self.frames_applied) {
            self.completion_reported = true;
            return true;
        }
        false
    }
}

/// Applies one replicated table's frames into memory-mapped column files
/// under `<base_dir>/table_<id>/`.
#[derive(Debug)]
pub struct MmapSlaveWriter {
    master_table_id: i32,
    table_dir: PathBuf,
    sync_on_commit: bool,
    columns: BTreeMap<i32, ColumnFile>,
    block: BlockProgress,
    committed_blocks: u64,
}

impl MmapSlaveWriter {
    /// Opens (or creates) the table directory and restores the committed
    /// column sizes from its transaction file.
    pub fn open<P: AsRef<Path>>(
        table_dir: P,
        master_table_id: i32,
        sync_on_commit: bool,
    ) -> AppResult<MmapSlaveWriter> {
        let table_dir = table_dir.as_ref().to_path_buf();
        fs::create_dir_all(&table_dir).map_err(storage_error(master_table_id))?;

        let mut writer = MmapSlaveWriter {
            master_table_id,
            table_dir,
            sync_on_commit,
            columns: BTreeMap::new(),
            block: BlockProgress::default(),
            committed_blocks: 0,
        };
        writer.load_txn()?;
        debug!(
            "opened slave writer for master table {} at {:?}, {} committed blocks",
            master_table_id, writer.table_dir, writer.committed_blocks
        );
        Ok(writer)
    }

    pub fn master_table_id(&self) -> i32 {
        self.master_table_id
    }

    pub fn committed_blocks(&self) -> u64 {
        self.committed_blocks
    }

    pub fn committed_column_size(&self, column_index: i32) -> u64 {
        self.columns
            .get(&column_index)
            .map_or(0, |column| column.committed_size)
    }

    /// Reads the committed prefix of a column.
    pub fn read_committed(&self, column_index: i32) -> AppResult<Vec<u8>> {
        let size = self.committed_column_size(column_index) as usize;
        let mut bytes = vec![0u8; size];
        if size > 0 {
            File::open(self.table_dir.join(column_file_name(column_index)))
                .and_then(|mut file| file.read_exact(&mut bytes))
                .map_err(storage_error(self.master_table_id))?;
        }
        Ok(bytes)
    }

    /// Forgets everything applied since the last commit. Bytes already in
    /// the column files stay beyond the committed size until rewritten.
    pub fn rollback_block(&mut self) {
        if self.block.frames_applied > 0 || self.block.frames_expected.is_some() {
            warn!(
                "rolling back uncommitted block of master table {}: {} frames applied, {:?} expected",
                self.master_table_id, self.block.frames_applied, self.block.frames_expected
            );
        }
        for column in self.columns.values_mut() {
            column.pending_size = column.committed_size;
        }
        self.block = BlockProgress::default();
    }

    fn column_file(&mut self, column_index: i32) -> AppResult<&mut ColumnFile> {
        if !self.columns.contains_key(&column_index) {
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.table_dir.join(column_file_name(column_index)))
                .map_err(storage_error(self.master_table_id))?;
            self.columns.insert(
                column_index,
                ColumnFile {
                    file,
                    committed_size: 0,
                    pending_size: 0,
                },
            );
        }
        self.columns.get_mut(&column_index).ok_or_else(|| {
            AppError::IllegalStateError(format!("column {} not opened", column_index))
        })
    }

    fn load_txn(&mut self) -> AppResult<()> {
        let path = self.table_dir.join(TXN_FILE_NAME);
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read(&path).map_err(storage_error(self.master_table_id))?;
        let corrupt = || AppError::InvalidValue(format!("corrupt transaction file {:?}", path));
        let mut buf = &content[..];
        if buf.remaining() < 1 + 8 + 4 {
            return Err(corrupt());
        }
        let version = buf.get_i8();
        if version != TXN_FILE_VERSION {
            return Err(AppError::InvalidValue(format!(
                "transaction file version {} in {:?}",
                version, path
            )));
        }
        let committed_blocks = buf.get_u64_le();
        let column_count = buf.get_u32_le() as usize;
        if buf.remaining() != column_count * (4 + 8) {
            return Err(corrupt());
        }
        for _ in 0..column_count {
            let column_index = buf.get_i32_le();
            let committed_size = buf.get_u64_le();
            let column = self.column_file(column_index)?;
            column.committed_size = committed_size;
            column.pending_size = committed_size;
        }
        self.committed_blocks = committed_blocks;
        Ok(())
    }

    fn store_txn(&self) -> AppResult<()> {
        let mut buf = BytesMut::with_capacity(1 + 8 + 4 + self.columns.len() * 12);
        buf.put_i8(TXN_FILE_VERSION);
        buf.put_u64_le(self.committed_blocks);
        buf.put_u32_le(self.columns.len() as u32);
        for (column_index, column) in &self.columns {
            buf.put_i32_le(*column_index);
            buf.put_u64_le(column.committed_size);
        }
        let tmp_path = self.table_dir.join(format!("{}.tmp", TXN_FILE_NAME));
        fs::write(&tmp_path, &buf)
            .and_then(|_| {
                if self.sync_on_commit {
                    File::open(&tmp_path)?.sync_all()?;
                }
                fs::rename(&tmp_path, self.table_dir.join(TXN_FILE_NAME))
            })
            .map_err(storage_error(self.master_table_id))
    }
}

impl SlaveWriter for MmapSlaveWriter {
    type Mapping = ColumnMapping;

    fn map_column_data(
        &mut self,
        first_timestamp: i64,
        column_index: i32,
        data_offset: i64,
        length: usize,
    ) -> AppResult<ColumnMapping> {
        let data_offset = u64::try_from(data_offset).map_err(|_| {
            AppError::InvalidValue(format!("negative data offset {}", data_offset))
        })?;
        let table_id = self.master_table_id;
        let required = data_offset.checked_add(length as u64).ok_or_else(|| {
            AppError::InvalidValue(format!(
                "column {} range at {} of {} bytes overflows",
                column_index, data_offset, length
            ))
        })?;
        let column = self.column_file(column_index)?;
        let current_len = column
            .file
            .metadata()
            .map_err(storage_error(table_id))?
            .len();
        if current_len < required {
            column
                .file
                .set_len(required)
                .map_err(storage_error(table_id))?;
        }
        trace!(
            "map column {} [{}, {}) first timestamp {}",
            column_index,
            data_offset,
            required,
            first_timestamp
        );
        let mmap = if length == 0 {
            None
        } else {
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(data_offset)
                    .len(length)
                    .map_mut(&column.file)
                    .map_err(storage_error(table_id))?
            };
            Some(mmap)
        };
        Ok(ColumnMapping {
            column_index,
            data_offset,
            mmap,
        })
    }

    fn unmap(&mut self, column_index: i32, mapping: ColumnMapping, length: usize) -> AppResult<bool> {
        if mapping.column_index != column_index || mapping.len() != length {
            return Err(AppError::IllegalStateError(format!(
                "unmap of column {} ({} bytes) with mapping of column {} ({} bytes)",
                column_index,
                length,
                mapping.column_index,
                mapping.len()
            )));
        }
        if let Some(mmap) = &mapping.mmap {
            mmap.flush_async()
                .map_err(storage_error(self.master_table_id))?;
        }
        let end = mapping.data_offset + length as u64;
        let column = self.column_file(column_index)?;
        column.pending_size = column.pending_size.max(end);
        drop(mapping);

        self.block.frames_applied += 1;
        Ok(self.block.try_complete())
    }

    fn mark_block_n_frames(&mut self, n_frames: u32) -> bool {
        self.block.frames_expected = Some(n_frames);
        self.block.try_complete()
    }

    fn commit(&mut self) -> AppResult<()> {
        if !self.block.completion_reported {
            warn!(
                "committing incomplete block of master table {}: {} frames applied, {:?} expected",
                self.master_table_id, self.block.frames_applied, self.block.frames_expected
            );
        }
        for column in self.columns.values_mut() {
            if column.pending_size != column.committed_size {
                if self.sync_on_commit {
                    column
                        .file
                        .sync_data()
                        .map_err(storage_error(self.master_table_id))?;
                }
                column.committed_size = column.pending_size;
            }
        }
        self.committed_blocks += 1;
        self.store_txn()?;
        self.block = BlockProgress::default();
        debug!(
            "master table {} committed block {}",
            self.master_table_id, self.committed_blocks
        );
        Ok(())
    }

    fn discard(&mut self, column_index: i32, mapping: ColumnMapping, written: usize) {
        debug!(
            "discarding mapping of column {} after {} of {} bytes",
            column_index,
            written,
            mapping.len()
        );
        drop(mapping);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_frame(
        writer: &mut MmapSlaveWriter,
        column_index: i32,
        data_offset: i64,
        body: &[u8],
    ) -> AppResult<bool> {
        let mut mapping = writer.map_column_data(0, column_index, data_offset, body.len())?;
        mapping.copy_from_slice(body);
        writer.unmap(column_index, mapping, body.len())
    }

    #[test]
    fn test_completion_when_count_arrives_last() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 7, false)?;

        assert!(!write_frame(&mut writer, 0, 0, &[1; 64])?);
        assert!(!write_frame(&mut writer, 0, 64, &[2; 128])?);
        assert!(writer.mark_block_n_frames(2));
        assert!(!writer.mark_block_n_frames(2));
        Ok(())
    }

    #[test]
    fn test_completion_when_count_arrives_first() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 7, false)?;

        assert!(!writer.mark_block_n_frames(2));
        assert!(!write_frame(&mut writer, 0, 0, &[1; 64])?);
        assert!(write_frame(&mut writer, 1, 0, &[2; 8])?);
        Ok(())
    }

    #[test]
    fn test_empty_block_completes_on_count() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 1, false)?;

        assert!(writer.mark_block_n_frames(0));
        writer.commit()?;
        assert_eq!(writer.committed_blocks(), 1);
        Ok(())
    }

    #[test]
    fn test_commit_publishes_column_bytes() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 3, true)?;

        write_frame(&mut writer, 2, 0, b"hello ")?;
        write_frame(&mut writer, 2, 6, b"world")?;
        assert_eq!(writer.committed_column_size(2), 0);
        assert!(writer.mark_block_n_frames(2));
        writer.commit()?;

        assert_eq!(writer.committed_column_size(2), 11);
        assert_eq!(writer.read_committed(2)?, b"hello world".to_vec());
        Ok(())
    }

    #[test]
    fn test_reopen_restores_committed_state() -> AppResult<()> {
        let dir = TempDir::new()?;
        {
            let mut writer = MmapSlaveWriter::open(dir.path(), 3, true)?;
            write_frame(&mut writer, 0, 0, &[9; 32])?;
            writer.mark_block_n_frames(1);
            writer.commit()?;
            // applied but never committed
            write_frame(&mut writer, 0, 32, &[8; 32])?;
        }
        let writer = MmapSlaveWriter::open(dir.path(), 3, true)?;
        assert_eq!(writer.committed_blocks(), 1);
        assert_eq!(writer.committed_column_size(0), 32);
        assert_eq!(writer.read_committed(0)?, vec![9; 32]);
        Ok(())
    }

    #[test]
    fn test_rollback_hides_uncommitted_frames() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 3, false)?;
        write_frame(&mut writer, 0, 0, &[1; 16])?;
        writer.mark_block_n_frames(2);

        writer.rollback_block();

        // the next block starts from zero applied frames
        assert!(!writer.mark_block_n_frames(1));
        assert!(write_frame(&mut writer, 0, 0, &[2; 16])?);
        writer.commit()?;
        assert_eq!(writer.read_committed(0)?, vec![2; 16]);
        Ok(())
    }

    #[test]
    fn test_discard_does_not_count_frame() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 3, false)?;
        writer.mark_block_n_frames(1);

        let mut mapping = writer.map_column_data(0, 0, 0, 8)?;
        mapping[..4].copy_from_slice(&[1, 2, 3, 4]);
        writer.discard(0, mapping, 4);

        assert!(write_frame(&mut writer, 0, 0, &[5; 8])?);
        Ok(())
    }

    #[test]
    fn test_zero_length_mapping() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 3, false)?;

        let mapping = writer.map_column_data(0, 4, 100, 0)?;
        assert!(mapping.is_empty());
        assert!(!writer.unmap(4, mapping, 0)?);
        Ok(())
    }

    #[test]
    fn test_unmap_rejects_foreign_mapping() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 3, false)?;

        let mapping = writer.map_column_data(0, 1, 0, 8)?;
        let result = writer.unmap(2, mapping, 8);
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
        Ok(())
    }

    #[test]
    fn test_column_file_failure_is_storage_error() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 3, false)?;
        // a directory where column 0's data file belongs
        fs::create_dir(dir.path().join(column_file_name(0)))?;

        let err = writer.map_column_data(0, 0, 0, 8).unwrap_err();
        assert!(matches!(err, AppError::StorageError { table_id: 3, .. }));
        assert_eq!(err.fault_kind(), crate::FaultKind::Internal);
        Ok(())
    }

    #[test]
    fn test_unaligned_offset_mapping() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut writer = MmapSlaveWriter::open(dir.path(), 3, false)?;

        write_frame(&mut writer, 0, 0, &[0; 5000])?;
        write_frame(&mut writer, 0, 4099, &[7; 3])?;
        writer.mark_block_n_frames(2);
        writer.commit()?;

        let column = writer.read_committed(0)?;
        assert_eq!(column.len(), 5000);
        assert_eq!(&column[4099..4102], &[7, 7, 7]);
        assert_eq!(column[4102], 0);
        Ok(())
    }
}
