// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Slave side table writers.
//!
//! The replication receiver never touches column files itself. For every
//! master table id it leases a [`SlaveWriter`] from a
//! [`ReplicationSlaveManager`] and forwards each frame's effect to it:
//!
//! - data frames become a `map_column_data` / `unmap` pair around the bytes
//!   streamed into the returned mapping,
//! - end of block becomes `mark_block_n_frames`,
//! - commit block becomes `commit`.
//!
//! The writer decides when a block is complete. `unmap` and
//! `mark_block_n_frames` both return `true` only for the call that makes the
//! applied frame count reach the announced count, so exactly one of them
//! fires per block whatever order the frames arrive in.

use std::ops::DerefMut;

use crate::AppResult;

pub use binding::TableBindingRegistry;
pub use column_writer::{ColumnMapping, MmapSlaveWriter};
pub use manager::MmapSlaveManager;

mod binding;
mod column_writer;
mod manager;

pub trait SlaveWriter: Send {
    /// Writable destination for one data frame. Owned by the receiver only
    /// between `map_column_data` and the matching `unmap` or `discard`.
    type Mapping: DerefMut<Target = [u8]> + Send;

    fn map_column_data(
        &mut self,
        first_timestamp: i64,
        column_index: i32,
        data_offset: i64,
        length: usize,
    ) -> AppResult<Self::Mapping>;

    /// Finalizes a fully written mapping. Returns `true` when this frame
    /// completes the current block.
    fn unmap(&mut self, column_index: i32, mapping: Self::Mapping, length: usize)
        -> AppResult<bool>;

    /// Records how many data frames the master sent for the current block.
    /// Returns `true` when every one of them has already been unmapped.
    fn mark_block_n_frames(&mut self, n_frames: u32) -> bool;

    fn commit(&mut self) -> AppResult<()>;

    /// Gives back a mapping abandoned mid-frame. The frame does not count
    /// toward block completion.
    fn discard(&mut self, _column_index: i32, _mapping: Self::Mapping, _written: usize) {}
}

/// Hands out at most one live writer per master table id.
pub trait ReplicationSlaveManager: Send + Sync {
    type Writer: SlaveWriter;

    /// Fails with `AppError::WriterBusy` while another connection holds the
    /// writer, with `AppError::LeaseFailure` when it cannot be produced.
    fn get_slave_writer(&self, master_table_id: i32) -> AppResult<Self::Writer>;

    fn release_slave_writer(&self, master_table_id: i32, writer: Self::Writer);
}
