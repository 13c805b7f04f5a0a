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

//! Table replication stream wire format.
//!
//! Every frame starts with the same generic header:
//!
//! ```text
//! +-----------+-----------+----------------+
//! | type (i8) | size(i32) | table id (i32) |
//! +-----------+-----------+----------------+
//! ```
//!
//! `size` counts the whole frame, header included. The generic header is
//! followed by a header extension whose layout depends on the frame type,
//! then (for data frames only) by the body bytes. All integers are
//! little-endian.

pub use frame::ReplicationFrame;
pub use header::{DataFrameHeader, EndOfBlockHeader, FrameType, GenericHeader, HeaderBuffer};

mod frame;
mod header;

pub const OFFSET_FRAME_TYPE: usize = 0;
pub const OFFSET_FRAME_SIZE: usize = OFFSET_FRAME_TYPE + 1;
pub const OFFSET_MASTER_TABLE_ID: usize = OFFSET_FRAME_SIZE + 4;
pub const MIN_HEADER_SIZE: usize = OFFSET_MASTER_TABLE_ID + 4;

// data frame
pub const OFFSET_DF_FIRST_TIMESTAMP: usize = MIN_HEADER_SIZE;
pub const OFFSET_DF_COLUMN_INDEX: usize = OFFSET_DF_FIRST_TIMESTAMP + 8;
pub const OFFSET_DF_DATA_OFFSET: usize = OFFSET_DF_COLUMN_INDEX + 4;
pub const DF_HEADER_SIZE: usize = OFFSET_DF_DATA_OFFSET + 8;

// end of block
pub const OFFSET_EOB_N_FRAMES_SENT: usize = MIN_HEADER_SIZE;
pub const EOB_HEADER_SIZE: usize = OFFSET_EOB_N_FRAMES_SENT + 4;

pub const CB_HEADER_SIZE: usize = MIN_HEADER_SIZE;
pub const SCR_HEADER_SIZE: usize = MIN_HEADER_SIZE;

pub const MAX_HEADER_SIZE: usize = DF_HEADER_SIZE;

const _: () = assert!(MAX_HEADER_SIZE >= EOB_HEADER_SIZE);
const _: () = assert!(MAX_HEADER_SIZE >= CB_HEADER_SIZE);
