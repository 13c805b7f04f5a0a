use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut};
use chrono::{TimeZone, Utc};

use crate::{AppError, AppResult};

use super::{
    CB_HEADER_SIZE, DF_HEADER_SIZE, EOB_HEADER_SIZE, MAX_HEADER_SIZE, MIN_HEADER_SIZE,
    OFFSET_DF_COLUMN_INDEX, OFFSET_DF_DATA_OFFSET, OFFSET_DF_FIRST_TIMESTAMP,
    OFFSET_EOB_N_FRAMES_SENT, OFFSET_FRAME_SIZE, OFFSET_FRAME_TYPE, OFFSET_MASTER_TABLE_ID,
    SCR_HEADER_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum FrameType {
    DataFrame = 0,
    EndOfBlock = 1,
    CommitBlock = 2,
    SlaveCommitReady = 3,
}

impl FrameType {
    pub const MIN_ID: i8 = FrameType::DataFrame as i8;
    pub const MAX_ID: i8 = FrameType::SlaveCommitReady as i8;

    /// Size of the generic header plus this type's header extension.
    pub fn header_size(self) -> usize {
        match self {
            FrameType::DataFrame => DF_HEADER_SIZE,
            FrameType::EndOfBlock => EOB_HEADER_SIZE,
            FrameType::CommitBlock => CB_HEADER_SIZE,
            FrameType::SlaveCommitReady => SCR_HEADER_SIZE,
        }
    }

    pub fn id(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for FrameType {
    type Error = AppError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::DataFrame),
            1 => Ok(FrameType::EndOfBlock),
            2 => Ok(FrameType::CommitBlock),
            3 => Ok(FrameType::SlaveCommitReady),
            _ => Err(AppError::MalformedProtocol(format!(
                "frame type {} outside [{}, {}]",
                value,
                FrameType::MIN_ID,
                FrameType::MAX_ID
            ))),
        }
    }
}

/// Fixed-capacity scratch buffer holding one frame header.
///
/// Allocated once per receiver and reused for every header read and for the
/// outbound acknowledgment. Accessors take absolute offsets and panic on an
/// offset past `MAX_HEADER_SIZE`, which only a wrong constant can produce.
#[derive(Debug, Clone)]
pub struct HeaderBuffer {
    bytes: Box<[u8; MAX_HEADER_SIZE]>,
}

impl Default for HeaderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderBuffer {
    pub const CAPACITY: usize = MAX_HEADER_SIZE;

    pub fn new() -> Self {
        HeaderBuffer {
            bytes: Box::new([0u8; MAX_HEADER_SIZE]),
        }
    }

    pub fn get_i8(&self, offset: usize) -> i8 {
        (&self.bytes[offset..]).get_i8()
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        (&self.bytes[offset..]).get_i32_le()
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        (&self.bytes[offset..]).get_i64_le()
    }

    pub fn put_i8(&mut self, offset: usize, value: i8) {
        (&mut self.bytes[offset..]).put_i8(value);
    }

    pub fn put_i32(&mut self, offset: usize, value: i32) {
        (&mut self.bytes[offset..]).put_i32_le(value);
    }

    pub fn put_i64(&mut self, offset: usize, value: i64) {
        (&mut self.bytes[offset..]).put_i64_le(value);
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.bytes[offset..offset + len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericHeader {
    pub frame_type: FrameType,
    pub frame_size: i32,
    pub master_table_id: i32,
}

impl GenericHeader {
    /// Decodes the generic header from the first `MIN_HEADER_SIZE` bytes.
    ///
    /// Rejects unknown frame types and frame sizes smaller than the type's
    /// own header.
    pub fn decode(buffer: &HeaderBuffer) -> AppResult<GenericHeader> {
        let frame_type = FrameType::try_from(buffer.get_i8(OFFSET_FRAME_TYPE))?;
        let frame_size = buffer.get_i32(OFFSET_FRAME_SIZE);
        let master_table_id = buffer.get_i32(OFFSET_MASTER_TABLE_ID);
        if frame_size < 0 || (frame_size as usize) < frame_type.header_size() {
            return Err(AppError::MalformedProtocol(format!(
                "frame size {} smaller than {:?} header size {}",
                frame_size,
                frame_type,
                frame_type.header_size()
            )));
        }
        Ok(GenericHeader {
            frame_type,
            frame_size,
            master_table_id,
        })
    }

    pub fn encode_into(&self, buffer: &mut HeaderBuffer) {
        buffer.put_i8(OFFSET_FRAME_TYPE, self.frame_type.id());
        buffer.put_i32(OFFSET_FRAME_SIZE, self.frame_size);
        buffer.put_i32(OFFSET_MASTER_TABLE_ID, self.master_table_id);
    }

    /// Bytes following the full (generic + extended) header.
    pub fn body_len(&self) -> usize {
        self.frame_size as usize - self.frame_type.header_size()
    }

    pub fn slave_commit_ready(master_table_id: i32) -> GenericHeader {
        GenericHeader {
            frame_type: FrameType::SlaveCommitReady,
            frame_size: SCR_HEADER_SIZE as i32,
            master_table_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrameHeader {
    pub first_timestamp: i64,
    pub column_index: i32,
    pub data_offset: i64,
}

impl DataFrameHeader {
    pub fn decode(buffer: &HeaderBuffer) -> AppResult<DataFrameHeader> {
        let header = DataFrameHeader {
            first_timestamp: buffer.get_i64(OFFSET_DF_FIRST_TIMESTAMP),
            column_index: buffer.get_i32(OFFSET_DF_COLUMN_INDEX),
            data_offset: buffer.get_i64(OFFSET_DF_DATA_OFFSET),
        };
        if header.column_index < 0 || header.data_offset < 0 {
            return Err(AppError::MalformedProtocol(format!(
                "negative column index {} or data offset {}",
                header.column_index, header.data_offset
            )));
        }
        Ok(header)
    }

    pub fn encode_into(&self, buffer: &mut HeaderBuffer) {
        buffer.put_i64(OFFSET_DF_FIRST_TIMESTAMP, self.first_timestamp);
        buffer.put_i32(OFFSET_DF_COLUMN_INDEX, self.column_index);
        buffer.put_i64(OFFSET_DF_DATA_OFFSET, self.data_offset);
    }
}

impl Display for DataFrameHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let first_timestamp = Utc.timestamp_micros(self.first_timestamp).single();
        f.debug_struct("DataFrameHeader")
            .field("first_timestamp", &first_timestamp)
            .field("column_index", &self.column_index)
            .field("data_offset", &self.data_offset)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfBlockHeader {
    pub frames_sent: u32,
}

impl EndOfBlockHeader {
    pub fn decode(buffer: &HeaderBuffer) -> AppResult<EndOfBlockHeader> {
        let frames_sent = buffer.get_i32(OFFSET_EOB_N_FRAMES_SENT);
        if frames_sent < 0 {
            return Err(AppError::MalformedProtocol(format!(
                "negative frame count {} in end of block",
                frames_sent
            )));
        }
        Ok(EndOfBlockHeader {
            frames_sent: frames_sent as u32,
        })
    }

    pub fn encode_into(&self, buffer: &mut HeaderBuffer) {
        buffer.put_i32(OFFSET_EOB_N_FRAMES_SENT, self.frames_sent as i32);
    }
}
