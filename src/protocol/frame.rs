use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

use super::{
    DataFrameHeader, EndOfBlockHeader, FrameType, GenericHeader, HeaderBuffer, MIN_HEADER_SIZE,
};

/// A whole frame, as the master encodes it.
///
/// The slave engine never materializes frames, it streams them. This type is
/// for the sending side and for reading acknowledgments back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    Data {
        master_table_id: i32,
        header: DataFrameHeader,
        body: Bytes,
    },
    EndOfBlock {
        master_table_id: i32,
        frames_sent: u32,
    },
    CommitBlock {
        master_table_id: i32,
    },
    SlaveCommitReady {
        master_table_id: i32,
    },
}

impl ReplicationFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            ReplicationFrame::Data { .. } => FrameType::DataFrame,
            ReplicationFrame::EndOfBlock { .. } => FrameType::EndOfBlock,
            ReplicationFrame::CommitBlock { .. } => FrameType::CommitBlock,
            ReplicationFrame::SlaveCommitReady { .. } => FrameType::SlaveCommitReady,
        }
    }

    pub fn master_table_id(&self) -> i32 {
        match self {
            ReplicationFrame::Data {
                master_table_id, ..
            }
            | ReplicationFrame::EndOfBlock {
                master_table_id, ..
            }
            | ReplicationFrame::CommitBlock { master_table_id }
            | ReplicationFrame::SlaveCommitReady { master_table_id } => *master_table_id,
        }
    }

    pub fn frame_size(&self) -> usize {
        let body_len = match self {
            ReplicationFrame::Data { body, .. } => body.len(),
            _ => 0,
        };
        self.frame_type().header_size() + body_len
    }

    pub fn encode(&self, out: &mut BytesMut) -> AppResult<()> {
        let frame_size = i32::try_from(self.frame_size()).map_err(|_| {
            AppError::InvalidValue(format!("frame of {} bytes is too large", self.frame_size()))
        })?;
        let frame_type = self.frame_type();
        let mut header = HeaderBuffer::new();
        GenericHeader {
            frame_type,
            frame_size,
            master_table_id: self.master_table_id(),
        }
        .encode_into(&mut header);
        match self {
            ReplicationFrame::Data { header: df, .. } => df.encode_into(&mut header),
            ReplicationFrame::EndOfBlock { frames_sent, .. } => EndOfBlockHeader {
                frames_sent: *frames_sent,
            }
            .encode_into(&mut header),
            _ => {}
        }
        out.reserve(frame_size as usize);
        out.put_slice(header.slice(0, frame_type.header_size()));
        if let ReplicationFrame::Data { body, .. } = self {
            out.put_slice(body);
        }
        Ok(())
    }

    /// Decodes one complete frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold the whole frame, and
    /// the number of bytes consumed otherwise.
    pub fn decode(src: &[u8]) -> AppResult<Option<(ReplicationFrame, usize)>> {
        if src.len() < MIN_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = HeaderBuffer::new();
        header
            .slice_mut(0, MIN_HEADER_SIZE)
            .copy_from_slice(&src[..MIN_HEADER_SIZE]);
        let generic = GenericHeader::decode(&header)?;
        let header_size = generic.frame_type.header_size();
        let frame_size = generic.frame_size as usize;
        if src.len() < frame_size {
            return Ok(None);
        }
        header
            .slice_mut(MIN_HEADER_SIZE, header_size - MIN_HEADER_SIZE)
            .copy_from_slice(&src[MIN_HEADER_SIZE..header_size]);

        let master_table_id = generic.master_table_id;
        let frame = match generic.frame_type {
            FrameType::DataFrame => ReplicationFrame::Data {
                master_table_id,
                header: DataFrameHeader::decode(&header)?,
                body: Bytes::copy_from_slice(&src[header_size..frame_size]),
            },
            FrameType::EndOfBlock => ReplicationFrame::EndOfBlock {
                master_table_id,
                frames_sent: EndOfBlockHeader::decode(&header)?.frames_sent,
            },
            FrameType::CommitBlock => ReplicationFrame::CommitBlock { master_table_id },
            FrameType::SlaveCommitReady => ReplicationFrame::SlaveCommitReady { master_table_id },
        };
        if generic.body_len() != 0 && generic.frame_type != FrameType::DataFrame {
            return Err(AppError::MalformedProtocol(format!(
                "{:?} frame carries {} body bytes",
                generic.frame_type,
                generic.body_len()
            )));
        }
        Ok(Some((frame, frame_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DF_HEADER_SIZE, EOB_HEADER_SIZE};

    fn data_frame(body_len: usize) -> ReplicationFrame {
        ReplicationFrame::Data {
            master_table_id: 7,
            header: DataFrameHeader {
                first_timestamp: 1_000,
                column_index: 1,
                data_offset: 256,
            },
            body: Bytes::from(vec![0xAB; body_len]),
        }
    }

    #[test]
    fn test_encode_data_frame_layout() -> AppResult<()> {
        let mut out = BytesMut::new();
        data_frame(64).encode(&mut out)?;

        assert_eq!(out.len(), DF_HEADER_SIZE + 64);
        assert_eq!(out[0], FrameType::DataFrame.id() as u8);
        assert_eq!(&out[1..5], &((DF_HEADER_SIZE + 64) as i32).to_le_bytes());
        assert_eq!(&out[5..9], &7i32.to_le_bytes());
        assert!(out[DF_HEADER_SIZE..].iter().all(|b| *b == 0xAB));
        Ok(())
    }

    #[test]
    fn test_decode_needs_whole_frame() -> AppResult<()> {
        let mut out = BytesMut::new();
        data_frame(16).encode(&mut out)?;

        assert!(ReplicationFrame::decode(&out[..MIN_HEADER_SIZE - 1])?.is_none());
        assert!(ReplicationFrame::decode(&out[..out.len() - 1])?.is_none());
        let (frame, consumed) = ReplicationFrame::decode(&out)?.unwrap();
        assert_eq!(consumed, out.len());
        assert_eq!(frame, data_frame(16));
        Ok(())
    }

    #[test]
    fn test_decode_stream_of_frames() -> AppResult<()> {
        let frames = vec![
            data_frame(8),
            ReplicationFrame::EndOfBlock {
                master_table_id: 7,
                frames_sent: 1,
            },
            ReplicationFrame::CommitBlock { master_table_id: 7 },
            ReplicationFrame::SlaveCommitReady { master_table_id: 7 },
        ];
        let mut out = BytesMut::new();
        for frame in &frames {
            frame.encode(&mut out)?;
        }

        let mut decoded = Vec::new();
        let mut position = 0;
        while let Some((frame, consumed)) = ReplicationFrame::decode(&out[position..])? {
            decoded.push(frame);
            position += consumed;
        }
        assert_eq!(decoded, frames);
        assert_eq!(position, out.len());
        Ok(())
    }

    #[test]
    fn test_decode_rejects_control_frame_body() -> AppResult<()> {
        let mut out = BytesMut::new();
        ReplicationFrame::EndOfBlock {
            master_table_id: 1,
            frames_sent: 2,
        }
        .encode(&mut out)?;
        out[1..5].copy_from_slice(&((EOB_HEADER_SIZE + 2) as i32).to_le_bytes());
        out.put_slice(&[0, 0]);

        assert!(ReplicationFrame::decode(&out).is_err());
        Ok(())
    }
}
