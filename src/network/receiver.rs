use std::mem;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::protocol::{
    DataFrameHeader, EndOfBlockHeader, FrameType, GenericHeader, HeaderBuffer, MIN_HEADER_SIZE,
    SCR_HEADER_SIZE,
};
use crate::replica::{ReplicationSlaveManager, SlaveWriter, TableBindingRegistry};
use crate::service::ReceiverConfig;
use crate::{AppError, AppResult};

use super::channel::{read_some, write_some, NonBlockingChannel};

/// What the receiver needs before `handle_io` can make progress again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoInterest {
    NeedsRead,
    NeedsWrite,
    /// The table writer is leased elsewhere. Call again after a short pause,
    /// without waiting for readiness.
    NeedsBackoffRetry,
}

type MappingOf<M> = <<M as ReplicationSlaveManager>::Writer as SlaveWriter>::Mapping;

struct OpenMapping<P> {
    master_table_id: i32,
    column_index: i32,
    mapping: P,
    length: usize,
    written: usize,
}

enum ReceiverState<P> {
    /// accumulating generic or extended header bytes
    ReadingHeader,
    /// generic header decoded, table writer not bound yet
    AwaitingLease,
    ReadingBody(OpenMapping<P>),
    /// slave commit ready header sits in the scratch buffer
    AwaitingAckFlush,
}

/// Slave side of the table replication stream.
///
/// Decodes frames from one non-blocking connection at a time and applies
/// them through the table writers leased from the manager. Resumable: every
/// call reads only as many bytes as the current header or body still needs,
/// and returns as soon as the channel would block.
///
/// One receiver serves many connections in sequence: `of` binds a channel,
/// `clear` gives back every lease taken on it. The header scratch buffer
/// and the binding slots are allocated once and reused.
pub struct ReplicationStreamReceiver<M: ReplicationSlaveManager, C> {
    manager: Arc<M>,
    config: ReceiverConfig,
    bindings: TableBindingRegistry<M::Writer>,
    header: HeaderBuffer,
    channel: Option<C>,
    header_offset: usize,
    header_remaining: usize,
    frame: Option<GenericHeader>,
    body_remaining: usize,
    state: ReceiverState<MappingOf<M>>,
    lease_attempts: u32,
    faulted: bool,
}

impl<M: ReplicationSlaveManager, C> ReplicationStreamReceiver<M, C> {
    pub fn new(manager: Arc<M>, config: ReceiverConfig) -> Self {
        ReplicationStreamReceiver {
            manager,
            config,
            bindings: TableBindingRegistry::new(),
            header: HeaderBuffer::new(),
            channel: None,
            header_offset: 0,
            header_remaining: MIN_HEADER_SIZE,
            frame: None,
            body_remaining: 0,
            state: ReceiverState::ReadingHeader,
            lease_attempts: 0,
            faulted: false,
        }
    }

    pub fn channel(&self) -> Option<&C> {
        self.channel.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_ack_pending(&self) -> bool {
        matches!(self.state, ReceiverState::AwaitingAckFlush)
    }

    pub fn bound_table_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Releases every per-connection resource: an open data frame mapping
    /// goes back through `SlaveWriter::discard`, then every leased writer
    /// goes back to the manager. Idempotent. Returns the unbound channel.
    pub fn clear(&mut self) -> Option<C> {
        let channel = self.channel.take()?;
        if let ReceiverState::ReadingBody(open) =
            mem::replace(&mut self.state, ReceiverState::ReadingHeader)
        {
            warn!(
                "connection cleared after {} of {} bytes of a data frame for master table {} column {}",
                open.written, open.length, open.master_table_id, open.column_index
            );
            if let Some(writer) = self.bindings.writer_mut(open.master_table_id) {
                writer.discard(open.column_index, open.mapping, open.written);
            }
        }
        self.bindings.release_all(self.manager.as_ref());
        self.reset_reading();
        self.faulted = false;
        debug!("replication stream receiver cleared");
        Some(channel)
    }

    /// Clears and drops the receiver, freeing its header buffer.
    pub fn close(mut self) {
        self.clear();
    }

    fn reset_reading(&mut self) {
        self.header_offset = 0;
        self.header_remaining = MIN_HEADER_SIZE;
        self.frame = None;
        self.body_remaining = 0;
        self.state = ReceiverState::ReadingHeader;
        self.lease_attempts = 0;
    }

    fn writer_mut(&mut self, master_table_id: i32) -> AppResult<&mut M::Writer> {
        self.bindings.writer_mut(master_table_id).ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "no writer bound for master table {}",
                master_table_id
            ))
        })
    }

    fn current_frame(&self) -> AppResult<GenericHeader> {
        self.frame
            .ok_or_else(|| AppError::IllegalStateError("no frame header decoded".into()))
    }
}

fn no_connection() -> AppError {
    AppError::IllegalStateError("no connection bound to receiver".into())
}

impl<M: ReplicationSlaveManager, C: NonBlockingChannel> ReplicationStreamReceiver<M, C> {
    /// Binds the receiver to a new connection, releasing the previous one.
    pub fn of(&mut self, channel: C) {
        if self.channel.is_some() {
            self.clear();
        }
        self.channel = Some(channel);
        self.faulted = false;
        self.reset_reading();
    }

    /// Makes as much progress as the channel allows.
    ///
    /// Any error faults the connection: the caller must `clear` it, no
    /// further progress is possible until then.
    pub fn handle_io(&mut self) -> AppResult<IoInterest> {
        if self.faulted {
            return Err(AppError::IllegalStateError(
                "receiver faulted, clear it before reuse".into(),
            ));
        }
        if self.channel.is_none() {
            return Err(no_connection());
        }
        let result = match self.state {
            ReceiverState::AwaitingAckFlush => self.handle_write(),
            _ => self.handle_read(),
        };
        if let Err(e) = &result {
            warn!("replication stream faulted: {}", e);
            self.faulted = true;
        }
        result
    }

    fn handle_read(&mut self) -> AppResult<IoInterest> {
        loop {
            match self.state {
                ReceiverState::ReadingHeader => {}
                ReceiverState::AwaitingLease => {
                    if let Some(interest) = self.resolve_binding()? {
                        return Ok(interest);
                    }
                    continue;
                }
                ReceiverState::ReadingBody(_) => {
                    if let Some(interest) = self.read_body()? {
                        return Ok(interest);
                    }
                    continue;
                }
                ReceiverState::AwaitingAckFlush => return Ok(IoInterest::NeedsWrite),
            }

            if self.header_remaining > 0 {
                let channel = self.channel.as_mut().ok_or_else(no_connection)?;
                let buf = self
                    .header
                    .slice_mut(self.header_offset, self.header_remaining);
                match read_some(channel, buf)? {
                    None => return Ok(IoInterest::NeedsRead),
                    Some(n) => {
                        self.header_offset += n;
                        self.header_remaining -= n;
                    }
                }
                if self.header_remaining > 0 {
                    continue;
                }
            }

            let frame = match self.frame {
                Some(frame) => frame,
                None => {
                    self.decode_generic_header()?;
                    continue;
                }
            };

            match frame.frame_type {
                FrameType::DataFrame => self.open_data_frame(frame)?,
                FrameType::EndOfBlock => {
                    if self.handle_end_of_block(frame)? {
                        return Ok(IoInterest::NeedsWrite);
                    }
                }
                FrameType::CommitBlock => {
                    self.handle_commit_block(frame)?;
                    return Ok(IoInterest::NeedsRead);
                }
                FrameType::SlaveCommitReady => {
                    return Err(AppError::MalformedProtocol(
                        "slave commit ready frame sent to slave".into(),
                    ))
                }
            }
        }
    }

    fn decode_generic_header(&mut self) -> AppResult<()> {
        let header = GenericHeader::decode(&self.header)?;
        let body_len = header.body_len();
        match header.frame_type {
            FrameType::SlaveCommitReady => {
                return Err(AppError::MalformedProtocol(format!(
                    "slave commit ready frame for master table {} received by slave",
                    header.master_table_id
                )));
            }
            FrameType::EndOfBlock | FrameType::CommitBlock if body_len != 0 => {
                return Err(AppError::MalformedProtocol(format!(
                    "{:?} frame for master table {} carries {} body bytes",
                    header.frame_type, header.master_table_id, body_len
                )));
            }
            FrameType::DataFrame if body_len > self.config.max_frame_size => {
                return Err(AppError::MalformedProtocol(format!(
                    "data frame body of {} bytes exceeds limit of {}",
                    body_len, self.config.max_frame_size
                )));
            }
            _ => {}
        }
        trace!(
            "frame {:?} size {} master table {}",
            header.frame_type,
            header.frame_size,
            header.master_table_id
        );
        self.header_remaining = header.frame_type.header_size() - self.header_offset;
        self.body_remaining = body_len;
        self.frame = Some(header);
        self.state = ReceiverState::AwaitingLease;
        self.lease_attempts = 0;
        Ok(())
    }

    /// `Ok(None)` once the frame's table is bound.
    fn resolve_binding(&mut self) -> AppResult<Option<IoInterest>> {
        let master_table_id = self.current_frame()?.master_table_id;
        match self
            .bindings
            .resolve(master_table_id, self.manager.as_ref())
        {
            Ok(_) => {
                self.state = ReceiverState::ReadingHeader;
                self.lease_attempts = 0;
                Ok(None)
            }
            Err(AppError::WriterBusy(_)) => {
                self.lease_attempts += 1;
                if self.lease_attempts > self.config.max_lease_retries {
                    return Err(AppError::LeaseFailure {
                        table_id: master_table_id,
                        reason: format!(
                            "writer still leased elsewhere after {} attempts",
                            self.lease_attempts
                        ),
                    });
                }
                debug!(
                    "writer of master table {} is busy, attempt {}",
                    master_table_id, self.lease_attempts
                );
                Ok(Some(IoInterest::NeedsBackoffRetry))
            }
            Err(e) => Err(e),
        }
    }

    fn open_data_frame(&mut self, frame: GenericHeader) -> AppResult<()> {
        let data_header = DataFrameHeader::decode(&self.header)?;
        let length = self.body_remaining;
        let column_end = (data_header.data_offset as u64).checked_add(length as u64);
        if column_end.map_or(true, |end| end > self.config.max_column_size) {
            return Err(AppError::MalformedProtocol(format!(
                "data frame for master table {} writes column {} past {} bytes: offset {}, length {}",
                frame.master_table_id,
                data_header.column_index,
                self.config.max_column_size,
                data_header.data_offset,
                length
            )));
        }
        let writer = self.writer_mut(frame.master_table_id)?;
        let mapping = writer.map_column_data(
            data_header.first_timestamp,
            data_header.column_index,
            data_header.data_offset,
            length,
        )?;
        if mapping.len() < length {
            let mapped = mapping.len();
            writer.discard(data_header.column_index, mapping, 0);
            return Err(AppError::IllegalStateError(format!(
                "writer mapped {} bytes for a {} byte frame",
                mapped, length
            )));
        }
        trace!(
            "data frame for master table {}: {}, {} bytes",
            frame.master_table_id,
            data_header,
            length
        );
        self.state = ReceiverState::ReadingBody(OpenMapping {
            master_table_id: frame.master_table_id,
            column_index: data_header.column_index,
            mapping,
            length,
            written: 0,
        });
        Ok(())
    }

    /// Streams body bytes straight into the open mapping and unmaps it once
    /// full. `Ok(None)` when the next frame header can be read.
    fn read_body(&mut self) -> AppResult<Option<IoInterest>> {
        let ReceiverState::ReadingBody(open) = &mut self.state else {
            return Err(AppError::IllegalStateError("no data frame open".into()));
        };
        while open.written < open.length {
            let channel = self.channel.as_mut().ok_or_else(no_connection)?;
            match read_some(channel, &mut open.mapping[open.written..open.length])? {
                None => return Ok(Some(IoInterest::NeedsRead)),
                Some(n) => {
                    open.written += n;
                    self.body_remaining -= n;
                }
            }
        }

        let ReceiverState::ReadingBody(open) =
            mem::replace(&mut self.state, ReceiverState::ReadingHeader)
        else {
            return Err(AppError::IllegalStateError("no data frame open".into()));
        };
        let writer = self.writer_mut(open.master_table_id)?;
        let block_complete = writer.unmap(open.column_index, open.mapping, open.length)?;
        trace!(
            "unmapped {} bytes of column {} for master table {}, block complete: {}",
            open.length,
            open.column_index,
            open.master_table_id,
            block_complete
        );
        if block_complete {
            self.prepare_ack(open.master_table_id);
            return Ok(Some(IoInterest::NeedsWrite));
        }
        self.reset_reading();
        Ok(None)
    }

    fn handle_end_of_block(&mut self, frame: GenericHeader) -> AppResult<bool> {
        let end_of_block = EndOfBlockHeader::decode(&self.header)?;
        let writer = self.writer_mut(frame.master_table_id)?;
        let block_complete = writer.mark_block_n_frames(end_of_block.frames_sent);
        debug!(
            "end of block for master table {}: {} frames sent, block complete: {}",
            frame.master_table_id, end_of_block.frames_sent, block_complete
        );
        if block_complete {
            self.prepare_ack(frame.master_table_id);
        } else {
            self.reset_reading();
        }
        Ok(block_complete)
    }

    fn handle_commit_block(&mut self, frame: GenericHeader) -> AppResult<()> {
        self.writer_mut(frame.master_table_id)?.commit()?;
        debug!("committed block for master table {}", frame.master_table_id);
        self.reset_reading();
        Ok(())
    }

    /// Puts the slave commit ready frame in the scratch buffer and switches
    /// to the write phase.
    fn prepare_ack(&mut self, master_table_id: i32) {
        GenericHeader::slave_commit_ready(master_table_id).encode_into(&mut self.header);
        self.header_offset = 0;
        self.header_remaining = SCR_HEADER_SIZE;
        self.frame = None;
        self.body_remaining = 0;
        self.state = ReceiverState::AwaitingAckFlush;
        debug!("block of master table {} ready to commit", master_table_id);
    }

    fn handle_write(&mut self) -> AppResult<IoInterest> {
        while self.header_remaining > 0 {
            let channel = self.channel.as_mut().ok_or_else(no_connection)?;
            let buf = self.header.slice(self.header_offset, self.header_remaining);
            match write_some(channel, buf)? {
                None => return Ok(IoInterest::NeedsWrite),
                Some(n) => {
                    self.header_offset += n;
                    self.header_remaining -= n;
                }
            }
        }
        self.reset_reading();
        Ok(IoInterest::NeedsRead)
    }
}

impl<M: ReplicationSlaveManager, C> Drop for ReplicationStreamReceiver<M, C> {
    fn drop(&mut self) {
        self.clear();
    }
}
