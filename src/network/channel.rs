use std::io::{self, ErrorKind};

use tokio::net::TcpStream;

use crate::{AppError, AppResult};

/// Non-blocking byte channel the receiver reads frames from and writes
/// acknowledgments to.
///
/// Same contract as a non-blocking socket: `Err(WouldBlock)` means no
/// progress right now, `Ok(0)` for a non-empty buffer means end of stream.
pub trait NonBlockingChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl NonBlockingChannel for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// Reads into `buf`, `Ok(None)` if the channel would block.
pub(crate) fn read_some<C: NonBlockingChannel>(
    channel: &mut C,
    buf: &mut [u8],
) -> AppResult<Option<usize>> {
    debug_assert!(!buf.is_empty());
    loop {
        match channel.try_read(buf) {
            Ok(0) => {
                return Err(AppError::ConnectionClosed(
                    "end of stream while reading frame".into(),
                ))
            }
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(AppError::IoError(e)),
        }
    }
}

/// Writes from `buf`, `Ok(None)` if the channel would block.
pub(crate) fn write_some<C: NonBlockingChannel>(
    channel: &mut C,
    buf: &[u8],
) -> AppResult<Option<usize>> {
    debug_assert!(!buf.is_empty());
    loop {
        match channel.try_write(buf) {
            Ok(0) => {
                return Err(AppError::ConnectionClosed(
                    "peer stopped accepting acknowledgment bytes".into(),
                ))
            }
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(AppError::IoError(e)),
        }
    }
}
