//! One-directional forwarding loop

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::transport::Side;
use crate::metrics::{Direction, RelayStats};

/// Which half of a pump failed
#[derive(Debug)]
pub enum PumpError {
    Read(io::Error),
    Write(io::Error),
}

impl PumpError {
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            PumpError::Read(e) | PumpError::Write(e) => e.kind(),
        }
    }

    /// The socket that failed, given the direction the pump was copying
    pub fn failed_side(&self, direction: Direction) -> Side {
        match (self, direction) {
            (PumpError::Read(_), Direction::ClientToTarget)
            | (PumpError::Write(_), Direction::TargetToClient) => Side::Client,
            (PumpError::Read(_), Direction::TargetToClient)
            | (PumpError::Write(_), Direction::ClientToTarget) => Side::Target,
        }
    }
}

impl fmt::Display for PumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpError::Read(e) => write!(f, "read failed: {}", e),
            PumpError::Write(e) => write!(f, "write failed: {}", e),
        }
    }
}

impl std::error::Error for PumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PumpError::Read(e) | PumpError::Write(e) => Some(e),
        }
    }
}

/// Copy chunks from `reader` to `writer` until the reader reaches EOF.
///
/// Each chunk is written in full before the next read, so chunks arrive in
/// the order they were read. `forwarded` and the process counters are bumped
/// per chunk, so they stay accurate even if this future is dropped midway.
pub async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    direction: Direction,
    stats: &RelayStats,
    forwarded: &mut u64,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = reader.read(&mut buf).await.map_err(PumpError::Read)?;
        if n == 0 {
            return Ok(());
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(PumpError::Write)?;
        stats.add_bytes(direction, n as u64);
        *forwarded += n as u64;

        trace!(direction = direction.as_str(), bytes = n, "Forwarded chunk");
    }
}
