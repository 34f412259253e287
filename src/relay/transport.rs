//! Transport handle: one TCP socket owned by a session

use std::fmt;
use std::io;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::Result;

/// Which end of the session a transport faces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// A live TCP socket with TCP_NODELAY enabled and an idempotent close
#[derive(Debug)]
pub struct Transport {
    stream: TcpStream,
    side: Side,
    peer_addr: SocketAddr,
    closed: bool,
}

impl Transport {
    /// Take ownership of a connected socket and switch off Nagle's algorithm
    /// before anything is written to it.
    pub fn new(stream: TcpStream, side: Side) -> Result<Self> {
        stream
            .set_nodelay(true)
            .with_context(|| format!("Failed to enable TCP_NODELAY on {} socket", side))?;
        let peer_addr = stream
            .peer_addr()
            .with_context(|| format!("Failed to get {} peer address", side))?;

        Ok(Self {
            stream,
            side,
            peer_addr,
            closed: false,
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.stream.nodelay()
    }

    /// Read whatever is available into `buf`; `Ok(0)` means the peer closed
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream.read_buf(buf).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Borrow separate read and write halves for forwarding
    pub fn split(&mut self) -> (ReadHalf<'_>, WriteHalf<'_>) {
        self.stream.split()
    }

    /// Shut the socket down. Calling this again is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // The peer may already be gone; there is nothing left to report then.
        match self.stream.shutdown().await {
            Ok(()) => debug!(side = %self.side, peer = %self.peer_addr, "Transport closed"),
            Err(e) => debug!(
                side = %self.side,
                peer = %self.peer_addr,
                error = %e,
                "Transport closed (peer already gone)"
            ),
        }
    }
}
