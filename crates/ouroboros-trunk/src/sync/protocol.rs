//! Storage peer wire protocol
//!
//! Every request and response starts with a 10 byte header:
//!
//! ```text
//! +----------------+-----+--------+
//! | pkg_len: i64   | cmd | status |
//! | (big endian)   | u8  | u8     |
//! +----------------+-----+--------+
//! ```
//!
//! followed by `pkg_len` body bytes. Peers answer every request except
//! `Quit` with a `Resp` header.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, TrunkError};

pub const PACKET_HEADER_SIZE: usize = 10;

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unexpected end of data")]
    UnexpectedEof,

    #[error("Invalid package length: {0}")]
    InvalidLength(i64),

    #[error("Unexpected body length {actual}, expected at most {expected}")]
    UnexpectedBody { expected: usize, actual: i64 },

    #[error("Invalid command: {0}")]
    InvalidCommand(u8),
}

/// Command codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TrunkSyncBinlog = 30,
    TrunkTruncateBinlogFile = 33,
    Quit = 82,
    Resp = 100,
    ActiveTest = 111,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> std::result::Result<Self, Self::Error> {
        match byte {
            30 => Ok(Command::TrunkSyncBinlog),
            33 => Ok(Command::TrunkTruncateBinlogFile),
            82 => Ok(Command::Quit),
            100 => Ok(Command::Resp),
            111 => Ok(Command::ActiveTest),
            _ => Err(ProtocolError::InvalidCommand(byte)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub pkg_len: i64,
    pub cmd: u8,
    pub status: u8,
}

impl PacketHeader {
    pub fn new(cmd: Command, body_len: usize) -> Self {
        Self {
            pkg_len: body_len as i64,
            cmd: cmd as u8,
            status: 0,
        }
    }

    pub fn response(status: u8, body_len: usize) -> Self {
        Self {
            pkg_len: body_len as i64,
            cmd: Command::Resp as u8,
            status,
        }
    }

    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[..8].copy_from_slice(&self.pkg_len.to_be_bytes());
        buf[8] = self.cmd;
        buf[9] = self.status;
        buf
    }

    pub fn decode(buf: &[u8; PACKET_HEADER_SIZE]) -> Self {
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[..8]);
        Self {
            pkg_len: i64::from_be_bytes(len),
            cmd: buf[8],
            status: buf[9],
        }
    }
}

/// Client connection to a peer storage node.
///
/// Every send and receive is bounded by the network timeout.
pub struct PeerConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    network_timeout: Duration,
}

impl PeerConnection {
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        network_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;

        debug!("Connected to peer {}", peer_addr);
        Ok(Self {
            stream,
            peer_addr,
            network_timeout,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address of the socket, as the peer sees this node
    pub fn local_ip(&self) -> Result<IpAddr> {
        Ok(self.stream.local_addr()?.ip())
    }

    /// Ship a batch of complete binlog lines and wait for the ack
    pub async fn send_binlog(&mut self, lines: &[u8]) -> Result<()> {
        self.send_request(Command::TrunkSyncBinlog, lines).await?;
        self.recv_response(0).await.map(|_| ())
    }

    /// Ask the peer to drop its copy of our binlog before a full resend
    pub async fn truncate_binlog(&mut self) -> Result<()> {
        self.send_request(Command::TrunkTruncateBinlogFile, &[]).await?;
        self.recv_response(0).await.map(|_| ())
    }

    /// Idle keepalive
    pub async fn active_test(&mut self) -> Result<()> {
        self.send_request(Command::ActiveTest, &[]).await?;
        self.recv_response(0).await.map(|_| ())
    }

    /// Tell the peer we are hanging up; no response is expected
    pub async fn quit(&mut self) -> Result<()> {
        self.send_request(Command::Quit, &[]).await
    }

    pub async fn send_request(&mut self, cmd: Command, body: &[u8]) -> Result<()> {
        let header = PacketHeader::new(cmd, body.len()).encode();

        let send = async {
            self.stream.write_all(&header).await?;
            if !body.is_empty() {
                self.stream.write_all(body).await?;
            }
            self.stream.flush().await
        };

        timeout(self.network_timeout, send)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))?
            .map_err(|e| TrunkError::Protocol(ProtocolError::Io(e)))
    }

    /// Read one response, accepting a body of at most `max_body` bytes
    pub async fn recv_response(&mut self, max_body: usize) -> Result<Vec<u8>> {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        self.read_exact(&mut buf).await?;
        let header = PacketHeader::decode(&buf);

        if header.status != 0 {
            return Err(TrunkError::Peer {
                status: header.status,
            });
        }
        if header.pkg_len < 0 {
            return Err(ProtocolError::InvalidLength(header.pkg_len).into());
        }
        if header.pkg_len as u64 > max_body as u64 {
            return Err(ProtocolError::UnexpectedBody {
                expected: max_body,
                actual: header.pkg_len,
            }
            .into());
        }

        let mut body = vec![0u8; header.pkg_len as usize];
        if !body.is_empty() {
            self.read_exact(&mut body).await?;
        }
        Ok(body)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match timeout(self.network_timeout, self.stream.read_exact(buf)).await {
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "recv timed out").into()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ProtocolError::UnexpectedEof.into())
            }
            Ok(Err(e)) => Err(ProtocolError::Io(e).into()),
            Ok(Ok(_)) => Ok(()),
        }
    }
}
