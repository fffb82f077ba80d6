//! Async client for the docking protocol. One request in flight at a time.

use crate::protocol::{
    license_from_str, Frame, FrameBuffer, Message, MessageType, ProtocolError, Status, NO_DOCK,
    NO_FEE, READ_CHUNK_LEN,
};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server closed the connection")]
    ConnectionClosed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("response sequence {actual} does not match request {expected}")]
    SequenceMismatch { expected: u32, actual: u32 },

    #[error("unexpected {0:?} response")]
    UnexpectedResponse(MessageType),
}

/// Status plus fee from an undock or fee query. `fee` is `None` when the
/// server reported no fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeReply {
    pub status: Status,
    pub fee: Option<i64>,
}

impl FeeReply {
    fn new(status: Status, fee: i64) -> Self {
        Self {
            status,
            fee: (fee != NO_FEE).then_some(fee),
        }
    }
}

pub struct DockClient {
    stream: TcpStream,
    buffer: FrameBuffer,
    next_sequence: u32,
    session: Option<u32>,
    response_timeout: Duration,
}

impl DockClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buffer: FrameBuffer::new(),
            next_sequence: 1,
            session: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        })
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Session id assigned by the server, known after the first response.
    pub fn session(&self) -> Option<u32> {
        self.session
    }

    /// Sends one request and waits for its response.
    pub async fn request(&mut self, message: Message) -> Result<Frame, ClientError> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let request = Frame::new(sequence, self.session.unwrap_or(0), message);
        self.stream.write_all(&request.encode()).await?;

        let limit = self.response_timeout;
        let response = tokio::time::timeout(limit, self.read_frame())
            .await
            .map_err(|_| ClientError::Timeout(limit))??;

        if response.sequence != sequence {
            return Err(ClientError::SequenceMismatch {
                expected: sequence,
                actual: response.sequence,
            });
        }
        self.session = Some(response.session);
        Ok(response)
    }

    async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        let mut chunk = [0u8; READ_CHUNK_LEN];
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.buffer.extend(&chunk[..n])?;
        }
    }

    /// Asks for a free dock able to take `weight`.
    pub async fn query(&mut self, weight: f32) -> Result<Option<i32>, ClientError> {
        match self.request(Message::DockQuery { weight }).await?.message {
            Message::DockQueryResponse { dock_id } => Ok((dock_id != NO_DOCK).then_some(dock_id)),
            other => Err(ClientError::UnexpectedResponse(other.message_type())),
        }
    }

    /// Licenses longer than the wire field are truncated.
    pub async fn dock(
        &mut self,
        dock_id: i32,
        weight: f32,
        license: &str,
    ) -> Result<Status, ClientError> {
        let message = Message::DockRequest {
            dock_id,
            weight,
            license: license_from_str(license),
        };
        match self.request(message).await?.message {
            Message::DockResponse { status } => Ok(status),
            other => Err(ClientError::UnexpectedResponse(other.message_type())),
        }
    }

    pub async fn undock(&mut self, dock_id: i32) -> Result<FeeReply, ClientError> {
        match self.request(Message::UndockRequest { dock_id }).await?.message {
            Message::UndockResponse { status, fee } => Ok(FeeReply::new(status, fee)),
            other => Err(ClientError::UnexpectedResponse(other.message_type())),
        }
    }

    pub async fn fee(&mut self, dock_id: i32) -> Result<FeeReply, ClientError> {
        match self.request(Message::FeeQuery { dock_id }).await?.message {
            Message::FeeResponse { status, fee } => Ok(FeeReply::new(status, fee)),
            other => Err(ClientError::UnexpectedResponse(other.message_type())),
        }
    }
}
