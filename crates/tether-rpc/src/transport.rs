//! Wire transport abstraction and the length-prefixed frame codec.
//!
//! A [`Transport`] is the outbound half of a bidirectional channel to one
//! remote process; inbound frames are pushed into the owning connection by
//! whoever drives the socket. [`ChannelTransport`] backs a transport with an
//! unbounded mpsc channel, which the socket writer task (or a test) drains.
//!
//! Stream sockets frame each JSON text with a 4-byte big-endian length prefix:
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length BE)   |  (JSON payload)  |
//! +----------------+------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// Maximum frame size (16 MB)
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// Outbound half of a connection to a remote process.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Queue one encoded frame for the remote.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport has shut down.
    fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Release the transport. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Items produced by a [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// Transport backed by an unbounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        self.sender
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Codec for length-prefixed JSON text frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    current_length: Option<usize>,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_length.is_none() {
            if src.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let len = src.get_u32() as usize;

            if len > MAX_MESSAGE_SIZE {
                return Err(CodecError::MessageTooLarge(len));
            }

            self.current_length = Some(len);
        }

        let Some(length) = self.current_length else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let payload = src.split_to(length);
        self.current_length = None;

        let text = std::str::from_utf8(&payload)?;
        Ok(Some(text.to_string()))
    }
}

impl Encoder<String> for FrameCodec {
    type Error = CodecError;

    // Frame size is checked against MAX_MESSAGE_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.as_bytes();

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(bytes.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.put_slice(bytes);

        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),
}
