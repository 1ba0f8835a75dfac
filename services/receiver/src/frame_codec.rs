//! Length-prefixed framing for the camera stream.
//!
//! Every message on the wire is a 4-byte big-endian signed length `N` followed
//! by exactly `N` bytes of protobuf. The reader tolerates short reads, and a
//! frame that arrives completely but fails to decode leaves the stream in sync
//! so the caller can move on to the next frame.

use crate::message::ImageMessage;
use bytes::Bytes;
use futures::stream::{self, Stream};
use prost::Message;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Size of the length prefix preceding every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Errors produced while reading frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Peer closed the connection")]
    Disconnected,

    #[error("Transport failure: {0}")]
    Transport(#[source] io::Error),

    #[error("Negative frame length: {0}")]
    NegativeLength(i32),

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed frame of {len} bytes: {source}")]
    Malformed {
        len: usize,
        #[source]
        source: prost::DecodeError,
    },
}

impl FrameError {
    /// Whether the stream can no longer be read after this error.
    ///
    /// A malformed frame was consumed in full, so the next length prefix is
    /// still aligned. Everything else leaves the stream unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::Malformed { .. })
    }
}

/// Reads frames off an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    max_frame_len: Option<usize>,
    frames_read: u64,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with no bound on frame length.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_frame_len: None,
            frames_read: 0,
            bytes_read: 0,
        }
    }

    /// Reject frames longer than `max` bytes. Exceeding the bound is fatal,
    /// since skipping the payload would mean reading it anyway.
    pub fn with_max_frame_len(mut self, max: Option<usize>) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Number of complete frames read so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Number of bytes consumed so far, prefixes included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read the next frame's raw bytes.
    pub async fn read_frame(&mut self) -> Result<Bytes, FrameError> {
        let len = match self.reader.read_i32().await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Disconnected)
            }
            Err(e) => return Err(FrameError::Transport(e)),
        };

        if len < 0 {
            return Err(FrameError::NegativeLength(len));
        }
        let len = len as usize;

        if let Some(max) = self.max_frame_len {
            if len > max {
                return Err(FrameError::FrameTooLarge { len, max });
            }
        }

        // read_exact keeps polling until the whole payload has arrived
        let mut buffer = vec![0u8; len];
        self.reader
            .read_exact(&mut buffer)
            .await
            .map_err(FrameError::Transport)?;

        self.frames_read += 1;
        self.bytes_read += (LENGTH_PREFIX_LEN + len) as u64;
        trace!(len, frames_read = self.frames_read, "Frame received");

        Ok(Bytes::from(buffer))
    }

    /// Read and decode the next message.
    pub async fn next_message(&mut self) -> Result<ImageMessage, FrameError> {
        let frame = self.read_frame().await?;
        let len = frame.len();
        ImageMessage::decode(frame).map_err(|source| FrameError::Malformed { len, source })
    }

    /// Turn the reader into a stream of decoded messages.
    ///
    /// Malformed frames are yielded as errors and the stream continues; the
    /// first fatal error is yielded and then the stream ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<ImageMessage, FrameError>> {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            let item = reader.next_message().await;
            let next = match &item {
                Err(e) if e.is_fatal() => None,
                _ => Some(reader),
            };
            Some((item, next))
        })
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Prefix raw bytes with their big-endian length.
pub fn encode_raw_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    out.extend_from_slice(&(body.len() as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Serialize a message into a complete frame.
pub fn encode_frame(message: &ImageMessage) -> Vec<u8> {
    encode_raw_frame(&message.encode_to_vec())
}
