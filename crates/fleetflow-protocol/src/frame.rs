// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for a batch of control messages.
//!
//! A POST body is a sequence of frames, each with the following format:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message kind
//! - N bytes: JSON encoded [`Message`]
//!
//! The kind in the header must agree with the payload variant so a reader
//! can skip kinds it does not handle without parsing the JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::Message;

/// Maximum frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes kind)
pub const HEADER_SIZE: usize = 6;

/// Message kinds for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    LogMessage = 1,
    VqlResponse = 2,
    FlowStats = 3,
    FileBuffer = 4,
    UploadTransaction = 5,
    Cancel = 6,
    FlowRequest = 7,
    FlowStatsRequest = 8,
}

impl TryFrom<u16> for MessageKind {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageKind::LogMessage),
            2 => Ok(MessageKind::VqlResponse),
            3 => Ok(MessageKind::FlowStats),
            4 => Ok(MessageKind::FileBuffer),
            5 => Ok(MessageKind::UploadTransaction),
            6 => Ok(MessageKind::Cancel),
            7 => Ok(MessageKind::FlowRequest),
            8 => Ok(MessageKind::FlowStatsRequest),
            _ => Err(FrameError::InvalidMessageKind(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message kind: {0}")]
    InvalidMessageKind(u16),

    #[error("frame kind {header:?} does not match payload kind {payload:?}")]
    KindMismatch {
        header: MessageKind,
        payload: MessageKind,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with kind and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    /// Serialize a message into a frame
    pub fn from_message(msg: &Message) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            kind: msg.kind(),
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload, checking it against the header kind
    pub fn decode_message(&self) -> Result<Message, FrameError> {
        let msg: Message = serde_json::from_slice(&self.payload)?;
        if msg.kind() != self.kind {
            return Err(FrameError::KindMismatch {
                header: self.kind,
                payload: msg.kind(),
            });
        }
        Ok(msg)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.kind as u16);
        buf.put(self.payload.clone());
    }

    /// Decode one frame from the front of `bytes`, advancing past it
    pub fn decode_from_bytes(bytes: &mut Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let kind = MessageKind::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self { kind, payload })
    }
}

/// Encode a batch of messages into one body.
pub fn encode_batch(messages: &[Message]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    for msg in messages {
        Frame::from_message(msg)?.encode_into(&mut buf);
    }
    Ok(buf.freeze())
}

/// Decode every frame in a body. Order is preserved.
pub fn decode_batch(mut body: Bytes) -> Result<Vec<Message>, FrameError> {
    let mut messages = Vec::new();
    while body.has_remaining() {
        let frame = Frame::decode_from_bytes(&mut body)?;
        messages.push(frame.decode_message()?);
    }
    Ok(messages)
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    // Read header
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = MessageKind::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        kind,
        payload: Bytes::from(payload),
    })
}
