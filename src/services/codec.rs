//! Length-prefixed text framing.
//!
//! Frame format: `[length:2][payload:N]`, length is a big-endian `u16`, which is
//! where the 65535-byte ceiling on a frame comes from. A payload is one of:
//!
//! - a 4-byte probe sentinel (`"0000"` request, `"1111"` reply)
//! - the JSON text of an [`Envelope`]
//! - a raw continuation chunk of a split envelope
//!
//! An envelope whose JSON exceeds `max_frame_bytes` is sent as a split
//! announcement (`splitMessage=true`, `messageParts=N`) followed by N raw chunks.
//! Chunks are cut on byte boundaries; only the reassembled text has to be valid
//! UTF-8.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_CEILING;
use crate::domains::message::Envelope;
use crate::error::{Result, StationLinkError};

pub const PROBE_REQUEST: &str = "0000";
pub const PROBE_REPLY: &str = "1111";

const SENTINEL_LEN: usize = 4;

/// What one logical read off the socket produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ProbeRequest,
    ProbeReply,
    Envelope(Envelope),
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let length = u16::try_from(payload.len()).map_err(|_| {
        StationLinkError::Transport(format!(
            "frame of {} bytes exceeds {MAX_FRAME_CEILING}",
            payload.len()
        ))
    })?;
    writer
        .write_all(&length.to_be_bytes())
        .await
        .map_err(|e| StationLinkError::Transport(e.to_string()))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| StationLinkError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| StationLinkError::Transport(e.to_string()))
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 2];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| StationLinkError::Transport(e.to_string()))?;
    let length = u16::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| StationLinkError::Transport(e.to_string()))?;
    Ok(Bytes::from(payload))
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Result<Self> {
        if max_frame_bytes == 0 || max_frame_bytes > MAX_FRAME_CEILING {
            return Err(StationLinkError::Config(format!(
                "the amount of bytes allowed per frame is {MAX_FRAME_CEILING} and {max_frame_bytes} was configured"
            )));
        }
        Ok(Self { max_frame_bytes })
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Frames for one envelope, announcement first when split.
    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Vec<Bytes>> {
        let text = envelope.to_json()?;
        self.split_text(&text)
    }

    pub fn split_text(&self, text: &str) -> Result<Vec<Bytes>> {
        let bytes = text.as_bytes();
        if bytes.len() <= self.max_frame_bytes {
            return Ok(vec![Bytes::copy_from_slice(bytes)]);
        }

        let parts = bytes.len().div_ceil(self.max_frame_bytes);
        let parts_u32 = u32::try_from(parts)
            .map_err(|_| StationLinkError::Serialization("message too large".to_string()))?;
        let announcement = Envelope::split_announcement(parts_u32).to_json()?;

        let mut frames = Vec::with_capacity(parts + 1);
        frames.push(Bytes::from(announcement));
        frames.extend(
            bytes
                .chunks(self.max_frame_bytes)
                .map(Bytes::copy_from_slice),
        );
        Ok(frames)
    }

    pub async fn write_envelope<W>(&self, writer: &mut W, envelope: &Envelope) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        for frame in self.encode_envelope(envelope)? {
            write_frame(writer, &frame).await?;
        }
        Ok(())
    }

    /// Reads one frame and, for split announcements, its continuation frames.
    pub async fn read_inbound<R>(&self, reader: &mut R) -> Result<Inbound>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let frame = read_frame(reader).await?;
        if frame.len() >= SENTINEL_LEN {
            match &frame[..SENTINEL_LEN] {
                b"0000" => return Ok(Inbound::ProbeRequest),
                b"1111" => return Ok(Inbound::ProbeReply),
                _ => {}
            }
        }

        let envelope = parse_envelope(&frame)?;
        if !envelope.split_message {
            return Ok(Inbound::Envelope(envelope));
        }
        if envelope.message_parts == 0 {
            return Err(StationLinkError::Serialization(
                "split announcement without parts".to_string(),
            ));
        }

        let mut assembled = Vec::new();
        for _ in 0..envelope.message_parts {
            let chunk = read_frame(reader).await?;
            assembled.extend_from_slice(&chunk);
        }
        Ok(Inbound::Envelope(parse_envelope(&assembled)?))
    }
}

fn parse_envelope(raw: &[u8]) -> Result<Envelope> {
    let text =
        std::str::from_utf8(raw).map_err(|e| StationLinkError::Serialization(e.to_string()))?;
    Envelope::from_json(text)
}
