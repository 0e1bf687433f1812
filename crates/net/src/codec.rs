//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian body length][body]
//! Body: [2-byte big-endian subject length][subject UTF-8][payload JSON object]
//! Maximum body size: 1MB (sanity limit)
//!
//! The codec keeps no state between calls. Each connection owns a
//! [`FrameBuffer`] and feeds it whatever the transport hands back.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::message::{Message, Payload};

/// Maximum allowed body size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

const LEN_PREFIX: usize = 4;
const SUBJECT_PREFIX: usize = 2;

/// Size of a single transport read
const READ_CHUNK: usize = 8 * 1024;

/// Encode one message as a self-delimiting frame
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let subject = msg.subject().as_bytes();
    if subject.is_empty() {
        return Err(Error::Protocol("Empty subject".into()));
    }
    if subject.len() > u16::MAX as usize {
        return Err(Error::Protocol(format!(
            "Subject too long: {} bytes",
            subject.len()
        )));
    }

    let payload = serde_json::to_vec(msg.payload())
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;

    let body_len = SUBJECT_PREFIX + subject.len() + payload.len();
    if body_len > MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!(
            "Message too large: {} bytes (max {})",
            body_len, MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.extend_from_slice(&(subject.len() as u16).to_be_bytes());
    frame.extend_from_slice(subject);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode every complete frame at the front of `buffer`.
///
/// Returns the decoded messages in order and the unconsumed tail, which
/// holds the start of the next (incomplete) frame, if any. Any corrupt
/// frame fails the whole call; use [`FrameBuffer::drain`] to keep the
/// messages ahead of it.
pub fn decode(mut buffer: &[u8]) -> Result<(Vec<Message>, &[u8])> {
    let mut messages = Vec::new();
    while let Some((msg, rest)) = decode_one(buffer)? {
        messages.push(msg);
        buffer = rest;
    }
    Ok((messages, buffer))
}

fn decode_one(buffer: &[u8]) -> Result<Option<(Message, &[u8])>> {
    if buffer.len() < LEN_PREFIX {
        return Ok(None);
    }

    let mut len_buf = [0u8; LEN_PREFIX];
    len_buf.copy_from_slice(&buffer[..LEN_PREFIX]);
    let body_len = u32::from_be_bytes(len_buf);

    // Sanity check before waiting for the body
    if (body_len as usize) < SUBJECT_PREFIX {
        return Err(Error::Protocol(format!(
            "Frame too short: {} bytes",
            body_len
        )));
    }
    if body_len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            body_len, MAX_FRAME_SIZE
        )));
    }

    let end = LEN_PREFIX + body_len as usize;
    if buffer.len() < end {
        return Ok(None);
    }
    let body = &buffer[LEN_PREFIX..end];

    let subject_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if subject_len == 0 {
        return Err(Error::Protocol("Empty subject".into()));
    }
    if subject_len > body.len() - SUBJECT_PREFIX {
        return Err(Error::Protocol(format!(
            "Subject length {} exceeds frame body of {} bytes",
            subject_len,
            body.len()
        )));
    }

    let subject = std::str::from_utf8(&body[SUBJECT_PREFIX..SUBJECT_PREFIX + subject_len])
        .map_err(|e| Error::Protocol(format!("Invalid subject: {}", e)))?;
    let payload: Payload = serde_json::from_slice(&body[SUBJECT_PREFIX + subject_len..])
        .map_err(|e| Error::Protocol(format!("Invalid JSON: {}", e)))?;

    let msg = Message::new(subject, payload)?;
    Ok(Some((msg, &buffer[end..])))
}

/// Per-connection receive buffer
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take every complete message, keeping any partial frame for later.
    ///
    /// A corrupt frame does not cost the messages decoded ahead of it: they
    /// are returned together with the error, and the corrupt bytes stay
    /// in the buffer.
    pub fn drain(&mut self) -> (Vec<Message>, Option<Error>) {
        let mut messages = Vec::new();
        let mut consumed = 0;
        let error = loop {
            match decode_one(&self.buf[consumed..]) {
                Ok(Some((msg, rest))) => {
                    messages.push(msg);
                    consumed = self.buf.len() - rest.len();
                }
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        self.buf.drain(..consumed);
        (messages, error)
    }

    /// Take only the first complete message, if there is one
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let (msg, consumed) = match decode_one(&self.buf)? {
            Some((msg, rest)) => (msg, self.buf.len() - rest.len()),
            None => return Ok(None),
        };
        self.buf.drain(..consumed);
        Ok(Some(msg))
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Read once from a stream into `buffer`.
///
/// Cancel safe: bytes are only appended after the read completes.
pub async fn read_into<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
) -> Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
        return Err(Error::ConnectionClosed);
    }
    buffer.extend(&chunk[..n]);
    Ok(n)
}

/// Write one frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = encode(msg)?;

    writer.write_all(&frame).await?;

    // Flush to ensure delivery
    writer.flush().await?;

    Ok(())
}
