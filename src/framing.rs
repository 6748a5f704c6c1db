//! Length-prefixed framing for stream transports (TCP, TLS).

use crate::error::{Error, Result};
use crate::proto::{Message, BUFFER_LENGTH, LENGTH_PREFIX};
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reassembles a byte stream into messages.
///
/// Unconsumed bytes are bounded by the capacity; a frame that can't fit fails
/// with [`Error::BufferOverflow`] and the connection must be closed.
pub struct FrameBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_capacity(BUFFER_LENGTH)
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes held that don't yet form a complete frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Feed a chunk and return every message it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Message>> {
        self.buf.extend_from_slice(chunk);

        let mut msgs = Vec::new();
        while let Some(msg) = self.next_frame()? {
            msgs.push(msg);
        }

        if self.buf.len() > self.capacity {
            return Err(Error::BufferOverflow);
        }

        Ok(msgs)
    }

    fn next_frame(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if LENGTH_PREFIX + len > self.capacity {
            return Err(Error::BufferOverflow);
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX);
        let payload = self.buf.split_to(len);
        Message::decode_payload(&payload).map(Some)
    }
}

/// Reads messages off an async stream.
pub struct FramedReader<R> {
    inner: R,
    frames: FrameBuffer,
    ready: VecDeque<Message>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            frames: FrameBuffer::new(),
            ready: VecDeque::new(),
        }
    }

    /// Next message, `None` once the peer closed cleanly between frames.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        let mut chunk = [0u8; BUFFER_LENGTH];

        loop {
            if let Some(msg) = self.ready.pop_front() {
                return Ok(Some(msg));
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.frames.is_empty() {
                    return Ok(None);
                }
                return Err(Error::MalformedMessage(format!(
                    "stream closed inside a frame ({} bytes pending)",
                    self.frames.len()
                )));
            }

            self.ready.extend(self.frames.push(&chunk[..n])?);
        }
    }
}

pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&msg.encode()?).await?;
    w.flush().await?;
    Ok(())
}
