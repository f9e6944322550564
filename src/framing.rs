//! Newline-delimited JSON framing
//!
//! The read side buffers raw bytes until a `\n` shows up and refuses to grow
//! past a configured limit. The write side is a task that owns the write half
//! of the connection, so frames queued from several sessions never interleave.

use std::ops::Deref;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{LanshareError, Result};

/// One encoded line, newline included. Shared so a broadcast encodes once.
pub type Frame = Arc<str>;

/// A frame sitting in a connection's queue. It holds its share of the
/// connection's byte budget until the writer has put it on the wire.
#[derive(Debug)]
pub struct QueuedFrame {
    frame: Frame,
    _budget: OwnedSemaphorePermit,
}

impl QueuedFrame {
    pub fn new(frame: Frame, budget: OwnedSemaphorePermit) -> Self {
        Self { frame, _budget: budget }
    }
}

impl Deref for QueuedFrame {
    type Target = str;

    fn deref(&self) -> &str {
        &self.frame
    }
}

/// Bytes requested from the stream per read
const READ_CHUNK: usize = 64 * 1024;

/// Encode a message as a single frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Frame> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(Arc::from(line))
}

/// Reads `\n` terminated lines from a byte stream
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
    // bytes of `buffer` already searched for a delimiter
    scanned: usize,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame: usize) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            scanned: 0,
            max_frame,
        }
    }

    /// Next complete line, with the delimiter and surrounding whitespace
    /// stripped. Returns `None` once the peer closes the stream; a trailing
    /// partial line is dropped. Blank lines are skipped.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
                let end = self.scanned + offset;
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                self.scanned = 0;

                let payload = &line[..line.len() - 1];
                if payload.len() > self.max_frame {
                    return Err(LanshareError::FrameTooLarge { limit: self.max_frame });
                }
                let text = std::str::from_utf8(payload).map_err(|_| LanshareError::InvalidUtf8)?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                return Ok(Some(text.to_string()));
            }

            self.scanned = self.buffer.len();
            if self.buffer.len() > self.max_frame {
                return Err(LanshareError::FrameTooLarge { limit: self.max_frame });
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(bytes = self.buffer.len(), "Dropping partial frame at end of stream");
                }
                return Ok(None);
            }
        }
    }
}

/// Drain `frames` into `writer` until every sender is gone or `shutdown`
/// fires. A write failure cancels `shutdown` so the owning session stops too.
/// Each frame's budget is released once it is written.
pub async fn run_writer<W>(mut writer: W, mut frames: mpsc::Receiver<QueuedFrame>, shutdown: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = writer.write_all(frame.as_bytes()) => res,
        };

        if let Err(e) = written {
            tracing::debug!(error = %e, "Write failed, closing connection");
            shutdown.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
}
