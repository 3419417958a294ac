//! Stream buffer — growable in-memory body that changes hands without copying.
//!
//! A [`StreamBuffer`] is in the writing phase for its whole life. Leaving that
//! phase consumes it:
//!
//! ```text
//! StreamBuffer ──into_readable()──▶ ReadableStream   (re-readable from byte 0)
//!              ──into_released()──▶ ReleasedBlock    (memory handed to a new owner)
//! ```
//!
//! Both conversions move the backing `Vec<u8>`, so a released or readable
//! buffer can never be written again and memory is freed exactly once by
//! whoever ends up owning it.

use std::io::{self, BufRead, Cursor, Read, Write};

/// Append-only byte buffer in the writing phase.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: Vec<u8>,
    limit: Option<usize>,
}

impl StreamBuffer {
    /// Unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that accepts at most `limit` bytes; writes beyond it are short.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Buffer honouring an optional limit.
    pub fn bounded(limit: Option<usize>) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Handle for appending bytes.
    pub fn write_handle(&mut self) -> WriteHandle<'_> {
        WriteHandle { buffer: self }
    }

    /// Finish writing and expose the contents as an input stream.
    pub fn into_readable(self) -> ReadableStream {
        ReadableStream {
            cursor: Cursor::new(self.data),
        }
    }

    /// Finish writing and hand the memory to the caller.
    pub fn into_released(self) -> ReleasedBlock {
        ReleasedBlock { data: self.data }
    }

    fn accept(&mut self, bytes: &[u8]) -> usize {
        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.data.len()),
            None => bytes.len(),
        };
        let n = room.min(bytes.len());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }
}

/// Write access to a [`StreamBuffer`]; lives no longer than the writing phase.
pub struct WriteHandle<'a> {
    buffer: &'a mut StreamBuffer,
}

impl Write for WriteHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.buffer.accept(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Finished buffer, readable from the start.
#[derive(Debug)]
pub struct ReadableStream {
    cursor: Cursor<Vec<u8>>,
}

impl ReadableStream {
    /// Total size of the finalized buffer.
    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }
}

impl Read for ReadableStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl BufRead for ReadableStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.cursor.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.cursor.consume(amt)
    }
}

/// Memory released from a [`StreamBuffer`]; the holder owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedBlock {
    data: Vec<u8>,
}

impl ReleasedBlock {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}
