//! Execution contexts
//!
//! Both contexts expose the same cursor operations to the nodes, so one
//! compiled graph decodes whole frames and continuous streams alike.
//!
//! - [`DiscreteContext`] - a fully received frame plus a cursor
//! - [`StreamContext`] - exact-length reads from a [`ByteStream`]

use super::error::ReadError;

/// Cursor operations a node performs on its input
pub trait ExecutionContext {
    /// Consume exactly `len` bytes and return them
    fn take(&mut self, len: usize) -> Result<&[u8], ReadError>;

    /// Consume exactly `len` bytes without looking at them
    fn skip(&mut self, len: usize) -> Result<(), ReadError>;

    /// Bytes consumed since the context was created
    fn position(&self) -> usize;
}

/// A whole frame held in memory.
///
/// Out-of-range reads fail without moving the cursor.
#[derive(Debug)]
pub struct DiscreteContext<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> DiscreteContext<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    fn advance(&mut self, len: usize) -> Result<std::ops::Range<usize>, ReadError> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(ReadError::Insufficient {
                needed: len,
                available: self.remaining(),
            })?;
        let range = self.cursor..end;
        self.cursor = end;
        Ok(range)
    }
}

impl ExecutionContext for DiscreteContext<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], ReadError> {
        let range = self.advance(len)?;
        Ok(&self.data[range])
    }

    fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        self.advance(len).map(|_| ())
    }

    fn position(&self) -> usize {
        self.cursor
    }
}

/// A continuous byte source with blocking exact-length reads
#[cfg_attr(test, mockall::automock)]
pub trait ByteStream: Send {
    /// Fill `buf` completely, or fail with timeout / end of data / closed
    fn read_full(&mut self, buf: &mut [u8]) -> Result<(), ReadError>;

    /// Drop exactly `count` bytes from the stream
    fn discard(&mut self, count: usize) -> Result<(), ReadError>;
}

/// A decode walk over a [`ByteStream`]
pub struct StreamContext<'s, S: ByteStream + ?Sized> {
    stream: &'s mut S,
    scratch: Vec<u8>,
    position: usize,
}

impl<'s, S: ByteStream + ?Sized> StreamContext<'s, S> {
    pub fn new(stream: &'s mut S) -> Self {
        Self {
            stream,
            scratch: Vec::new(),
            position: 0,
        }
    }

    /// Reuse `scratch` as the read buffer
    pub fn with_scratch(stream: &'s mut S, scratch: Vec<u8>) -> Self {
        Self {
            stream,
            scratch,
            position: 0,
        }
    }

    /// Give the read buffer back for reuse
    pub fn into_scratch(self) -> Vec<u8> {
        self.scratch
    }
}

impl<S: ByteStream + ?Sized> ExecutionContext for StreamContext<'_, S> {
    fn take(&mut self, len: usize) -> Result<&[u8], ReadError> {
        self.scratch.resize(len, 0);
        self.stream.read_full(&mut self.scratch[..len])?;
        self.position += len;
        Ok(&self.scratch[..len])
    }

    fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        self.stream.discard(len)?;
        self.position += len;
        Ok(())
    }

    fn position(&self) -> usize {
        self.position
    }
}
