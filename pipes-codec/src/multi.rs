use bytes::{Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::FramingError;
use crate::frame::{parse_header, preview, Frame};

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024;

/// Push-style framer for one request or response body.
///
/// [`Multi::send`] turns a field into chunks no larger than `max_chunk_size`. [`Multi::feed`]
/// takes chunks as they arrive from the transport, cut anywhere, and hands back every frame
/// completed so far. [`Multi::end`] checks what is left once the body is over.
#[derive(Debug)]
pub struct Multi {
    buf: BytesMut,
    received: usize,
    max_chunk_size: usize,
    max_frame_size: usize,
}

impl Default for Multi {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_SIZE)
    }
}

impl Multi {
    pub fn new(max_chunk_size: usize) -> Self {
        Multi { buf: BytesMut::new(), received: 0, max_chunk_size: max_chunk_size.max(1), max_frame_size: 0 }
    }

    /// Set max inbound body size. `0` means unlimited, the default.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    #[inline]
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Frames received since the last [`Multi::end`].
    #[inline]
    pub fn received(&self) -> usize {
        self.received
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn send<T, B>(&self, typ: T, body: B) -> Result<Vec<Bytes>, FramingError>
    where
        T: Into<ByteString>,
        B: Into<Bytes>,
    {
        let frame = Frame::new(typ, body)?;
        Ok(self.chunks(&frame))
    }

    /// Splits an encoded frame; the last chunk carries the remainder.
    pub fn chunks(&self, frame: &Frame) -> Vec<Bytes> {
        let mut data = BytesMut::new();
        frame.encode(&mut data);
        let mut data = data.freeze();
        let mut chunks = Vec::with_capacity(data.len() / self.max_chunk_size + 1);
        while data.len() > self.max_chunk_size {
            chunks.push(data.split_to(self.max_chunk_size));
        }
        chunks.push(data);
        chunks
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FramingError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while !self.buf.is_empty() {
            let header = match parse_header(&self.buf, self.max_frame_size)? {
                Some(h) => h,
                None => break,
            };
            if self.buf.len() < header.frame_len() {
                self.buf.reserve(header.reserve_hint(self.buf.len()));
                break;
            }
            frames.push(header.take(&mut self.buf)?);
            self.received += 1;
        }
        Ok(frames)
    }

    /// Ends the stream and resets the framer for reuse.
    pub fn end(&mut self) -> Result<(), FramingError> {
        let res = if !self.buf.is_empty() {
            Err(FramingError::TrailingData(preview(&self.buf)))
        } else if self.received == 0 {
            Err(FramingError::NothingReceived)
        } else {
            Ok(())
        };
        self.buf.clear();
        self.received = 0;
        res
    }
}
