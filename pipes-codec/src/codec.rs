use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;
use crate::frame::{parse_header, preview, Frame};

/// `tokio_util` codec over the same framing as [`crate::Multi`], for transports that
/// already hand out an `AsyncRead`.
#[derive(Debug, Clone, Default)]
pub struct MultiCodec {
    max_size: usize,
    received: usize,
}

impl MultiCodec {
    /// Create `MultiCodec` instance. A `max_size` of `0` means unlimited.
    pub fn new(max_size: usize) -> Self {
        MultiCodec { max_size, received: 0 }
    }

    pub fn set_max_size(&mut self, size: usize) {
        self.max_size = size;
    }
}

impl Decoder for MultiCodec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        if src.is_empty() {
            return Ok(None);
        }
        let header = match parse_header(src, self.max_size)? {
            Some(h) => h,
            None => return Ok(None),
        };
        if src.len() < header.frame_len() {
            src.reserve(header.reserve_hint(src.len()));
            return Ok(None);
        }
        let frame = header.take(src)?;
        self.received += 1;
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            let err = FramingError::TrailingData(preview(src));
            src.clear();
            return Err(err);
        }
        if self.received == 0 {
            return Err(FramingError::NothingReceived);
        }
        Ok(None)
    }
}

impl Encoder<Frame> for MultiCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FramingError> {
        if self.max_size != 0 && item.body.len() > self.max_size {
            return Err(FramingError::MaxSizeExceeded(item.body.len()));
        }
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_max_size() {
        let mut codec = MultiCodec::new(5);
        let mut buf = BytesMut::from(&b"OK:body:9:"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(FramingError::MaxSizeExceeded(9))));
        assert!(codec.encode(Frame::new("body", "123456").unwrap(), &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_decode_huge_length() {
        let mut codec = MultiCodec::default();
        let mut buf = BytesMut::from(format!("OK:a:{}:x", usize::MAX).as_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(FramingError::MaxSizeExceeded(_))));

        let mut buf = BytesMut::from(&b"OK:a:4000000000:x"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.capacity() < 1024 * 1024);
    }

    #[test]
    fn test_encode_decode() {
        let mut codec = MultiCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new("router", "{\"select\":\"all\"}").unwrap(), &mut buf).unwrap();
        codec.encode(Frame::new("id", "x").unwrap(), &mut buf).unwrap();
        let a = codec.decode(&mut buf).unwrap().unwrap();
        let b = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(a.typ(), "router");
        assert_eq!(b.body_str().unwrap(), "x");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_framed_read_trailing() {
        let data: &[u8] = b"OK:msg:2:{}OK:msg:9:{";
        let mut framed = FramedRead::new(data, MultiCodec::default());
        assert_eq!(framed.next().await.unwrap().unwrap().body_str().unwrap(), "{}");
        assert!(matches!(framed.next().await, Some(Err(FramingError::TrailingData(_)))));
    }

    #[tokio::test]
    async fn test_framed_read_empty() {
        let data: &[u8] = b"";
        let mut framed = FramedRead::new(data, MultiCodec::default());
        assert!(matches!(framed.next().await, Some(Err(FramingError::NothingReceived))));
    }
}
