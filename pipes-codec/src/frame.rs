use bytes::{BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::FramingError;

pub(crate) const MAGIC: &[u8] = b"OK:";

/// Longest decimal length accepted in a header; `u64::MAX` has 20 digits.
const MAX_LEN_DIGITS: usize = 20;

/// Most a partial frame may reserve ahead of the bytes actually received.
const MAX_RESERVE: usize = 64 * 1024;

/// One named field: `OK:<typ>:<len>:<body>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub typ: ByteString,
    pub body: Bytes,
}

impl Frame {
    /// Builds a frame, rejecting field types outside `[0-9A-Za-z]+`.
    pub fn new<T, B>(typ: T, body: B) -> Result<Self, FramingError>
    where
        T: Into<ByteString>,
        B: Into<Bytes>,
    {
        let typ = typ.into();
        if !is_field_type(typ.as_bytes()) {
            return Err(FramingError::InvalidFieldType(typ.to_string()));
        }
        Ok(Frame { typ, body: body.into() })
    }

    #[inline]
    pub fn typ(&self) -> &str {
        &self.typ
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as text; every field the broker exchanges is UTF-8.
    #[inline]
    pub fn body_str(&self) -> Result<&str, FramingError> {
        std::str::from_utf8(&self.body).map_err(|_| FramingError::Utf8Error(self.typ.to_string()))
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        header_len(self.typ.len(), self.body.len()) + self.body.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_slice(MAGIC);
        dst.put_slice(self.typ.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(self.body.len().to_string().as_bytes());
        dst.put_u8(b':');
        dst.put_slice(&self.body);
    }
}

#[inline]
pub(crate) fn is_field_type(typ: &[u8]) -> bool {
    !typ.is_empty() && typ.iter().all(|c| c.is_ascii_alphanumeric())
}

#[inline]
fn header_len(typ_len: usize, body_len: usize) -> usize {
    MAGIC.len() + typ_len + 1 + body_len.to_string().len() + 1
}

/// A parsed `OK:<typ>:<len>:` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub typ_end: usize,
    pub body_len: usize,
    pub header_len: usize,
}

impl Header {
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.header_len + self.body_len
    }

    /// Room to reserve for the rest of a frame of which `buffered` bytes are in.
    #[inline]
    pub fn reserve_hint(&self, buffered: usize) -> usize {
        self.frame_len().saturating_sub(buffered).min(MAX_RESERVE)
    }

    /// Splits a complete frame off the front of `src`.
    pub fn take(&self, src: &mut BytesMut) -> Result<Frame, FramingError> {
        let mut raw = src.split_to(self.frame_len());
        let head = raw.split_to(self.header_len);
        let typ = ByteString::try_from(head.freeze().slice(MAGIC.len()..self.typ_end))
            .map_err(|_| FramingError::Malformed("field type".into()))?;
        Ok(Frame { typ, body: raw.freeze() })
    }
}

/// Parses a header at the start of `buf`.
///
/// `Ok(None)` means more bytes are needed to decide. Bytes that can never become a valid
/// header are reported as [`FramingError::Malformed`].
pub(crate) fn parse_header(buf: &[u8], max_frame_size: usize) -> Result<Option<Header>, FramingError> {
    let magic = buf.len().min(MAGIC.len());
    if buf[..magic] != MAGIC[..magic] {
        return Err(FramingError::Malformed(preview(buf)));
    }
    if buf.len() <= MAGIC.len() {
        return Ok(None);
    }

    let mut pos = MAGIC.len();
    while pos < buf.len() && buf[pos].is_ascii_alphanumeric() {
        pos += 1;
    }
    if pos == buf.len() {
        return Ok(None);
    }
    if pos == MAGIC.len() || buf[pos] != b':' {
        return Err(FramingError::Malformed(preview(buf)));
    }
    let typ_end = pos;

    pos += 1;
    let len_start = pos;
    while pos < buf.len() && buf[pos].is_ascii_digit() {
        pos += 1;
        if pos - len_start > MAX_LEN_DIGITS {
            return Err(FramingError::Malformed(preview(buf)));
        }
    }
    if pos == buf.len() {
        return Ok(None);
    }
    if pos == len_start || buf[pos] != b':' {
        return Err(FramingError::Malformed(preview(buf)));
    }

    let digits = std::str::from_utf8(&buf[len_start..pos]).map_err(|_| FramingError::Malformed(preview(buf)))?;
    let body_len = digits.parse::<usize>().map_err(|_| FramingError::Malformed(preview(buf)))?;
    if max_frame_size != 0 && body_len > max_frame_size {
        return Err(FramingError::MaxSizeExceeded(body_len));
    }

    let header_len = pos + 1;
    if header_len.checked_add(body_len).is_none() {
        return Err(FramingError::MaxSizeExceeded(body_len));
    }

    Ok(Some(Header { typ_end, body_len, header_len }))
}

pub(crate) fn preview(buf: &[u8]) -> String {
    const MAX: usize = 32;
    let s = String::from_utf8_lossy(&buf[..buf.len().min(MAX)]);
    if buf.len() > MAX {
        format!("{s}...")
    } else {
        s.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header(b"O", 0).unwrap(), None);
        assert_eq!(parse_header(b"OK:msg", 0).unwrap(), None);
        assert_eq!(parse_header(b"OK:msg:12", 0).unwrap(), None);
        let h = parse_header(b"OK:msg:12:{}", 0).unwrap().unwrap();
        assert_eq!(h, Header { typ_end: 6, body_len: 12, header_len: 10 });
        assert_eq!(h.frame_len(), 22);
    }

    #[test]
    fn test_parse_header_malformed() {
        assert!(matches!(parse_header(b"KO:", 0), Err(FramingError::Malformed(_))));
        assert!(matches!(parse_header(b"OK::3:abc", 0), Err(FramingError::Malformed(_))));
        assert!(matches!(parse_header(b"OK:a-b:3:abc", 0), Err(FramingError::Malformed(_))));
        assert!(matches!(parse_header(b"OK:ab:x:", 0), Err(FramingError::Malformed(_))));
        assert!(matches!(parse_header(b"OK:ab:100:", 10), Err(FramingError::MaxSizeExceeded(100))));
    }

    #[test]
    fn test_parse_header_length_overflow() {
        let max = usize::MAX.to_string();
        let buf = format!("OK:a:{max}:x");
        assert!(matches!(parse_header(buf.as_bytes(), 0), Err(FramingError::MaxSizeExceeded(n)) if n == usize::MAX));

        let h = parse_header(b"OK:a:4000000000:x", 0).unwrap().unwrap();
        assert_eq!(h.reserve_hint(10), MAX_RESERVE);
        assert_eq!(parse_header(b"OK:a:3:", 0).unwrap().unwrap().reserve_hint(8), 2);
    }

    #[test]
    fn test_frame_encode() {
        let f = Frame::new("id", "pipes-1:3").unwrap();
        let mut buf = BytesMut::new();
        f.encode(&mut buf);
        assert_eq!(&buf[..], b"OK:id:9:pipes-1:3");
        assert_eq!(f.encoded_len(), buf.len());
        assert!(matches!(Frame::new("a b", ""), Err(FramingError::InvalidFieldType(_))));
    }
}
