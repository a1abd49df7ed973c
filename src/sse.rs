//! Server-sent-event line reassembly for upstream completion streams.
//!
//! Transport chunks arrive at arbitrary byte boundaries. `SseLineBuffer` is a `Decoder`
//! for `FramedRead`: it leaves the trailing partial line in the read buffer and yields
//! only complete lines, with `\r\n` endings normalized.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::constants::{MAX_LINE_BYTES, SSE_DATA_PREFIX, SSE_DONE_SENTINEL};

#[derive(Debug, Clone, Copy)]
pub struct SseLineBuffer {
    max_line: usize,
}

impl Default for SseLineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl SseLineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }
}

fn take_line(buf: &mut BytesMut, max_line: usize) -> std::io::Result<Option<String>> {
    match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            if pos > max_line {
                return Err(line_too_long(max_line));
            }
            let line = buf.split_to(pos);
            buf.advance(1);
            Ok(Some(decode_line(&line)))
        }
        None if buf.len() > max_line => Err(line_too_long(max_line)),
        None => Ok(None),
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn line_too_long(max_line: usize) -> std::io::Error {
    std::io::Error::other(format!("SSE line exceeds {} bytes", max_line))
}

impl Decoder for SseLineBuffer {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        take_line(src, self.max_line)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = take_line(src, self.max_line)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            Ok(None)
        } else {
            let rest = src.split();
            Ok(Some(decode_line(&rest)))
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    Blank,
    Done,
    Data(&'a str),
    /// Comments, `event:`/`id:` fields and anything else without a data prefix.
    Ignored,
}

pub fn classify_line(line: &str) -> SseLine<'_> {
    let line = line.trim_end();
    if line.is_empty() {
        return SseLine::Blank;
    }
    match line.strip_prefix(SSE_DATA_PREFIX) {
        Some(data) => {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if data.trim() == SSE_DONE_SENTINEL {
                SseLine::Done
            } else {
                SseLine::Data(data)
            }
        }
        None => SseLine::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut SseLineBuffer, src: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(src).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_partial_lines_carry_over() {
        let mut codec = SseLineBuffer::default();
        let mut src = BytesMut::from(&b"data: {\"a\""[..]);
        assert!(drain(&mut codec, &mut src).is_empty());
        assert_eq!(src.len(), 10);
        src.extend_from_slice(b":1}\r\n\r\ndata: [DO");
        assert_eq!(
            drain(&mut codec, &mut src),
            vec!["data: {\"a\":1}".to_string(), String::new()]
        );
        src.extend_from_slice(b"NE]\n");
        assert_eq!(drain(&mut codec, &mut src), vec!["data: [DONE]".to_string()]);
        assert_eq!(codec.decode_eof(&mut src).unwrap(), None);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let mut codec = SseLineBuffer::default();
        let text = "data: héllo\n".as_bytes();
        let (a, b) = text.split_at(8);
        let mut src = BytesMut::from(a);
        assert!(drain(&mut codec, &mut src).is_empty());
        src.extend_from_slice(b);
        assert_eq!(drain(&mut codec, &mut src), vec!["data: héllo".to_string()]);
    }

    #[test]
    fn test_line_length_cap() {
        let mut codec = SseLineBuffer::new(8);
        let mut src = BytesMut::from(&b"data: 0123456789"[..]);
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn test_eof_flushes_unterminated_line() {
        let mut codec = SseLineBuffer::default();
        let mut src = BytesMut::from(&b"data: 1\r\ndata: 2\npartial"[..]);
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("data: 1"));
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("data: 2"));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut src).unwrap().as_deref(), Some("partial"));
        assert_eq!(codec.decode_eof(&mut src).unwrap(), None);
    }

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line(""), SseLine::Blank);
        assert_eq!(classify_line("data: [DONE]"), SseLine::Done);
        assert_eq!(classify_line("data:[DONE]"), SseLine::Done);
        assert_eq!(classify_line("data: {\"x\":1}"), SseLine::Data("{\"x\":1}"));
        assert_eq!(classify_line(": keepalive"), SseLine::Ignored);
        assert_eq!(classify_line("event: message"), SseLine::Ignored);
    }
}
