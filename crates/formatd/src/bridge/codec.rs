//! Newline framing for daemon pipes.
//!
//! Decoding works on raw bytes and only validates UTF-8 once a full line is
//! buffered, so reads that split a multi-byte character (or deliver several
//! lines at once) are handled without special cases.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplex streams, etc).

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single inbound line (64 MiB).
///
/// Large enough for a base64 reply to the largest accepted request.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFrame {
    /// A complete line without its terminator (`\n` or `\r\n`).
    Line(String),
    /// A line exceeded the cap and was discarded up to its terminator.
    ///
    /// Reported as a frame rather than an error: a `FramedRead` stops after
    /// the first decode error, and one oversized line must not end the stream.
    Oversized { len: usize },
}

/// Codec that splits a byte stream into newline-terminated lines.
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline in the current buffer.
    next_index: usize,
    /// Bytes thrown away so far for an oversized line.
    discarded: Option<usize>,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarded: None,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn finish_line(bytes: &[u8]) -> Option<String> {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl Decoder for LineCodec {
    type Item = LineFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarded, newline) {
                (Some(discarded), Some(pos)) => {
                    src.advance(pos + 1);
                    self.next_index = 0;
                    self.discarded = None;
                    return Ok(Some(LineFrame::Oversized {
                        len: discarded + pos,
                    }));
                }
                (Some(discarded), None) => {
                    let len = src.len();
                    src.advance(len);
                    self.next_index = 0;
                    self.discarded = Some(discarded + len);
                    return Ok(None);
                }
                (None, Some(pos)) => {
                    let line = src.split_to(pos + 1);
                    self.next_index = 0;
                    if pos > self.max_length {
                        return Ok(Some(LineFrame::Oversized { len: pos }));
                    }
                    match Self::finish_line(&line[..pos]) {
                        Some(text) => return Ok(Some(LineFrame::Line(text))),
                        None => continue,
                    }
                }
                (None, None) if src.len() > self.max_length => {
                    let len = src.len();
                    src.advance(len);
                    self.next_index = 0;
                    self.discarded = Some(len);
                    return Ok(None);
                }
                (None, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if let Some(discarded) = self.discarded.take() {
            let len = src.len();
            src.advance(len);
            return Ok(Some(LineFrame::Oversized {
                len: discarded + len,
            }));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Unterminated final fragment.
        let rest = src.split_to(src.len());
        Ok(Self::finish_line(&rest).map(LineFrame::Line))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = line.as_ref();
        if line.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "line contains an embedded newline",
            ));
        }
        tracing::trace!(line_bytes = line.len(), "Encoding line");
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> LineFrame {
        LineFrame::Line(s.to_string())
    }

    fn drain(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<LineFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn several_lines_in_one_chunk() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1}\n{\"id\":2}\r\n{\"id\""[..]);

        assert_eq!(
            drain(&mut codec, &mut buf),
            vec![line("{\"id\":1}"), line("{\"id\":2}")]
        );
        assert_eq!(&buf[..], b"{\"id\"");

        buf.extend_from_slice(b":3}\n");
        assert_eq!(drain(&mut codec, &mut buf), vec![line("{\"id\":3}")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_inside_multibyte_character() {
        let mut codec = LineCodec::new();
        let bytes = "héllo→\n".as_bytes();
        let mut buf = BytesMut::new();

        // Feed one byte at a time so every multi-byte sequence gets split.
        let mut frames = Vec::new();
        for b in bytes {
            buf.put_u8(*b);
            frames.extend(drain(&mut codec, &mut buf));
        }
        assert_eq!(frames, vec![line("héllo→")]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"\n  \r\n\t\nx\n"[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec![line("x")]);
    }

    #[test]
    fn oversized_line_is_discarded_and_stream_continues() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abc"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"def\nok\n");
        assert_eq!(
            drain(&mut codec, &mut buf),
            vec![LineFrame::Oversized { len: 16 }, line("ok")]
        );
    }

    #[test]
    fn oversized_complete_line() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"too long\nfine\n"[..]);
        assert_eq!(
            drain(&mut codec, &mut buf),
            vec![LineFrame::Oversized { len: 8 }, line("fine")]
        );
    }

    #[test]
    fn eof_flushes_unterminated_fragment() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"a\ntail"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(line("a")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(line("tail")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe\n"[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec![line("\u{fffd}\u{fffd}")]);
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(r#"{"op":"shutdown"}"#, &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"op\":\"shutdown\"}\n");
    }

    #[test]
    fn encode_rejects_embedded_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let err = codec.encode("a\nb", &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }
}
