//! Newline framing for pool sockets.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// Longest line accepted from a pool, in bytes.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// One item read from the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),

    /// A line exceeded [`MAX_LINE_LENGTH`]; it was discarded up to its
    /// newline and reading continues with the next line.
    Overflow,
}

/// `LinesCodec` that reports over-long lines as a frame instead of an error.
///
/// `FramedRead` ends the stream after the first decoder error, which would
/// turn a single oversized message into a disconnect.
#[derive(Debug)]
pub struct StratumLines {
    lines: LinesCodec,
}

impl StratumLines {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn map(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Frame>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Overflow)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for StratumLines {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::map(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::map(self.lines.decode_eof(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines() {
        let mut codec = StratumLines::new();
        let mut buf = BytesMut::from(&b"{\"id\":1}\n{\"id\":2}\npartial"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Line("{\"id\":1}".into())));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Line("{\"id\":2}".into())));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b" line\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Line("partial line".into())));
    }

    #[test]
    fn overflow_discards_and_recovers() {
        let mut codec = StratumLines::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Overflow));

        // Rest of the long line is dropped, the next line comes through
        buf.extend_from_slice(b"tail\nok\n");
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames, vec![Frame::Line("ok".into())]);
    }
}
