//! Incremental parser for client commands (RESP2 arrays of bulk strings).
//!
//! Works on a `BytesMut` filled by the socket reader and consumes a frame
//! only once it is complete.

use bytes::{Buf, BytesMut};

/// Malformed input; the connection is closed after reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolError;

#[derive(Debug, Default)]
pub struct CommandParser;

impl CommandParser {
    pub fn new() -> Self {
        CommandParser
    }

    /// Returns the next complete command, or `None` when more input is needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, ProtocolError> {
        let mut pos = 0;
        let Some(header) = read_line(buf, &mut pos) else {
            return Ok(None);
        };
        if header.first() != Some(&b'*') {
            return Err(ProtocolError);
        }
        let count = parse_len(&header[1..])?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(line) = read_line(buf, &mut pos) else {
                return Ok(None);
            };
            if line.first() != Some(&b'$') {
                return Err(ProtocolError);
            }
            let len = parse_len(&line[1..])?;
            if buf.len() < pos + len + 2 {
                return Ok(None);
            }
            args.push(buf[pos..pos + len].to_vec());
            if &buf[pos + len..pos + len + 2] != b"\r\n" {
                return Err(ProtocolError);
            }
            pos += len + 2;
        }
        buf.advance(pos);
        Ok(Some(args))
    }
}

fn read_line(buf: &BytesMut, pos: &mut usize) -> Option<Vec<u8>> {
    let start = *pos;
    let end = buf[start..].windows(2).position(|w| w == b"\r\n")? + start;
    *pos = end + 2;
    Some(buf[start..end].to_vec())
}

fn parse_len(digits: &[u8]) -> Result<usize, ProtocolError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_complete_frames() {
        let mut parser = CommandParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1\r"[..]);
        assert_eq!(parser.parse(&mut buf), Ok(None));
        buf.extend_from_slice(b"\nk\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(
            parser.parse(&mut buf),
            Ok(Some(vec![b"GET".to_vec(), b"k".to_vec()]))
        );
        assert_eq!(parser.parse(&mut buf), Ok(Some(vec![b"PING".to_vec()])));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_inline_commands() {
        let mut buf = BytesMut::from(&b"PING\r\n"[..]);
        assert_eq!(CommandParser::new().parse(&mut buf), Err(ProtocolError));
    }
}
