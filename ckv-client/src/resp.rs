//! # RESP2 Encoding and Parsing
//!
//! Purpose: Frame commands and parse replies for both the blocking and the
//! cooperative transports, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::io::BufRead;

use bytes::{Buf, BytesMut};
use ckv_common::{CacheError, CacheResult, TransportError};

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with None for a null array (aborted transaction).
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Bulk(None) | RespValue::Array(None))
    }

    /// Error message text, when this is an error reply.
    pub fn error_message(&self) -> Option<String> {
        match self {
            RespValue::Error(msg) => Some(String::from_utf8_lossy(msg).into_owned()),
            _ => None,
        }
    }

    /// Integer reply, also accepting integers sent as bulk or simple text.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(v) => Some(*v),
            RespValue::Bulk(Some(data)) | RespValue::Simple(data) => {
                std::str::from_utf8(data).ok()?.parse().ok()
            }
            _ => None,
        }
    }

    /// Payload bytes of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Bulk(Some(data)) | RespValue::Simple(data) => Some(data),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            RespValue::Bulk(Some(data)) | RespValue::Simple(data) => Some(data),
            _ => None,
        }
    }

    /// Text of a bulk or simple string, lossily decoded.
    pub fn as_text(&self) -> Option<String> {
        self.as_bytes()
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// `+OK` style acknowledgement.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(text) if text.as_slice() == b"OK")
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> CacheResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(protocol("empty reply line"));
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        other => Err(protocol(format!("unexpected reply type byte {other:#04x}"))),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> CacheResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let len = len as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(protocol("bulk string missing CRLF"));
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> CacheResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Array(None));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(Some(items)))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> CacheResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(TransportError::Closed.into());
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(protocol("reply line missing CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

/// Decodes one complete value from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed then.
pub fn decode(buf: &mut BytesMut) -> CacheResult<Option<RespValue>> {
    match parse_frame(&buf[..], 0)? {
        Some((value, end)) => {
            buf.advance(end);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_frame(data: &[u8], pos: usize) -> CacheResult<Option<(RespValue, usize)>> {
    let Some(line_end) = find_crlf(data, pos) else {
        return Ok(None);
    };
    if line_end == pos {
        return Err(protocol("empty reply line"));
    }
    let line = &data[pos + 1..line_end];
    let next = line_end + 2;

    match data[pos] {
        b'+' => Ok(Some((RespValue::Simple(line.to_vec()), next))),
        b'-' => Ok(Some((RespValue::Error(line.to_vec()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(line)?), next))),
        b'$' => {
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let end = next + len as usize;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(protocol("bulk string missing CRLF"));
            }
            Ok(Some((RespValue::Bulk(Some(data[next..end].to_vec())), end + 2)))
        }
        b'*' => {
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                match parse_frame(data, cursor)? {
                    Some((item, end)) => {
                        items.push(item);
                        cursor = end;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(protocol(format!("unexpected reply type byte {other:#04x}"))),
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < from + 2 {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|idx| from + idx)
}

fn parse_i64(data: &[u8]) -> CacheResult<i64> {
    if data.is_empty() {
        return Err(protocol("empty integer"));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(protocol("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

fn protocol(message: impl Into<String>) -> CacheError {
    CacheError::Protocol(message.into())
}
