//! Server replies and their RESP2 encoding.

/// A reply as the test server sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    /// Full error line without the leading `-`, e.g. `ERR no such key`.
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".into())
    }

    pub fn nil() -> Self {
        Reply::Bulk(None)
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(Some(data.into()))
    }

    pub fn err(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    pub fn wrong_type() -> Self {
        Reply::err("WRONGTYPE Operation against a key holding the wrong kind of value")
    }

    pub fn arity(command: &str) -> Self {
        Reply::err(format!(
            "ERR wrong number of arguments for '{}' command",
            command.to_ascii_lowercase()
        ))
    }

    pub fn not_integer() -> Self {
        Reply::err("ERR value is not an integer or out of range")
    }

    pub fn syntax() -> Self {
        Reply::err("ERR syntax error")
    }

    pub fn array(items: Vec<Reply>) -> Self {
        Reply::Array(Some(items))
    }

    pub fn bulks<I, B>(items: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Reply::Array(Some(items.into_iter().map(Reply::bulk).collect()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Appends the RESP2 encoding of this reply to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(text) => line(out, b'+', text.as_bytes()),
            Reply::Error(text) => line(out, b'-', text.as_bytes()),
            Reply::Integer(value) => line(out, b':', value.to_string().as_bytes()),
            Reply::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                line(out, b'$', data.len().to_string().as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Reply::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

fn line(out: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_nested_replies() {
        let reply = Reply::array(vec![Reply::Integer(-2), Reply::bulk("ab"), Reply::nil()]);
        let mut out = Vec::new();
        reply.encode(&mut out);
        assert_eq!(out, b"*3\r\n:-2\r\n$2\r\nab\r\n$-1\r\n");
    }
}
