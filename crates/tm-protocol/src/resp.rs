//! RESP2 framing for Redis connections.
//!
//! Replies are decoded incrementally: `decode` returns `Ok(None)` until a
//! complete frame is buffered, so the codec can sit under a `Framed`
//! stream. Requests are always arrays of bulk strings.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BrokerError;

/// Largest bulk string accepted from the server (512 MiB, the Redis limit).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array accepted from the server.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A decoded RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`
    Simple(String),
    /// `-ERR ...`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$3\r\nfoo`
    Bulk(Vec<u8>),
    /// `$-1` or `*-1`
    Null,
    /// `*2\r\n...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Short human-readable description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Simple(s) => format!("simple string {s:?}"),
            Self::Error(e) => format!("error {e:?}"),
            Self::Integer(i) => format!("integer {i}"),
            Self::Bulk(b) => format!("bulk string {:?}", String::from_utf8_lossy(b)),
            Self::Null => "null".to_string(),
            Self::Array(items) => format!("array of {}", items.len()),
        }
    }
}

/// A request: command name followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![name.as_bytes().to_vec()],
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Command name, for logging.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default()
    }
}

/// Codec for RESP2 requests and replies.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse(src, 0)? {
            Some((value, consumed)) => {
                let _ = src.split_to(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for RespCodec {
    type Error = BrokerError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(format!("*{}\r\n", item.args.len()).as_bytes());
        for arg in &item.args {
            dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

/// Parses one value starting at `pos`, returning it and the position just
/// past it, or `None` if the buffer does not yet hold the whole value.
fn parse(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, BrokerError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((
            RespValue::Simple(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            RespValue::Error(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Null, next)));
            }
            if len > MAX_BULK_LEN {
                return Err(BrokerError::Protocol(format!("bulk length {len} too large")));
            }
            let len = len as usize;
            let end = next + len;
            let Some(data) = buf.get(next..end) else {
                return Ok(None);
            };
            match buf.get(end..end + 2) {
                None => Ok(None),
                Some(b"\r\n") => Ok(Some((RespValue::Bulk(data.to_vec()), end + 2))),
                Some(_) => Err(BrokerError::Protocol(
                    "bulk string not terminated by CRLF".to_string(),
                )),
            }
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((RespValue::Null, next)));
            }
            if count > MAX_ARRAY_LEN {
                return Err(BrokerError::Protocol(format!("array length {count} too large")));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut cursor = next;
            for _ in 0..count {
                match parse(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(BrokerError::Protocol(format!(
            "unexpected type byte 0x{other:02x}"
        ))),
    }
}

/// Returns the bytes up to the next CRLF and the position after it.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    let line = rest.get(..idx)?;
    Some((line, start + idx + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, BrokerError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            BrokerError::Protocol(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<RespValue> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(v) = codec.decode(&mut buf).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn test_decode_scalars() {
        let values = decode_all(b"+OK\r\n-ERR nope\r\n:17001\r\n$5\r\nhello\r\n$-1\r\n");
        assert_eq!(
            values,
            vec![
                RespValue::Simple("OK".into()),
                RespValue::Error("ERR nope".into()),
                RespValue::Integer(17001),
                RespValue::Bulk(b"hello".to_vec()),
                RespValue::Null,
            ]
        );
    }

    #[test]
    fn test_decode_subscribe_ack() {
        let values = decode_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nchan\r\n:1\r\n");
        assert_eq!(
            values,
            vec![RespValue::Array(vec![
                RespValue::Bulk(b"subscribe".to_vec()),
                RespValue::Bulk(b"chan".to_vec()),
                RespValue::Integer(1),
            ])]
        );
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*3\r\n$7\r\nmessage\r\n$4\r\nch"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        // Nothing consumed while incomplete.
        assert!(buf.starts_with(b"*3\r\n"));

        buf.extend_from_slice(b"an\r\n$2\r\n{}\r\n");
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Bulk(b"message".to_vec()),
                RespValue::Bulk(b"chan".to_vec()),
                RespValue::Bulk(b"{}".to_vec()),
            ])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bulk_may_contain_crlf() {
        let values = decode_all(b"$4\r\na\r\nb\r\n");
        assert_eq!(values, vec![RespValue::Bulk(b"a\r\nb".to_vec())]);
    }

    #[test]
    fn test_bad_type_byte_is_protocol_error() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(BrokerError::Protocol(_))));
    }

    #[test]
    fn test_bad_bulk_terminator() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$2\r\nokXX"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(BrokerError::Protocol(_))));
    }

    #[test]
    fn test_encode_command() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Command::new("PUBLISH").arg("chan").arg("{}"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nchan\r\n$2\r\n{}\r\n");
    }
}
