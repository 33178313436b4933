//! RESP2 helpers shared by the client listener, the peer client, and the AOF.
//!
//! Every command travels as an array of bulk strings. The same codec
//! (`redis_protocol::codec::Resp2`) frames client traffic, peer traffic, and
//! the append-only file, so a persisted log can be read back exactly like a
//! live connection.

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio_util::codec::Encoder;

/// A command and its arguments, e.g. `[SET, key, value]`.
pub type CmdLine = Vec<Bytes>;

/// Build a command line from anything byte-like.
pub fn to_cmd_line<I, S>(parts: I) -> CmdLine
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    parts
        .into_iter()
        .map(|part| Bytes::copy_from_slice(part.as_ref()))
        .collect()
}

/// Wrap a command line in a RESP array of bulk strings.
pub fn cmd_line_frame(cmd_line: &[Bytes]) -> BytesFrame {
    BytesFrame::Array(
        cmd_line
            .iter()
            .cloned()
            .map(BytesFrame::BulkString)
            .collect(),
    )
}

/// Convert a decoded frame back into a command line.
///
/// Only arrays of bulk or simple strings are commands; anything else is
/// rejected so callers can report it.
pub fn frame_to_cmd_line(frame: BytesFrame) -> anyhow::Result<CmdLine> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    parts
        .into_iter()
        .map(|part| match part {
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Ok(b),
            other => anyhow::bail!("expected bulk string, got {other:?}"),
        })
        .collect()
}

/// Append the RESP encoding of `cmd_line` to `buf`.
pub fn encode_cmd_line(cmd_line: &[Bytes], buf: &mut BytesMut) -> anyhow::Result<()> {
    Resp2::default()
        .encode(cmd_line_frame(cmd_line), buf)
        .context("encode command frame")
}

/// Lowercased command name, or an empty string for an empty command line.
pub fn command_name(cmd_line: &[Bytes]) -> String {
    cmd_line
        .first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
        .unwrap_or_default()
}

/// `+OK`
pub fn ok_reply() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

/// `:<value>`
pub fn int_reply(value: i64) -> BytesFrame {
    BytesFrame::Integer(value)
}

/// `$<len>` followed by `value`.
pub fn bulk_reply(value: Bytes) -> BytesFrame {
    BytesFrame::BulkString(value)
}

/// Null bulk string, the reply for a missing key.
pub fn null_reply() -> BytesFrame {
    BytesFrame::Null
}

/// Error reply; `msg` should already carry its `ERR` prefix.
pub fn error_reply(msg: impl Into<String>) -> BytesFrame {
    BytesFrame::Error(msg.into().into())
}

/// Generic reply returned when command dispatch fails unexpectedly.
pub fn unknown_error_reply() -> BytesFrame {
    error_reply("ERR unknown")
}

/// Redis' wrong-arity error for `cmd`.
pub fn arity_error_reply(cmd: &str) -> BytesFrame {
    error_reply(format!(
        "ERR wrong number of arguments for '{cmd}' command"
    ))
}

pub fn is_error_reply(reply: &BytesFrame) -> bool {
    matches!(reply, BytesFrame::Error(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Decoder;

    #[test]
    fn cmd_line_survives_codec() {
        let cmd_line = to_cmd_line(["SET", "key with spaces", "v\r\nalue"]);
        let mut buf = BytesMut::new();
        encode_cmd_line(&cmd_line, &mut buf).unwrap();
        assert!(buf.starts_with(b"*3\r\n$3\r\nSET\r\n"));

        let frame = Resp2::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame_to_cmd_line(frame).unwrap(), cmd_line);
        assert!(buf.is_empty());
    }

    #[test]
    fn non_array_frames_are_not_commands() {
        let err = frame_to_cmd_line(BytesFrame::Integer(3)).unwrap_err();
        assert!(err.to_string().contains("expected array frame"));
    }

    #[test]
    fn command_name_is_lowercased() {
        assert_eq!(command_name(&to_cmd_line(["GeT", "k"])), "get");
        assert_eq!(command_name(&[]), "");
    }
}
