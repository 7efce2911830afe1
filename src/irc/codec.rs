//! Line framing for client and server sockets.
//!
//! Inbound bytes split on `\n` with an optional preceding `\r`. Outbound
//! traffic is either a [`Message`], serialized here, or a shared [`Bytes`]
//! line that already carries its terminator and is copied as-is.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Longest line a client may send, terminator included.
pub const CLIENT_LINE_LIMIT: usize = 512;

/// Longest line a peer server may send. A relayed client line plus the
/// widest prefix or N-line fields stays well inside it.
pub const SERVER_LINE_LIMIT: usize = 8191;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({limit} bytes)")]
    LineTooLong { limit: usize },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Line codec. Only the inbound side is bounded: outbound lines are built
/// from bounded input and are never refused.
#[derive(Debug, Clone, Copy)]
pub struct IrcCodec {
    max_line: usize,
}

impl IrcCodec {
    pub fn client() -> Self {
        Self { max_line: CLIENT_LINE_LIMIT }
    }

    pub fn server() -> Self {
        Self { max_line: SERVER_LINE_LIMIT }
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }
}

impl Default for IrcCodec {
    fn default() -> Self {
        Self::client()
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(end) = src.iter().position(|&b| b == b'\n') {
            if end + 1 > self.max_line {
                src.advance(end + 1);
                return Err(CodecError::LineTooLong { limit: self.max_line });
            }
            let mut frame = src.split_to(end + 1);
            frame.truncate(end);
            if frame.last() == Some(&b'\r') {
                frame.truncate(end - 1);
            }
            if frame.is_empty() {
                continue;
            }
            let text = std::str::from_utf8(&frame)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            return Ok(Some(Message::parse(text)?));
        }
        if src.len() > self.max_line {
            return Err(CodecError::LineTooLong { limit: self.max_line });
        }
        Ok(None)
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

impl Encoder<Bytes> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_partial_then_complete() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::from("PASS :s3");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"cret\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PASS");
        assert_eq!(msg.params, vec!["s3cret"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_burst_sequence() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::from("C #b +nt\r\nEB\r\n");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command, "C");
        assert_eq!(first.params, vec!["#b", "+nt"]);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.command, "EB");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_skips_blank_lines() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::from("\r\n\r\nEB\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "EB");
    }

    #[test]
    fn decode_accepts_bare_newline() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::from("NICK ada\nUSER ada 0 * :Ada\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().params, vec!["ada"]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "USER");
    }

    #[test]
    fn decode_rejects_unterminated_oversized_line() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::from(vec![b'A'; CLIENT_LINE_LIMIT + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong { limit: CLIENT_LINE_LIMIT })
        ));
    }

    fn privmsg_of_len(len: usize) -> Vec<u8> {
        let head = b"PRIVMSG #x :";
        let mut line = head.to_vec();
        line.resize(len - 2, b'x');
        line.extend_from_slice(b"\r\n");
        line
    }

    #[test]
    fn client_limit_applies_to_complete_lines() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::from(privmsg_of_len(CLIENT_LINE_LIMIT + 1).as_slice());
        buf.extend_from_slice(b"EB\r\n");
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::LineTooLong { .. })));
        // The offending line is consumed, not left to poison the buffer.
        assert_eq!(&buf[..], b"EB\r\n");
    }

    #[test]
    fn server_links_accept_longer_lines() {
        let mut codec = IrcCodec::server();
        let mut buf = BytesMut::from(privmsg_of_len(CLIENT_LINE_LIMIT + 100).as_slice());
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.params[1].len(), CLIENT_LINE_LIMIT + 100 - 14);
    }

    #[test]
    fn maximal_client_line_still_encodes_after_fanout() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::from(privmsg_of_len(CLIENT_LINE_LIMIT).as_slice());
        let msg = codec.decode(&mut buf).unwrap().unwrap();

        let prefix = format!("{}!{}@{}", "n".repeat(30), "u".repeat(30), "h".repeat(63));
        let relayed = Message::with_prefix(&prefix, "PRIVMSG", msg.params).to_line();
        assert!(relayed.len() > CLIENT_LINE_LIMIT);

        let mut out = BytesMut::new();
        codec.encode(relayed.clone(), &mut out).unwrap();
        assert_eq!(&out[..], &relayed[..]);

        // A peer link reading the relayed line back accepts it.
        let mut link = IrcCodec::server();
        assert!(link.decode(&mut out).unwrap().is_some());
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_message_appends_crlf() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("EB", vec![]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"EB\r\n");
    }

    #[test]
    fn encode_shared_line_verbatim() {
        let mut codec = IrcCodec::client();
        let mut buf = BytesMut::new();
        let shared = Bytes::from_static(b":ada 042 hello\r\n");
        codec.encode(shared.clone(), &mut buf).unwrap();
        codec.encode(shared, &mut buf).unwrap();
        assert_eq!(&buf[..], b":ada 042 hello\r\n:ada 042 hello\r\n");
    }
}
