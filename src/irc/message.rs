//! Line parsing and serialization for client and server links.
//!
//! ```text
//! [:prefix SPACE] command [SPACE params] [SPACE :trailing]
//! ```
//!
//! Server-link lines lead with a one-character origin token instead of a
//! prefix (`A S peer.test 1 ...`); those parse with the token as `command`
//! and the link verb as the first parameter.

use std::fmt;

use bytes::Bytes;

/// A parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command, numeric, or origin token.
    pub command: String,
    /// Middle parameters, then the trailing one if present.
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.to_owned(),
            params,
        }
    }

    pub fn with_prefix(prefix: &str, command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix.to_owned()),
            command: command.to_owned(),
            params,
        }
    }

    /// Parse a single line. A trailing `\r\n` is ignored and runs of
    /// spaces between middle parameters collapse.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut rest = input.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut prefix = None;
        if let Some(tagged) = rest.strip_prefix(':') {
            let (p, tail) = tagged.split_once(' ').ok_or(ParseError::MissingCommand)?;
            prefix = Some(p.to_owned());
            rest = tail;
        }

        let rest = rest.trim_start_matches(' ');
        let (command, mut tail) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        loop {
            tail = tail.trim_start_matches(' ');
            if tail.is_empty() {
                break;
            }
            if let Some(trailing) = tail.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            let (word, next) = tail.split_once(' ').unwrap_or((tail, ""));
            params.push(word.to_owned());
            tail = next;
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Parameter `i`, or `""` when absent.
    pub fn param(&self, i: usize) -> &str {
        self.params.get(i).map(String::as_str).unwrap_or("")
    }

    /// Serialize to wire format (without trailing `\r\n`). The last
    /// parameter is always written in trailing form.
    pub fn to_wire(&self) -> String {
        let mut out = match &self.prefix {
            Some(prefix) => format!(":{prefix} {}", self.command),
            None => self.command.clone(),
        };
        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push_str(" :");
            out.push_str(last);
        }
        out
    }

    /// Serialize to a shareable, `\r\n`-terminated line.
    pub fn to_line(&self) -> Bytes {
        line(self.to_wire())
    }
}

/// Terminate `text` with `\r\n` and freeze it into a shared buffer.
pub fn line(mut text: String) -> Bytes {
    text.push_str("\r\n");
    Bytes::from(text)
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Client lines ─────────────────────────────────────────────

    #[test]
    fn parse_registration() {
        let msg = Message::parse("USER ada 0 * :Ada Lovelace").unwrap();
        assert_eq!(msg.command, "USER");
        assert_eq!(msg.params, vec!["ada", "0", "*", "Ada Lovelace"]);
    }

    #[test]
    fn parse_prefixed_privmsg() {
        let msg = Message::parse(":ada!ada@host PRIVMSG #engines :hello there").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("ada!ada@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#engines", "hello there"]);
    }

    #[test]
    fn parse_strips_crlf() {
        let msg = Message::parse("PING :estuary.test\r\n").unwrap();
        assert_eq!(msg.params, vec!["estuary.test"]);
    }

    #[test]
    fn parse_empty_trailing() {
        let msg = Message::parse("TOPIC #engines :").unwrap();
        assert_eq!(msg.params, vec!["#engines", ""]);
    }

    // ── Server-link lines ────────────────────────────────────────

    #[test]
    fn parse_server_burst_line_with_double_space() {
        let msg = Message::parse("A S b.test 1 100 200 J10  B :second hop").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "A");
        assert_eq!(
            msg.params,
            vec!["S", "b.test", "1", "100", "200", "J10", "B", "second hop"]
        );
    }

    #[test]
    fn parse_end_of_burst() {
        let msg = Message::parse("EB").unwrap();
        assert_eq!(msg.command, "EB");
        assert!(msg.params.is_empty());
        assert_eq!(msg.param(0), "");
    }

    // ── Errors ───────────────────────────────────────────────────

    #[test]
    fn parse_errors() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(Message::parse(":only"), Err(ParseError::MissingCommand));
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn serialize_marks_last_param_trailing() {
        let msg = Message::with_prefix("estuary.test", "001", vec!["ada".into(), "Welcome".into()]);
        assert_eq!(msg.to_wire(), ":estuary.test 001 ada :Welcome");
    }

    #[test]
    fn serialize_without_params() {
        assert_eq!(Message::new("EB", vec![]).to_wire(), "EB");
    }

    #[test]
    fn to_line_appends_crlf() {
        let msg = Message::new("PASS", vec!["s3cret".into()]);
        assert_eq!(&msg.to_line()[..], b"PASS :s3cret\r\n");
    }

    #[test]
    fn serialized_form_parses_back() {
        let msg = Message::with_prefix("ada!ada@host", "PRIVMSG", vec!["#engines".into(), "a b c".into()]);
        assert_eq!(Message::parse(&msg.to_wire()).unwrap(), msg);
    }
}
