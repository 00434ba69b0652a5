//! Owned and borrowed message types.
//!
//! [`MessageRef`] borrows slices of the incoming line for cheap inspection;
//! [`Message`] is the owned form handlers construct and the fan-out paths
//! clone. `Display` on `Message` produces the exact wire bytes minus CRLF.

use std::fmt;

use crate::error::MessageParseError;
use crate::parser::RawMessage;
use crate::prefix::Prefix;
use crate::tags::{build_tag_block, escape_tag_value, unescape_tag_value};

/// One message tag, value unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

impl Tag {
    pub fn new(key: impl Into<String>, value: Option<&str>) -> Self {
        Tag(key.into(), value.map(str::to_string))
    }
}

/// A parsed frame borrowing the input line.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRef<'a> {
    /// Raw tag block, still escaped.
    pub tags: Option<&'a str>,
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
    pub has_trailing: bool,
    pub raw: &'a str,
}

impl<'a> MessageRef<'a> {
    pub fn parse(line: &'a str) -> Result<Self, MessageParseError> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let raw = RawMessage::parse(trimmed)?;
        Ok(MessageRef {
            tags: raw.tags,
            prefix: raw.prefix,
            command: raw.command,
            params: raw.params,
            has_trailing: raw.has_trailing,
            raw: trimmed,
        })
    }

    /// Positional parameter accessor.
    pub fn arg(&self, i: usize) -> Option<&'a str> {
        self.params.get(i).copied()
    }

    /// Iterate tags as `(key, unescaped value)` pairs.
    pub fn tags_iter(&self) -> impl Iterator<Item = (&'a str, Option<String>)> + '_ {
        self.tags
            .unwrap_or("")
            .split(';')
            .filter(|t| !t.is_empty())
            .map(|t| match t.split_once('=') {
                Some((k, v)) => (k, Some(unescape_tag_value(v))),
                None => (t, None),
            })
    }

    pub fn to_owned_message(&self) -> Message {
        Message {
            tags: self
                .tags_iter()
                .map(|(k, v)| Tag(k.to_string(), v))
                .collect(),
            prefix: self.prefix.map(Prefix::parse),
            command: self.command.to_string(),
            params: self.params.iter().map(|p| p.to_string()).collect(),
            has_trailing: self.has_trailing,
        }
    }
}

/// The owned frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub tags: Vec<Tag>,
    pub prefix: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
    /// Serialise the last parameter as a `:`-led trailing even when it
    /// would not strictly need one.
    pub has_trailing: bool,
}

impl Message {
    /// Start a message with no source prefix.
    pub fn cmd(command: impl Into<String>) -> Self {
        Message {
            tags: Vec::new(),
            prefix: None,
            command: command.into(),
            params: Vec::new(),
            has_trailing: false,
        }
    }

    pub fn parse(line: &str) -> Result<Self, MessageParseError> {
        Ok(MessageRef::parse(line)?.to_owned_message())
    }

    /// Append a middle parameter. The value must not contain spaces.
    pub fn param(mut self, p: impl Into<String>) -> Self {
        self.params.push(p.into());
        self
    }

    /// Append the trailing parameter.
    pub fn trailing(mut self, p: impl Into<String>) -> Self {
        self.params.push(p.into());
        self.has_trailing = true;
        self
    }

    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    /// Whether writing this message should be followed by closing the
    /// connection (the ERROR command terminates the session).
    pub fn is_error(&self) -> bool {
        self.command == "ERROR"
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let escaped: Vec<(String, Option<String>)> = self
                .tags
                .iter()
                .map(|Tag(k, v)| (k.clone(), v.as_deref().map(escape_tag_value)))
                .collect();
            let block = build_tag_block(
                escaped
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_deref())),
            );
            write!(f, "@{block} ")?;
        }

        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }

        f.write_str(&self.command)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last
                && (self.has_trailing
                    || param.is_empty()
                    || param.contains(' ')
                    || param.starts_with(':'))
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes() {
        let lines = [
            "PING :token",
            "PRIVMSG #chan :hello there",
            ":nick!u@h JOIN :#room",
            "@account=alice;msgid=42 :nick!u@h PRIVMSG #c :hi",
            "MODE #chan +kl secret 10",
            "PRIVMSG #chan :",
        ];
        for line in lines {
            let msg = Message::parse(line).unwrap();
            assert_eq!(msg.to_string(), line, "line {line:?}");
        }
    }

    #[test]
    fn escaped_tag_values_survive() {
        let msg = Message::parse("@note=two\\swords PRIVMSG #c :x").unwrap();
        assert_eq!(msg.tags[0], Tag::new("note", Some("two words")));
        assert_eq!(msg.to_string(), "@note=two\\swords PRIVMSG #c :x");
    }

    #[test]
    fn builder_emits_trailing_colon() {
        let msg = Message::cmd("PONG")
            .param("irc.example.net")
            .trailing("tok");
        assert_eq!(msg.to_string(), "PONG irc.example.net :tok");
    }

    #[test]
    fn trailing_forced_for_spaces() {
        let msg = Message::cmd("PRIVMSG").param("#c").param("two words");
        assert_eq!(msg.to_string(), "PRIVMSG #c :two words");
    }

    #[test]
    fn tags_iter_handles_flags() {
        let r = MessageRef::parse("@bot;account=ali\\:ce CMD").unwrap();
        let tags: Vec<_> = r.tags_iter().collect();
        assert_eq!(tags[0], ("bot", None));
        assert_eq!(tags[1], ("account", Some("ali;ce".to_string())));
    }

    #[test]
    fn error_command_detected() {
        assert!(Message::cmd("ERROR").trailing("Closing Link").is_error());
        assert!(!Message::cmd("PRIVMSG").is_error());
    }
}
