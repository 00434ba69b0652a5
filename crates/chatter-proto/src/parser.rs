//! Nom-based IRC frame parser.
//!
//! Splits one line (already stripped of CRLF) into its raw components:
//! tag block, source prefix, command and parameters. Tag unescaping and
//! prefix decomposition happen in [`crate::tags`] and [`crate::prefix`].

use nom::{
    bytes::complete::{take_until, take_while1},
    character::complete::{char, space0},
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::MessageParseError;

/// Parse the IRCv3 tag block (after `@`, up to the first space).
fn parse_tags(input: &str) -> IResult<&str, &str> {
    preceded(char('@'), take_until(" "))(input)
}

/// Parse the source prefix (after `:`, up to the first space).
fn parse_prefix(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

/// Parse the command token.
fn parse_command(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric())(input)
}

/// Parse parameters: space-separated middles up to a `:`-led trailing which
/// consumes the rest of the line. Runs of interior spaces collapse. The
/// second value records whether a trailing parameter was present, so the
/// serialiser can reproduce the exact bytes.
fn parse_params(input: &str) -> (Vec<&str>, bool) {
    let mut params: Vec<&str> = Vec::new();
    let mut rest = input;
    let mut has_trailing = false;

    while rest.as_bytes().first() == Some(&b' ') {
        while rest.as_bytes().first() == Some(&b' ') {
            rest = &rest[1..];
        }
        if rest.is_empty() {
            break;
        }
        if let Some(after_colon) = rest.strip_prefix(':') {
            params.push(after_colon);
            has_trailing = true;
            break;
        }
        let end = rest.find(' ').unwrap_or(rest.len());
        params.push(&rest[..end]);
        rest = &rest[end..];
    }

    (params, has_trailing)
}

/// A raw frame split into borrowed slices of the input line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage<'a> {
    /// Tag block without the leading `@`, still escaped.
    pub tags: Option<&'a str>,
    /// Prefix without the leading `:`.
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
    /// Whether the last parameter was written as a `:`-led trailing.
    pub has_trailing: bool,
}

impl<'a> RawMessage<'a> {
    pub fn parse(input: &'a str) -> Result<Self, MessageParseError> {
        if input.is_empty() {
            return Err(MessageParseError::EmptyMessage);
        }

        let (input, tags) = opt(parse_tags)(input).map_err(|_: nom::Err<nom::error::Error<&str>>| {
            MessageParseError::InvalidCommand
        })?;
        let (input, _) = space0::<_, nom::error::Error<&str>>(input)
            .map_err(|_| MessageParseError::InvalidCommand)?;
        let (input, prefix) = opt(parse_prefix)(input)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| MessageParseError::InvalidCommand)?;
        let (input, _) = space0::<_, nom::error::Error<&str>>(input)
            .map_err(|_| MessageParseError::InvalidCommand)?;
        let (input, command) = parse_command(input)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| MessageParseError::MissingCommand)?;

        let (params, has_trailing) = parse_params(input);
        Ok(RawMessage {
            tags,
            prefix,
            command,
            params,
            has_trailing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command() {
        let msg = RawMessage::parse("PING").unwrap();
        assert_eq!(msg.command, "PING");
        assert!(msg.tags.is_none());
        assert!(msg.prefix.is_none());
        assert!(msg.params.is_empty());
    }

    #[test]
    fn trailing_keeps_spaces() {
        let msg = RawMessage::parse("PRIVMSG #chan :Hello, world!").unwrap();
        assert_eq!(msg.params, vec!["#chan", "Hello, world!"]);
    }

    #[test]
    fn prefix_and_tags() {
        let msg =
            RawMessage::parse("@msgid=abc;time=x :nick!u@h PRIVMSG #c :hi there").unwrap();
        assert_eq!(msg.tags, Some("msgid=abc;time=x"));
        assert_eq!(msg.prefix, Some("nick!u@h"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#c", "hi there"]);
    }

    #[test]
    fn space_runs_collapse() {
        let msg = RawMessage::parse("USER  guest   0 * :Real Name").unwrap();
        assert_eq!(msg.params, vec!["guest", "0", "*", "Real Name"]);
    }

    #[test]
    fn empty_trailing_is_a_param() {
        let msg = RawMessage::parse("PRIVMSG #chan :").unwrap();
        assert_eq!(msg.params, vec!["#chan", ""]);
    }

    #[test]
    fn numeric_command() {
        let msg = RawMessage::parse(":server 001 nick :Welcome").unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.prefix, Some("server"));
    }

    #[test]
    fn empty_line_rejected() {
        assert_eq!(
            RawMessage::parse("").unwrap_err(),
            MessageParseError::EmptyMessage
        );
    }
}
