//! IRCv3 message-tag escaping and tag-block assembly.

/// Protocol limit on the joined tag block, excluding the `@` and the
/// separating space.
pub const MAX_TAG_BLOCK: usize = 4094;

/// Escape a tag value for the wire.
///
/// A lone backslash at the end of the value is dropped rather than escaped,
/// matching the de-facto client behaviour for truncated values.
pub fn escape_tag_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ';' => escaped.push_str("\\:"),
            ' ' => escaped.push_str("\\s"),
            '\\' => {
                if chars.peek().is_none() {
                    break;
                }
                escaped.push_str("\\\\");
            }
            '\r' => escaped.push_str("\\r"),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Reverse [`escape_tag_value`]. Unknown escapes decay to the escaped
/// character; a trailing backslash is dropped.
pub fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        let r = if c == '\\' {
            match iter.next() {
                Some(':') => ';',
                Some('s') => ' ',
                Some('\\') => '\\',
                Some('r') => '\r',
                Some('n') => '\n',
                Some(other) => other,
                None => break,
            }
        } else {
            c
        };
        unescaped.push(r);
    }
    unescaped
}

/// Join `key` / `key=value` pairs into a wire tag block, truncated at
/// [`MAX_TAG_BLOCK`] bytes. Values must already be escaped.
pub fn build_tag_block<'a>(pairs: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> String {
    let mut block = String::new();
    for (key, value) in pairs {
        let mut entry = String::with_capacity(key.len() + 1 + value.map_or(0, str::len));
        entry.push_str(key);
        if let Some(v) = value {
            entry.push('=');
            entry.push_str(v);
        }

        let sep = usize::from(!block.is_empty());
        if block.len() + sep + entry.len() > MAX_TAG_BLOCK {
            break;
        }
        if sep == 1 {
            block.push(';');
        }
        block.push_str(&entry);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        for raw in ["plain", "has space", "semi;colon", "back\\slash!", "\r\n"] {
            let escaped = escape_tag_value(raw);
            assert_eq!(unescape_tag_value(&escaped), raw, "value {raw:?}");
        }
    }

    #[test]
    fn escape_after_unescape_is_identity() {
        for escaped in ["a\\sb", "x\\:y", "v\\\\w", "cr\\r", "lf\\n", "plain"] {
            assert_eq!(
                escape_tag_value(&unescape_tag_value(escaped)),
                escaped,
                "escaped {escaped:?}"
            );
        }
    }

    #[test]
    fn trailing_backslash_dropped() {
        assert_eq!(escape_tag_value("abc\\"), "abc");
        assert_eq!(unescape_tag_value("abc\\"), "abc");
    }

    #[test]
    fn block_joins_and_truncates() {
        let block = build_tag_block([("account", Some("alice")), ("bot", None)]);
        assert_eq!(block, "account=alice;bot");

        let long = "x".repeat(MAX_TAG_BLOCK);
        let block = build_tag_block([("a", Some(long.as_str())), ("b", None)]);
        // the oversized entry is dropped entirely, never split
        assert_eq!(block, "");
    }
}
