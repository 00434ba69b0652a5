//! Identifier validation.

/// Default cap on nick length, in bytes after encoding. Servers may
/// configure a different cap; the wire grammar itself does not change.
pub const NICK_MAX_DEFAULT: usize = 9;

const NICK_SPECIALS: &str = "[]\\`_^{|}";

/// Validate a nickname: first character a Unicode letter or one of
/// `` [ ] \ ` _ ^ { | } ``, the rest may add digits and `-`, at most
/// `max_len` bytes after encoding.
pub fn is_valid_nick(nick: &str, max_len: usize) -> bool {
    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_alphabetic() || NICK_SPECIALS.contains(first)) {
        return false;
    }
    if nick.len() > max_len {
        return false;
    }
    chars.all(|c| c.is_alphabetic() || c.is_numeric() || c == '-' || NICK_SPECIALS.contains(c))
}

/// Validate a channel name, given without its `#` sigil.
pub fn is_valid_channel_name(name: &str, max_len: usize) -> bool {
    !name.is_empty()
        && name.len() <= max_len
        && !name
            .chars()
            .any(|c| c == ' ' || c == ',' || c == '\u{7}' || c.is_control())
}
