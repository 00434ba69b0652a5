//! Message source prefixes.

use std::fmt;

/// The `:source` ahead of a relayed or server-originated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prefix {
    /// A bare server name.
    ServerName(String),
    /// `nick!user@host`.
    Nickmask {
        nick: String,
        user: String,
        host: String,
    },
}

impl Prefix {
    pub fn nickmask(nick: &str, user: &str, host: &str) -> Self {
        Prefix::Nickmask {
            nick: nick.to_string(),
            user: user.to_string(),
            host: host.to_string(),
        }
    }

    /// Parse a raw prefix token. Anything without `!` and `@` is taken as a
    /// server name; a partial mask keeps the nick and fills the rest.
    pub fn parse(raw: &str) -> Self {
        match (raw.find('!'), raw.find('@')) {
            (Some(bang), Some(at)) if bang < at => Prefix::Nickmask {
                nick: raw[..bang].to_string(),
                user: raw[bang + 1..at].to_string(),
                host: raw[at + 1..].to_string(),
            },
            _ => Prefix::ServerName(raw.to_string()),
        }
    }

    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickmask { nick, .. } => Some(nick),
            Prefix::ServerName(_) => None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => f.write_str(name),
            Prefix::Nickmask { nick, user, host } => write!(f, "{nick}!{user}@{host}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nickmask() {
        let p = Prefix::parse("alice!ali@example.net");
        assert_eq!(p, Prefix::nickmask("alice", "ali", "example.net"));
        assert_eq!(p.to_string(), "alice!ali@example.net");
    }

    #[test]
    fn bare_token_is_server() {
        assert_eq!(
            Prefix::parse("irc.example.net"),
            Prefix::ServerName("irc.example.net".into())
        );
    }
}
