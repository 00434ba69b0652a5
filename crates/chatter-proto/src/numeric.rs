//! Numeric replies emitted by the daemon.

/// The subset of RFC 1459/2812 and IRCv3 numerics chatterd speaks.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Numeric {
    RPL_WELCOME = 1,
    RPL_YOURHOST = 2,
    RPL_CREATED = 3,
    RPL_MYINFO = 4,
    RPL_ISUPPORT = 5,
    RPL_LUSERCLIENT = 251,
    RPL_LUSERME = 252,
    RPL_WHOISUSER = 311,
    RPL_ENDOFWHO = 315,
    RPL_ENDOFWHOIS = 318,
    RPL_WHOISCHANNELS = 319,
    RPL_CHANNELMODEIS = 324,
    RPL_NOTOPIC = 331,
    RPL_TOPIC = 332,
    RPL_NAMREPLY = 353,
    RPL_WHOSPCRPL = 354,
    RPL_ENDOFNAMES = 366,
    RPL_MOTD = 372,
    RPL_MOTDSTART = 375,
    RPL_ENDOFMOTD = 376,
    ERR_NOSUCHNICK = 401,
    ERR_NOSUCHCHANNEL = 403,
    ERR_NOORIGIN = 409,
    ERR_UNKNOWNCOMMAND = 421,
    ERR_NONICKNAMEGIVEN = 431,
    ERR_ERRONEUSNICKNAME = 432,
    ERR_NICKNAMEINUSE = 433,
    ERR_NOTONCHANNEL = 442,
    ERR_NOTREGISTERED = 451,
    ERR_NEEDMOREPARAMS = 461,
    ERR_PASSWDMISMATCH = 464,
    ERR_BADCHANMASK = 476,
    ERR_UMODEUNKNOWNFLAG = 501,
    RPL_LOGGEDIN = 900,
    RPL_SASLSUCCESS = 903,
}

impl Numeric {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// The zero-padded three-digit command token.
    pub fn token(self) -> String {
        format!("{:03}", self.code())
    }
}
