//! User and channel mode bits with their letter mappings.

/// User modes, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum UserMode {
    Invisible = 1 << 0,
    Cloak = 1 << 1,
    BlockUnregisteredPm = 1 << 2,
    Bot = 1 << 3,
    Deaf = 1 << 4,
    Registered = 1 << 5,
    CallerId = 1 << 6,
    HideChannels = 1 << 7,
    BlockCtcp = 1 << 8,
    Secure = 1 << 9,
    Oper = 1 << 10,
    LocalOper = 1 << 11,
    Wallops = 1 << 12,
    ServerNotices = 1 << 13,
    Protected = 1 << 14,
    Service = 1 << 15,
}

impl UserMode {
    pub const ALL: [UserMode; 16] = [
        UserMode::Invisible,
        UserMode::Cloak,
        UserMode::BlockUnregisteredPm,
        UserMode::Bot,
        UserMode::Deaf,
        UserMode::Registered,
        UserMode::CallerId,
        UserMode::HideChannels,
        UserMode::BlockCtcp,
        UserMode::Secure,
        UserMode::Oper,
        UserMode::LocalOper,
        UserMode::Wallops,
        UserMode::ServerNotices,
        UserMode::Protected,
        UserMode::Service,
    ];

    pub fn letter(self) -> char {
        match self {
            UserMode::Invisible => 'i',
            UserMode::Cloak => 'x',
            UserMode::BlockUnregisteredPm => 'R',
            UserMode::Bot => 'B',
            UserMode::Deaf => 'd',
            UserMode::Registered => 'r',
            UserMode::CallerId => 'g',
            UserMode::HideChannels => 'p',
            UserMode::BlockCtcp => 'T',
            UserMode::Secure => 'z',
            UserMode::Oper => 'o',
            UserMode::LocalOper => 'O',
            UserMode::Wallops => 'w',
            UserMode::ServerNotices => 's',
            UserMode::Protected => 'a',
            UserMode::Service => 'S',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.letter() == c)
    }
}

/// Channel modes, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ChannelMode {
    InviteOnly = 1 << 0,
    Moderated = 1 << 1,
    NoExternal = 1 << 2,
    Quiet = 1 << 3,
    Secret = 1 << 4,
    TopicProtected = 1 << 5,
    Ban = 1 << 6,
    Key = 1 << 7,
    Limit = 1 << 8,
}

impl ChannelMode {
    pub const ALL: [ChannelMode; 9] = [
        ChannelMode::InviteOnly,
        ChannelMode::Moderated,
        ChannelMode::NoExternal,
        ChannelMode::Quiet,
        ChannelMode::Secret,
        ChannelMode::TopicProtected,
        ChannelMode::Ban,
        ChannelMode::Key,
        ChannelMode::Limit,
    ];

    pub fn letter(self) -> char {
        match self {
            ChannelMode::InviteOnly => 'i',
            ChannelMode::Moderated => 'm',
            ChannelMode::NoExternal => 'n',
            ChannelMode::Quiet => 'q',
            ChannelMode::Secret => 's',
            ChannelMode::TopicProtected => 't',
            ChannelMode::Ban => 'b',
            ChannelMode::Key => 'k',
            ChannelMode::Limit => 'l',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.letter() == c)
    }

    /// Whether a change of this mode consumes one argument.
    pub fn takes_arg(self) -> bool {
        matches!(
            self,
            ChannelMode::Ban | ChannelMode::Key | ChannelMode::Limit
        )
    }
}

/// A set of mode bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeSet(u16);

impl ModeSet {
    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }

    pub fn has(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }
}

/// Set of user modes on one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModeSet(ModeSet);

impl UserModeSet {
    pub fn set(&mut self, mode: UserMode) {
        self.0.set(mode as u16);
    }

    pub fn clear(&mut self, mode: UserMode) {
        self.0.clear(mode as u16);
    }

    pub fn has(&self, mode: UserMode) -> bool {
        self.0.has(mode as u16)
    }

    /// Currently set modes as a letter string, in canonical order.
    pub fn letters(&self) -> String {
        UserMode::ALL
            .into_iter()
            .filter(|m| self.has(*m))
            .map(UserMode::letter)
            .collect()
    }
}

/// Set of channel modes on one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelModeSet(ModeSet);

impl ChannelModeSet {
    pub fn set(&mut self, mode: ChannelMode) {
        self.0.set(mode as u16);
    }

    pub fn clear(&mut self, mode: ChannelMode) {
        self.0.clear(mode as u16);
    }

    pub fn has(&self, mode: ChannelMode) -> bool {
        self.0.has(mode as u16)
    }

    pub fn letters(&self) -> String {
        ChannelMode::ALL
            .into_iter()
            .filter(|m| self.has(*m))
            .map(ChannelMode::letter)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_round_trip() {
        for mode in UserMode::ALL {
            assert_eq!(UserMode::from_letter(mode.letter()), Some(mode));
        }
        for mode in ChannelMode::ALL {
            assert_eq!(ChannelMode::from_letter(mode.letter()), Some(mode));
        }
    }

    #[test]
    fn letter_string_is_ordered() {
        let mut set = UserModeSet::default();
        set.set(UserMode::Registered);
        set.set(UserMode::Invisible);
        assert_eq!(set.letters(), "ir");
        set.clear(UserMode::Invisible);
        assert_eq!(set.letters(), "r");
    }

    #[test]
    fn arg_taking_channel_modes() {
        assert!(ChannelMode::Key.takes_arg());
        assert!(ChannelMode::Ban.takes_arg());
        assert!(ChannelMode::Limit.takes_arg());
        assert!(!ChannelMode::Moderated.takes_arg());
    }
}
