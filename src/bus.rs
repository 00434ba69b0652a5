//! Extension bus: synchronous dispatch at defined observation points.
//!
//! Each event kind carries a flat record the handler may mutate or cancel.
//! Dispatch runs on the caller's task; handlers must not hold locks across
//! I/O. With no handler registered for a kind, dispatch is a lookup and
//! nothing more.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Observation points, one bit per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    AuthSaslPlain = 1 << 0,
    ChannelMsg = 1 << 1,
    PrivateMsg = 1 << 2,
    ChannelJoin = 1 << 3,
    ChannelPart = 1 << 4,
    RawLine = 1 << 5,
    PeerMaxConnections = 1 << 6,
    NickChange = 1 << 7,
    ChannelRename = 1 << 8,
    TagMsg = 1 << 9,
}

/// SASL PLAIN verification. A handler that clears `ok` (or sets `cancel`)
/// rejects the login; `reason` feeds the failure reply.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub username: String,
    pub password: String,
    pub ip: String,
    pub ok: bool,
    pub cancel: bool,
    pub reason: String,
}

/// A PRIVMSG or TAGMSG in flight. `channel` is set for the channel route,
/// `target_nick` for the private route.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub account: Uuid,
    pub conn: Uuid,
    pub nick: String,
    pub channel: Option<String>,
    pub target_nick: Option<String>,
    pub text: String,
    pub tags: Vec<(String, String)>,
    pub cancel: bool,
    pub reason: String,
}

/// JOIN or PART of one account on one channel.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub account: Uuid,
    pub channel: String,
    pub from_system: bool,
    pub message: String,
    pub cancel: bool,
    pub reason: String,
}

/// A raw inbound line before parsing. Handlers may rewrite it.
#[derive(Debug, Clone)]
pub struct RawLineEvent {
    pub line: String,
    pub ip: String,
    pub cancel: bool,
    pub reason: String,
}

/// A connection was refused because the per-IP cap was reached.
#[derive(Debug, Clone)]
pub struct PeerMaxConnectionsEvent {
    pub ip: String,
    pub cap: u32,
}

#[derive(Debug, Clone)]
pub struct NickChangeEvent {
    pub account: Uuid,
    pub old_nick: String,
    pub new_nick: String,
    pub cancel: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RenameEvent {
    pub account: Uuid,
    pub old_name: String,
    pub new_name: String,
    pub message: String,
    pub cancel: bool,
    pub reason: String,
}

/// The tagged event value handed to handlers.
#[derive(Debug, Clone)]
pub enum Event {
    AuthSaslPlain(AuthEvent),
    ChannelMsg(MessageEvent),
    PrivateMsg(MessageEvent),
    ChannelJoin(MembershipEvent),
    ChannelPart(MembershipEvent),
    RawLine(RawLineEvent),
    PeerMaxConnections(PeerMaxConnectionsEvent),
    NickChange(NickChangeEvent),
    ChannelRename(RenameEvent),
    TagMsg(MessageEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AuthSaslPlain(_) => EventKind::AuthSaslPlain,
            Event::ChannelMsg(_) => EventKind::ChannelMsg,
            Event::PrivateMsg(_) => EventKind::PrivateMsg,
            Event::ChannelJoin(_) => EventKind::ChannelJoin,
            Event::ChannelPart(_) => EventKind::ChannelPart,
            Event::RawLine(_) => EventKind::RawLine,
            Event::PeerMaxConnections(_) => EventKind::PeerMaxConnections,
            Event::NickChange(_) => EventKind::NickChange,
            Event::ChannelRename(_) => EventKind::ChannelRename,
            Event::TagMsg(_) => EventKind::TagMsg,
        }
    }

    pub fn cancelled(&self) -> bool {
        match self {
            Event::AuthSaslPlain(e) => e.cancel,
            Event::ChannelMsg(e) | Event::PrivateMsg(e) | Event::TagMsg(e) => e.cancel,
            Event::ChannelJoin(e) | Event::ChannelPart(e) => e.cancel,
            Event::RawLine(e) => e.cancel,
            Event::PeerMaxConnections(_) => false,
            Event::NickChange(e) => e.cancel,
            Event::ChannelRename(e) => e.cancel,
        }
    }

    /// The abort reason recorded by a cancelling handler, for logging.
    pub fn reason(&self) -> &str {
        match self {
            Event::AuthSaslPlain(e) => &e.reason,
            Event::ChannelMsg(e) | Event::PrivateMsg(e) | Event::TagMsg(e) => &e.reason,
            Event::ChannelJoin(e) | Event::ChannelPart(e) => &e.reason,
            Event::RawLine(e) => &e.reason,
            Event::PeerMaxConnections(_) => "",
            Event::NickChange(e) => &e.reason,
            Event::ChannelRename(e) => &e.reason,
        }
    }
}

pub type EventHandler = Box<dyn Fn(&mut Event) + Send + Sync>;

/// Process-wide dispatch table. Registration is additive.
#[derive(Default)]
pub struct Bus {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers
            .read()
            .get(&kind)
            .is_some_and(|v| !v.is_empty())
    }

    /// Run every handler for the event's kind, in registration order. The
    /// caller inspects `event.cancelled()` afterwards.
    pub fn dispatch(&self, event: &mut Event) {
        let guard = self.handlers.read();
        let Some(handlers) = guard.get(&event.kind()) else {
            return;
        };
        for handler in handlers {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_event() -> Event {
        Event::ChannelJoin(MembershipEvent {
            account: Uuid::new_v4(),
            channel: "rust".into(),
            from_system: false,
            message: String::new(),
            cancel: false,
            reason: String::new(),
        })
    }

    #[test]
    fn dispatch_without_handler_is_noop() {
        let bus = Bus::new();
        let mut event = join_event();
        bus.dispatch(&mut event);
        assert!(!event.cancelled());
    }

    #[test]
    fn handler_can_cancel_with_reason() {
        let bus = Bus::new();
        bus.register(
            EventKind::ChannelJoin,
            Box::new(|e| {
                if let Event::ChannelJoin(join) = e {
                    join.cancel = true;
                    join.reason = "channel frozen".into();
                }
            }),
        );

        let mut event = join_event();
        bus.dispatch(&mut event);
        assert!(event.cancelled());
        assert_eq!(event.reason(), "channel frozen");
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = Bus::new();
        bus.register(
            EventKind::RawLine,
            Box::new(|e| {
                if let Event::RawLine(raw) = e {
                    raw.line.push('a');
                }
            }),
        );
        bus.register(
            EventKind::RawLine,
            Box::new(|e| {
                if let Event::RawLine(raw) = e {
                    raw.line.push('b');
                }
            }),
        );

        let mut event = Event::RawLine(RawLineEvent {
            line: "x".into(),
            ip: String::new(),
            cancel: false,
            reason: String::new(),
        });
        bus.dispatch(&mut event);
        match event {
            Event::RawLine(raw) => assert_eq!(raw.line, "xab"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn has_handler_tracks_registration() {
        let bus = Bus::new();
        assert!(!bus.has_handler(EventKind::NickChange));
        bus.register(EventKind::NickChange, Box::new(|_| {}));
        assert!(bus.has_handler(EventKind::NickChange));
    }
}
