//! Heartbeat control tokens.
//!
//! Control tokens share the text channel with application payloads. They are
//! matched by exact string equality (`PING`, `PONG`) or by prefix
//! (`HEARTBEAT_ANNOUNCE|<ms>`) and must be intercepted before anything is
//! handed to message subscribers.

/// Hub → member liveness probe.
pub const PING: &str = "PING";

/// Member → hub reply to [`PING`].
pub const PONG: &str = "PONG";

/// Prefix of the hub's heartbeat interval announcement.
pub const HEARTBEAT_ANNOUNCE_PREFIX: &str = "HEARTBEAT_ANNOUNCE|";

/// An in-band control token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    Pong,
    /// Hub heartbeat interval in milliseconds.
    HeartbeatAnnounce(u64),
}

impl ControlMessage {
    /// Wire form of the token.
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::Ping => PING.to_string(),
            ControlMessage::Pong => PONG.to_string(),
            ControlMessage::HeartbeatAnnounce(ms) => {
                format!("{}{}", HEARTBEAT_ANNOUNCE_PREFIX, ms)
            }
        }
    }
}

/// Classification of an inbound text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// A control token. Never delivered to application handlers.
    Control(ControlMessage),
    /// Application payload, forwarded verbatim.
    Data(&'a str),
    /// Uses the reserved announce prefix but carries no valid interval.
    /// Dropped by both sides.
    Malformed(&'a str),
}

/// Split an inbound frame into control tokens and application data.
pub fn classify(text: &str) -> Inbound<'_> {
    match text {
        PING => Inbound::Control(ControlMessage::Ping),
        PONG => Inbound::Control(ControlMessage::Pong),
        _ => match text.strip_prefix(HEARTBEAT_ANNOUNCE_PREFIX) {
            Some(ms) => match ms.parse::<u64>() {
                Ok(ms) => Inbound::Control(ControlMessage::HeartbeatAnnounce(ms)),
                Err(_) => Inbound::Malformed(text),
            },
            None => Inbound::Data(text),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_control_tokens() {
        assert_eq!(classify("PING"), Inbound::Control(ControlMessage::Ping));
        assert_eq!(classify("PONG"), Inbound::Control(ControlMessage::Pong));
        assert_eq!(
            classify("HEARTBEAT_ANNOUNCE|150"),
            Inbound::Control(ControlMessage::HeartbeatAnnounce(150))
        );
    }

    #[test]
    fn test_tokens_are_case_sensitive() {
        assert_eq!(classify("ping"), Inbound::Data("ping"));
        assert_eq!(classify("Pong"), Inbound::Data("Pong"));
        assert_eq!(classify("PING "), Inbound::Data("PING "));
    }

    #[test]
    fn test_application_data_passes_through() {
        let payload = "{\"type\":\"chat\",\"body\":\"PING\"}";
        assert_eq!(classify(payload), Inbound::Data(payload));
        assert_eq!(classify(""), Inbound::Data(""));
    }

    #[test]
    fn test_malformed_announce_is_not_data() {
        assert_eq!(
            classify("HEARTBEAT_ANNOUNCE|soon"),
            Inbound::Malformed("HEARTBEAT_ANNOUNCE|soon")
        );
        assert_eq!(
            classify("HEARTBEAT_ANNOUNCE|"),
            Inbound::Malformed("HEARTBEAT_ANNOUNCE|")
        );
        assert_eq!(
            classify("HEARTBEAT_ANNOUNCE|-5"),
            Inbound::Malformed("HEARTBEAT_ANNOUNCE|-5")
        );
    }

    #[test]
    fn test_encode() {
        assert_eq!(ControlMessage::Ping.encode(), "PING");
        assert_eq!(ControlMessage::Pong.encode(), "PONG");
        assert_eq!(
            ControlMessage::HeartbeatAnnounce(30000).encode(),
            "HEARTBEAT_ANNOUNCE|30000"
        );
    }
}
