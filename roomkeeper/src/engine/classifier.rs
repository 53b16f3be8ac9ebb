use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;

use super::events::{Member, Room};
use super::validation::single_server_part;

/// Category a room falls into, based on who else is in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomCategory {
    /// Nobody left after dropping ignored accounts.
    Empty,
    /// Every remaining member is on a personal server or a personal contact.
    Personal,
    /// At least one member (or the room itself) is relayed by a bridge.
    Bridged(String),
    Default,
}

impl RoomCategory {
    /// Parse the textual form used in configuration keys.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(Self::Empty),
            "personal" => Some(Self::Personal),
            "default" => Some(Self::Default),
            other => other
                .strip_prefix("bridged:")
                .filter(|p| !p.is_empty())
                .map(|p| Self::Bridged(p.to_string())),
        }
    }
}

impl fmt::Display for RoomCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Personal => write!(f, "personal"),
            Self::Bridged(protocol) => write!(f, "bridged:{protocol}"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// A display-name marker left by a bridge, e.g. `" (Telegram)"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeMarker {
    pub marker: String,
    pub protocol: String,
}

/// Inputs to classification that stay fixed for the whole run.
#[derive(Debug, Clone, Default)]
pub struct ClassifierRules {
    pub ignore: HashSet<String>,
    pub personal_servers: Vec<String>,
    pub personal_contacts: HashSet<String>,
    pub bridge_markers: Vec<BridgeMarker>,
}

impl ClassifierRules {
    pub fn is_ignored(&self, user_id: &str) -> bool {
        self.ignore.contains(user_id)
    }

    pub fn is_personal(&self, user_id: &str) -> bool {
        let on_personal_server = single_server_part(user_id)
            .is_some_and(|server| self.personal_servers.iter().any(|s| s == server));
        on_personal_server || self.personal_contacts.contains(user_id)
    }

    /// Protocol of the first bridge marker found in the member's display name.
    pub fn bridge_protocol(&self, member: &Member) -> Option<&str> {
        let name = member.display_name.as_deref()?;
        self.bridge_markers
            .iter()
            .find(|m| name.contains(&m.marker))
            .map(|m| m.protocol.as_str())
    }
}

/// Classify a room from its joined members.
///
/// Order matters: the empty check runs first, a bridge anywhere wins over
/// personal, and personal needs every remaining member to qualify.
pub fn classify(room: &Room, members: &[Member], rules: &ClassifierRules) -> RoomCategory {
    let relevant: Vec<&Member> = members
        .iter()
        .filter(|m| !rules.is_ignored(&m.user_id))
        .collect();

    if relevant.is_empty() {
        return RoomCategory::Empty;
    }

    if let Some(protocol) = relevant.iter().find_map(|m| rules.bridge_protocol(m)) {
        return RoomCategory::Bridged(protocol.to_string());
    }
    if let Some(protocol) = room.bridges.first() {
        return RoomCategory::Bridged(protocol.clone());
    }

    if relevant.iter().all(|m| rules.is_personal(&m.user_id)) {
        RoomCategory::Personal
    } else {
        RoomCategory::Default
    }
}
