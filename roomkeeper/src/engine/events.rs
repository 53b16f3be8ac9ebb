use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque, server-unique room identifier (`!abc:example.com`).
pub type RoomId = String;

/// Fully qualified account identifier (`@alice:example.com`).
pub type UserId = String;

/// Room creation types that mark a room as a space.
pub const SPACE_ROOM_TYPES: &[&str] = &["m.space", "org.matrix.msc1772.space"];

/// What kind of room this is, taken from the room's creation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Ordinary,
    Space,
    /// A creation type we do not recognise. Treated like an ordinary room.
    Unknown(String),
}

impl RoomKind {
    /// Classify the optional `type` field of a room creation event.
    pub fn from_create_type(room_type: Option<&str>) -> Self {
        match room_type {
            None => Self::Ordinary,
            Some(t) if SPACE_ROOM_TYPES.contains(&t) => Self::Space,
            Some(t) => Self::Unknown(t.to_string()),
        }
    }

    pub fn is_space(&self) -> bool {
        matches!(self, Self::Space)
    }
}

/// Snapshot of a joined room as seen by the gateway's room directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub room_id: RoomId,
    pub display_name: String,
    pub kind: RoomKind,
    /// The acting account's current per-room display name.
    pub my_display_name: Option<String>,
    /// The acting account's current per-room avatar.
    pub my_avatar_url: Option<String>,
    /// Protocol ids of bridges announced in room state.
    pub bridges: Vec<String>,
}

impl Room {
    pub fn new(room_id: impl Into<RoomId>, display_name: impl Into<String>, kind: RoomKind) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            kind,
            my_display_name: None,
            my_avatar_url: None,
            bridges: Vec::new(),
        }
    }

    pub fn is_space(&self) -> bool {
        self.kind.is_space()
    }
}

/// A joined member of a room. Only lives for one classification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Member {
    pub fn new(user_id: impl Into<UserId>, display_name: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.map(str::to_string),
            avatar_url: None,
        }
    }
}

/// A resolved space: a room of kind `Space`, reduced to what the engine needs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Space {
    pub room_id: RoomId,
    pub display_name: String,
}

impl Space {
    pub fn new(room_id: impl Into<RoomId>, display_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
        }
    }
}

impl From<&Room> for Space {
    fn from(room: &Room) -> Self {
        Self::new(room.room_id.clone(), room.display_name.clone())
    }
}

/// A space reference as returned by a strategy: either a bare id or an
/// already resolved space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceRef {
    Id(RoomId),
    Resolved(Space),
}

impl SpaceRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Resolved(space) => &space.room_id,
        }
    }
}

impl From<&str> for SpaceRef {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<Space> for SpaceRef {
    fn from(space: Space) -> Self {
        Self::Resolved(space)
    }
}

/// One `m.space.child` state entry. `present == false` is a tombstone and
/// means exactly the same as no entry at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceChildRelation {
    pub space_id: RoomId,
    pub room_id: RoomId,
    pub present: bool,
}

impl SpaceChildRelation {
    /// Build a relation from raw event content. Present iff the content is a
    /// non-empty object.
    pub fn from_content(space_id: &str, room_id: &str, content: Option<&Value>) -> Self {
        Self {
            space_id: space_id.to_string(),
            room_id: room_id.to_string(),
            present: content_is_present(content),
        }
    }
}

/// Whether state content counts as a live entry rather than a tombstone.
pub fn content_is_present(content: Option<&Value>) -> bool {
    match content {
        Some(Value::Object(map)) => !map.is_empty(),
        _ => false,
    }
}

/// A raw state event as returned by a full room state read.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
}

/// Inbound events the dispatcher listens for, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Someone's membership in a room changed (join, leave, profile edit).
    Membership {
        room_id: RoomId,
        user_id: UserId,
        membership: String,
    },
    /// A space added, tombstoned or rewrote a child entry.
    SpaceChild(SpaceChildRelation),
}

impl RoomEvent {
    /// The room whose handling this event triggers.
    pub fn affected_room(&self) -> &str {
        match self {
            Self::Membership { room_id, .. } => room_id,
            Self::SpaceChild(rel) => &rel.room_id,
        }
    }
}
