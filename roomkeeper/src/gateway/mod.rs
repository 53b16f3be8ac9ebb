//! Protocol gateway: the only place that talks to the homeserver.
//!
//! The engine sees the server through the [`Gateway`] trait. `matrix` holds
//! the HTTP implementation; tests use the in-memory one in `memory`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::engine::events::{Member, Room, RoomEvent, StateEvent};
use crate::strategy::Profile;

pub mod matrix;
#[cfg(test)]
pub mod memory;

pub use matrix::MatrixGateway;

/// State event type of a space's child entries.
pub const SPACE_CHILD_EVENT: &str = "m.space.child";
/// State event type of room membership, keyed by user id.
pub const ROOM_MEMBER_EVENT: &str = "m.room.member";
/// State event types bridges use to announce themselves in a room.
pub const BRIDGE_EVENT_TYPES: &[&str] = &["m.bridge", "uk.half-shot.bridge"];

/// Failure of a single gateway operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Bad credentials or an invalidated session. Fatal.
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Transport failure or a transient server error.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The server refused a write.
    #[error("Permission denied: {message}")]
    Permission { message: String },

    /// The server answered with something we could not understand.
    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl GatewayError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    /// Whether the whole run has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub device_id: String,
}

/// Result of the initial full-state sync.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub rooms: Vec<Room>,
}

impl Snapshot {
    pub fn spaces(&self) -> impl Iterator<Item = &Room> {
        self.rooms.iter().filter(|r| r.is_space())
    }
}

#[async_trait]
pub trait Gateway: Send {
    async fn login(&mut self, credentials: &Credentials) -> Result<Session, GatewayError>;

    /// Fetch every joined room with full state and remember the sync position.
    async fn full_state_sync(&mut self) -> Result<Snapshot, GatewayError>;

    /// Look up a room in the directory kept up to date by syncing.
    fn room(&self, room_id: &str) -> Option<Room>;

    async fn joined_members(&mut self, room_id: &str) -> Result<Vec<Member>, GatewayError>;

    /// Full current state of a room.
    async fn room_state(&mut self, room_id: &str) -> Result<Vec<StateEvent>, GatewayError>;

    /// Content of one state entry, `None` when the server has no such entry.
    async fn read_room_state(
        &mut self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, GatewayError>;

    async fn write_room_state(
        &mut self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<(), GatewayError>;

    /// One long-poll for new events. Returns an empty batch when the poll
    /// times out; the caller simply polls again.
    async fn poll_events(&mut self, timeout: Duration) -> Result<Vec<RoomEvent>, GatewayError>;

    /// Invalidate the session. Calling it twice is harmless.
    async fn logout(&mut self) -> Result<(), GatewayError>;

    /// Drop local resources. Calling it twice is harmless.
    async fn close(&mut self);
}

/// Content of a live space-child entry.
pub fn space_child_content(via: &[String]) -> Value {
    json!({
        "via": via,
        "auto_join": false,
        "suggested": false,
    })
}

/// Content of a tombstoned space-child entry.
pub fn space_child_tombstone() -> Value {
    Value::Object(Map::new())
}

/// Content of the acting account's own member event with a new profile.
pub fn member_content(profile: &Profile) -> Value {
    let mut content = Map::new();
    content.insert("membership".into(), Value::from("join"));
    if let Some(name) = &profile.name {
        content.insert("displayname".into(), Value::from(name.as_str()));
    }
    if let Some(avatar) = &profile.avatar_url {
        content.insert("avatar_url".into(), Value::from(avatar.as_str()));
    }
    Value::Object(content)
}

/// Protocol id announced by a bridge state event (`content.protocol.id`).
pub fn bridge_protocol(content: &Value) -> Option<String> {
    content
        .get("protocol")
        .and_then(|p| p.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
