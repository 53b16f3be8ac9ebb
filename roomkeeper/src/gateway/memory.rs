//! In-memory gateway for tests and end-to-end simulations.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    Credentials, Gateway, GatewayError, ROOM_MEMBER_EVENT, SPACE_CHILD_EVENT, Session, Snapshot,
    space_child_content,
};
use crate::engine::events::{Member, Room, RoomEvent, SpaceChildRelation, StateEvent};

/// One recorded state write.
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub room_id: String,
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

/// A fake homeserver holding rooms, members and state entries in memory.
pub struct MemoryGateway {
    own_user_id: String,
    password: String,
    rooms: BTreeMap<String, Room>,
    members: HashMap<String, Vec<Member>>,
    state: BTreeMap<(String, String, String), Value>,
    batches: VecDeque<Vec<RoomEvent>>,
    forbidden: HashSet<String>,
    offline: bool,
    /// Queue the event a real server would send back for each write.
    pub echo_writes: bool,
    /// Cancelled once every queued batch has been delivered.
    drained: Option<CancellationToken>,
    /// Every successful write, in order.
    pub writes: Vec<StateWrite>,
    pub logged_in: bool,
    pub logout_calls: usize,
    pub closed: bool,
}

impl MemoryGateway {
    pub fn new(own_user_id: &str) -> Self {
        Self {
            own_user_id: own_user_id.to_string(),
            password: "secret".into(),
            rooms: BTreeMap::new(),
            members: HashMap::new(),
            state: BTreeMap::new(),
            batches: VecDeque::new(),
            forbidden: HashSet::new(),
            offline: false,
            echo_writes: false,
            drained: None,
            writes: Vec::new(),
            logged_in: false,
            logout_calls: 0,
            closed: false,
        }
    }

    pub fn add_room(&mut self, room: Room) {
        self.rooms.insert(room.room_id.clone(), room);
    }

    /// Forget a room, as if the account had left it.
    pub fn remove_room(&mut self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    pub fn set_members(&mut self, room_id: &str, members: Vec<Member>) {
        self.members.insert(room_id.to_string(), members);
    }

    pub fn set_state(&mut self, room_id: &str, event_type: &str, state_key: &str, content: Value) {
        self.state.insert(
            (room_id.to_string(), event_type.to_string(), state_key.to_string()),
            content,
        );
    }

    /// Put `room_id` into `space_id` with a live child entry.
    pub fn add_space_child(&mut self, space_id: &str, room_id: &str) {
        let via = vec!["example.com".to_string()];
        self.set_state(space_id, SPACE_CHILD_EVENT, room_id, space_child_content(&via));
    }

    pub fn push_batch(&mut self, events: Vec<RoomEvent>) {
        self.batches.push_back(events);
    }

    /// Refuse every write to `room_id` with a permission error.
    pub fn forbid_writes(&mut self, room_id: &str) {
        self.forbidden.insert(room_id.to_string());
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn cancel_when_drained(&mut self, token: CancellationToken) {
        self.drained = Some(token);
    }

    /// Rename the acting account in a room, as if done by hand in a client.
    pub fn set_own_profile(&mut self, room_id: &str, name: Option<&str>, avatar: Option<&str>) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.my_display_name = name.map(String::from);
            room.my_avatar_url = avatar.map(String::from);
        }
    }

    pub fn state_content(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<&Value> {
        self.state
            .get(&(room_id.to_string(), event_type.to_string(), state_key.to_string()))
    }

    fn check_online(&self) -> Result<(), GatewayError> {
        if self.offline {
            return Err(GatewayError::network("homeserver unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn login(&mut self, credentials: &Credentials) -> Result<Session, GatewayError> {
        self.check_online()?;
        if credentials.user_id != self.own_user_id || credentials.password != self.password {
            return Err(GatewayError::Auth {
                message: "M_FORBIDDEN Invalid username or password".into(),
            });
        }
        self.logged_in = true;
        Ok(Session {
            user_id: self.own_user_id.clone(),
            device_id: credentials.device_id.clone(),
        })
    }

    async fn full_state_sync(&mut self) -> Result<Snapshot, GatewayError> {
        self.check_online()?;
        Ok(Snapshot {
            rooms: self.rooms.values().cloned().collect(),
        })
    }

    fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).cloned()
    }

    async fn joined_members(&mut self, room_id: &str) -> Result<Vec<Member>, GatewayError> {
        self.check_online()?;
        Ok(self.members.get(room_id).cloned().unwrap_or_default())
    }

    async fn room_state(&mut self, room_id: &str) -> Result<Vec<StateEvent>, GatewayError> {
        self.check_online()?;
        Ok(self
            .state
            .iter()
            .filter(|((room, _, _), _)| room == room_id)
            .map(|((_, event_type, state_key), content)| StateEvent {
                event_type: event_type.clone(),
                state_key: Some(state_key.clone()),
                content: content.clone(),
            })
            .collect())
    }

    async fn read_room_state(
        &mut self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, GatewayError> {
        self.check_online()?;
        Ok(self.state_content(room_id, event_type, state_key).cloned())
    }

    async fn write_room_state(
        &mut self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<(), GatewayError> {
        self.check_online()?;
        if self.forbidden.contains(room_id) {
            return Err(GatewayError::permission(format!(
                "403 M_FORBIDDEN: cannot send {event_type} in {room_id}"
            )));
        }

        // Same write-through as the HTTP gateway's room directory.
        if event_type == ROOM_MEMBER_EVENT && state_key == self.own_user_id {
            let name = content.get("displayname").and_then(Value::as_str);
            let avatar = content.get("avatar_url").and_then(Value::as_str);
            self.set_own_profile(room_id, name, avatar);
        }

        let echo = match event_type {
            SPACE_CHILD_EVENT => Some(RoomEvent::SpaceChild(SpaceChildRelation::from_content(
                room_id,
                state_key,
                Some(&content),
            ))),
            ROOM_MEMBER_EVENT => Some(RoomEvent::Membership {
                room_id: room_id.to_string(),
                user_id: state_key.to_string(),
                membership: "join".into(),
            }),
            _ => None,
        };
        if self.echo_writes
            && let Some(event) = echo
        {
            self.batches.push_back(vec![event]);
        }

        self.set_state(room_id, event_type, state_key, content.clone());
        self.writes.push(StateWrite {
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            content,
        });
        Ok(())
    }

    async fn poll_events(&mut self, _timeout: Duration) -> Result<Vec<RoomEvent>, GatewayError> {
        self.check_online()?;
        match self.batches.pop_front() {
            Some(batch) => Ok(batch),
            None => {
                if let Some(token) = &self.drained {
                    token.cancel();
                }
                tokio::task::yield_now().await;
                Ok(Vec::new())
            }
        }
    }

    async fn logout(&mut self) -> Result<(), GatewayError> {
        self.logout_calls += 1;
        self.logged_in = false;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
