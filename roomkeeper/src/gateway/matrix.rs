use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    BRIDGE_EVENT_TYPES, Credentials, Gateway, GatewayError, ROOM_MEMBER_EVENT, SPACE_CHILD_EVENT,
    Session, Snapshot, bridge_protocol,
};
use crate::engine::events::{Member, Room, RoomEvent, RoomKind, SpaceChildRelation, StateEvent};

/// Client-server API prefix.
const CLIENT_API: &str = "/_matrix/client/v3";
/// Extra time a long-poll request may take on top of its server-side timeout.
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    login_type: &'a str,
    identifier: LoginIdentifier<'a>,
    password: &'a str,
    device_id: &'a str,
    initial_device_display_name: &'a str,
}

#[derive(Serialize)]
struct LoginIdentifier<'a> {
    #[serde(rename = "type")]
    id_type: &'a str,
    user: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    user_id: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Deserialize, Default)]
struct SyncRooms {
    #[serde(default)]
    join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    leave: BTreeMap<String, Value>,
}

#[derive(Deserialize, Default)]
struct JoinedRoom {
    #[serde(default)]
    state: EventList,
    #[serde(default)]
    timeline: EventList,
}

#[derive(Deserialize, Default)]
struct EventList {
    #[serde(default)]
    events: Vec<StateEvent>,
}

impl JoinedRoom {
    /// State events in the order the server delivered them.
    fn state_events(&self) -> impl Iterator<Item = &StateEvent> {
        self.state
            .events
            .iter()
            .chain(self.timeline.events.iter())
            .filter(|e| e.state_key.is_some())
    }
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    #[serde(default)]
    joined: HashMap<String, JoinedMember>,
}

#[derive(Deserialize)]
struct JoinedMember {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Deserialize, Default)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

/// Room state accumulated from sync, enough to rebuild a [`Room`] snapshot.
#[derive(Debug, Default, Clone)]
struct RoomRecord {
    name: Option<String>,
    canonical_alias: Option<String>,
    create_type: Option<String>,
    my_display_name: Option<String>,
    my_avatar_url: Option<String>,
    /// `type|state_key` of each bridge event to its protocol id.
    bridges: BTreeMap<String, String>,
}

impl RoomRecord {
    fn apply(&mut self, event: &StateEvent, own_user_id: &str) {
        let key = event.state_key.as_deref().unwrap_or_default();
        match event.event_type.as_str() {
            "m.room.create" => self.create_type = string_field(&event.content, "type"),
            "m.room.name" => self.name = string_field(&event.content, "name"),
            "m.room.canonical_alias" => {
                self.canonical_alias = string_field(&event.content, "alias")
            }
            ROOM_MEMBER_EVENT if key == own_user_id => {
                self.my_display_name = string_field(&event.content, "displayname");
                self.my_avatar_url = string_field(&event.content, "avatar_url");
            }
            t if BRIDGE_EVENT_TYPES.contains(&t) => {
                let slot = format!("{t}|{key}");
                match bridge_protocol(&event.content) {
                    Some(protocol) => {
                        self.bridges.insert(slot, protocol);
                    }
                    None => {
                        self.bridges.remove(&slot);
                    }
                }
            }
            _ => {}
        }
    }

    fn to_room(&self, room_id: &str) -> Room {
        let display_name = self
            .name
            .clone()
            .or_else(|| self.canonical_alias.clone())
            .unwrap_or_else(|| room_id.to_string());
        let mut room = Room::new(
            room_id,
            display_name,
            RoomKind::from_create_type(self.create_type.as_deref()),
        );
        room.my_display_name = self.my_display_name.clone();
        room.my_avatar_url = self.my_avatar_url.clone();
        room.bridges = self.bridges.values().cloned().collect();
        room.bridges.sort();
        room.bridges.dedup();
        room
    }
}

fn string_field(content: &Value, field: &str) -> Option<String> {
    content
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Map a non-success response to the error taxonomy.
async fn error_for(resp: reqwest::Response) -> GatewayError {
    let status = resp.status();
    let body: MatrixErrorBody = resp.json().await.unwrap_or_default();
    let message = format!("{} {}: {}", status.as_u16(), body.errcode, body.error);
    match status {
        StatusCode::UNAUTHORIZED => GatewayError::Auth { message },
        StatusCode::FORBIDDEN => GatewayError::Permission { message },
        StatusCode::TOO_MANY_REQUESTS => GatewayError::Network { message },
        s if s.is_server_error() => GatewayError::Network { message },
        _ => GatewayError::Protocol { message },
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, GatewayError> {
    resp.json().await.map_err(|e| GatewayError::Protocol {
        message: format!("failed to decode response: {e}"),
    })
}

/// Gateway speaking the Matrix client-server API over HTTP.
pub struct MatrixGateway {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
    user_id: String,
    /// Sync position; `None` until the first full-state sync.
    since: Option<String>,
    rooms: HashMap<String, RoomRecord>,
}

impl MatrixGateway {
    pub fn new(homeserver: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: homeserver.trim_end_matches('/').to_string(),
            access_token: None,
            user_id: String::new(),
            since: None,
            rooms: HashMap::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, CLIENT_API, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut req = self.http.request(method, self.url(path)).query(query);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        req.send()
            .await
            .map_err(|e| GatewayError::network(format!("request to {path} failed: {e}")))
    }

    async fn sync(&self, timeout: Duration, full_state: bool) -> Result<SyncResponse, GatewayError> {
        let mut query = vec![("timeout", timeout.as_millis().to_string())];
        if full_state {
            query.push(("full_state", "true".to_string()));
        }
        if let Some(since) = &self.since {
            query.push(("since", since.clone()));
        }
        let resp = self
            .send(Method::GET, "/sync", &query, None, Some(timeout + POLL_GRACE))
            .await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        decode(resp).await
    }

    fn state_path(room_id: &str, event_type: &str, state_key: &str) -> String {
        format!(
            "/rooms/{}/state/{}/{}",
            enc(room_id),
            enc(event_type),
            enc(state_key)
        )
    }

    #[cfg(test)]
    pub(crate) fn with_session(homeserver: &str, user_id: &str, access_token: &str) -> Self {
        let mut gw = Self::new(homeserver);
        gw.user_id = user_id.to_string();
        gw.access_token = Some(access_token.to_string());
        gw
    }
}

#[async_trait]
impl Gateway for MatrixGateway {
    async fn login(&mut self, credentials: &Credentials) -> Result<Session, GatewayError> {
        let body = serde_json::to_value(LoginRequest {
            login_type: "m.login.password",
            identifier: LoginIdentifier {
                id_type: "m.id.user",
                user: &credentials.user_id,
            },
            password: &credentials.password,
            device_id: &credentials.device_id,
            initial_device_display_name: "roomkeeper",
        })
        .map_err(|e| GatewayError::Protocol {
            message: format!("failed to encode login request: {e}"),
        })?;

        let resp = self.send(Method::POST, "/login", &[], Some(&body), None).await?;
        let status = resp.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            let err: MatrixErrorBody = resp.json().await.unwrap_or_default();
            return Err(GatewayError::Auth {
                message: format!("{} {}", err.errcode, err.error),
            });
        }
        if !status.is_success() {
            return Err(error_for(resp).await);
        }

        let login: LoginResponse = decode(resp).await?;
        self.access_token = Some(login.access_token);
        self.user_id = login.user_id.clone();
        info!(user_id = %login.user_id, "logged in");

        Ok(Session {
            user_id: login.user_id,
            device_id: login.device_id.unwrap_or_else(|| credentials.device_id.clone()),
        })
    }

    async fn full_state_sync(&mut self) -> Result<Snapshot, GatewayError> {
        self.since = None;
        let sync = self.sync(Duration::ZERO, true).await?;

        self.rooms.clear();
        for (room_id, joined) in &sync.rooms.join {
            let record = self.rooms.entry(room_id.clone()).or_default();
            for event in joined.state_events() {
                record.apply(event, &self.user_id);
            }
        }
        self.since = Some(sync.next_batch);

        let mut rooms: Vec<Room> = self
            .rooms
            .iter()
            .map(|(id, record)| record.to_room(id))
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        info!(count = rooms.len(), "fetched rooms");
        Ok(Snapshot { rooms })
    }

    fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).map(|r| r.to_room(room_id))
    }

    async fn joined_members(&mut self, room_id: &str) -> Result<Vec<Member>, GatewayError> {
        let path = format!("/rooms/{}/joined_members", enc(room_id));
        let resp = self.send(Method::GET, &path, &[], None, None).await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let body: JoinedMembersResponse = decode(resp).await?;
        let mut members: Vec<Member> = body
            .joined
            .into_iter()
            .map(|(user_id, m)| Member {
                user_id,
                display_name: m.display_name,
                avatar_url: m.avatar_url,
            })
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(members)
    }

    async fn room_state(&mut self, room_id: &str) -> Result<Vec<StateEvent>, GatewayError> {
        let path = format!("/rooms/{}/state", enc(room_id));
        let resp = self.send(Method::GET, &path, &[], None, None).await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        decode(resp).await
    }

    async fn read_room_state(
        &mut self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, GatewayError> {
        let path = Self::state_path(room_id, event_type, state_key);
        let resp = self.send(Method::GET, &path, &[], None, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        decode(resp).await.map(Some)
    }

    async fn write_room_state(
        &mut self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<(), GatewayError> {
        let path = Self::state_path(room_id, event_type, state_key);
        let resp = self
            .send(Method::PUT, &path, &[], Some(&content), None)
            .await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        debug!(%room_id, %event_type, %state_key, "state written");

        // Directory reflects our own writes before the sync echo arrives.
        if let Some(record) = self.rooms.get_mut(room_id) {
            let event = StateEvent {
                event_type: event_type.to_string(),
                state_key: Some(state_key.to_string()),
                content,
            };
            record.apply(&event, &self.user_id);
        }
        Ok(())
    }

    async fn poll_events(&mut self, timeout: Duration) -> Result<Vec<RoomEvent>, GatewayError> {
        let sync = self.sync(timeout, false).await?;

        let mut events = Vec::new();
        for room_id in sync.rooms.leave.keys() {
            if self.rooms.remove(room_id).is_some() {
                info!(%room_id, "left room");
                events.push(RoomEvent::Membership {
                    room_id: room_id.clone(),
                    user_id: self.user_id.clone(),
                    membership: "leave".into(),
                });
            }
        }

        for (room_id, joined) in &sync.rooms.join {
            let record = self.rooms.entry(room_id.clone()).or_default();
            for event in joined.state_events() {
                record.apply(event, &self.user_id);

                let key = event.state_key.as_deref().unwrap_or_default();
                match event.event_type.as_str() {
                    ROOM_MEMBER_EVENT => events.push(RoomEvent::Membership {
                        room_id: room_id.clone(),
                        user_id: key.to_string(),
                        membership: string_field(&event.content, "membership").unwrap_or_default(),
                    }),
                    SPACE_CHILD_EVENT => events.push(RoomEvent::SpaceChild(
                        SpaceChildRelation::from_content(room_id, key, Some(&event.content)),
                    )),
                    _ => {}
                }
            }
        }

        self.since = Some(sync.next_batch);
        Ok(events)
    }

    async fn logout(&mut self) -> Result<(), GatewayError> {
        if self.access_token.is_none() {
            return Ok(());
        }
        let resp = self.send(Method::POST, "/logout", &[], None, None).await?;
        let status = resp.status();
        // An already invalidated token counts as logged out.
        if !status.is_success() && status != StatusCode::UNAUTHORIZED {
            return Err(error_for(resp).await);
        }
        self.access_token = None;
        info!(user_id = %self.user_id, "logged out");
        Ok(())
    }

    async fn close(&mut self) {
        if self.access_token.is_some() {
            warn!("closing gateway with an active session");
        }
        self.rooms.clear();
        self.since = None;
        self.access_token = None;
    }
}
