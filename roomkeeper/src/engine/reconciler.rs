use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{error, info, warn};

use super::events::{Member, Room, RoomId, Space, SpaceChildRelation, SpaceRef};
use super::space_cache::SpaceCache;
use crate::gateway::{
    Gateway, GatewayError, SPACE_CHILD_EVENT, space_child_content, space_child_tombstone,
};
use crate::strategy::{Profile, Strategy};

/// Put a room into a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSpaceAdd {
    pub space: Space,
    pub room_id: RoomId,
    pub room_name: String,
    /// Server hints for the new child entry.
    pub via: Vec<String>,
}

/// Take a room out of a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSpaceRemove {
    pub space: Space,
    pub room_id: RoomId,
    pub room_name: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Unknown space {space_id} requested for room {room_id}")]
    UnknownSpace { space_id: RoomId, room_id: RoomId },
}

/// Minimal set of changes that turns the current spaces into the desired ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceDelta {
    pub additions: Vec<PlannedSpaceAdd>,
    pub removals: Vec<PlannedSpaceRemove>,
    /// Desired spaces that could not be resolved. Never applied.
    pub skipped: Vec<LookupError>,
}

impl SpaceDelta {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    pub fn extend(&mut self, other: SpaceDelta) {
        self.additions.extend(other.additions);
        self.removals.extend(other.removals);
        self.skipped.extend(other.skipped);
    }
}

/// Diff the desired spaces of `room` against the cached ones.
///
/// `additions = desired - current`, `removals = current - desired`, compared
/// by space id. Space rooms are never filed into other spaces.
pub fn reconcile(room: &Room, cache: &SpaceCache, desired: &[SpaceRef], via: &[String]) -> SpaceDelta {
    let mut delta = SpaceDelta::default();
    if room.is_space() {
        return delta;
    }

    let current = cache.space_ids_for(&room.room_id);
    let mut wanted: BTreeSet<&str> = BTreeSet::new();

    for entry in desired {
        let space_id = entry.id();
        if !wanted.insert(space_id) || current.contains(space_id) {
            continue;
        }
        let space = match entry {
            SpaceRef::Resolved(space) => space.clone(),
            SpaceRef::Id(id) => match cache.space(id) {
                Some(space) => space.clone(),
                None => {
                    let err = LookupError::UnknownSpace {
                        space_id: id.clone(),
                        room_id: room.room_id.clone(),
                    };
                    warn!(room_id = %room.room_id, space_id = %id, "skipping addition: {err}");
                    delta.skipped.push(err);
                    continue;
                }
            },
        };
        delta.additions.push(PlannedSpaceAdd {
            space,
            room_id: room.room_id.clone(),
            room_name: room.display_name.clone(),
            via: via.to_vec(),
        });
    }

    for space_id in current.iter().filter(|id| !wanted.contains(id.as_str())) {
        let space = cache
            .space(space_id)
            .cloned()
            .unwrap_or_else(|| Space::new(space_id.clone(), space_id.clone()));
        delta.removals.push(PlannedSpaceRemove {
            space,
            room_id: room.room_id.clone(),
            room_name: room.display_name.clone(),
        });
    }

    delta
}

/// Ask the strategy where `room` belongs and diff against the cache.
pub fn plan_spaces<S: Strategy + ?Sized>(
    strategy: &S,
    room: &Room,
    members: &[Member],
    cache: &SpaceCache,
) -> SpaceDelta {
    if room.is_space() {
        return SpaceDelta::default();
    }
    let current_spaces = cache.spaces_for(&room.room_id);
    if current_spaces.is_empty() {
        info!(room_id = %room.room_id, room = %room.display_name, "room is in no spaces");
    } else {
        let names: Vec<&str> = current_spaces.iter().map(|s| s.display_name.as_str()).collect();
        info!(room_id = %room.room_id, room = %room.display_name, spaces = ?names, "room is in spaces");
    }

    let profile = Profile::of_room(room);
    let desired = strategy.propose_spaces(&profile, room, members, &current_spaces);
    let via = strategy.via_servers_for(room);
    reconcile(room, cache, &desired, &via)
}

/// A planned change that the server did not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSpaceChange {
    pub space_id: RoomId,
    pub room_id: RoomId,
    pub error: GatewayError,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: Vec<FailedSpaceChange>,
}

impl ApplyReport {
    /// The first failure that must stop the run, if any.
    pub fn fatal(&self) -> Option<&GatewayError> {
        self.failed.iter().map(|f| &f.error).find(|e| e.is_fatal())
    }
}

/// Write every planned change. A failed write is reported and leaves the
/// cache alone; a successful one is fed back through the cache's normal
/// update path so the server's echo becomes a no-op.
pub async fn apply_delta<G: Gateway + ?Sized>(
    gateway: &mut G,
    cache: &mut SpaceCache,
    delta: &SpaceDelta,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for add in &delta.additions {
        let content = space_child_content(&add.via);
        let result = gateway
            .write_room_state(&add.space.room_id, SPACE_CHILD_EVENT, &add.room_id, content)
            .await;
        record(&mut report, cache, &add.space.room_id, &add.room_id, true, result);
    }

    for removal in &delta.removals {
        let result = gateway
            .write_room_state(
                &removal.space.room_id,
                SPACE_CHILD_EVENT,
                &removal.room_id,
                space_child_tombstone(),
            )
            .await;
        record(&mut report, cache, &removal.space.room_id, &removal.room_id, false, result);
    }

    report
}

fn record(
    report: &mut ApplyReport,
    cache: &mut SpaceCache,
    space_id: &str,
    room_id: &str,
    present: bool,
    result: Result<(), GatewayError>,
) {
    let action = if present { "add to" } else { "remove from" };
    match result {
        Ok(()) => {
            cache.apply(&SpaceChildRelation {
                space_id: space_id.to_string(),
                room_id: room_id.to_string(),
                present,
            });
            info!(%room_id, %space_id, "{action} space done");
            report.applied += 1;
        }
        Err(e) => {
            error!(%room_id, %space_id, error = %e, "{action} space failed");
            report.failed.push(FailedSpaceChange {
                space_id: space_id.to_string(),
                room_id: room_id.to_string(),
                error: e,
            });
        }
    }
}
