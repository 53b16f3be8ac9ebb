use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info};

use super::events::{RoomId, Space, SpaceChildRelation, content_is_present};
use crate::gateway::{Gateway, GatewayError, SPACE_CHILD_EVENT, Snapshot};

/// What an incremental update did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    Added,
    Removed,
    Unchanged,
}

/// Which spaces each room is in, as far as we know.
///
/// Invariant: `room_spaces[room]` holds exactly the spaces whose latest known
/// child entry for `room` is live. Rooms in no space have no key at all, and
/// every space id in a set is also in `spaces`.
#[derive(Debug, Default)]
pub struct SpaceCache {
    room_spaces: HashMap<RoomId, BTreeSet<RoomId>>,
    spaces: BTreeMap<RoomId, Space>,
}

impl SpaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache from a full scan of every space's state.
    pub async fn bootstrap<G: Gateway + ?Sized>(
        gateway: &mut G,
        snapshot: &Snapshot,
    ) -> Result<Self, GatewayError> {
        let mut cache = Self::new();

        for space in snapshot.spaces() {
            info!(space_id = %space.room_id, name = %space.display_name, "found space");
            cache.register_space(Space::from(space));

            let events = gateway.room_state(&space.room_id).await?;
            for event in events {
                if event.event_type != SPACE_CHILD_EVENT {
                    continue;
                }
                let Some(room_id) = event.state_key.as_deref() else {
                    continue;
                };
                if content_is_present(Some(&event.content)) {
                    cache.insert(room_id, &space.room_id);
                }
            }
        }

        info!(
            spaces = cache.spaces.len(),
            rooms = cache.room_spaces.len(),
            "space cache built"
        );
        Ok(cache)
    }

    /// Remember a space. Returns true the first time the id is seen; a known
    /// space only gets its display name refreshed.
    pub fn register_space(&mut self, space: Space) -> bool {
        match self.spaces.get_mut(&space.room_id) {
            Some(known) => {
                known.display_name = space.display_name;
                false
            }
            None => {
                debug!(space_id = %space.room_id, "registered space");
                self.spaces.insert(space.room_id.clone(), space);
                true
            }
        }
    }

    pub fn knows_space(&self, space_id: &str) -> bool {
        self.spaces.contains_key(space_id)
    }

    pub fn space(&self, space_id: &str) -> Option<&Space> {
        self.spaces.get(space_id)
    }

    pub fn known_spaces(&self) -> impl Iterator<Item = &Space> {
        self.spaces.values()
    }

    /// Ids of the spaces `room_id` is in. Unknown rooms are in no space.
    pub fn space_ids_for(&self, room_id: &str) -> BTreeSet<RoomId> {
        self.room_spaces.get(room_id).cloned().unwrap_or_default()
    }

    /// Resolved spaces `room_id` is in, ordered by space id.
    pub fn spaces_for(&self, room_id: &str) -> Vec<Space> {
        self.room_spaces
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.spaces.get(id).cloned())
            .collect()
    }

    pub fn contains(&self, space_id: &str, room_id: &str) -> bool {
        self.room_spaces
            .get(room_id)
            .is_some_and(|spaces| spaces.contains(space_id))
    }

    /// Number of rooms that are in at least one space.
    pub fn room_count(&self) -> usize {
        self.room_spaces.len()
    }

    /// Apply one child-entry change. Idempotent in both directions.
    pub fn apply(&mut self, relation: &SpaceChildRelation) -> CacheChange {
        if !self.knows_space(&relation.space_id) {
            self.register_space(Space::new(
                relation.space_id.clone(),
                relation.space_id.clone(),
            ));
        }

        if relation.present {
            if self.insert(&relation.room_id, &relation.space_id) {
                CacheChange::Added
            } else {
                CacheChange::Unchanged
            }
        } else if self.remove(&relation.room_id, &relation.space_id) {
            CacheChange::Removed
        } else {
            CacheChange::Unchanged
        }
    }

    /// Drop a space and every child entry it held, e.g. after leaving it.
    /// Returns false if the space was not known.
    pub fn forget_space(&mut self, space_id: &str) -> bool {
        if self.spaces.remove(space_id).is_none() {
            return false;
        }
        self.room_spaces.retain(|_, spaces| {
            spaces.remove(space_id);
            !spaces.is_empty()
        });
        true
    }

    fn insert(&mut self, room_id: &str, space_id: &str) -> bool {
        self.room_spaces
            .entry(room_id.to_string())
            .or_default()
            .insert(space_id.to_string())
    }

    fn remove(&mut self, room_id: &str, space_id: &str) -> bool {
        let Some(spaces) = self.room_spaces.get_mut(room_id) else {
            return false;
        };
        let removed = spaces.remove(space_id);
        if spaces.is_empty() {
            self.room_spaces.remove(room_id);
        }
        removed
    }
}
