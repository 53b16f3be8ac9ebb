use tracing::debug;

use super::events::{Member, Room, RoomId};
use crate::strategy::{Profile, Strategy};

/// A display name/avatar change waiting to be written for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRename {
    pub room_id: RoomId,
    /// Only used for display.
    pub room_name: String,
    pub old: Profile,
    pub new: Profile,
}

/// Which fields of the current profile the strategy lets us overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenamePermission {
    pub name: bool,
    pub avatar: bool,
}

impl RenamePermission {
    pub fn of<S: Strategy + ?Sized>(strategy: &S, current: &Profile) -> Self {
        Self {
            name: strategy.nick_change_allowed(current),
            avatar: strategy.avatar_change_allowed(current),
        }
    }

    /// Nothing may change, so the room can be skipped before fetching members.
    pub fn is_none(&self) -> bool {
        !self.name && !self.avatar
    }
}

/// Compute the rename for one room, if any.
///
/// Fields the strategy does not manage keep their current value no matter
/// what the strategy proposes. Returns `None` when nothing would change.
pub fn plan_rename<S: Strategy + ?Sized>(
    strategy: &S,
    room: &Room,
    members: &[Member],
) -> Option<PlannedRename> {
    let current = Profile::of_room(room);
    let permission = RenamePermission::of(strategy, &current);
    if permission.is_none() {
        return None;
    }

    let proposed = strategy.propose_name_and_avatar(&current, room, members);
    let target = Profile {
        name: if permission.name {
            proposed.name
        } else {
            current.name.clone()
        },
        avatar_url: if permission.avatar {
            proposed.avatar_url
        } else {
            current.avatar_url.clone()
        },
    };

    if target == current {
        debug!(room_id = %room.room_id, name = ?current.name, "keep");
        return None;
    }

    Some(PlannedRename {
        room_id: room.room_id.clone(),
        room_name: room.display_name.clone(),
        old: current,
        new: target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::RoomKind;
    use std::collections::HashSet;

    /// Always proposes the same profile; manages a fixed set of names/avatars.
    struct Fixed {
        managed_names: HashSet<&'static str>,
        managed_avatars: HashSet<&'static str>,
        proposal: Profile,
    }

    impl Strategy for Fixed {
        fn nick_change_allowed(&self, current: &Profile) -> bool {
            current.name.as_deref().is_some_and(|n| self.managed_names.contains(n))
        }

        fn avatar_change_allowed(&self, current: &Profile) -> bool {
            current
                .avatar_url
                .as_deref()
                .is_some_and(|a| self.managed_avatars.contains(a))
        }

        fn propose_name_and_avatar(&self, _: &Profile, _: &Room, _: &[Member]) -> Profile {
            self.proposal.clone()
        }

        fn via_servers_for(&self, _: &Room) -> Vec<String> {
            Vec::new()
        }
    }

    fn strategy() -> Fixed {
        Fixed {
            managed_names: ["Old Name", "Alice Friend"].into_iter().collect(),
            managed_avatars: ["mxc://x/old", "mxc://x/X"].into_iter().collect(),
            proposal: Profile::new(Some("Alice Friend"), Some("mxc://x/X")),
        }
    }

    fn room_with(name: Option<&str>, avatar: Option<&str>) -> Room {
        let mut room = Room::new("!r:example.com", "Chat", RoomKind::Ordinary);
        room.my_display_name = name.map(String::from);
        room.my_avatar_url = avatar.map(String::from);
        room
    }

    #[test]
    fn test_plans_change_for_managed_fields() {
        let room = room_with(Some("Old Name"), Some("mxc://x/old"));
        let plan = plan_rename(&strategy(), &room, &[]).unwrap();
        assert_eq!(plan.room_id, "!r:example.com");
        assert_eq!(plan.old, Profile::new(Some("Old Name"), Some("mxc://x/old")));
        assert_eq!(plan.new, Profile::new(Some("Alice Friend"), Some("mxc://x/X")));
    }

    #[test]
    fn test_second_pass_is_empty() {
        let room = room_with(Some("Old Name"), Some("mxc://x/old"));
        let plan = plan_rename(&strategy(), &room, &[]).unwrap();

        let applied = room_with(plan.new.name.as_deref(), plan.new.avatar_url.as_deref());
        assert!(plan_rename(&strategy(), &applied, &[]).is_none());
    }

    #[test]
    fn test_unmanaged_name_is_never_changed() {
        let room = room_with(Some("Hand Picked"), Some("mxc://x/old"));
        let plan = plan_rename(&strategy(), &room, &[]).unwrap();
        assert_eq!(plan.new.name.as_deref(), Some("Hand Picked"));
        assert_eq!(plan.new.avatar_url.as_deref(), Some("mxc://x/X"));
    }

    #[test]
    fn test_nothing_managed_is_skipped() {
        let room = room_with(Some("Hand Picked"), Some("mxc://x/custom"));
        assert!(plan_rename(&strategy(), &room, &[]).is_none());
        assert!(RenamePermission::of(&strategy(), &Profile::of_room(&room)).is_none());
    }

    #[test]
    fn test_no_change_yields_no_plan() {
        let room = room_with(Some("Alice Friend"), Some("mxc://x/X"));
        assert!(plan_rename(&strategy(), &room, &[]).is_none());
    }
}
