//! Caller-supplied decisions: which names/avatars may be touched, what they
//! should become, and which spaces a room belongs in.

use std::collections::{HashMap, HashSet};

use crate::config::{ProfileEntry, RoomkeeperConfig};
use crate::engine::classifier::{ClassifierRules, RoomCategory, classify};
use crate::engine::events::{Member, Room, Space, SpaceRef};
use crate::engine::validation::single_server_part;

/// A per-room display name and avatar pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn new(name: Option<&str>, avatar_url: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            avatar_url: avatar_url.map(str::to_string),
        }
    }

    /// The acting account's current profile in `room`.
    pub fn of_room(room: &Room) -> Self {
        Self::new(room.my_display_name.as_deref(), room.my_avatar_url.as_deref())
    }
}

/// Capability set the engine consults. All methods are pure.
pub trait Strategy {
    fn nick_change_allowed(&self, _current: &Profile) -> bool {
        true
    }

    fn avatar_change_allowed(&self, _current: &Profile) -> bool {
        true
    }

    fn propose_name_and_avatar(&self, current: &Profile, _room: &Room, _members: &[Member]) -> Profile {
        current.clone()
    }

    /// Desired spaces for `room`. The default keeps whatever is there.
    fn propose_spaces(
        &self,
        _current: &Profile,
        _room: &Room,
        _members: &[Member],
        current_spaces: &[Space],
    ) -> Vec<SpaceRef> {
        current_spaces.iter().cloned().map(SpaceRef::Resolved).collect()
    }

    /// Server hints written into new space-child entries.
    fn via_servers_for(&self, room: &Room) -> Vec<String>;
}

/// Keep-unknown rule: only values listed here are considered set by us and
/// therefore safe to overwrite.
#[derive(Debug, Clone, Default)]
pub struct ManagedProfiles {
    pub names: HashSet<String>,
    pub avatars: HashSet<String>,
}

impl ManagedProfiles {
    pub fn manages_name(&self, name: Option<&str>) -> bool {
        name.is_some_and(|n| self.names.contains(n))
    }

    pub fn manages_avatar(&self, avatar_url: Option<&str>) -> bool {
        avatar_url.is_some_and(|a| self.avatars.contains(a))
    }
}

/// Strategy driven entirely by the configuration file.
#[derive(Debug, Clone)]
pub struct ProfileStrategy {
    rules: ClassifierRules,
    default_profile: ProfileEntry,
    personal_profile: Option<ProfileEntry>,
    bridged_profiles: HashMap<String, ProfileEntry>,
    managed: ManagedProfiles,
    space_rules: HashMap<RoomCategory, Vec<String>>,
    /// Every space id mentioned in the rules. Others are never removed.
    managed_spaces: HashSet<String>,
    via: Vec<String>,
}

impl ProfileStrategy {
    pub fn from_config(config: &RoomkeeperConfig) -> Result<Self, String> {
        let profiles = &config.profiles;

        let mut managed = ManagedProfiles::default();
        let all_entries = std::iter::once(&profiles.default)
            .chain(profiles.personal.iter())
            .chain(profiles.bridged.values());
        for entry in all_entries {
            managed.names.extend(entry.name.iter().cloned());
            managed.avatars.extend(entry.avatar_url.iter().cloned());
        }
        managed.names.extend(profiles.managed_names.iter().cloned());
        managed.avatars.extend(profiles.managed_avatars.iter().cloned());

        let mut space_rules = HashMap::new();
        let mut managed_spaces = HashSet::new();
        for (key, spaces) in &config.spaces.categories {
            let category = RoomCategory::parse(key)
                .ok_or_else(|| format!("Unknown room category in [spaces.categories]: {key}"))?;
            managed_spaces.extend(spaces.iter().cloned());
            space_rules.insert(category, spaces.clone());
        }
        managed_spaces.extend(config.spaces.managed.iter().cloned());

        let via = if config.spaces.via.is_empty() {
            single_server_part(&config.account.user_id)
                .map(|s| vec![s.to_string()])
                .unwrap_or_default()
        } else {
            config.spaces.via.clone()
        };

        Ok(Self {
            rules: config.classifier_rules(),
            default_profile: profiles.default.clone(),
            personal_profile: profiles.personal.clone(),
            bridged_profiles: profiles.bridged.clone(),
            managed,
            space_rules,
            managed_spaces,
            via,
        })
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    fn profile_for(&self, category: &RoomCategory) -> &ProfileEntry {
        match category {
            RoomCategory::Empty | RoomCategory::Default => &self.default_profile,
            RoomCategory::Personal => self.personal_profile.as_ref().unwrap_or(&self.default_profile),
            RoomCategory::Bridged(protocol) => self
                .bridged_profiles
                .get(protocol)
                .unwrap_or(&self.default_profile),
        }
    }
}

impl Strategy for ProfileStrategy {
    fn nick_change_allowed(&self, current: &Profile) -> bool {
        self.managed.manages_name(current.name.as_deref())
    }

    fn avatar_change_allowed(&self, current: &Profile) -> bool {
        self.managed.manages_avatar(current.avatar_url.as_deref())
    }

    fn propose_name_and_avatar(&self, current: &Profile, room: &Room, members: &[Member]) -> Profile {
        let category = classify(room, members, &self.rules);
        let entry = self.profile_for(&category);
        Profile {
            name: entry.name.clone().or_else(|| current.name.clone()),
            avatar_url: entry.avatar_url.clone().or_else(|| current.avatar_url.clone()),
        }
    }

    fn propose_spaces(
        &self,
        _current: &Profile,
        room: &Room,
        members: &[Member],
        current_spaces: &[Space],
    ) -> Vec<SpaceRef> {
        let category = classify(room, members, &self.rules);
        let mut desired: Vec<SpaceRef> = current_spaces
            .iter()
            .filter(|s| !self.managed_spaces.contains(&s.room_id))
            .cloned()
            .map(SpaceRef::Resolved)
            .collect();
        if let Some(wanted) = self.space_rules.get(&category) {
            desired.extend(wanted.iter().map(|id| SpaceRef::Id(id.clone())));
        }
        desired
    }

    fn via_servers_for(&self, _room: &Room) -> Vec<String> {
        self.via.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::RoomKind;

    const CONFIG: &str = r#"
        [account]
        homeserver = "https://example.com"
        user_id = "@sepp:example.com"

        [classifier]
        ignore = ["@mybot:example.com"]
        personal_servers = ["example.com"]
        personal_contacts = ["@horst:matrix.org"]
        bridges = [{ marker = " (Telegram)", protocol = "telegram" }]

        [profiles]
        managed_names = ["Old Name"]
        default = { name = "Mr. S", avatar_url = "mxc://example.com/default" }
        personal = { name = "Sepp Hans", avatar_url = "mxc://example.com/personal" }
        bridged.telegram = { name = "Sepponator", avatar_url = "mxc://example.com/tg" }

        [spaces.categories]
        personal = ["!friends:example.com"]
        "bridged:telegram" = ["!telegram:example.com"]
    "#;

    fn strategy() -> ProfileStrategy {
        let config: RoomkeeperConfig = toml::from_str(CONFIG).unwrap();
        ProfileStrategy::from_config(&config).unwrap()
    }

    fn room() -> Room {
        Room::new("!r:example.com", "Chat", RoomKind::Ordinary)
    }

    #[test]
    fn test_managed_names_include_profiles_and_extras() {
        let s = strategy();
        assert!(s.nick_change_allowed(&Profile::new(Some("Mr. S"), None)));
        assert!(s.nick_change_allowed(&Profile::new(Some("Old Name"), None)));
        assert!(!s.nick_change_allowed(&Profile::new(Some("Hand Picked"), None)));
        assert!(!s.nick_change_allowed(&Profile::default()));
        assert!(s.avatar_change_allowed(&Profile::new(None, Some("mxc://example.com/tg"))));
    }

    #[test]
    fn test_own_account_is_ignored() {
        let s = strategy();
        assert!(s.rules().is_ignored("@sepp:example.com"));
        assert!(s.rules().is_ignored("@mybot:example.com"));
    }

    #[test]
    fn test_profile_by_category() {
        let s = strategy();
        let current = Profile::new(Some("Mr. S"), Some("mxc://example.com/default"));

        let personal = [Member::new("@alice:example.com", Some("Alice"))];
        assert_eq!(
            s.propose_name_and_avatar(&current, &room(), &personal),
            Profile::new(Some("Sepp Hans"), Some("mxc://example.com/personal"))
        );

        let bridged = [Member::new("@tg:example.com", Some("Bob (Telegram)"))];
        assert_eq!(
            s.propose_name_and_avatar(&current, &room(), &bridged).name.as_deref(),
            Some("Sepponator")
        );

        assert_eq!(
            s.propose_name_and_avatar(&current, &room(), &[]).name.as_deref(),
            Some("Mr. S")
        );
    }

    #[test]
    fn test_unknown_bridge_protocol_uses_default_profile() {
        let s = strategy();
        let mut r = room();
        r.bridges.push("signal".into());
        let members = [Member::new("@alice:example.com", None)];
        let proposed = s.propose_name_and_avatar(&Profile::default(), &r, &members);
        assert_eq!(proposed.name.as_deref(), Some("Mr. S"));
    }

    #[test]
    fn test_spaces_keep_unmanaged_and_replace_managed() {
        let s = strategy();
        let current_spaces = vec![
            Space::new("!hobby:example.com", "Hobby"),
            Space::new("!telegram:example.com", "Telegram"),
        ];
        let members = [Member::new("@alice:example.com", None)];
        let desired = s.propose_spaces(&Profile::default(), &room(), &members, &current_spaces);
        let ids: Vec<&str> = desired.iter().map(SpaceRef::id).collect();
        assert_eq!(ids, vec!["!hobby:example.com", "!friends:example.com"]);
    }

    #[test]
    fn test_via_defaults_to_own_server() {
        assert_eq!(strategy().via_servers_for(&room()), vec!["example.com".to_string()]);
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        let mut config: RoomkeeperConfig = toml::from_str(CONFIG).unwrap();
        config
            .spaces
            .categories
            .insert("weird".into(), vec!["!x:example.com".into()]);
        assert!(ProfileStrategy::from_config(&config).is_err());
    }
}
