use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::engine::classifier::{BridgeMarker, ClassifierRules};
use crate::engine::validation;

/// Top-level configuration, loaded from roomkeeper.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RoomkeeperConfig {
    pub account: AccountSection,
    pub run: RunSection,
    pub classifier: ClassifierSection,
    pub profiles: ProfilesSection,
    pub spaces: SpacesSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AccountSection {
    pub homeserver: String,
    pub user_id: String,
    /// Device id used for the login session.
    pub device_id: String,
}

impl Default for AccountSection {
    fn default() -> Self {
        Self {
            homeserver: String::new(),
            user_id: String::new(),
            device_id: "ROOMKEEPER".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Manage per-room display names and avatars.
    pub rename: bool,
    /// Manage space membership of rooms.
    pub spaces: bool,
    /// Plan and apply changes for every room once at startup.
    pub initial_pass: bool,
    /// Keep running and react to live events after startup.
    pub listen: bool,
    /// Long-poll bound for one sync request.
    pub poll_timeout_ms: u64,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            rename: true,
            spaces: true,
            initial_pass: true,
            listen: true,
            poll_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClassifierSection {
    /// Accounts that never count as room members (bots, other own accounts).
    pub ignore: Vec<String>,
    pub personal_servers: Vec<String>,
    pub personal_contacts: Vec<String>,
    pub bridges: Vec<BridgeMarker>,
}

/// A target name/avatar. Missing fields leave the current value alone.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileEntry {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ProfilesSection {
    /// Used for empty and default rooms, and as fallback for the others.
    pub default: ProfileEntry,
    pub personal: Option<ProfileEntry>,
    /// Keyed by bridge protocol id.
    pub bridged: HashMap<String, ProfileEntry>,
    /// Extra names that may be overwritten besides the configured ones.
    pub managed_names: Vec<String>,
    pub managed_avatars: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SpacesSection {
    /// Server hints for new space-child entries. Defaults to the account's server.
    pub via: Vec<String>,
    /// Room category (`personal`, `default`, `empty`, `bridged:<protocol>`) to space ids.
    pub categories: HashMap<String, Vec<String>>,
    /// Spaces the tool may remove rooms from even if no category lists them.
    pub managed: Vec<String>,
}

impl RoomkeeperConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {path}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ROOMKEEPER_HOMESERVER") {
            self.account.homeserver = v;
        }
        if let Ok(v) = std::env::var("ROOMKEEPER_USER_ID") {
            self.account.user_id = v;
        }
        if let Ok(v) = std::env::var("ROOMKEEPER_DEVICE_ID") {
            self.account.device_id = v;
        }
        if let Ok(v) = std::env::var("ROOMKEEPER_POLL_TIMEOUT_MS")
            && let Ok(ms) = v.parse()
        {
            self.run.poll_timeout_ms = ms;
        }
    }

    /// Check everything needed before logging in.
    pub fn validate(&self) -> Result<(), String> {
        validation::validate_homeserver(&self.account.homeserver)?;
        validation::validate_user_id(&self.account.user_id)?;
        for id in self.spaces.categories.values().flatten().chain(&self.spaces.managed) {
            validation::validate_room_id(id)?;
        }
        if self.run.poll_timeout_ms == 0 {
            return Err("poll_timeout_ms must be greater than zero".into());
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.run.poll_timeout_ms)
    }

    /// Classifier rules. The acting account is always ignored.
    pub fn classifier_rules(&self) -> ClassifierRules {
        let mut ignore: std::collections::HashSet<String> =
            self.classifier.ignore.iter().cloned().collect();
        if !self.account.user_id.is_empty() {
            ignore.insert(self.account.user_id.clone());
        }
        ClassifierRules {
            ignore,
            personal_servers: self.classifier.personal_servers.clone(),
            personal_contacts: self.classifier.personal_contacts.iter().cloned().collect(),
            bridge_markers: self.classifier.bridges.clone(),
        }
    }
}
