//! The event dispatcher: owns the space cache and drives every pass.
//!
//! One task does everything. Each event is handled to completion, including
//! the writes it triggers, before the next one is looked at, so the cache
//! never needs a lock.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{Room, RoomEvent, RoomId, Space, SpaceChildRelation};
use super::reconciler::{SpaceDelta, apply_delta, plan_spaces};
use super::rename_planner::{PlannedRename, RenamePermission, plan_rename};
use super::space_cache::{CacheChange, SpaceCache};
use crate::config::RoomkeeperConfig;
use crate::gateway::{Gateway, GatewayError, ROOM_MEMBER_EVENT, member_content};
use crate::strategy::{Profile, Strategy};

/// Pause after a failed poll before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Building the cache and running the optional initial pass.
    Bootstrapping,
    /// Reacting to live events.
    Listening,
}

/// Which chores the dispatcher performs.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub rename: bool,
    pub spaces: bool,
    pub poll_timeout: Duration,
}

impl DispatcherOptions {
    pub fn from_config(config: &RoomkeeperConfig) -> Self {
        Self {
            rename: config.run.rename,
            spaces: config.run.spaces,
            poll_timeout: config.poll_timeout(),
        }
    }
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            rename: true,
            spaces: true,
            poll_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a pass wants to write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub renames: Vec<PlannedRename>,
    pub spaces: SpaceDelta,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.renames.is_empty() && self.spaces.is_empty()
    }

    fn extend(&mut self, other: Plan) {
        self.renames.extend(other.renames);
        self.spaces.extend(other.spaces);
    }
}

/// Counts of what an execution actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub applied: usize,
    pub failed: usize,
}

pub struct Dispatcher<G, S> {
    gateway: G,
    strategy: S,
    cache: SpaceCache,
    options: DispatcherOptions,
    own_user_id: String,
    room_ids: Vec<RoomId>,
    state: DispatcherState,
}

impl<G: Gateway, S: Strategy> Dispatcher<G, S> {
    pub fn new(gateway: G, strategy: S, own_user_id: &str, options: DispatcherOptions) -> Self {
        Self {
            gateway,
            strategy,
            cache: SpaceCache::new(),
            options,
            own_user_id: own_user_id.to_string(),
            room_ids: Vec::new(),
            state: DispatcherState::Bootstrapping,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn cache(&self) -> &SpaceCache {
        &self.cache
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    /// Full-state sync followed by the cache build. Any read failure aborts.
    pub async fn bootstrap(&mut self) -> Result<(), GatewayError> {
        let snapshot = self.gateway.full_state_sync().await?;
        info!(rooms = snapshot.rooms.len(), "initial sync complete");
        self.cache = SpaceCache::bootstrap(&mut self.gateway, &snapshot).await?;
        self.room_ids = snapshot.rooms.into_iter().map(|r| r.room_id).collect();
        Ok(())
    }

    /// Plan changes for every joined room.
    ///
    /// A room whose members cannot be fetched is logged and left out; only an
    /// auth failure stops planning.
    pub async fn plan_all(&mut self) -> Result<Plan, GatewayError> {
        let mut plan = Plan::default();
        let room_ids = self.room_ids.clone();

        for room_id in &room_ids {
            let Some(room) = self.gateway.room(room_id) else {
                debug!(%room_id, "room left since sync");
                continue;
            };
            if room.is_space() {
                self.cache.register_space(Space::from(&room));
            }
            match self.plan_room(&room, self.options.rename, self.options.spaces).await {
                Ok(room_plan) => plan.extend(room_plan),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(%room_id, error = %e, "cannot plan room"),
            }
        }

        info!(
            renames = plan.renames.len(),
            space_additions = plan.spaces.additions.len(),
            space_removals = plan.spaces.removals.len(),
            "plan ready"
        );
        Ok(plan)
    }

    /// Plan one room. Members are only fetched when something may change.
    async fn plan_room(&mut self, room: &Room, rename: bool, spaces: bool) -> Result<Plan, GatewayError> {
        let rename = rename && !RenamePermission::of(&self.strategy, &Profile::of_room(room)).is_none();
        let spaces = spaces && !room.is_space();
        if !rename && !spaces {
            debug!(room_id = %room.room_id, room = %room.display_name, "skip");
            return Ok(Plan::default());
        }

        let members = self.gateway.joined_members(&room.room_id).await?;
        let mut plan = Plan::default();
        if rename && let Some(change) = plan_rename(&self.strategy, room, &members) {
            info!(
                room_id = %room.room_id,
                room = %room.display_name,
                from = ?change.old.name,
                to = ?change.new.name,
                "rename planned"
            );
            plan.renames.push(change);
        }
        if spaces {
            plan.spaces = plan_spaces(&self.strategy, room, &members, &self.cache);
        }
        Ok(plan)
    }

    /// Write a plan. Every failure is logged against its room (and space)
    /// and the rest still runs; an auth failure ends the execution.
    pub async fn execute(&mut self, plan: &Plan) -> Result<ExecutionSummary, GatewayError> {
        let mut summary = ExecutionSummary::default();

        for change in &plan.renames {
            let result = self
                .gateway
                .write_room_state(
                    &change.room_id,
                    ROOM_MEMBER_EVENT,
                    &self.own_user_id,
                    member_content(&change.new),
                )
                .await;
            match result {
                Ok(()) => {
                    info!(room_id = %change.room_id, name = ?change.new.name, "renamed");
                    summary.applied += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(room_id = %change.room_id, error = %e, "rename failed");
                    summary.failed += 1;
                }
            }
        }

        let report = apply_delta(&mut self.gateway, &mut self.cache, &plan.spaces).await;
        if let Some(fatal) = report.fatal() {
            return Err(fatal.clone());
        }
        summary.applied += report.applied;
        summary.failed += report.failed.len();
        Ok(summary)
    }

    /// Route one inbound event.
    pub async fn handle_event(&mut self, event: RoomEvent) -> Result<(), GatewayError> {
        debug!(room_id = %event.affected_room(), "event");
        match event {
            RoomEvent::Membership {
                room_id,
                user_id,
                membership,
            } => {
                debug!(%room_id, %user_id, %membership, "membership changed");
                let Some(room) = self.gateway.room(&room_id) else {
                    if self.cache.forget_space(&room_id) {
                        info!(space_id = %room_id, "left space");
                    } else {
                        debug!(%room_id, "not a joined room");
                    }
                    return Ok(());
                };
                if room.is_space() && self.cache.register_space(Space::from(&room)) {
                    info!(space_id = %room_id, name = %room.display_name, "new space");
                }
                self.run_room_pass(&room, self.options.rename, self.options.spaces)
                    .await
            }
            RoomEvent::SpaceChild(relation) => self.handle_space_child(relation).await,
        }
    }

    async fn handle_space_child(&mut self, relation: SpaceChildRelation) -> Result<(), GatewayError> {
        let change = self.cache.apply(&relation);
        if change != CacheChange::Unchanged {
            info!(
                space_id = %relation.space_id,
                room_id = %relation.room_id,
                change = ?change,
                "space membership changed"
            );
        }
        if !self.options.spaces {
            return Ok(());
        }
        let Some(room) = self.gateway.room(&relation.room_id) else {
            debug!(room_id = %relation.room_id, "child is not a joined room");
            return Ok(());
        };
        self.run_room_pass(&room, false, true).await
    }

    async fn run_room_pass(&mut self, room: &Room, rename: bool, spaces: bool) -> Result<(), GatewayError> {
        let plan = match self.plan_room(room, rename, spaces).await {
            Ok(plan) => plan,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(room_id = %room.room_id, error = %e, "cannot plan room");
                return Ok(());
            }
        };
        if plan.is_empty() {
            return Ok(());
        }
        self.execute(&plan).await.map(|_| ())
    }

    /// Poll and dispatch until cancelled or the session dies.
    pub async fn listen(&mut self, cancel: CancellationToken) -> Result<(), GatewayError> {
        self.state = DispatcherState::Listening;
        info!(
            spaces = self.cache.known_spaces().count(),
            "listening for events"
        );

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.gateway.poll_events(self.options.poll_timeout) => result,
            };

            let events = match batch {
                Ok(events) => events,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, retry_in = ?POLL_RETRY_DELAY, "poll failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                    }
                }
            };

            for event in events {
                self.handle_event(event).await?;
            }
        }

        info!("stopped listening");
        Ok(())
    }

    /// Log out and release the gateway.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.gateway.logout().await {
            warn!(error = %e, "logout failed");
        }
        self.gateway.close().await;
    }
}
