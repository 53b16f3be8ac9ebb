pub mod classifier;
pub mod dispatcher;
pub mod events;
pub mod reconciler;
pub mod rename_planner;
pub mod space_cache;
pub mod validation;
