//! Console rendering of a plan, shown to the operator before it is applied.

use crate::engine::reconciler::SpaceDelta;
use crate::engine::rename_planner::PlannedRename;
use crate::strategy::Profile;

fn show(profile: &Profile) -> String {
    format!(
        "{}|{}",
        profile.name.as_deref().unwrap_or("-"),
        profile.avatar_url.as_deref().unwrap_or("-")
    )
}

/// One line per rename: `room |old_name|old_avatar -> new_name|new_avatar`,
/// room names padded to the widest.
pub fn render_renames(renames: &[PlannedRename]) -> String {
    let width = renames.iter().map(|r| r.room_name.chars().count()).max().unwrap_or(0);
    renames
        .iter()
        .map(|r| {
            format!(
                "{:<width$} |{} -> {}\n",
                r.room_name,
                show(&r.old),
                show(&r.new)
            )
        })
        .collect()
}

/// Additions as `room -> space`, then removals as `room x space`.
pub fn render_space_changes(delta: &SpaceDelta) -> String {
    let width = delta
        .additions
        .iter()
        .map(|a| a.room_name.chars().count())
        .chain(delta.removals.iter().map(|r| r.room_name.chars().count()))
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for add in &delta.additions {
        out.push_str(&format!("{:<width$} -> {}\n", add.room_name, add.space.display_name));
    }
    for removal in &delta.removals {
        out.push_str(&format!("{:<width$} x {}\n", removal.room_name, removal.space.display_name));
    }
    out
}
