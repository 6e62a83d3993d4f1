//! Plain-text rendering of the entity list

use ha_core::{Domain, EntitySnapshot};
use ha_reconciler::CommandPhase;

/// One line per entity: marker, id, state and display name
///
/// `*` marks a command in flight, `~` a cooldown, `-` a read-only entity.
pub fn render_row(snapshot: &EntitySnapshot, phase: Option<CommandPhase>) -> String {
    let marker = match phase {
        Some(CommandPhase::InFlight) => '*',
        Some(CommandPhase::CoolingDown) => '~',
        None if Domain::of(&snapshot.entity_id).is_none() => '-',
        None => ' ',
    };
    format!(
        "{marker} {:<40} {:<12} {}",
        snapshot.entity_id.to_string(),
        snapshot.state,
        snapshot.friendly_name()
    )
}
