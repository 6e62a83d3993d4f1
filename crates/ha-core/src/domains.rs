//! Supported entity domains and the commands each one accepts
//!
//! Controls are dispatched on [`Domain`] rather than on the raw prefix of
//! the entity id, so adding a domain forces every match below to handle it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EntityId;

/// Domains the panel knows how to control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Light,
    Switch,
    Fan,
    InputBoolean,
    Cover,
    Lock,
    MediaPlayer,
}

/// User-level intent on a control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    TurnOn,
    TurnOff,
    Toggle,
    Open,
    Close,
    Lock,
    Unlock,
    Play,
    Pause,
}

/// A concrete service to call and the state expected once it took effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub domain: Domain,
    pub service: &'static str,
    pub target_state: &'static str,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Light,
        Domain::Switch,
        Domain::Fan,
        Domain::InputBoolean,
        Domain::Cover,
        Domain::Lock,
        Domain::MediaPlayer,
    ];

    /// Domain of an entity, `None` for read-only or unsupported domains
    pub fn of(entity_id: &EntityId) -> Option<Self> {
        entity_id.domain().parse().ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Light => "light",
            Domain::Switch => "switch",
            Domain::Fan => "fan",
            Domain::InputBoolean => "input_boolean",
            Domain::Cover => "cover",
            Domain::Lock => "lock",
            Domain::MediaPlayer => "media_player",
        }
    }

    /// Resolve an action against the entity's current state.
    ///
    /// Returns `None` when the action makes no sense for this domain.
    pub fn command(&self, action: Action, current_state: &str) -> Option<Command> {
        let (service, target_state) = match self {
            Domain::Light | Domain::Switch | Domain::Fan | Domain::InputBoolean => match action {
                Action::TurnOn => ("turn_on", "on"),
                Action::TurnOff => ("turn_off", "off"),
                Action::Toggle if current_state == "on" => ("turn_off", "off"),
                Action::Toggle => ("turn_on", "on"),
                _ => return None,
            },
            Domain::Cover => match action {
                Action::Open => ("open_cover", "opening"),
                Action::Close => ("close_cover", "closing"),
                Action::Toggle if matches!(current_state, "open" | "opening") => {
                    ("close_cover", "closing")
                }
                Action::Toggle => ("open_cover", "opening"),
                _ => return None,
            },
            Domain::Lock => match action {
                Action::Lock => ("lock", "locked"),
                Action::Unlock => ("unlock", "unlocked"),
                Action::Toggle if current_state == "locked" => ("unlock", "unlocked"),
                Action::Toggle => ("lock", "locked"),
                _ => return None,
            },
            Domain::MediaPlayer => match action {
                Action::Play => ("media_play", "playing"),
                Action::Pause => ("media_pause", "paused"),
                Action::Toggle if current_state == "playing" => ("media_pause", "paused"),
                Action::Toggle => ("media_play", "playing"),
                _ => return None,
            },
        };

        Some(Command {
            domain: *self,
            service,
            target_state,
        })
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unsupported domain: {s}"))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "on" | "turn_on" => Action::TurnOn,
            "off" | "turn_off" => Action::TurnOff,
            "toggle" => Action::Toggle,
            "open" => Action::Open,
            "close" => Action::Close,
            "lock" => Action::Lock,
            "unlock" => Action::Unlock,
            "play" => Action::Play,
            "pause" => Action::Pause,
            other => return Err(format!("unknown action: {other}")),
        })
    }
}
