//! Line commands read from stdin

use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use ha_core::{Action, EntityId};

pub const HELP: &str = "\
commands:
  on|off|toggle <entity_id>
  open|close <entity_id>
  lock|unlock <entity_id>
  play|pause <entity_id>
  list                 show all entities
  reload               fetch all states again
  help
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCommand {
    Perform { action: Action, entity_id: EntityId },
    List,
    Reload,
    Help,
    Quit,
}

impl FromStr for PanelCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| anyhow!("empty command"))?;
        let argument = words.next();
        if words.next().is_some() {
            bail!("too many arguments");
        }

        let command = match (verb.to_ascii_lowercase().as_str(), argument) {
            ("list" | "ls", None) => PanelCommand::List,
            ("reload", None) => PanelCommand::Reload,
            ("help" | "?", None) => PanelCommand::Help,
            ("quit" | "exit", None) => PanelCommand::Quit,
            (verb, Some(entity_id)) => {
                let action = verb.parse::<Action>().map_err(|e| anyhow!(e))?;
                let entity_id = entity_id
                    .parse::<EntityId>()
                    .with_context(|| format!("invalid entity id '{entity_id}'"))?;
                PanelCommand::Perform { action, entity_id }
            }
            (verb, None) => bail!("'{verb}' needs an entity id"),
        };
        Ok(command)
    }
}
