//! Headless Home Assistant panel
//!
//! Connects to Home Assistant, mirrors every entity and accepts control
//! commands on stdin. Commands are applied optimistically and rolled back
//! when Home Assistant does not confirm them in time.

mod command;
mod view;

use std::sync::Arc;

use anyhow::{Context, Result};
use ha_client::{ClientConfig, ConnectionEvent, WsClient};
use ha_config::PanelConfig;
use ha_core::events::StateChangedData;
use ha_core::{Action, EntityId};
use ha_reconciler::{Home, ReconcilerConfig, TriggerOutcome};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::command::{PanelCommand, HELP};

const DEFAULT_CONFIG: &str = "panel.yaml";

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn client_config(config: &PanelConfig) -> ClientConfig {
    let mut client = ClientConfig::new(&config.home_assistant.url, &config.home_assistant.token);
    client.auth_timeout = config.client.auth_timeout();
    client.request_timeout = config.client.request_timeout();
    client.max_reconnect_attempts = config.client.max_reconnect_attempts;
    client
}

fn reconciler_config(config: &PanelConfig) -> ReconcilerConfig {
    ReconcilerConfig {
        confirm_timeout: config.reconciler.confirm_timeout(),
        cooldown: config.reconciler.cooldown(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config =
        PanelConfig::load(&path).with_context(|| format!("failed to load config from {path}"))?;
    init_logging(&config.log_level);

    info!(url = %config.home_assistant.url, "Starting Home Assistant panel");

    let client = WsClient::connect(client_config(&config))
        .await
        .context("failed to connect to Home Assistant")?;
    let home = Arc::new(Home::new(
        Arc::new(client.clone()),
        reconciler_config(&config),
    ));

    let count = home.load_states().await.context("failed to load states")?;
    info!(entities = count, "Panel ready");
    println!("{count} entities loaded. Type 'help' for commands.");

    let changes = client
        .subscribe_state_changes()
        .await
        .context("failed to subscribe to state changes")?;
    let connection = client.subscribe_connection_events();
    let lines = BufReader::new(tokio::io::stdin()).lines();

    let result = tokio::select! {
        result = run(Arc::clone(&home), changes, connection, lines) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };
    client.disconnect();
    home.reset();
    info!("Shutting down...");
    result
}

/// Event loop of the panel
///
/// Ends with the input or on `quit`. Fails once the client gave up
/// reconnecting.
async fn run<R>(
    home: Arc<Home>,
    mut changes: broadcast::Receiver<StateChangedData>,
    mut connection: broadcast::Receiver<ConnectionEvent>,
    mut lines: Lines<R>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut notices = home.reconciler().subscribe_notices();

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(data) => {
                    home.apply_state_changed(data);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed state changes, reloading");
                    reload(&home).await;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            event = connection.recv() => match event {
                Ok(ConnectionEvent::Reconnected) => reload(&home).await,
                Ok(ConnectionEvent::GaveUp) => {
                    anyhow::bail!("lost the connection to Home Assistant");
                }
                Ok(event) => debug!(?event, "Connection event"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            },
            notice = notices.recv() => {
                if let Ok(notice) = notice {
                    println!("! {notice}");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read input")? else {
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<PanelCommand>() {
                    Ok(PanelCommand::Quit) => return Ok(()),
                    Ok(command) => handle(&home, command).await,
                    Err(e) => println!("error: {e:#}"),
                }
            }
        }
    }
}

async fn handle(home: &Arc<Home>, command: PanelCommand) {
    match command {
        PanelCommand::Perform { action, entity_id } => {
            // The call resolves only after Home Assistant ran the service;
            // its state_changed events must keep flowing meanwhile
            let home = Arc::clone(home);
            tokio::spawn(async move { perform(&home, &entity_id, action).await });
        }
        PanelCommand::List => {
            for snapshot in home.store().all() {
                let phase = home.reconciler().phase(&snapshot.entity_id);
                println!("{}", view::render_row(&snapshot, phase));
            }
        }
        PanelCommand::Reload => reload(home).await,
        PanelCommand::Help => println!("{HELP}"),
        PanelCommand::Quit => {}
    }
}

async fn perform(home: &Home, entity_id: &EntityId, action: Action) {
    match home.perform(entity_id, action, || {}).await {
        Ok(TriggerOutcome::Accepted) => println!("{entity_id}: sent"),
        Ok(TriggerOutcome::InFlight) => {
            println!("{entity_id}: busy, a command is already in flight")
        }
        Ok(TriggerOutcome::CoolingDown) => {
            println!("{entity_id}: busy, just confirmed")
        }
        // The notice carries the message
        Ok(TriggerOutcome::SendFailed(_)) => {}
        Err(e) => println!("error: {e}"),
    }
}

async fn reload(home: &Home) {
    match home.load_states().await {
        Ok(count) => info!(entities = count, "Reloaded states"),
        Err(e) => error!(error = %e, "Failed to reload states"),
    }
}
