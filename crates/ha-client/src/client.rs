//! Connection, request correlation and reconnect supervision

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ha_core::events::{StateChangedData, STATE_CHANGED};
use ha_core::{ChannelError, CommandChannel, EntitySnapshot, ServiceCall};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{reconnect_delay, ClientConfig};
use crate::types::{ErrorInfo, EventMessage, ServerMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reader = SplitStream<Socket>;
type Writer = SplitSink<Socket, Message>;
type Responder = oneshot::Sender<Result<Value, ChannelError>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of the underlying connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected,
    /// Reconnecting stopped; the client stays disconnected
    GaveUp,
}

struct Shared {
    config: ClientConfig,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: DashMap<u64, Responder>,
    next_id: AtomicU64,
    closing: AtomicBool,
    wants_state_changes: AtomicBool,
    state_changes: broadcast::Sender<StateChangedData>,
    connection: broadcast::Sender<ConnectionEvent>,
}

/// Home Assistant WebSocket client
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct WsClient {
    shared: Arc<Shared>,
}

impl WsClient {
    /// Connect and authenticate
    #[instrument(skip(config), fields(url = %config.ws_url()))]
    pub async fn connect(config: ClientConfig) -> Result<Self, ChannelError> {
        let (state_changes, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connection, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            outgoing: Mutex::new(None),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            wants_state_changes: AtomicBool::new(false),
            state_changes,
            connection,
        });

        let reader = shared.open().await?;
        info!("Connected to Home Assistant");
        tokio::spawn(supervise(Arc::clone(&shared), reader));
        shared.announce(ConnectionEvent::Connected);

        Ok(Self { shared })
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.outgoing).is_some()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.connection.subscribe()
    }

    /// Receive every `state_changed` event
    ///
    /// The `subscribe_events` request is only sent the first time; it is
    /// repeated automatically after a reconnect.
    pub async fn subscribe_state_changes(
        &self,
    ) -> Result<broadcast::Receiver<StateChangedData>, ChannelError> {
        let receiver = self.shared.state_changes.subscribe();
        if !self.shared.wants_state_changes.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.subscribe_events(STATE_CHANGED).await {
                self.shared
                    .wants_state_changes
                    .store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(receiver)
    }

    /// Subscribe to an event type, returning the subscription id
    pub async fn subscribe_events(&self, event_type: &str) -> Result<u64, ChannelError> {
        self.shared.subscribe_events(event_type).await
    }

    /// Services offered by the instance, keyed by domain
    pub async fn get_services(&self) -> Result<Value, ChannelError> {
        self.shared.request(json!({"type": "get_services"})).await
    }

    pub async fn ping(&self) -> Result<(), ChannelError> {
        self.shared.request(json!({"type": "ping"})).await.map(|_| ())
    }

    /// Close the connection without reconnecting
    pub fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(outgoing) = lock(&self.shared.outgoing).take() {
            let _ = outgoing.send(Message::Close(None));
        }
        self.shared.fail_pending();
        info!("Disconnected from Home Assistant");
    }
}

#[async_trait]
impl CommandChannel for WsClient {
    #[instrument(skip(self, call), fields(service = %call.service_id()))]
    async fn call_service(&self, call: ServiceCall) -> Result<(), ChannelError> {
        let mut payload = json!({
            "type": "call_service",
            "domain": call.domain,
            "service": call.service,
            "service_data": call.service_data,
        });
        if let Some(target) = call.target.filter(|t| !t.is_empty()) {
            let target = serde_json::to_value(target)
                .map_err(|e| ChannelError::Protocol(e.to_string()))?;
            payload["target"] = target;
        }

        self.shared.request(payload).await.map(|_| ())
    }

    async fn get_states(&self) -> Result<Vec<EntitySnapshot>, ChannelError> {
        let result = self.shared.request(json!({"type": "get_states"})).await?;
        serde_json::from_value(result).map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

impl Shared {
    /// Open a socket, authenticate and start its writer task
    async fn open(&self) -> Result<Reader, ChannelError> {
        let url = self.config.ws_url();
        let (socket, _) = timeout(self.config.auth_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ChannelError::Timeout("connect".to_string()))?
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let (mut writer, mut reader) = socket.split();
        timeout(
            self.config.auth_timeout,
            authenticate(&mut writer, &mut reader, &self.config.token),
        )
        .await
        .map_err(|_| ChannelError::Timeout("authentication".to_string()))??;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));
        *lock(&self.outgoing) = Some(tx);
        Ok(reader)
    }

    async fn request(&self, payload: Value) -> Result<Value, ChannelError> {
        self.request_with_id(payload).await.map(|(_, result)| result)
    }

    async fn request_with_id(&self, mut payload: Value) -> Result<(u64, Value), ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Value::Object(fields) = &mut payload {
            fields.insert("id".to_string(), id.into());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if let Err(e) = self.send_frame(Message::Text(payload.to_string())) {
            self.pending.remove(&id);
            return Err(e);
        }
        trace!(id, "Request sent");

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome.map(|result| (id, result)),
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(ChannelError::Timeout(format!("no result for request {id}")))
            }
        }
    }

    async fn subscribe_events(&self, event_type: &str) -> Result<u64, ChannelError> {
        let (id, _) = self
            .request_with_id(json!({"type": "subscribe_events", "event_type": event_type}))
            .await?;
        debug!(event_type, id, "Subscribed to events");
        Ok(id)
    }

    fn send_frame(&self, frame: Message) -> Result<(), ChannelError> {
        let outgoing = lock(&self.outgoing);
        let tx = outgoing.as_ref().ok_or(ChannelError::NotConnected)?;
        tx.send(frame).map_err(|_| ChannelError::NotConnected)
    }

    fn dispatch(&self, text: &str) {
        let messages = match ServerMessage::parse_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Unparseable message from Home Assistant");
                return;
            }
        };

        for message in messages {
            match message {
                ServerMessage::Result {
                    id,
                    success,
                    result,
                    error,
                } => {
                    let outcome = if success {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        let error = error.unwrap_or_else(|| ErrorInfo {
                            code: "unknown_error".to_string(),
                            message: String::new(),
                        });
                        Err(ChannelError::Rejected {
                            code: error.code,
                            message: error.message,
                        })
                    };
                    self.resolve(id, outcome);
                }
                ServerMessage::Pong { id } => self.resolve(id, Ok(Value::Null)),
                ServerMessage::Event { event, .. } => self.publish(event),
                other => trace!(?other, "Ignoring message"),
            }
        }
    }

    fn resolve(&self, id: u64, outcome: Result<Value, ChannelError>) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => debug!(id, "Result for unknown or expired request"),
        }
    }

    fn publish(&self, event: EventMessage) {
        if event.event_type != STATE_CHANGED {
            trace!(event_type = %event.event_type, "Ignoring event");
            return;
        }
        match serde_json::from_value::<StateChangedData>(event.data) {
            Ok(data) => {
                trace!(entity_id = %data.entity_id, "State changed");
                // No receivers is fine
                let _ = self.state_changes.send(data);
            }
            Err(e) => warn!(error = %e, "Malformed state_changed event"),
        }
    }

    /// Drop the writer and fail every request still waiting for a result
    fn detach(&self) {
        lock(&self.outgoing).take();
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(ChannelError::ConnectionClosed));
            }
        }
    }

    fn announce(&self, event: ConnectionEvent) {
        let _ = self.connection.send(event);
    }

    async fn reconnect(&self) -> Option<Reader> {
        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = reconnect_delay(attempt);
            info!(attempt, ?delay, "Reconnecting");
            self.announce(ConnectionEvent::Reconnecting { attempt, delay });
            sleep(delay).await;

            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            match self.open().await {
                Ok(_) if self.closing.load(Ordering::SeqCst) => {
                    // disconnect() raced with the handshake
                    if let Some(outgoing) = lock(&self.outgoing).take() {
                        let _ = outgoing.send(Message::Close(None));
                    }
                    return None;
                }
                Ok(reader) => return Some(reader),
                Err(ChannelError::AuthInvalid(message)) => {
                    warn!(%message, "Token rejected, not reconnecting");
                    return None;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
            }
        }
        None
    }
}

async fn authenticate(
    writer: &mut Writer,
    reader: &mut Reader,
    token: &str,
) -> Result<(), ChannelError> {
    match next_message(reader).await? {
        ServerMessage::AuthRequired { ha_version } => {
            debug!(?ha_version, "Authentication required")
        }
        other => {
            return Err(ChannelError::Protocol(format!(
                "expected auth_required, got {:?}",
                other
            )))
        }
    }

    let auth = json!({"type": "auth", "access_token": token});
    writer
        .send(Message::Text(auth.to_string()))
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;

    match next_message(reader).await? {
        ServerMessage::AuthOk { ha_version } => {
            debug!(?ha_version, "Authenticated");
            Ok(())
        }
        ServerMessage::AuthInvalid { message } => Err(ChannelError::AuthInvalid(
            message.unwrap_or_else(|| "invalid access token".to_string()),
        )),
        other => Err(ChannelError::Protocol(format!(
            "expected auth result, got {:?}",
            other
        ))),
    }
}

async fn next_message(reader: &mut Reader) -> Result<ServerMessage, ChannelError> {
    loop {
        let frame = reader
            .next()
            .await
            .ok_or(ChannelError::ConnectionClosed)?
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| ChannelError::Protocol(e.to_string()))
            }
            Message::Close(_) => return Err(ChannelError::ConnectionClosed),
            _ => continue,
        }
    }
}

async fn write_loop(mut writer: Writer, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = writer.send(frame).await {
            debug!(error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop(shared: &Shared, reader: &mut Reader) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => shared.dispatch(&text),
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "WebSocket read failed");
                break;
            }
        }
    }
}

/// Read until the connection ends, then reconnect unless it was closed on purpose
async fn supervise(shared: Arc<Shared>, mut reader: Reader) {
    loop {
        read_loop(&shared, &mut reader).await;
        shared.detach();
        shared.announce(ConnectionEvent::Disconnected);

        if shared.closing.load(Ordering::SeqCst) {
            return;
        }
        warn!("Connection to Home Assistant lost");

        match shared.reconnect().await {
            Some(next) => {
                reader = next;
                info!("Reconnected to Home Assistant");
                shared.announce(ConnectionEvent::Reconnected);
                if shared.wants_state_changes.load(Ordering::SeqCst) {
                    tokio::spawn(resubscribe(Arc::clone(&shared)));
                }
            }
            None => {
                shared.announce(ConnectionEvent::GaveUp);
                return;
            }
        }
    }
}

async fn resubscribe(shared: Arc<Shared>) {
    if let Err(e) = shared.subscribe_events(STATE_CHANGED).await {
        warn!(error = %e, "Failed to resubscribe to state changes");
    }
}

fn lock<T>(value: &Mutex<T>) -> MutexGuard<'_, T> {
    value.lock().unwrap_or_else(PoisonError::into_inner)
}
