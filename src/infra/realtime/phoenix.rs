//! Websocket transport for the backend's Phoenix-style realtime channels.
//!
//! One background task owns the socket. It joins every registered channel,
//! keeps the connection alive with heartbeats and, when the socket drops,
//! reports the loss to each channel, waits a fixed delay and reconnects,
//! rejoining everything still registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::RowOperation;
use crate::sync::{
    ChangeCallback, ChangeEvent, ChannelId, ChannelSpec, ChannelStatus, RealtimeError,
    RealtimeTransport, StatusCallback,
};

const HEARTBEAT_TOPIC: &str = "phoenix";

#[derive(Debug, Clone)]
pub struct PhoenixOptions {
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for PhoenixOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Websocket endpoint for the store at `site`.
pub fn realtime_url(site: &str, api_key: &str) -> Result<Url, RealtimeError> {
    let invalid = |reason: String| RealtimeError::Connection(format!("invalid realtime url: {reason}"));
    let mut url = Url::parse(site)
        .and_then(|url| url.join("/realtime/v1/websocket"))
        .map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot switch scheme to `{scheme}`")))?;
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

enum Command {
    Join {
        id: ChannelId,
        spec: ChannelSpec,
        on_change: ChangeCallback,
        on_status: StatusCallback,
    },
    Leave {
        id: ChannelId,
    },
}

/// Realtime transport over a single websocket connection.
pub struct PhoenixTransport {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl PhoenixTransport {
    /// Start the connection task. Must be called from within a tokio runtime.
    pub fn spawn(url: Url, api_key: String, options: PhoenixOptions) -> Result<Self, RealtimeError> {
        let handle = Handle::try_current()
            .map_err(|err| RealtimeError::Connection(format!("no async runtime: {err}")))?;
        let (commands, rx) = mpsc::unbounded_channel();
        let task = handle.spawn(run(url, api_key, options, rx));
        Ok(Self {
            commands,
            next_id: AtomicU64::new(1),
            task,
        })
    }
}

impl RealtimeTransport for PhoenixTransport {
    fn subscribe(
        &self,
        spec: ChannelSpec,
        on_change: ChangeCallback,
        on_status: StatusCallback,
    ) -> Result<ChannelId, RealtimeError> {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.commands
            .send(Command::Join {
                id,
                spec,
                on_change,
                on_status,
            })
            .map_err(|_| RealtimeError::Closed)?;
        Ok(id)
    }

    fn remove_channel(&self, channel: ChannelId) {
        // A closed command channel means the task is gone along with every channel.
        let _ = self.commands.send(Command::Leave { id: channel });
    }
}

impl Drop for PhoenixTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Frame {
    Reply { reference: String, ok: bool },
    Change {
        topic: String,
        table: String,
        operation: RowOperation,
        record: Value,
    },
    ChannelError { topic: String },
    ChannelClosed { topic: String },
    Ignored,
}

/// Every subscription joins its own topic, so leaving one never closes
/// another subscription on the same table.
fn topic_for(spec: &ChannelSpec, id: ChannelId) -> String {
    format!("realtime:{}-{}", spec.name, id.0)
}

fn join_message(topic: &str, spec: &ChannelSpec, api_key: &str, reference: &str) -> Envelope {
    let mut change = json!({
        "event": "*",
        "schema": spec.schema,
        "table": spec.table,
    });
    if let Some(filter) = &spec.filter {
        change["filter"] = Value::String(filter.clone());
    }
    Envelope {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload: json!({
            "config": { "postgres_changes": [change] },
            "access_token": api_key,
        }),
        reference: Some(reference.to_string()),
    }
}

fn control_message(topic: &str, event: &str, reference: &str) -> Envelope {
    Envelope {
        topic: topic.to_string(),
        event: event.to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

fn decode_frame(text: &str) -> Frame {
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        return Frame::Ignored;
    };
    match envelope.event.as_str() {
        "phx_reply" => match envelope.reference {
            Some(reference) => Frame::Reply {
                reference,
                ok: envelope.payload.get("status").and_then(Value::as_str) == Some("ok"),
            },
            None => Frame::Ignored,
        },
        "postgres_changes" => {
            let data = &envelope.payload["data"];
            let operation = data
                .get("type")
                .and_then(Value::as_str)
                .and_then(|kind| kind.parse::<RowOperation>().ok());
            match operation {
                Some(operation) => Frame::Change {
                    topic: envelope.topic,
                    table: data["table"].as_str().unwrap_or_default().to_string(),
                    operation,
                    record: match operation {
                        RowOperation::Delete => data["old_record"].clone(),
                        _ => data["record"].clone(),
                    },
                },
                None => Frame::Ignored,
            }
        }
        "phx_error" => Frame::ChannelError {
            topic: envelope.topic,
        },
        "phx_close" => Frame::ChannelClosed {
            topic: envelope.topic,
        },
        _ => Frame::Ignored,
    }
}

struct Registered {
    spec: ChannelSpec,
    topic: String,
    on_change: ChangeCallback,
    on_status: StatusCallback,
}

struct Session {
    api_key: String,
    channels: HashMap<ChannelId, Registered>,
    pending_joins: HashMap<String, ChannelId>,
    next_ref: u64,
}

impl Session {
    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn join(&mut self, id: ChannelId) -> Option<Message> {
        let reference = self.next_ref();
        let channel = self.channels.get(&id)?;
        let message = join_message(&channel.topic, &channel.spec, &self.api_key, &reference);
        self.pending_joins.insert(reference, id);
        encode(&message)
    }

    fn by_topic(&self, topic: &str) -> impl Iterator<Item = &Registered> {
        self.channels
            .values()
            .filter(move |channel| channel.topic == topic)
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Reply { reference, ok } => {
                let Some(id) = self.pending_joins.remove(&reference) else {
                    return;
                };
                if let Some(channel) = self.channels.get(&id) {
                    let status = if ok {
                        ChannelStatus::Subscribed
                    } else {
                        ChannelStatus::ChannelError
                    };
                    (channel.on_status)(status);
                }
            }
            Frame::Change {
                topic,
                table,
                operation,
                record,
            } => {
                for channel in self.by_topic(&topic) {
                    (channel.on_change)(ChangeEvent {
                        table: table.clone(),
                        operation,
                        record: record.clone(),
                    });
                }
            }
            Frame::ChannelError { topic } => {
                for channel in self.by_topic(&topic) {
                    (channel.on_status)(ChannelStatus::ChannelError);
                }
            }
            Frame::ChannelClosed { topic } => {
                for channel in self.by_topic(&topic) {
                    (channel.on_status)(ChannelStatus::Closed);
                }
            }
            Frame::Ignored => {}
        }
    }

    fn report_lost(&mut self) {
        self.pending_joins.clear();
        for channel in self.channels.values() {
            (channel.on_status)(ChannelStatus::ChannelError);
        }
    }
}

fn encode(envelope: &Envelope) -> Option<Message> {
    match serde_json::to_string(envelope) {
        Ok(text) => Some(Message::text(text)),
        Err(err) => {
            warn!(error = %err, "Failed to encode realtime message");
            None
        }
    }
}

async fn run(
    url: Url,
    api_key: String,
    options: PhoenixOptions,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut session = Session {
        api_key,
        channels: HashMap::new(),
        pending_joins: HashMap::new(),
        next_ref: 0,
    };

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                info!(host = url.host_str().unwrap_or_default(), "Realtime socket connected");

                let ids: Vec<ChannelId> = session.channels.keys().copied().collect();
                for id in ids {
                    if let Some(message) = session.join(id)
                        && socket.send(message).await.is_err()
                    {
                        break;
                    }
                }

                let mut heartbeat = tokio::time::interval(options.heartbeat_interval);
                heartbeat.tick().await;

                loop {
                    tokio::select! {
                        command = commands.recv() => {
                            let Some(command) = command else {
                                let _ = socket.close(None).await;
                                return;
                            };
                            let outgoing = match command {
                                Command::Join { id, spec, on_change, on_status } => {
                                    let topic = topic_for(&spec, id);
                                    session.channels.insert(id, Registered { spec, topic, on_change, on_status });
                                    session.join(id)
                                }
                                Command::Leave { id } => {
                                    let reference = session.next_ref();
                                    session.channels.remove(&id).and_then(|channel| {
                                        encode(&control_message(&channel.topic, "phx_leave", &reference))
                                    })
                                }
                            };
                            if let Some(message) = outgoing
                                && socket.send(message).await.is_err()
                            {
                                break;
                            }
                        }
                        _ = heartbeat.tick() => {
                            let reference = session.next_ref();
                            if let Some(message) = encode(&control_message(HEARTBEAT_TOPIC, "heartbeat", &reference))
                                && socket.send(message).await.is_err()
                            {
                                break;
                            }
                        }
                        incoming = socket.next() => {
                            match incoming {
                                Some(Ok(Message::Text(text))) => session.handle_frame(decode_frame(&text)),
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!(error = %err, "Realtime socket error");
                                    break;
                                }
                            }
                        }
                    }
                }

                warn!("Realtime socket disconnected");
                session.report_lost();
            }
            Err(err) => {
                warn!(error = %err, "Realtime socket connection failed");
            }
        }

        debug!(
            delay_ms = options.reconnect_delay.as_millis() as u64,
            "Realtime reconnect scheduled"
        );
        // Keep accepting registrations while waiting to reconnect.
        let sleep = tokio::time::sleep(options.reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(Command::Join { id, spec, on_change, on_status }) => {
                        let topic = topic_for(&spec, id);
                        session.channels.insert(id, Registered { spec, topic, on_change, on_status });
                    }
                    Some(Command::Leave { id }) => {
                        session.channels.remove(&id);
                    }
                    None => return,
                },
            }
        }
    }
}
