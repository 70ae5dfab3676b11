//! Reconnecting WebSocket client for the delivery channel.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use run_relay_core::config::Config;
use run_relay_core::protocol::{ClientCommand, ServerFrame};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Base URL of the gateway, e.g. `ws://127.0.0.1:18790`.
    pub url: String,
    pub session_id: String,
    pub heartbeat_interval: Duration,
    pub max_backoff: Duration,
    pub history_limit: usize,
}

impl ClientOptions {
    pub fn from_config(config: &Config, session_id: impl Into<String>) -> Self {
        Self {
            url: config.client_url(),
            session_id: session_id.into(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs()),
            max_backoff: Duration::from_secs(config.max_backoff_secs()),
            history_limit: config.client_history_limit(),
        }
    }

    pub fn session_url(&self) -> String {
        format!(
            "{}/ws/{}",
            self.url.trim_end_matches('/'),
            self.session_id
        )
    }
}

/// Events delivered to the session's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A connection is up and a history fetch has been requested.
    Connected,
    Frame(ServerFrame),
    Disconnected { reason: String },
}

/// Doubling backoff capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

enum Exit {
    Cancelled,
    /// `healthy` is set once any frame arrived on the connection.
    Dropped { reason: String, healthy: bool },
}

/// Sleep unless cancelled first. Returns false on cancel.
async fn wait(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Keep a connection to the session alive until `cancel` fires.
///
/// Every (re)connect sends `get_messages` first and emits
/// [`ClientEvent::Connected`], so the consumer can discard its state and
/// rebuild from the reply. Commands queued while disconnected are sent after
/// the next connect.
///
/// Every reconnect waits out the backoff, including after a connection that
/// was accepted and then dropped. The backoff resets only once a connection
/// has delivered a frame.
pub async fn run_client(
    options: ClientOptions,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let url = options.session_url();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let connect = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = connect_async(url.as_str()) => result,
        };
        let (mut ws, _) = match connect {
            Ok(value) => value,
            Err(e) => {
                warn!(%url, %e, ?backoff, "Connect failed, retrying");
                if !wait(&cancel, backoff).await {
                    return Ok(());
                }
                backoff = next_backoff(backoff, options.max_backoff);
                continue;
            }
        };
        info!(%url, "Connected");

        let fetch = ClientCommand::GetMessages {
            limit: Some(options.history_limit),
        };
        if let Err(e) = send_command(&mut ws, &fetch).await {
            warn!(%url, %e, ?backoff, "History request failed, retrying");
            let _ = ws.close(None).await;
            if !wait(&cancel, backoff).await {
                return Ok(());
            }
            backoff = next_backoff(backoff, options.max_backoff);
            continue;
        }
        if events.send(ClientEvent::Connected).is_err() {
            let _ = ws.close(None).await;
            return Ok(());
        }

        let exit = session_loop(&options, &mut ws, &mut commands, &events, &cancel).await;
        let _ = ws.close(None).await;

        match exit {
            Exit::Cancelled => return Ok(()),
            Exit::Dropped { reason, healthy } => {
                if healthy {
                    backoff = INITIAL_BACKOFF;
                }
                warn!(%reason, ?backoff, "Connection lost");
                if events
                    .send(ClientEvent::Disconnected { reason })
                    .is_err()
                {
                    return Ok(());
                }
                if !wait(&cancel, backoff).await {
                    return Ok(());
                }
                backoff = next_backoff(backoff, options.max_backoff);
            }
        }
    }
}

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send_command(ws: &mut Ws, command: &ClientCommand) -> anyhow::Result<()> {
    let text = serde_json::to_string(command)?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn session_loop(
    options: &ClientOptions,
    ws: &mut Ws,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    events: &mpsc::UnboundedSender<ClientEvent>,
    cancel: &CancellationToken,
) -> Exit {
    let period = options.heartbeat_interval.max(Duration::from_secs(1));
    let mut heartbeat = tokio::time::interval(period);
    heartbeat.tick().await;
    let mut last_inbound = Instant::now();
    let mut healthy = false;
    let half_open_after = period * 2;
    let dropped = |reason: String, healthy: bool| Exit::Dropped { reason, healthy };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Exit::Cancelled,
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    last_inbound = Instant::now();
                    healthy = true;
                    match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => {
                            if events.send(ClientEvent::Frame(frame)).is_err() {
                                return Exit::Cancelled;
                            }
                        }
                        Err(e) => warn!(%e, "Ignoring unparseable server frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return dropped("closed by server".into(), healthy);
                }
                Some(Ok(_)) => {
                    last_inbound = Instant::now();
                    healthy = true;
                }
                Some(Err(e)) => return dropped(e.to_string(), healthy),
            },
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = send_command(ws, &command).await {
                        return dropped(format!("send failed: {e}"), healthy);
                    }
                }
                None => return Exit::Cancelled,
            },
            _ = heartbeat.tick() => {
                if last_inbound.elapsed() >= half_open_after {
                    return dropped("heartbeat timed out".into(), healthy);
                }
                debug!("Sending heartbeat");
                if let Err(e) = send_command(ws, &ClientCommand::Ping).await {
                    return dropped(format!("heartbeat failed: {e}"), healthy);
                }
            }
        }
    }
}
