//! Session layer of the Outpost daemon.
//!
//! Serves the framed JSON protocol over a loopback WebSocket listener (the
//! reference transport) or over stdio. Each connection gets a reader loop,
//! a writer task that stamps event sequence numbers, and a processor that
//! owns the session's `RunContext`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use outpost_core::approval::ApprovalBroker;
use outpost_core::config::Config;
use outpost_core::config::LoggingConfig;
use outpost_core::config::Transport;
use outpost_core::workspace::Workspace;
use outpost_protocol::EVENT_TICK;
use outpost_protocol::MAX_FRAME_BYTES;
use outpost_protocol::OutboundEvent;
use outpost_protocol::TICK_INTERVAL_SECS;
use outpost_protocol::TickPayload;

mod message_processor;
mod outgoing_message;
mod session;

use crate::message_processor::Flow;
use crate::message_processor::MessageProcessor;
use crate::outgoing_message::OutgoingMessage;
use crate::outgoing_message::SequenceStamper;
use crate::session::SessionHandle;
use crate::session::SessionRegistry;

/// Extra slack over the protocol frame cap so our own size check, not the
/// transport's, produces the error code.
const WS_MESSAGE_CEILING: usize = MAX_FRAME_BYTES + 64 * 1024;

/// Capacity of the daemon-wide broadcast channel (ticks, approvals).
const BROADCAST_CAPACITY: usize = 64;

/// Shared state of a running daemon process.
pub struct Daemon {
    pub config: Arc<Config>,
    pub workspace: Arc<Workspace>,
    pub token: String,
    pub home: PathBuf,
    pub approvals: Arc<ApprovalBroker>,
    pub(crate) events: broadcast::Sender<OutboundEvent>,
    pub(crate) sessions: SessionRegistry,
}

impl Daemon {
    pub fn new(
        config: Arc<Config>,
        workspace: Arc<Workspace>,
        token: String,
        home: PathBuf,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            config,
            workspace,
            token,
            home,
            approvals: Arc::new(ApprovalBroker::new()),
            events,
            sessions: SessionRegistry::default(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start the keepalive tick and the approval-event forwarder. Both stop
    /// when `cancel` fires.
    fn start_background(self: &Arc<Self>, cancel: &CancellationToken) {
        let daemon = self.clone();
        let tick_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SECS));
            // The first tick fires immediately; skip it so clients see the
            // hello payload before any event.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = tick_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let payload = TickPayload { ts: Utc::now().timestamp_millis() };
                        let _ = daemon.events.send(OutboundEvent::new(
                            EVENT_TICK,
                            serde_json::json!(payload),
                        ));
                    }
                }
            }
        });

        let daemon = self.clone();
        let mut approvals = self.approvals.subscribe();
        let approvals_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = approvals_cancel.cancelled() => break,
                    event = approvals.recv() => match event {
                        Ok(event) => {
                            let _ = daemon.events.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// Everything `serve` needs; assembled by the CLI (or a test).
pub struct ServeOptions {
    pub config: Arc<Config>,
    pub workspace: Arc<Workspace>,
    pub token: String,
    pub home: PathBuf,
    /// Override `server.host` from the command line.
    pub host: Option<String>,
    /// Override `server.port` from the command line.
    pub port: Option<u16>,
}

/// A daemon bound to a local address, running until cancelled.
pub struct BoundServer {
    pub local_addr: SocketAddr,
    pub cancel: CancellationToken,
    pub daemon: Arc<Daemon>,
    task: tokio::task::JoinHandle<()>,
}

impl BoundServer {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Run the daemon on the configured transport until interrupted.
pub async fn serve(options: ServeOptions) -> anyhow::Result<()> {
    match options.config.server.transport {
        Transport::Stdio => run_stdio(options).await,
        Transport::Http => {
            let cancel = CancellationToken::new();
            let bound = bind(options, cancel.clone()).await?;
            tracing::info!("listening on ws://{}/ws", bound.local_addr);
            wait_for_shutdown_signal().await;
            tracing::info!("shutting down");
            bound.shutdown().await;
            Ok(())
        }
    }
}

/// Bind the WebSocket listener and start accepting sessions. The returned
/// handle reports the actual local address, which matters when the caller
/// asked for port 0.
pub async fn bind(options: ServeOptions, cancel: CancellationToken) -> anyhow::Result<BoundServer> {
    let host = options
        .host
        .unwrap_or_else(|| options.config.server.host.clone());
    let port = options.port.unwrap_or(options.config.server.port);

    let daemon = Daemon::new(
        options.config,
        options.workspace,
        options.token,
        options.home,
    );
    daemon.start_background(&cancel);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(AppState {
            daemon: daemon.clone(),
            cancel: cancel.clone(),
        });

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    let local_addr = listener.local_addr()?;

    let serve_cancel = cancel.clone();
    let shutdown_daemon = daemon.clone();
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                serve_cancel.cancelled().await;
            })
            .await;
        if let Err(err) = result {
            tracing::error!("listener error: {err}");
        }
        // Cancel any session still draining, so in-flight subprocesses get
        // their two-stage kill.
        shutdown_daemon.sessions.shutdown_all();
    });

    Ok(BoundServer {
        local_addr,
        cancel,
        daemon,
        task,
    })
}

#[derive(Clone)]
struct AppState {
    daemon: Arc<Daemon>,
    cancel: CancellationToken,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(WS_MESSAGE_CEILING)
        .max_frame_size(WS_MESSAGE_CEILING)
        .on_upgrade(move |socket| handle_socket(socket, state.daemon, state.cancel.child_token()))
}

async fn handle_socket(socket: WebSocket, daemon: Arc<Daemon>, cancel: CancellationToken) {
    let session_id = Uuid::new_v4();
    let (socket_tx, mut socket_rx) = socket.split();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<OutgoingMessage>();

    daemon.sessions.insert(
        session_id,
        SessionHandle {
            cancel: cancel.clone(),
            connected_at: Utc::now(),
        },
    );
    tracing::debug!("session {session_id} connected");

    let writer = tokio::spawn(write_socket(outgoing_rx, socket_tx));

    let mut processor = MessageProcessor::new(daemon.clone(), outgoing_tx, cancel.clone());
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = socket_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if processor.handle_text(text.as_str()).await == Flow::Close {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => processor.reject_binary(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong are handled by the transport
                Some(Err(err)) => {
                    tracing::debug!("session {session_id} read error: {err}");
                    break;
                }
            },
        }
    }

    // Disconnect cancels all in-flight work for this session.
    cancel.cancel();
    processor.shutdown();
    // Dropping the processor releases its half of the outgoing queue; the
    // writer exits once the last in-flight task drops its clone.
    drop(processor);
    if let Some(handle) = daemon.sessions.remove(&session_id) {
        let uptime = Utc::now().signed_duration_since(handle.connected_at);
        tracing::debug!("session {session_id} closed after {}s", uptime.num_seconds());
    }
    let _ = writer.await;
}

async fn write_socket(
    mut outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
    mut socket: futures_util::stream::SplitSink<WebSocket, Message>,
) {
    let mut stamper = SequenceStamper::default();
    while let Some(message) = outgoing.recv().await {
        if let OutgoingMessage::Close { code, reason } = message {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            break;
        }
        let Some(frame) = stamper.frame_for(message) else {
            continue;
        };
        let Ok(json) = serde_json::to_string(&frame) else {
            continue;
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

/// Stdio transport: one implicit session over stdin/stdout, one line per
/// frame. Authentication still runs; loopback is not implicit trust.
pub async fn run_stdio(options: ServeOptions) -> anyhow::Result<()> {
    use tokio::io::AsyncBufReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::io::BufReader;

    let cancel = CancellationToken::new();
    let daemon = Daemon::new(
        options.config,
        options.workspace,
        options.token,
        options.home,
    );
    daemon.start_background(&cancel);

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutgoingMessage>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut stamper = SequenceStamper::default();
        while let Some(message) = outgoing_rx.recv().await {
            if matches!(message, OutgoingMessage::Close { .. }) {
                break;
            }
            let Some(frame) = stamper.frame_for(message) else {
                continue;
            };
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if stdout.write_all(json.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut processor = MessageProcessor::new(daemon, outgoing_tx, cancel.clone());
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if processor.handle_text(&line).await == Flow::Close {
            break;
        }
    }

    cancel.cancel();
    processor.shutdown();
    drop(processor);
    let _ = writer.await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Install the global tracing subscriber per the `logging` config section.
/// `RUST_LOG` wins when set.
pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_filter()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json_logs {
        builder.json().init();
    } else if logging.timestamps {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// Daemon over a fresh exec-tier workspace with approvals disabled.
    pub(crate) fn test_daemon() -> (Arc<Daemon>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
version: 1
workspaces:
  - name: test
    path: {p}
    tier: exec
    allowVcs: true
approvals:
  requireWriteApproval: false
  requireExecApproval: false
"#,
            p = dir.path().display()
        );
        let config: outpost_core::config::ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        let config = Arc::new(Config::from_file(config).unwrap());
        let workspace = config.workspace(None).unwrap();
        let daemon = Daemon::new(
            config,
            workspace,
            outpost_core::token::generate_token(),
            dir.path().join("home"),
        );
        (daemon, dir)
    }
}
