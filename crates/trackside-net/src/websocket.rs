//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "WebSocket event channel relaying link events and control requests."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use trackside_link::SessionManager;
use trackside_proto::{ControlRequest, LinkEvent};

/// Builder for the client-facing server (`/ws` and `/healthz`).
#[derive(Clone)]
pub struct WebSocketServerBuilder {
    listen: SocketAddr,
    sessions: SessionManager,
}

impl WebSocketServerBuilder {
    /// Create a builder bound to `listen` serving `sessions`.
    pub fn new(listen: SocketAddr, sessions: SessionManager) -> Self {
        Self { listen, sessions }
    }

    /// Bind, spawn the server and return a shutdown handle.
    pub async fn spawn(self) -> anyhow::Result<WebSocketServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "websocket server listening");

        let app = Router::new()
            .route("/ws", get(upgrade_handler))
            .route("/healthz", get(healthz))
            .layer(TraceLayer::new_for_http())
            .with_state(self.sessions);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "websocket server exited with error");
            }
        });

        Ok(WebSocketServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle for the running server.
pub struct WebSocketServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WebSocketServerHandle {
    /// Return the bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Trigger graceful shutdown and await completion.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(sessions): State<SessionManager>,
) -> axum::response::Response {
    ws.on_upgrade(|socket| client_loop(socket, sessions))
}

/// Applies one client's requests in arrival order, off the socket loop so a
/// slow `open` never stalls event delivery.
fn spawn_dispatcher(sessions: SessionManager) -> (mpsc::UnboundedSender<ControlRequest>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlRequest>();
    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            sessions.handle(request).await;
        }
    });
    (tx, task)
}

async fn client_loop(mut socket: WebSocket, sessions: SessionManager) {
    let mut subscription = sessions.subscribe();
    let (requests, dispatcher) = spawn_dispatcher(sessions.clone());
    debug!("websocket client connected");

    let greeting = LinkEvent::Status(sessions.status().await.to_event());
    if send_event(&mut socket, &greeting).await.is_err() {
        dispatcher.abort();
        return;
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket client lagged behind; dropping events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    break;
                };

                match message {
                    Message::Text(text) => match serde_json::from_str::<ControlRequest>(&text) {
                        Ok(request) => {
                            if requests.send(request).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "invalid websocket control request"),
                    },
                    Message::Binary(_) => warn!("binary websocket frames are not supported"),
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    // Requests already received still apply; the dispatcher exits once drained.
    drop(requests);
    let _ = dispatcher.await;
    debug!("websocket client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &LinkEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to serialise link event");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await
}
