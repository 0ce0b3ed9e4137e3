//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Transports between the client facade and a session manager."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use trackside_link::SessionManager;
use trackside_proto::{ControlRequest, LinkEvent};

use crate::ClientError;

const EVENT_CAPACITY: usize = 256;

/// Bidirectional path to a session manager.
#[async_trait]
pub trait LinkChannel: Send + Sync + 'static {
    /// Deliver a one-way request.
    async fn send(&self, request: ControlRequest) -> Result<(), ClientError>;

    /// Events published by the session manager from now on.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    /// Flush outstanding requests and release the transport.
    async fn close(&self) {}
}

/// Channel bound directly to a [`SessionManager`] in the same process.
#[derive(Clone)]
pub struct LocalChannel {
    manager: SessionManager,
}

impl LocalChannel {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl LinkChannel for LocalChannel {
    async fn send(&self, request: ControlRequest) -> Result<(), ClientError> {
        self.manager.handle(request).await;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.manager.subscribe()
    }
}

/// Channel to a remote daemon's `/ws` endpoint.
pub struct WsChannel {
    requests: Mutex<Option<mpsc::UnboundedSender<ControlRequest>>>,
    events: broadcast::Sender<LinkEvent>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
}

impl WsChannel {
    /// Connect to `url`, e.g. `ws://127.0.0.1:7878/ws`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|source| ClientError::Connect {
                url: url.to_string(),
                source,
            })?;
        let (mut sink, mut source) = stream.split();
        let (requests, mut pending) = mpsc::unbounded_channel::<ControlRequest>();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(request) = pending.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to serialise control request");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let publisher = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<LinkEvent>(&text) {
                        Ok(event) => {
                            let _ = publisher.send(event);
                        }
                        Err(err) => debug!(error = %err, "ignoring unrecognised server frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!("websocket event stream ended");
        });

        Ok(Self {
            requests: Mutex::new(Some(requests)),
            events,
            writer: Mutex::new(Some(writer)),
            reader,
        })
    }
}

#[async_trait]
impl LinkChannel for WsChannel {
    async fn send(&self, request: ControlRequest) -> Result<(), ClientError> {
        match self.requests.lock().as_ref() {
            Some(requests) => requests
                .send(request)
                .map_err(|_| ClientError::ChannelClosed),
            None => Err(ClientError::ChannelClosed),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Drains queued requests, sends a close frame and stops reading.
    async fn close(&self) {
        drop(self.requests.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        self.reader.abort();
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        self.reader.abort();
    }
}
