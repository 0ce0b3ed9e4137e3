//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "One device session: reader/writer tasks and link confirmation."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use trackside_common::LinkConfig;
use trackside_metrics::LinkMetrics;
use trackside_proto::{decode, FramedLine, LineFramer, LinkEvent, StatusEvent};
use trackside_sim::EmulatorHandle;
use uuid::Uuid;

use crate::transport::{Connection, Endpoint};
use crate::LinkError;

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    /// Transport is up; waiting for enough valid frames to trust the link.
    Opening,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub open: bool,
    pub endpoint: Option<String>,
    pub state: SessionState,
}

impl SessionStatus {
    pub fn closed() -> Self {
        Self {
            open: false,
            endpoint: None,
            state: SessionState::Closed,
        }
    }

    pub fn to_event(&self) -> StatusEvent {
        let event = match self.state {
            SessionState::Open => StatusEvent {
                open: true,
                ..StatusEvent::default()
            },
            SessionState::Opening => StatusEvent {
                message: Some(String::from("opening")),
                ..StatusEvent::default()
            },
            SessionState::Closed => StatusEvent::closed(),
        };
        match &self.endpoint {
            Some(endpoint) => event.with_endpoint(endpoint.clone()),
            None => event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub confirm_frames: u32,
    pub write_queue: usize,
    pub max_line_length: usize,
    pub broadcast_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for SessionSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            confirm_frames: config.confirm_frames.max(1),
            write_queue: config.write_queue.max(1),
            max_line_length: config.max_line_length,
            broadcast_capacity: config.broadcast_capacity.max(1),
        }
    }
}

/// State shared between the session handle and its tasks.
struct Shared {
    session_id: Uuid,
    endpoint: String,
    state: Mutex<SessionState>,
    events: broadcast::Sender<LinkEvent>,
    metrics: Option<LinkMetrics>,
    shutdown: broadcast::Sender<()>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn publish(&self, event: LinkEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn confirm(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Opening {
                return;
            }
            *state = SessionState::Open;
        }
        info!(session_id = %self.session_id, endpoint = %self.endpoint, "device session open");
        if let Some(metrics) = &self.metrics {
            metrics.session_opened();
        }
        self.publish(LinkEvent::Status(StatusEvent::opened(self.endpoint.clone())));
    }

    /// Terminal transport failure: close once, report it, stop the sibling task.
    fn fail(&self, message: String) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        warn!(session_id = %self.session_id, endpoint = %self.endpoint, %message, "device session failed");
        if let Some(metrics) = &self.metrics {
            metrics.session_closed();
        }
        self.publish(LinkEvent::Status(
            StatusEvent::failed(message).with_endpoint(self.endpoint.clone()),
        ));
        let _ = self.shutdown.send(());
    }
}

/// A live connection. Dropping it without [`DeviceSession::close`] leaves the
/// tasks running until the transport fails; the manager always closes.
pub(crate) struct DeviceSession {
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    emulator: Option<EmulatorHandle>,
}

impl DeviceSession {
    pub(crate) fn start(
        endpoint: &Endpoint,
        connection: Connection,
        settings: SessionSettings,
        events: broadcast::Sender<LinkEvent>,
        metrics: Option<LinkMetrics>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let (shutdown, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            session_id,
            endpoint: endpoint.id().to_string(),
            state: Mutex::new(SessionState::Opening),
            events,
            metrics,
            shutdown,
        });

        let span = info_span!("device_session", session_id = %session_id, endpoint = %endpoint);
        let (read_half, write_half) = tokio::io::split(connection.stream);
        let (writer_tx, writer_rx) = mpsc::channel(settings.write_queue);

        let reader = tokio::spawn(
            read_loop(
                read_half,
                shared.clone(),
                settings,
                shared.shutdown.subscribe(),
            )
            .instrument(span.clone()),
        );
        let writer = tokio::spawn(
            write_loop(
                write_half,
                writer_rx,
                shared.clone(),
                shared.shutdown.subscribe(),
            )
            .instrument(span),
        );

        info!(session_id = %session_id, endpoint = %endpoint, "device session opening");
        Self {
            shared,
            writer_tx,
            reader,
            writer,
            emulator: connection.emulator,
        }
    }

    pub(crate) fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub(crate) fn status(&self) -> SessionStatus {
        let state = self.shared.state();
        SessionStatus {
            open: state == SessionState::Open,
            endpoint: Some(self.shared.endpoint.clone()),
            state,
        }
    }

    /// Queue an encoded line for the writer task.
    pub(crate) fn enqueue(&self, line: Vec<u8>) -> Result<(), LinkError> {
        if self.shared.state() != SessionState::Open {
            return Err(LinkError::NotOpen);
        }
        self.writer_tx.try_send(line).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => LinkError::WriteQueueFull,
            mpsc::error::TrySendError::Closed(_) => LinkError::ChannelClosed,
        })?;
        if let Some(metrics) = &self.shared.metrics {
            metrics.command_written();
        }
        Ok(())
    }

    /// Stop both tasks and the emulator timers, and wait for all of them.
    pub(crate) async fn close(self) {
        let Self {
            shared,
            writer_tx,
            reader,
            writer,
            emulator,
        } = self;
        let _ = shared.shutdown.send(());
        drop(writer_tx);
        for (name, task) in [("reader", reader), ("writer", writer)] {
            if let Err(err) = task.await {
                error!(session_id = %shared.session_id, task = name, error = %err, "session task join error");
            }
        }
        if let Some(emulator) = emulator {
            emulator.shutdown().await;
        }
        let was_open = {
            let mut state = shared.state.lock();
            std::mem::replace(&mut *state, SessionState::Closed) == SessionState::Open
        };
        if was_open {
            if let Some(metrics) = &shared.metrics {
                metrics.session_closed();
            }
        }
        info!(session_id = %shared.session_id, endpoint = %shared.endpoint, "device session closed");
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    settings: SessionSettings,
    mut shutdown: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new(settings.max_line_length);
    let mut buf = [0u8; READ_CHUNK];
    let mut consecutive: u32 = 0;

    loop {
        let read = tokio::select! {
            _ = shutdown.recv() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                shared.fail(String::from("device closed the connection"));
                break;
            }
            Ok(n) => n,
            Err(err) => {
                shared.fail(format!("read failed: {err}"));
                break;
            }
        };

        for frame in framer.push(&buf[..n]) {
            let line = match frame {
                FramedLine::Line(line) => line,
                FramedLine::Overflow { discarded } => {
                    debug!(discarded, "dropped oversized frame");
                    if let Some(metrics) = &shared.metrics {
                        metrics.frame_malformed();
                    }
                    consecutive = 0;
                    continue;
                }
            };
            match decode(&line) {
                Ok(record) => {
                    if let Some(metrics) = &shared.metrics {
                        metrics.frame_decoded();
                    }
                    match shared.state() {
                        SessionState::Open => shared.publish(LinkEvent::Input(record)),
                        SessionState::Opening => {
                            consecutive += 1;
                            if consecutive >= settings.confirm_frames {
                                shared.confirm();
                            }
                        }
                        SessionState::Closed => {}
                    }
                }
                Err(err) if err.is_empty_frame() => {}
                Err(err) => {
                    debug!(error = %err, "dropped malformed frame");
                    if let Some(metrics) = &shared.metrics {
                        metrics.frame_malformed();
                    }
                    consecutive = 0;
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = shutdown.recv() => break,
            next = queue.recv() => match next {
                Some(line) => line,
                None => break,
            },
        };
        let result = tokio::select! {
            _ = shutdown.recv() => break,
            result = write_line(&mut writer, &line) => result,
        };
        if let Err(err) = result {
            shared.fail(format!("write failed: {err}"));
            break;
        }
        debug!(bytes = line.len(), "command written");
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}
