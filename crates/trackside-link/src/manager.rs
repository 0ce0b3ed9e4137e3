//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Session manager enforcing a single active device connection."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use trackside_common::AppConfig;
use trackside_metrics::LinkMetrics;
use trackside_proto::{encode, Command, ControlRequest, LinkEvent, StatusEvent};
use uuid::Uuid;

use crate::session::{DeviceSession, SessionSettings, SessionStatus};
use crate::transport::{Connector, DeviceConnector, Endpoint};
use crate::LinkError;

struct Inner {
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    events: broadcast::Sender<LinkEvent>,
    metrics: Option<LinkMetrics>,
    active: Mutex<Option<DeviceSession>>,
}

/// Cloneable handle to the process-wide device session slot.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        connector: impl Connector,
        settings: SessionSettings,
        metrics: Option<LinkMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.broadcast_capacity);
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                settings,
                events,
                metrics,
                active: Mutex::new(None),
            }),
        }
    }

    /// Manager wired to real serial ports and the built-in emulator.
    pub fn from_config(config: &AppConfig, metrics: Option<LinkMetrics>) -> Self {
        Self::new(
            DeviceConnector::from_config(config),
            SessionSettings::from(&config.link),
            metrics,
        )
    }

    /// Receive every status and input event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: LinkEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Open `endpoint`, closing any current session first. The session starts
    /// in `Opening`; `status{open:true}` follows once the link is confirmed.
    pub async fn open(&self, endpoint: &str) -> Result<Uuid, LinkError> {
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            previous.close().await;
            self.publish(LinkEvent::Status(StatusEvent::closed()));
        }

        let endpoint: Endpoint = match endpoint.parse() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.report_open_failure(endpoint, &err);
                return Err(err);
            }
        };
        let connection = match self.inner.connector.connect(&endpoint).await {
            Ok(connection) => connection,
            Err(err) => {
                self.report_open_failure(endpoint.id(), &err);
                return Err(err);
            }
        };

        let session = DeviceSession::start(
            &endpoint,
            connection,
            self.inner.settings,
            self.inner.events.clone(),
            self.inner.metrics.clone(),
        );
        let session_id = session.session_id();
        *active = Some(session);
        Ok(session_id)
    }

    fn report_open_failure(&self, endpoint: &str, err: &LinkError) {
        warn!(endpoint, error = %err, "failed to open device endpoint");
        if let Some(metrics) = &self.inner.metrics {
            metrics.open_failed();
        }
        let message = match err {
            LinkError::EndpointOpenFailure { message, .. } => message.clone(),
            other => other.to_string(),
        };
        self.publish(LinkEvent::Status(
            StatusEvent::failed(message).with_endpoint(endpoint),
        ));
    }

    /// Close the active session, if any. Always publishes `status{open:false}`.
    pub async fn close(&self) {
        let session = self.inner.active.lock().await.take();
        match session {
            Some(session) => session.close().await,
            None => debug!("close requested without an active session"),
        }
        self.publish(LinkEvent::Status(StatusEvent::closed()));
    }

    /// Forward a command to the device. Writes are dropped unless the session
    /// is confirmed open.
    pub async fn write(&self, command: &Command) -> Result<(), LinkError> {
        let line = encode(command)?;
        let active = self.inner.active.lock().await;
        match active.as_ref() {
            Some(session) => session.enqueue(line),
            None => Err(LinkError::NotOpen),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let active = self.inner.active.lock().await;
        active
            .as_ref()
            .map(DeviceSession::status)
            .unwrap_or_else(SessionStatus::closed)
    }

    /// Broadcast the current status to every subscriber.
    pub async fn request_status(&self) {
        let status = self.status().await;
        self.publish(LinkEvent::Status(status.to_event()));
    }

    /// Dispatch a client request. Requests are one-way; failures are logged.
    pub async fn handle(&self, request: ControlRequest) {
        match request {
            ControlRequest::Open { endpoint } => {
                if let Ok(session_id) = self.open(&endpoint).await {
                    info!(%session_id, endpoint = %endpoint, "open requested by client");
                }
            }
            ControlRequest::Close => self.close().await,
            ControlRequest::Status => self.request_status().await,
            ControlRequest::Command { command } => match self.write(&command).await {
                Ok(()) => debug!(cmd = command.name(), "command forwarded"),
                Err(LinkError::NotOpen) => {
                    debug!(cmd = command.name(), "dropping command while session is not open")
                }
                Err(err) => warn!(cmd = command.name(), error = %err, "failed to forward command"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::{broadcast::error::TryRecvError, mpsc};
    use trackside_common::EmulatorConfig;
    use trackside_metrics::new_registry;
    use trackside_proto::Telemetry;

    use crate::session::SessionState;
    use crate::transport::Connection;

    /// Hands the device side of a fresh duplex pipe to the test.
    struct PipeConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self, _endpoint: &Endpoint) -> Result<Connection, LinkError> {
            let (host, device) = tokio::io::duplex(4096);
            self.peers
                .send(device)
                .map_err(|_| LinkError::ChannelClosed)?;
            Ok(Connection {
                stream: Box::new(host),
                emulator: None,
            })
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, LinkError> {
            Err(LinkError::EndpointOpenFailure {
                endpoint: endpoint.id().to_string(),
                message: "No such file or directory".into(),
            })
        }
    }

    fn pipe_manager() -> (SessionManager, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(
            PipeConnector { peers: tx },
            SessionSettings::default(),
            None,
        );
        (manager, rx)
    }

    const SAMPLE: &[u8] = b"{\"bemf\":0,\"target\":0,\"rate\":0,\"current\":0}\n";

    async fn feed(device: &mut DuplexStream, lines: &[&[u8]]) {
        for line in lines {
            device.write_all(line).await.unwrap();
        }
        device.flush().await.unwrap();
    }

    async fn next_status(events: &mut broadcast::Receiver<LinkEvent>) -> StatusEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event before timeout")
                .expect("channel open")
            {
                LinkEvent::Status(status) => return status,
                LinkEvent::Input(_) => continue,
            }
        }
    }

    async fn open_confirmed(
        manager: &SessionManager,
        peers: &mut mpsc::UnboundedReceiver<DuplexStream>,
        events: &mut broadcast::Receiver<LinkEvent>,
    ) -> DuplexStream {
        manager.open("/dev/ttyTEST").await.unwrap();
        let mut device = peers.recv().await.unwrap();
        feed(&mut device, &[SAMPLE; 5]).await;
        assert!(next_status(events).await.open);
        device
    }

    #[tokio::test]
    async fn confirms_after_consecutive_valid_frames() {
        let (manager, mut peers) = pipe_manager();
        let mut events = manager.subscribe();
        manager.open("/dev/ttyTEST").await.unwrap();
        let mut device = peers.recv().await.unwrap();

        feed(&mut device, &[SAMPLE, SAMPLE, SAMPLE, SAMPLE, b"{garbage\n", SAMPLE]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.status().await.state, SessionState::Opening);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        feed(&mut device, &[SAMPLE; 4]).await;
        let status = next_status(&mut events).await;
        assert!(status.open);
        assert_eq!(status.endpoint.as_deref(), Some("/dev/ttyTEST"));
        assert!(manager.status().await.open);

        feed(&mut device, &[b"{\"freeram\":1600}\r\n"]).await;
        match events.recv().await.unwrap() {
            LinkEvent::Input(Telemetry::Heartbeat(beat)) => assert_eq!(beat.freeram, 1600),
            other => panic!("unexpected {other:?}"),
        }
        manager.close().await;
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_record() {
        let (manager, mut peers) = pipe_manager();
        let mut first = manager.subscribe();
        let mut second = manager.subscribe();
        let mut device = open_confirmed(&manager, &mut peers, &mut first).await;
        assert!(next_status(&mut second).await.open);

        for i in 0..20 {
            let line = format!("{{\"turnouts\":{i}}}\n");
            feed(&mut device, &[line.as_bytes()]).await;
        }
        for subscriber in [&mut first, &mut second] {
            for i in 0..20u16 {
                match subscriber.recv().await.unwrap() {
                    LinkEvent::Input(Telemetry::Turnouts(count)) => assert_eq!(count.turnouts, i),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
        manager.close().await;
    }

    #[tokio::test]
    async fn writes_reach_device_only_when_open() {
        let (manager, mut peers) = pipe_manager();
        let mut events = manager.subscribe();
        assert!(matches!(
            manager.write(&Command::stop()).await,
            Err(LinkError::NotOpen)
        ));

        manager.open("/dev/ttyTEST").await.unwrap();
        let mut device = peers.recv().await.unwrap();
        assert!(matches!(
            manager.write(&Command::speed(10)).await,
            Err(LinkError::NotOpen)
        ));

        feed(&mut device, &[SAMPLE; 5]).await;
        assert!(next_status(&mut events).await.open);
        manager.write(&Command::speed(42)).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"speed\":42}\n");
        manager.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_always_reports_closed() {
        let (manager, _peers) = pipe_manager();
        let mut events = manager.subscribe();
        manager.close().await;
        manager.close().await;
        for _ in 0..2 {
            assert_eq!(next_status(&mut events).await, StatusEvent::closed());
        }
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(manager.status().await, SessionStatus::closed());
    }

    #[tokio::test]
    async fn open_failure_reports_error_status() {
        let registry = new_registry();
        let metrics = LinkMetrics::new(registry.clone()).unwrap();
        let manager = SessionManager::new(RefusingConnector, SessionSettings::default(), Some(metrics));
        let mut events = manager.subscribe();

        let err = manager.open("/dev/ttyMISSING").await.unwrap_err();
        assert!(matches!(err, LinkError::EndpointOpenFailure { .. }));
        let status = next_status(&mut events).await;
        assert!(!status.open);
        assert!(status.error);
        assert_eq!(status.message.as_deref(), Some("No such file or directory"));
        assert_eq!(manager.status().await.state, SessionState::Closed);

        let failures = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "trackside_open_failures_total")
            .unwrap();
        assert_eq!(failures.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[tokio::test]
    async fn device_hangup_is_reported_as_failure() {
        let (manager, mut peers) = pipe_manager();
        let mut events = manager.subscribe();
        let device = open_confirmed(&manager, &mut peers, &mut events).await;
        drop(device);

        let status = next_status(&mut events).await;
        assert!(!status.open);
        assert!(status.error);
        assert_eq!(manager.status().await.state, SessionState::Closed);
        manager.close().await;
    }

    #[tokio::test]
    async fn reopening_replaces_the_active_session() {
        let (manager, mut peers) = pipe_manager();
        let mut events = manager.subscribe();
        let _first = open_confirmed(&manager, &mut peers, &mut events).await;
        let second_id = manager.open("/dev/ttyOTHER").await.unwrap();
        assert_eq!(next_status(&mut events).await, StatusEvent::closed());
        let status = manager.status().await;
        assert_eq!(status.endpoint.as_deref(), Some("/dev/ttyOTHER"));
        assert_eq!(status.state, SessionState::Opening);
        assert!(!second_id.is_nil());
        manager.close().await;
    }

    #[tokio::test]
    async fn handle_dispatches_control_requests() {
        let (manager, mut peers) = pipe_manager();
        let mut events = manager.subscribe();
        manager
            .handle(ControlRequest::Open {
                endpoint: "/dev/ttyTEST".into(),
            })
            .await;
        let mut device = peers.recv().await.unwrap();
        feed(&mut device, &[SAMPLE; 5]).await;
        assert!(next_status(&mut events).await.open);

        manager.handle(ControlRequest::Status).await;
        assert!(next_status(&mut events).await.open);

        manager
            .handle(ControlRequest::Command {
                command: Command::forward(),
            })
            .await;
        let mut buf = vec![0u8; 32];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"dir\":\"f\"}\n");

        manager.handle(ControlRequest::Close).await;
        assert_eq!(next_status(&mut events).await, StatusEvent::closed());
    }

    #[tokio::test(start_paused = true)]
    async fn emulator_session_goes_quiet_after_close() {
        let config = EmulatorConfig {
            seed: 5,
            ..EmulatorConfig::default()
        };
        let manager = SessionManager::new(
            DeviceConnector::new(9600, config),
            SessionSettings::default(),
            None,
        );
        let mut events = manager.subscribe();
        manager.open("TEST").await.unwrap();
        let status = next_status(&mut events).await;
        assert!(status.open);
        assert_eq!(status.endpoint.as_deref(), Some("TEST"));

        manager.close().await;
        assert_eq!(next_status(&mut events).await, StatusEvent::closed());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }
}
