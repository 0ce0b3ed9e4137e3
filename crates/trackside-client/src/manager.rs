//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Client facade tracking link state and governing command delivery."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use trackside_common::{AppConfig, ThrottleConfig};
use trackside_control::{CommandSink, ControlError, Governor, Outcome, ThrottlePolicy};
use trackside_link::SessionManager;
use trackside_proto::{
    AccessoryCommand, AccessoryOp, Command, ControlRequest, DeviceQuery, LinkEvent, ParamSetting,
    PidParams, RelayCommand, RelayOp, Telemetry, MAX_SPEED,
};

use crate::channel::{LinkChannel, LocalChannel, WsChannel};
use crate::ClientError;

#[derive(Debug, Default)]
struct ClientState {
    connected: bool,
    endpoint: Option<String>,
    pid: Option<PidParams>,
    pid_pending: Option<PidParams>,
    turnouts: Option<u16>,
    relays: Option<u16>,
}

impl ClientState {
    fn forget_device(&mut self) {
        self.connected = false;
        self.endpoint = None;
        self.pid_pending = None;
        self.turnouts = None;
        self.relays = None;
    }
}

struct Inner {
    channel: Arc<dyn LinkChannel>,
    state: Mutex<ClientState>,
    events: broadcast::Sender<LinkEvent>,
    last_input: Mutex<Instant>,
    pid: Governor,
    speed: Governor,
    reply_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct ChannelSink(Arc<dyn LinkChannel>);

#[async_trait]
impl CommandSink for ChannelSink {
    async fn send(&self, command: Command) -> Result<(), ControlError> {
        self.0
            .send(ControlRequest::Command { command })
            .await
            .map_err(|err| match err {
                ClientError::ChannelClosed => ControlError::ChannelClosed,
                other => ControlError::Delivery(other.to_string()),
            })
    }
}

/// Client-side view of one device link.
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<Inner>,
}

impl LinkManager {
    /// Wrap `channel`. PID edits are throttled and acknowledged, speed edits
    /// only throttled. The watchdog re-requests status after `watchdog` of
    /// silence.
    pub fn new(channel: Arc<dyn LinkChannel>, throttle: &ThrottleConfig, watchdog: Duration) -> Self {
        let sink: Arc<dyn CommandSink> = Arc::new(ChannelSink(channel.clone()));
        let pid = Governor::spawn("pid", ThrottlePolicy::acknowledged(throttle), sink.clone());
        let speed = Governor::spawn("speed", ThrottlePolicy::fire_and_forget(throttle), sink);
        let (events, _) = broadcast::channel(256);
        let upstream = channel.subscribe();
        let manager = Self {
            inner: Arc::new(Inner {
                channel,
                state: Mutex::new(ClientState::default()),
                events,
                last_input: Mutex::new(Instant::now()),
                pid,
                speed,
                reply_timeout: throttle.ack_timeout,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let pump = tokio::spawn(pump(Arc::downgrade(&manager.inner), upstream, manager.inner.pid.subscribe()));
        let dog = tokio::spawn(watchdog_loop(Arc::downgrade(&manager.inner), watchdog));
        manager.inner.tasks.lock().extend([pump, dog]);
        manager
    }

    /// Connect to a remote daemon.
    pub async fn connect(url: &str, config: &AppConfig) -> Result<Self, ClientError> {
        let channel = WsChannel::connect(url).await?;
        info!(url, "connected to link daemon");
        let manager = Self::new(Arc::new(channel), &config.throttle, config.watchdog.interval);
        // The greeting may race the subscription above; ask again.
        manager.request_status().await?;
        Ok(manager)
    }

    /// Drive an in-process session manager.
    pub fn local(sessions: SessionManager, config: &AppConfig) -> Self {
        Self::new(
            Arc::new(LocalChannel::new(sessions)),
            &config.throttle,
            config.watchdog.interval,
        )
    }

    pub async fn open_endpoint(&self, endpoint: &str) -> Result<(), ClientError> {
        self.request(ControlRequest::Open {
            endpoint: endpoint.to_string(),
        })
        .await
    }

    pub async fn close_endpoint(&self) -> Result<(), ClientError> {
        self.request(ControlRequest::Close).await
    }

    /// Ask the daemon to broadcast its current status.
    pub async fn request_status(&self) -> Result<(), ClientError> {
        self.request(ControlRequest::Status).await
    }

    /// Device command builder.
    pub fn command(&self) -> Commands<'_> {
        Commands { manager: self }
    }

    /// Whether the last status reported an open link.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn endpoint(&self) -> Option<String> {
        self.inner.state.lock().endpoint.clone()
    }

    /// Last PID set confirmed by the device, either acknowledged or read back.
    pub fn pid(&self) -> Option<PidParams> {
        self.inner.state.lock().pid
    }

    /// True while a PID edit waits for its acknowledgement.
    pub fn pid_pending(&self) -> bool {
        self.inner.state.lock().pid_pending.is_some()
    }

    /// Status and input events, after the manager has applied them.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// Delivery outcomes of PID edits, including `Exhausted` warnings.
    pub fn pid_outcomes(&self) -> broadcast::Receiver<Outcome<Command>> {
        self.inner.pid.subscribe()
    }

    /// Number of turnout decoders, asked once per connection.
    pub async fn turnout_count(&self) -> Result<u16, ClientError> {
        if let Some(count) = self.inner.state.lock().turnouts {
            return Ok(count);
        }
        self.query(DeviceQuery::Turnouts, "turnout count", |telemetry| match telemetry {
            Telemetry::Turnouts(reply) => Some(reply.turnouts),
            _ => None,
        })
        .await
    }

    /// Number of relays, asked once per connection.
    pub async fn relay_count(&self) -> Result<u16, ClientError> {
        if let Some(count) = self.inner.state.lock().relays {
            return Ok(count);
        }
        self.query(DeviceQuery::Relays, "relay count", |telemetry| match telemetry {
            Telemetry::Relays(reply) => Some(reply.relays),
            _ => None,
        })
        .await
    }

    /// Wait until the link reports open, or `limit` elapses.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), ClientError> {
        let mut events = self.subscribe();
        if self.is_connected() {
            return Ok(());
        }
        let deadline = Instant::now() + limit;
        loop {
            match timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(ClientError::Timeout("link to open")),
                Ok(Err(RecvError::Closed)) => return Err(ClientError::ChannelClosed),
                Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Ok(LinkEvent::Status(status))) if status.open => return Ok(()),
                Ok(Ok(_)) => {}
            }
        }
    }

    /// Stop background tasks, flush commands already released by the
    /// governors and close the channel.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.pid.shutdown().await;
        self.inner.speed.shutdown().await;
        self.inner.channel.close().await;
    }

    async fn request(&self, request: ControlRequest) -> Result<(), ClientError> {
        self.inner.channel.send(request).await
    }

    async fn write(&self, command: Command) -> Result<(), ClientError> {
        self.request(ControlRequest::Command { command }).await
    }

    async fn query<T>(
        &self,
        query: DeviceQuery,
        what: &'static str,
        pick: impl Fn(&Telemetry) -> Option<T>,
    ) -> Result<T, ClientError> {
        let mut events = self.subscribe();
        self.write(Command::Get(query)).await?;
        let deadline = Instant::now() + self.inner.reply_timeout;
        loop {
            match timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(ClientError::Timeout(what)),
                Ok(Err(RecvError::Closed)) => return Err(ClientError::ChannelClosed),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(skipped, "reply wait lagged behind event stream");
                }
                Ok(Ok(LinkEvent::Input(telemetry))) => {
                    if let Some(value) = pick(&telemetry) {
                        return Ok(value);
                    }
                }
                Ok(Ok(LinkEvent::Status(_))) => {}
            }
        }
    }
}

/// Borrowed command builder returned by [`LinkManager::command`].
pub struct Commands<'a> {
    manager: &'a LinkManager,
}

impl Commands<'_> {
    pub async fn forward(&self) -> Result<(), ClientError> {
        self.manager.write(Command::forward()).await
    }

    pub async fn backward(&self) -> Result<(), ClientError> {
        self.manager.write(Command::backward()).await
    }

    /// Stop immediately and drop any speed edit still waiting for its slot.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.manager.inner.speed.preempt(Command::stop())?;
        Ok(())
    }

    /// Throttled speed edit in percent.
    pub fn speed(&self, percent: u8) -> Result<(), ClientError> {
        if percent > MAX_SPEED {
            return Err(ClientError::OutOfRange {
                what: "speed",
                value: u32::from(percent),
            });
        }
        self.manager.inner.speed.submit(Command::speed(percent))?;
        Ok(())
    }

    /// Throttled, acknowledged PID edit.
    pub fn set_pid(&self, kp: f64, ki: f64, kd: f64, sample_ms: u32) -> Result<(), ClientError> {
        let params = PidParams::new(kp, ki, kd, sample_ms);
        self.manager.inner.state.lock().pid_pending = Some(params);
        self.manager.inner.pid.submit(Command::Pid(params))?;
        Ok(())
    }

    /// Read the PID set back; the reply updates [`LinkManager::pid`].
    pub async fn get_pid(&self) -> Result<(), ClientError> {
        self.manager.write(Command::Get(DeviceQuery::Pid)).await
    }

    pub async fn get_prop(&self, name: &str) -> Result<(), ClientError> {
        let query: DeviceQuery = name
            .parse()
            .map_err(|_| ClientError::UnsupportedCommand(format!("get {name}")))?;
        self.manager.write(Command::Get(query)).await
    }

    pub async fn set_prop(&self, name: &str, value: u32) -> Result<(), ClientError> {
        let setting = ParamSetting::from_name(name, value)
            .ok_or_else(|| ClientError::UnsupportedCommand(format!("set {name}")))?;
        self.manager.write(Command::Set(setting)).await
    }

    pub async fn accessory(&self, id: u16, port: u8, op: AccessoryOp) -> Result<(), ClientError> {
        self.manager
            .write(Command::Acc(AccessoryCommand { id, port, cmd: op }))
            .await
    }

    pub async fn relay(&self, id: u16, op: RelayOp) -> Result<(), ClientError> {
        self.manager
            .write(Command::Rel(RelayCommand { id, cmd: op }))
            .await
    }

    /// Request the power-on self test verdict.
    pub async fn self_test(&self) -> Result<(), ClientError> {
        self.manager.write(Command::Get(DeviceQuery::Post)).await
    }

    pub async fn ports(&self) -> Result<(), ClientError> {
        self.manager.write(Command::Get(DeviceQuery::Ports)).await
    }
}

async fn pump(
    inner: std::sync::Weak<Inner>,
    mut upstream: broadcast::Receiver<LinkEvent>,
    mut pid_outcomes: broadcast::Receiver<Outcome<Command>>,
) {
    loop {
        tokio::select! {
            event = upstream.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client lagged behind link events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else { break };
                apply(&inner, &event);
                let _ = inner.events.send(event);
            }
            outcome = pid_outcomes.recv() => {
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else { break };
                record_pid_outcome(&inner, &outcome);
            }
        }
    }
    debug!("client event pump stopped");
}

fn apply(inner: &Inner, event: &LinkEvent) {
    match event {
        LinkEvent::Status(status) => {
            let mut state = inner.state.lock();
            if status.open {
                state.connected = true;
                state.endpoint = status.endpoint.clone();
            } else {
                let was_connected = state.connected;
                state.forget_device();
                drop(state);
                if was_connected {
                    let _ = inner.pid.reset();
                    let _ = inner.speed.reset();
                }
            }
        }
        LinkEvent::Input(telemetry) => {
            *inner.last_input.lock() = Instant::now();
            match telemetry {
                Telemetry::Ack(ack) => {
                    inner.pid.observe_ack(ack);
                }
                Telemetry::Pid(params) => inner.state.lock().pid = Some(*params),
                Telemetry::Turnouts(reply) => inner.state.lock().turnouts = Some(reply.turnouts),
                Telemetry::Relays(reply) => inner.state.lock().relays = Some(reply.relays),
                _ => {}
            }
        }
    }
}

fn record_pid_outcome(inner: &Inner, outcome: &Outcome<Command>) {
    let mut state = inner.state.lock();
    match outcome {
        Outcome::Acknowledged {
            command: Command::Pid(params),
        } => {
            state.pid = Some(*params);
            if state.pid_pending.as_ref() == Some(params) {
                state.pid_pending = None;
            }
        }
        Outcome::Exhausted { .. } => {
            if let Some(err) = outcome.as_error() {
                warn!(error = %err, "pid update was not confirmed by the device");
            }
            state.pid_pending = None;
        }
        _ => {}
    }
}

async fn watchdog_loop(inner: std::sync::Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        let silent_for = inner.last_input.lock().elapsed();
        if silent_for >= period {
            debug!(silent_ms = silent_for.as_millis() as u64, "no input from link, requesting status");
            if inner.channel.send(ControlRequest::Status).await.is_err() {
                break;
            }
        }
    }
}
