//! ---
//! ts_section: "11-simulation-test-harness"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Async driver wiring the emulated controller to a byte stream."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use trackside_common::EmulatorConfig;
use trackside_proto::{encode_line, FramedLine, LineFramer, Telemetry};

use crate::device::EmulatedDevice;
use crate::EmulatorError;

const DUPLEX_CAPACITY: usize = 8 * 1024;

/// Spawns emulated controllers.
pub struct Emulator;

impl Emulator {
    /// Run an emulated controller on `stream` until shutdown or until the peer
    /// drops its end.
    pub fn spawn<S>(config: EmulatorConfig, stream: S) -> Result<EmulatorHandle, EmulatorError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let device = EmulatedDevice::new(config)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            match run(device, stream, shutdown_rx).await {
                Ok(()) => debug!("emulator stopped"),
                Err(EmulatorError::Io(err)) => debug!(error = %err, "emulator stream closed"),
                Err(err) => warn!(error = %err, "emulator stopped with error"),
            }
        });
        Ok(EmulatorHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Spawn an emulator on one end of an in-memory duplex pipe and return
    /// the other end.
    pub fn duplex(config: EmulatorConfig) -> Result<(DuplexStream, EmulatorHandle), EmulatorError> {
        let (host, device) = tokio::io::duplex(DUPLEX_CAPACITY);
        let handle = Self::spawn(config, device)?;
        Ok((host, handle))
    }
}

/// Handle owning the emulator task.
#[derive(Debug)]
pub struct EmulatorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EmulatorHandle {
    /// Cancel every emulator timer and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "emulator task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    records: &[Telemetry],
) -> Result<(), EmulatorError> {
    for record in records {
        writer.write_all(&encode_line(record)?).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn run<S>(
    mut device: EmulatedDevice,
    stream: S,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EmulatorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framer = LineFramer::default();
    let mut buf = [0u8; 512];

    let mut period = device.update_period();
    let mut telemetry = ticker(period);
    let mut heartbeat = ticker(device.config().heartbeat_interval);
    let mut ramp = ticker(device.config().ramp_interval);
    let settle_delay = device.config().settle_delay;
    let mut settle_at: Option<Instant> = None;

    info!(period_ms = period.as_millis() as u64, "emulated controller running");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!("emulator peer closed the stream");
                    break;
                }
                for frame in framer.push(&buf[..n]) {
                    let FramedLine::Line(line) = frame else {
                        continue;
                    };
                    let outcome = device.handle_line(&line);
                    if let Some(next) = outcome.retick {
                        period = next;
                        telemetry = ticker(period);
                        debug!(period_ms = period.as_millis() as u64, "emulator telemetry period changed");
                    }
                    if outcome.settle {
                        settle_at = Some(Instant::now() + settle_delay);
                        ramp.reset();
                    }
                    send(&mut writer, &outcome.replies).await?;
                }
            }
            _ = telemetry.tick() => {
                let sample = device.tick(period);
                send(&mut writer, std::slice::from_ref(&sample)).await?;
            }
            _ = heartbeat.tick() => {
                let beat = device.heartbeat();
                send(&mut writer, std::slice::from_ref(&beat)).await?;
            }
            _ = ramp.tick(), if device.is_ramping() => {
                device.ramp_step();
            }
            _ = time::sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                device.settle();
                settle_at = None;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use trackside_proto::{decode, Command, Direction, Sample};

    fn config() -> EmulatorConfig {
        EmulatorConfig {
            seed: 3,
            ..EmulatorConfig::default()
        }
    }

    async fn next_record<R: AsyncRead + Unpin>(lines: &mut tokio::io::Lines<BufReader<R>>) -> Telemetry {
        let line = lines.next_line().await.unwrap().expect("stream open");
        decode(line.as_bytes()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn emits_samples_on_the_configured_period() {
        let (host, handle) = Emulator::duplex(config()).unwrap();
        let (reader, _writer) = tokio::io::split(host);
        let mut lines = BufReader::new(reader).lines();

        let started = Instant::now();
        let mut samples = 0;
        while samples < 5 {
            if let Telemetry::Sample(_) = next_record(&mut lines).await {
                samples += 1;
            }
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed < Duration::from_millis(1600));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn speed_ramps_without_jumping() {
        let (host, handle) = Emulator::duplex(config()).unwrap();
        let (reader, mut writer) = tokio::io::split(host);
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{\"speed\":50}\n").await.unwrap();
        let mut rates = Vec::new();
        while rates.len() < 6 {
            if let Telemetry::Sample(Sample { rate, .. }) = next_record(&mut lines).await {
                rates.push(rate);
            }
        }
        assert!(rates[0] > 0 && rates[0] < 400, "{rates:?}");
        assert!(rates.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*rates.last().unwrap(), 400);

        writer.write_all(b"{\"dir\":\"s\"}\n").await.unwrap();
        let mut saw_echo = false;
        let mut last_rate = 400;
        for _ in 0..20 {
            match next_record(&mut lines).await {
                Telemetry::Direction(report) if report.dir == Direction::Stop => saw_echo = true,
                Telemetry::Sample(sample) => last_rate = sample.rate,
                _ => {}
            }
        }
        assert!(saw_echo);
        assert_eq!(last_rate, 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_all_timers() {
        let (host, handle) = Emulator::duplex(config()).unwrap();
        let (reader, mut writer) = tokio::io::split(host);
        writer
            .write_all(&trackside_proto::encode(&Command::speed(80)).unwrap())
            .await
            .unwrap();
        time::sleep(Duration::from_millis(700)).await;
        handle.shutdown().await;

        // Drain what was written before shutdown; the stream must then end.
        let mut lines = BufReader::new(reader).lines();
        while let Some(_line) = lines.next_line().await.unwrap() {}
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let bad = EmulatorConfig {
            buffer_size: 0,
            ..EmulatorConfig::default()
        };
        assert!(matches!(
            Emulator::duplex(bad),
            Err(EmulatorError::InvalidConfig(_))
        ));
    }
}
