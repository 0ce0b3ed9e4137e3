//! ---
//! ts_section: "06-metrics-logging"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Metrics collection and export utilities."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener.local_addr()?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters describing the health of the device link.
#[derive(Clone, Debug)]
pub struct LinkMetrics {
    frames_decoded: IntCounter,
    frames_malformed: IntCounter,
    sessions_opened: IntCounter,
    open_failures: IntCounter,
    commands_written: IntCounter,
    link_open: IntGauge,
}

impl LinkMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let frames_decoded = IntCounter::with_opts(Opts::new(
            "trackside_frames_decoded_total",
            "Telemetry lines decoded from the device",
        ))?;
        registry.register(Box::new(frames_decoded.clone()))?;

        let frames_malformed = IntCounter::with_opts(Opts::new(
            "trackside_frames_malformed_total",
            "Inbound lines dropped because they could not be decoded",
        ))?;
        registry.register(Box::new(frames_malformed.clone()))?;

        let sessions_opened = IntCounter::with_opts(Opts::new(
            "trackside_sessions_opened_total",
            "Device sessions confirmed open",
        ))?;
        registry.register(Box::new(sessions_opened.clone()))?;

        let open_failures = IntCounter::with_opts(Opts::new(
            "trackside_open_failures_total",
            "Endpoint open attempts that failed",
        ))?;
        registry.register(Box::new(open_failures.clone()))?;

        let commands_written = IntCounter::with_opts(Opts::new(
            "trackside_commands_written_total",
            "Commands handed to the device transport",
        ))?;
        registry.register(Box::new(commands_written.clone()))?;

        let link_open = IntGauge::with_opts(Opts::new(
            "trackside_link_open",
            "Indicator (0/1) whether a device session is confirmed open",
        ))?;
        registry.register(Box::new(link_open.clone()))?;

        Ok(Self {
            frames_decoded,
            frames_malformed,
            sessions_opened,
            open_failures,
            commands_written,
            link_open,
        })
    }

    pub fn frame_decoded(&self) {
        self.frames_decoded.inc();
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed.inc();
    }

    pub fn session_opened(&self) {
        self.sessions_opened.inc();
        self.link_open.set(1);
    }

    pub fn session_closed(&self) {
        self.link_open.set(0);
    }

    pub fn open_failed(&self) {
        self.open_failures.inc();
    }

    pub fn command_written(&self) {
        self.commands_written.inc();
    }
}

pub use prometheus;
