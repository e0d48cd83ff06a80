//! ACGS-Sentinel: SIEM Shipper & Security Pipeline
//!
//! `log()` is fire-and-forget: events enter a bounded queue in O(1) and a
//! background worker formats and ships them in batches (by size or by
//! time). Overflow behavior honors `drop_on_overflow`; either way the
//! dropped counter moves. The [`SecurityPipeline`] is the sink the rest of
//! the system emits through: correlate, alert, then ship.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::alerts::{Alert, AlertManager};
use crate::correlation::Correlator;
use crate::event::{EventSink, SecurityEvent};
use crate::format::{format_event, SiemFormat, SiemMeta};

/// Errors from the shipping layer.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("ship failed: {0}")]
    ShipFailed(String),

    #[error("insecure SIEM endpoint {0}: TLS is required unless explicitly disabled")]
    InsecureEndpoint(String),
}

/// Transport the ship worker hands formatted batches to.
#[async_trait]
pub trait ShipTransport: Send + Sync {
    async fn ship(&self, batch: &[String]) -> Result<(), SentinelError>;
}

/// Ships batches to an HTTP collector as newline-delimited payloads.
/// TLS is required by default.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self, SentinelError> {
        Self::build(url.into(), false)
    }

    /// Permit a plaintext endpoint (lab use only).
    pub fn new_insecure(url: impl Into<String>) -> Result<Self, SentinelError> {
        Self::build(url.into(), true)
    }

    fn build(url: String, allow_insecure: bool) -> Result<Self, SentinelError> {
        if !allow_insecure && !url.starts_with("https://") {
            return Err(SentinelError::InsecureEndpoint(url));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SentinelError::ShipFailed(e.to_string()))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl ShipTransport for HttpTransport {
    async fn ship(&self, batch: &[String]) -> Result<(), SentinelError> {
        let body = batch.join("\n");
        let resp = self
            .client
            .post(&self.url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| SentinelError::ShipFailed(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SentinelError::ShipFailed(format!(
                "collector returned {}",
                resp.status()
            )))
        }
    }
}

/// Transport that writes each formatted event to the process log. The
/// default when no collector endpoint is configured.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl ShipTransport for LogTransport {
    async fn ship(&self, batch: &[String]) -> Result<(), SentinelError> {
        for line in batch {
            tracing::info!(target: "siem", "{line}");
        }
        Ok(())
    }
}

/// Shipper configuration.
#[derive(Debug, Clone)]
pub struct SiemConfig {
    pub queue_capacity: usize,
    pub drop_on_overflow: bool,
    pub format: SiemFormat,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub meta: SiemMeta,
}

impl Default for SiemConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            drop_on_overflow: true,
            format: SiemFormat::Json,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            meta: SiemMeta::default(),
        }
    }
}

/// Shipper and pipeline counters.
#[derive(Debug, Default)]
pub struct SiemMetrics {
    pub events_logged: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_shipped: AtomicU64,
    pub alerts_triggered: AtomicU64,
    pub correlations_detected: AtomicU64,
    pub ship_failures: AtomicU64,
    pub queue_size: AtomicU64,
}

/// Point-in-time snapshot of [`SiemMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiemMetricsSnapshot {
    pub events_logged: u64,
    pub events_dropped: u64,
    pub events_shipped: u64,
    pub alerts_triggered: u64,
    pub correlations_detected: u64,
    pub ship_failures: u64,
    pub queue_size: u64,
}

impl SiemMetrics {
    pub fn snapshot(&self) -> SiemMetricsSnapshot {
        SiemMetricsSnapshot {
            events_logged: self.events_logged.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_shipped: self.events_shipped.load(Ordering::Relaxed),
            alerts_triggered: self.alerts_triggered.load(Ordering::Relaxed),
            correlations_detected: self.correlations_detected.load(Ordering::Relaxed),
            ship_failures: self.ship_failures.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Event(Box<SecurityEvent>),
    Flush(oneshot::Sender<()>),
}

/// Bounded-queue, batching SIEM shipper.
pub struct SiemShipper {
    tx: mpsc::Sender<Command>,
    config: SiemConfig,
    metrics: Arc<SiemMetrics>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SiemShipper {
    /// Create the shipper and spawn its ship worker.
    pub fn spawn(config: SiemConfig, transport: Arc<dyn ShipTransport>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let metrics = Arc::new(SiemMetrics::default());
        let worker = tokio::spawn(Self::run_worker(
            rx,
            config.clone(),
            transport,
            Arc::clone(&metrics),
        ));
        Arc::new(Self {
            tx,
            config,
            metrics,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue an event. Returns in O(1); never blocks the caller.
    pub fn log(&self, event: SecurityEvent) {
        match self.tx.try_send(Command::Event(Box::new(event))) {
            Ok(()) => {
                self.metrics.events_logged.fetch_add(1, Ordering::Relaxed);
                self.update_queue_gauge();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The counter moves whether or not dropping was sanctioned.
                self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
                if self.config.drop_on_overflow {
                    tracing::debug!("siem queue saturated, event dropped");
                } else {
                    tracing::error!(
                        "siem queue saturated and drop_on_overflow is disabled; event lost"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn update_queue_gauge(&self) {
        let used = self.config.queue_capacity.saturating_sub(self.tx.capacity());
        self.metrics.queue_size.store(used as u64, Ordering::Relaxed);
    }

    /// Wait until everything enqueued so far has been shipped.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush, stop the worker, and wait for it to finish.
    pub async fn shutdown(&self) {
        self.flush().await;
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn metrics(&self) -> Arc<SiemMetrics> {
        Arc::clone(&self.metrics)
    }

    async fn run_worker(
        mut rx: mpsc::Receiver<Command>,
        config: SiemConfig,
        transport: Arc<dyn ShipTransport>,
        metrics: Arc<SiemMetrics>,
    ) {
        let mut batch: Vec<String> = Vec::with_capacity(config.batch_size);
        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(Command::Event(event)) => {
                            batch.push(format_event(&event, &config.meta, config.format));
                            if batch.len() >= config.batch_size {
                                Self::ship_batch(&transport, &mut batch, &metrics).await;
                            }
                        }
                        Some(Command::Flush(done)) => {
                            Self::ship_batch(&transport, &mut batch, &metrics).await;
                            let _ = done.send(());
                        }
                        None => {
                            Self::ship_batch(&transport, &mut batch, &metrics).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    Self::ship_batch(&transport, &mut batch, &metrics).await;
                }
            }
        }
    }

    async fn ship_batch(
        transport: &Arc<dyn ShipTransport>,
        batch: &mut Vec<String>,
        metrics: &SiemMetrics,
    ) {
        if batch.is_empty() {
            return;
        }
        let outgoing = std::mem::take(batch);
        match transport.ship(&outgoing).await {
            Ok(()) => {
                metrics
                    .events_shipped
                    .fetch_add(outgoing.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                metrics.ship_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, lost = outgoing.len(), "siem ship failed");
            }
        }
    }
}

/// The sink the rest of the system emits through: correlation, alerting,
/// then shipping, in that order.
pub struct SecurityPipeline {
    correlator: Correlator,
    alerts: AlertManager,
    shipper: Arc<SiemShipper>,
    fingerprint: Option<String>,
    on_alert: parking_lot::RwLock<Option<Box<dyn Fn(Alert) + Send + Sync>>>,
}

impl SecurityPipeline {
    pub fn new(correlator: Correlator, alerts: AlertManager, shipper: Arc<SiemShipper>) -> Self {
        Self {
            correlator,
            alerts,
            shipper,
            fingerprint: None,
            on_alert: parking_lot::RwLock::new(None),
        }
    }

    /// Stamp this fingerprint onto events that arrive without one.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Install a callback invoked for every fired alert.
    pub fn set_alert_handler(&self, handler: impl Fn(Alert) + Send + Sync + 'static) {
        *self.on_alert.write() = Some(Box::new(handler));
    }

    pub fn metrics(&self) -> Arc<SiemMetrics> {
        self.shipper.metrics()
    }

    pub async fn flush(&self) {
        self.shipper.flush().await;
    }

    pub async fn shutdown(&self) {
        self.shipper.shutdown().await;
    }
}

impl EventSink for SecurityPipeline {
    fn emit(&self, mut event: SecurityEvent) {
        if event.fingerprint.is_empty() {
            if let Some(fp) = &self.fingerprint {
                event.fingerprint = fp.clone();
            }
        }
        let metrics = self.shipper.metrics();
        let before = self.correlator.detected_total();
        if event.correlation_id.is_none() {
            if let Some(id) = self.correlator.observe(&event) {
                event.correlation_id = Some(id);
            }
        }
        let newly_detected = self.correlator.detected_total() - before;
        if newly_detected > 0 {
            metrics
                .correlations_detected
                .fetch_add(newly_detected, Ordering::Relaxed);
        }

        if let Some(alert) = self.alerts.observe(&event) {
            metrics.alerts_triggered.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event_type = %alert.event_type,
                level = ?alert.level,
                observed = alert.observed,
                "alert triggered"
            );
            if let Some(handler) = self.on_alert.read().as_ref() {
                handler(alert);
            }
        }

        self.shipper.log(event);
    }
}
