// ── Controller orchestration ──
//
// Wires the gateway, queue, transport and engine together, runs the
// sampling, heartbeat, prune and queue flush loops, and owns the shutdown
// sequence.
// Any background task that dies unexpectedly is reported as fatal, and
// the caller routes that into the same idempotent shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use edgectl_api::wire::{ControllerStatus, HeartbeatState, SensorBatch};
use edgectl_api::{BrokerLink, LinkEvent, LinkState, MqttSession};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::ControlCommand;
use crate::config::ControllerConfig;
use crate::engine::{ControlEngine, EngineState};
use crate::error::CoreError;
use crate::gateway::{DeviceGateway, DeviceIoError, TimeoutGateway};
use crate::model::SensorReading;
use crate::queue::PersistentQueue;
use crate::site::ConfigStore;
use crate::transport::{Delivery, MessageTransport};

const COMMAND_CHANNEL_SIZE: usize = 32;
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The top-level controller.
///
/// Cheaply cloneable. `start()` spawns the background loops; `shutdown()`
/// runs the fail-safe stop sequence exactly once no matter how many
/// times or from where it is called.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    store: Arc<ConfigStore>,
    gateway: Arc<dyn DeviceGateway>,
    queue: Arc<PersistentQueue>,
    transport: Arc<MessageTransport>,
    engine: ControlEngine,
    link_events: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    fatal: watch::Sender<Option<String>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Assemble a controller from already-built collaborators. Does not
    /// start anything; call [`start()`](Self::start).
    ///
    /// The gateway is wrapped so every device call is bounded by
    /// `config.io_timeout`.
    pub fn new(
        config: ControllerConfig,
        store: Arc<ConfigStore>,
        gateway: Arc<dyn DeviceGateway>,
        link: Arc<dyn BrokerLink>,
        link_events: mpsc::Receiver<LinkEvent>,
        queue: Arc<PersistentQueue>,
    ) -> Self {
        let gateway: Arc<dyn DeviceGateway> =
            Arc::new(TimeoutGateway::new(gateway, config.io_timeout));
        let transport = Arc::new(MessageTransport::new(
            link,
            Arc::clone(&queue),
            config.topics(),
            config.queue.drain_limit,
        ));
        let engine = ControlEngine::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&transport),
        );
        let (fatal, _) = watch::channel(None);

        Self {
            inner: Arc::new(ControllerInner {
                config,
                store,
                gateway,
                queue,
                transport,
                engine,
                link_events: Mutex::new(Some(link_events)),
                cancel: CancellationToken::new(),
                shutting_down: AtomicBool::new(false),
                fatal,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Open the persistent queue and an MQTT session described by
    /// `config`, then assemble the controller.
    pub async fn connect(
        config: ControllerConfig,
        store: Arc<ConfigStore>,
        gateway: Arc<dyn DeviceGateway>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let queue = Arc::new(match &config.queue.path {
            Some(path) => PersistentQueue::open(path).await?,
            None => PersistentQueue::in_memory().await?,
        });
        let session_config = config.session_config()?;
        let (session, events) = MqttSession::connect(&session_config, CancellationToken::new())?;
        Ok(Self::new(
            config,
            store,
            gateway,
            Arc::new(session),
            events,
            queue,
        ))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &ControlEngine {
        &self.inner.engine
    }

    pub fn transport(&self) -> &Arc<MessageTransport> {
        &self.inner.transport
    }

    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.inner.queue
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.transport.link_state()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the engine and spawn the background loops.
    pub async fn start(&self) -> Result<(), CoreError> {
        let events = self
            .inner
            .link_events
            .lock()
            .await
            .take()
            .ok_or_else(|| CoreError::Fatal("controller already started".into()))?;

        self.inner.engine.start().await?;

        let (command_tx, command_rx) = mpsc::channel::<ControlCommand>(COMMAND_CHANNEL_SIZE);
        let cancel = self.inner.cancel.clone();
        let mut tasks = JoinSet::new();

        tasks.spawn(Arc::clone(&self.inner.transport).run(events, command_tx, cancel.clone()));
        tasks.spawn(
            Arc::clone(&self.inner.transport)
                .run_flusher(self.inner.config.queue.retry_interval, cancel.clone()),
        );
        tasks.spawn(self.inner.engine.clone().run_commands(command_rx, cancel.clone()));
        tasks.spawn(timer_watch_task(self.clone(), cancel.clone()));
        tasks.spawn(sampling_task(self.clone(), cancel.clone()));
        tasks.spawn(heartbeat_task(self.clone(), cancel.clone()));
        tasks.spawn(prune_task(self.clone(), cancel.clone()));

        let ctrl = self.clone();
        *self.inner.supervisor.lock().await = Some(tokio::spawn(supervise(ctrl, tasks)));

        info!(
            controller = %self.inner.config.controller_id,
            sample_ms = self.inner.config.sample_interval.as_millis(),
            "controller started"
        );
        Ok(())
    }

    /// Resolves once a background task has failed unexpectedly, with a
    /// description of the failure.
    pub async fn fatal(&self) -> String {
        let mut rx = self.inner.fatal.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "fatal channel closed".into(),
        }
    }

    /// Flag a fatal condition from outside the controller.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "fatal error");
        self.inner.fatal.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Graceful, idempotent shutdown: stop the engine, force every
    /// actuator off, publish OFFLINE, disconnect, close the queue.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return;
        }
        info!("shutting down");
        let inner = &self.inner;

        if let Err(e) = inner.engine.stop().await {
            warn!(error = %e, "engine stop failed");
        }

        // No more samples, heartbeats or commands from here on.
        inner.cancel.cancel();
        if let Some(supervisor) = inner.supervisor.lock().await.take() {
            if tokio::time::timeout(TASK_DRAIN_TIMEOUT, supervisor).await.is_err() {
                warn!("background tasks did not stop in time");
            }
        }

        let switched_off = inner.engine.force_all_off().await;
        info!(actuators = switched_off, "outputs forced off");

        self.publish_heartbeat(HeartbeatState::Offline).await;
        inner.transport.disconnect().await;
        inner.queue.close().await;
        info!("shutdown complete");
    }

    // ── Loop bodies ──────────────────────────────────────────────────

    /// Read every sensor once, log and publish the batch, then evaluate
    /// rules against it. A failing sensor is skipped.
    pub async fn sample_once(&self) -> Vec<SensorReading> {
        let inner = &self.inner;
        let site = inner.store.current();
        let controller_id = &inner.config.controller_id;
        let mut readings = Vec::new();

        for device in site.sensors() {
            match inner.gateway.read_sensor(device).await {
                Ok(raw) => {
                    let value = device.scaling.apply(raw);
                    if !value.is_finite() {
                        let e = DeviceIoError::Read {
                            device: device.id.clone(),
                            reason: format!("non-finite reading {raw}"),
                        };
                        warn!(sensor = %device.id, error = %e, "sensor read failed");
                        continue;
                    }
                    readings.push(SensorReading::new(&device.id, value, controller_id));
                }
                Err(e) => warn!(sensor = %device.id, error = %e, "sensor read failed"),
            }
        }

        for reading in &readings {
            inner.queue.record_reading(reading).await;
        }

        if !readings.is_empty() {
            let batch = SensorBatch {
                controller_id: controller_id.clone(),
                readings: readings.iter().map(SensorReading::to_payload).collect(),
                timestamp: Utc::now(),
            };
            let topic = inner.transport.topics().sensor_data();
            if let Err(e) = inner.transport.publish_json(&topic, &batch).await {
                warn!(error = %e, "failed to publish sensor batch");
            }
        }

        let report = inner.engine.evaluate(&readings).await;
        if !report.fired.is_empty() || !report.failed.is_empty() {
            debug!(fired = ?report.fired, failed = ?report.failed, "evaluation pass");
        }
        readings
    }

    pub async fn publish_heartbeat(&self, status: HeartbeatState) -> Delivery {
        let config = &self.inner.config;
        let heartbeat = ControllerStatus::now(&config.controller_id, &config.name, status);
        let topic = self.inner.transport.topics().controller_status();
        match self.inner.transport.publish_json(&topic, &heartbeat).await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = %e, "failed to encode heartbeat");
                Delivery::Dropped
            }
        }
    }

    pub async fn prune_queue(&self) {
        match self.inner.queue.prune(self.inner.config.queue.retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "pruned sent messages"),
            Err(e) => warn!(error = %e, "queue prune failed"),
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sampling_task(ctrl: Controller, cancel: CancellationToken) {
    let mut interval = ticker(ctrl.inner.config.sample_interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if ctrl.inner.engine.state() == EngineState::Running {
                    ctrl.sample_once().await;
                }
            }
        }
    }
}

async fn heartbeat_task(ctrl: Controller, cancel: CancellationToken) {
    let mut interval = ticker(ctrl.inner.config.heartbeat_interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                ctrl.publish_heartbeat(HeartbeatState::Online).await;
            }
        }
    }
}

async fn prune_task(ctrl: Controller, cancel: CancellationToken) {
    let mut interval = ticker(ctrl.inner.config.queue.prune_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => ctrl.prune_queue().await,
        }
    }
}

/// Scheduled actions run on their own timer tasks; surface their panics
/// here so they take the same fatal path as the loops above.
async fn timer_watch_task(ctrl: Controller, cancel: CancellationToken) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        reason = ctrl.inner.engine.timer_fault() => {
            ctrl.report_fatal(reason);
            cancel.cancelled().await;
        }
    }
}

/// Join background tasks. A panic, or any task ending before shutdown
/// was requested, is reported as fatal.
async fn supervise(ctrl: Controller, mut tasks: JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        let cancelled = ctrl.inner.cancel.is_cancelled();
        match result {
            Err(e) if e.is_panic() => {
                ctrl.report_fatal(format!("background task panicked: {e}"));
            }
            Err(e) => debug!(error = %e, "background task aborted"),
            Ok(()) if !cancelled => {
                ctrl.report_fatal("background task exited unexpectedly");
            }
            Ok(()) => {}
        }
    }
    debug!("all background tasks finished");
}
