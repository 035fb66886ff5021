//! # Tracking Session
//!
//! Wires a position source, the durable queue and the uplink controller
//! into one start/stop unit.
//!
//! Each emitted sample is formatted and appended to the queue inside the
//! observer callback, before the next fix is read, and the controller is
//! woken afterwards. Stopping a session stops sampling and delivery but
//! leaves the queue untouched; whatever is still owed goes out on the next
//! start, in this process or the next one.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{QueueError, Result, SensorError};
use crate::position::{Position, PositionObserver, PositionSource, SensorProvider, SourceConfig};
use crate::protocol::format_position;
use crate::queue::{DurableQueue, SqliteQueue};
use crate::status::{StatusBus, StatusEvent};
use crate::transport::{DeliveryTransport, HttpTransport};
use crate::uplink::{BackoffPolicy, DeliverySlot, UplinkController, UplinkHandle, UplinkWaker};

/// Everything a session needs to know that is not a collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub device_id: String,
    pub server_url: String,
    pub source: SourceConfig,
    pub backoff: BackoffPolicy,
    pub enabled: bool,
    pub remote_control: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config, device_id: String) -> Self {
        Self {
            device_id,
            server_url: config.server.url.clone(),
            source: config.source_config(),
            backoff: config.backoff_policy(),
            enabled: config.tracking.enabled,
            remote_control: config.tracking.remote_control,
        }
    }
}

/// Command received from the server side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Send the next fix immediately, bypassing the filters
    pub request_position: bool,

    /// New sampling interval in seconds
    pub interval_s: Option<u64>,
}

/// Tracking session
pub struct TrackingSession {
    settings: SessionSettings,
    queue: Arc<dyn DurableQueue>,
    transport: Arc<dyn DeliveryTransport>,
    provider: Arc<dyn SensorProvider>,
    status: StatusBus,
    source: Option<PositionSource>,
    uplink: Option<UplinkHandle>,
    one_shots: Vec<PositionSource>,
    waker: UplinkWaker,
    slot: DeliverySlot,
}

impl std::fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingSession")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TrackingSession {
    pub fn new(
        settings: SessionSettings,
        queue: Arc<dyn DurableQueue>,
        transport: Arc<dyn DeliveryTransport>,
        provider: Arc<dyn SensorProvider>,
        status: StatusBus,
    ) -> Self {
        Self {
            settings,
            queue,
            transport,
            provider,
            status,
            source: None,
            uplink: None,
            one_shots: Vec::new(),
            waker: UplinkWaker::new(),
            slot: DeliverySlot::new(),
        }
    }

    /// Build a session from configuration with the SQLite queue and HTTP
    /// transport
    ///
    /// # Errors
    ///
    /// Returns error if the queue database cannot be opened, the device id
    /// cannot be resolved or the HTTP client cannot be built.
    pub fn open(
        config: &Config,
        provider: Arc<dyn SensorProvider>,
        status: StatusBus,
    ) -> Result<Self> {
        let queue = SqliteQueue::open(&config.storage.path)?;
        let device_id = config.resolve_device_id(&queue)?;
        let transport = HttpTransport::new(config.request_timeout(), config.uplink.method)?;
        info!("Tracking session for device {} -> {}", device_id, config.server.url);

        Ok(Self::new(
            SessionSettings::from_config(config, device_id),
            Arc::new(queue),
            Arc::new(transport),
            provider,
            status,
        ))
    }

    /// Start sampling and delivery
    ///
    /// A no-op when tracking is disabled or the session already runs.
    pub fn start(&mut self) {
        if !self.settings.enabled {
            info!("Tracking disabled, session not started");
            return;
        }
        if self.is_running() {
            debug!("Tracking session already running");
            return;
        }

        let uplink = UplinkController::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.transport),
            self.settings.backoff,
            self.status.clone(),
        )
        .with_waker(self.waker.clone())
        .with_slot(self.slot.clone())
        .start();

        let recorder = self.recorder(None);
        let mut source = PositionSource::new(Arc::clone(&self.provider), recorder);
        source.start_updates(self.settings.source);

        self.uplink = Some(uplink);
        self.source = Some(source);

        info!("Tracking session started");
        self.status.emit(StatusEvent::SessionStarted);
        if let Ok(depth) = self.queue.count() {
            self.status.emit(StatusEvent::QueueDepth(depth));
        }
    }

    /// Stop sampling and delivery; queued requests are kept
    ///
    /// Pending one-shot and alarm requests are cancelled too. On a session
    /// that is not running this does nothing, so requests made while
    /// stopped survive.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        for mut one_shot in self.one_shots.drain(..) {
            one_shot.stop_updates();
        }
        if let Some(mut source) = self.source.take() {
            source.stop_updates();
        }
        if let Some(uplink) = self.uplink.take() {
            uplink.stop();
        }

        info!("Tracking session stopped");
        self.status.emit(StatusEvent::SessionStopped);
    }

    pub fn is_running(&self) -> bool {
        self.uplink.is_some()
    }

    /// Queue one immediate position report
    ///
    /// Periodic sampling, if running, continues unaffected.
    pub fn request_position(&mut self) {
        match self.source.as_mut() {
            Some(source) => source.request_one_shot(),
            None => self.spawn_one_shot(None),
        }
    }

    /// Queue one immediate position report tagged with an alarm reason
    pub fn send_alarm(&mut self, alarm: &str) {
        warn!("Sending alarm '{}'", alarm);
        self.spawn_one_shot(Some(alarm.to_string()));
    }

    /// Replace the sampling configuration, applied in place when running
    pub fn reconfigure(&mut self, config: SourceConfig) {
        self.settings.source = config;
        if let Some(source) = self.source.as_mut() {
            source.start_updates(config);
        }
    }

    /// Apply a server-side command
    ///
    /// Returns `false` (and changes nothing) when remote control is off.
    pub fn apply_remote(&mut self, command: RemoteCommand) -> bool {
        if !self.settings.remote_control {
            warn!("Ignoring remote command {:?}: remote control disabled", command);
            return false;
        }

        info!("Applying remote command {:?}", command);
        if let Some(interval_s) = command.interval_s.filter(|s| *s > 0) {
            let config = SourceConfig {
                interval: Duration::from_secs(interval_s),
                ..self.settings.source
            };
            self.reconfigure(config);
        }
        if command.request_position {
            match self.source.as_ref() {
                Some(source) => source.request_direct_update(),
                None => self.spawn_one_shot(None),
            }
        }
        true
    }

    /// Number of requests still owed to the server
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be read.
    pub fn queue_depth(&self) -> std::result::Result<usize, QueueError> {
        self.queue.count()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }

    fn spawn_one_shot(&mut self, alarm: Option<String>) {
        self.one_shots.retain(PositionSource::is_one_shot_pending);

        let recorder = self.recorder(alarm);
        let mut source = PositionSource::new(Arc::clone(&self.provider), recorder);
        source.set_config(self.settings.source);
        source.request_one_shot();
        self.one_shots.push(source);
    }

    fn recorder(&self, alarm: Option<String>) -> Arc<Recorder> {
        Arc::new(Recorder {
            device_id: self.settings.device_id.clone(),
            server_url: self.settings.server_url.clone(),
            alarm,
            queue: Arc::clone(&self.queue),
            status: self.status.clone(),
            waker: self.waker.clone(),
        })
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Observer that turns samples into queued requests
struct Recorder {
    device_id: String,
    server_url: String,
    alarm: Option<String>,
    queue: Arc<dyn DurableQueue>,
    status: StatusBus,
    waker: UplinkWaker,
}

impl PositionObserver for Recorder {
    fn on_position(&self, position: Position) {
        let request = match format_position(
            &position,
            &self.device_id,
            &self.server_url,
            self.alarm.as_deref(),
        ) {
            Ok(request) => request,
            Err(e) => {
                error!("Dropping position: {}", e);
                self.status.emit(StatusEvent::FormatRejected(e));
                return;
            }
        };

        match self.queue.append(&request) {
            Ok(id) => {
                debug!("Queued request {} (direct: {})", id, position.is_direct());
                self.waker.wake();
                if let Ok(depth) = self.queue.count() {
                    self.status.emit(StatusEvent::QueueDepth(depth));
                }
            }
            Err(e) => {
                error!("Failed to queue position: {}", e);
                self.status.emit(StatusEvent::PersistenceFailed(e.to_string()));
            }
        }
    }

    fn on_sensor_error(&self, error: SensorError) {
        error!("Position sensor unavailable: {}", error);
        self.status.emit(StatusEvent::SensorUnavailable(error));
    }
}
