//! # Overwatcher
//!
//! Unattended supervision of the observatory. A tick every few seconds
//! refreshes the weather, the alerts, the ephemeris and the observing
//! status, then decides whether to open, observe, stop or close.

pub mod dome;
pub mod events;
pub mod notifier;
pub mod observer;
pub mod sources;

use crate::{
    actor::{Args, RemoteActor},
    config::{Config, OverwatcherConfig, WeatherLimits},
    observatory::Observatory,
    Error, Result,
};
use chrono::{DateTime, Utc};
use dome::DomeHelper;
use events::{Event, EventRecorder, EventStore, FileEventStore};
use notifier::{Level, Notification, NotificationSink, Notifier};
use observer::ObserverOverwatcher;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sources::{AlertsMonitor, AlertsSource, Ephemeris, EphemerisSource, OpsApi, WeatherSource};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

static INSTANCE: OnceCell<Arc<Overwatcher>> = OnceCell::new();

/// The supervision state, as of the last tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverwatcherState {
    pub running: bool,
    pub enabled: bool,
    pub observing: bool,
    pub calibrating: bool,
    pub night: bool,
    pub safe: bool,
    pub allow_dome_calibrations: bool,
    pub dry_run: bool,
}

/// How to stop an observation at daybreak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaytimeStop {
    /// Let the current exposure finish
    Graceful,
    Immediate,
}

/// An exposure ending within `threshold` seconds is allowed to finish
pub fn daytime_stop_mode(remaining: Option<f64>, threshold: f64) -> DaytimeStop {
    match remaining {
        Some(remaining) if remaining <= threshold => DaytimeStop::Graceful,
        _ => DaytimeStop::Immediate,
    }
}

/// The calibration sequence currently in control of the dome, if any
#[derive(Debug, Default)]
pub struct CalibrationTracker {
    running: Mutex<Option<String>>,
}
impl CalibrationTracker {
    pub fn begin(&self, name: impl Into<String>) {
        *self.running.lock() = Some(name.into());
    }
    pub fn end(&self) {
        *self.running.lock() = None;
    }
    pub fn running(&self) -> Option<String> {
        self.running.lock().clone()
    }
}

/// External services the overwatcher depends on
pub struct Services {
    pub weather: Arc<dyn WeatherSource>,
    pub alerts: Arc<dyn AlertsSource>,
    pub ephemeris: Arc<dyn EphemerisSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub events: Arc<dyn EventStore>,
}
impl Services {
    /// The operations API for weather, alerts, ephemeris and notifications, events to a file
    pub fn from_config(config: &Config) -> Result<Self> {
        let api = Arc::new(OpsApi::new(config.services.api.clone())?);
        Ok(Self {
            weather: api.clone(),
            alerts: api.clone(),
            ephemeris: api.clone(),
            sink: api,
            events: Arc::new(FileEventStore::new(config.overwatcher.events_file.clone())),
        })
    }
}

/// What a tick remembers of the previous ones
#[derive(Debug, Default)]
struct TickMemory {
    previous: OverwatcherState,
    /// The dome is to be closed once observations stop
    pending_close: bool,
    ephemeris: Option<Ephemeris>,
    alerts: AlertsMonitor,
}

pub struct Overwatcher {
    config: OverwatcherConfig,
    limits: WeatherLimits,
    weather: Arc<dyn WeatherSource>,
    alerts: Arc<dyn AlertsSource>,
    ephemeris: Arc<dyn EphemerisSource>,
    heartbeat: Arc<RemoteActor>,
    pub notifier: Arc<Notifier>,
    pub events: Arc<EventRecorder>,
    pub dome: Arc<DomeHelper>,
    pub observer: ObserverOverwatcher,
    pub calibrations: CalibrationTracker,
    state: Mutex<OverwatcherState>,
    memory: tokio::sync::Mutex<TickMemory>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}
impl Overwatcher {
    pub fn new(observatory: Arc<Observatory>, services: Services) -> Self {
        let config = observatory.config.overwatcher.clone();
        let notifier = Arc::new(Notifier::new(
            services.sink,
            config.notification_channel.clone(),
            Duration::from_secs(config.repeat_window),
        ));
        let events = Arc::new(EventRecorder::new(services.events, notifier.clone()));
        let dome = Arc::new(DomeHelper::new(observatory.clone()));
        let observer = ObserverOverwatcher::new(
            observatory.clone(),
            dome.clone(),
            events.clone(),
            observatory.config.observer.clone(),
            Duration::from_secs(config.error_backoff),
        );
        let state = OverwatcherState {
            dry_run: config.dry_run,
            ..Default::default()
        };
        let heartbeat = observatory.client.actor(&config.heartbeat_actor);
        Self {
            limits: observatory.config.weather.clone(),
            config,
            weather: services.weather,
            alerts: services.alerts,
            ephemeris: services.ephemeris,
            heartbeat,
            notifier,
            events,
            dome,
            observer,
            calibrations: Default::default(),
            state: Mutex::new(state),
            memory: Default::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }
    /// The process wide overwatcher, built by `init` on first use
    pub fn instance<F>(init: F) -> Result<Arc<Self>>
    where
        F: FnOnce() -> Result<Self>,
    {
        INSTANCE.get_or_try_init(|| init().map(Arc::new)).cloned()
    }
    pub fn state(&self) -> OverwatcherState {
        *self.state.lock()
    }
    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }
    /// Disables the overwatcher, observations stop after the current tile
    pub async fn disable(&self) -> Result<()> {
        self.state.lock().enabled = false;
        self.observer.stop_observing(false).await
    }
    /// Disables the overwatcher and stops observing right away
    pub async fn force_disable(&self) -> Result<()> {
        self.state.lock().enabled = false;
        self.observer.stop_observing(true).await
    }
    async fn current_ephemeris(&self, memory: &mut TickMemory, now: DateTime<Utc>) -> Result<Ephemeris> {
        match memory.ephemeris {
            Some(ephemeris) if !ephemeris.is_stale(now) => Ok(ephemeris),
            _ => {
                let ephemeris = self.ephemeris.ephemeris().await?;
                memory.ephemeris = Some(ephemeris);
                Ok(ephemeris)
            }
        }
    }
    /// Runs one decision step as of `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let mut memory = self.memory.lock().await;

        let records = self.weather.weather(self.limits.delta_time).await?;
        let weather_safe = sources::is_safe(&records, &self.limits);
        memory.alerts.update(self.alerts.alerts().await);
        let alert = memory.alerts.unsafe_reason(self.config.max_alerts_failures);
        let safe = weather_safe && alert.is_none();
        self.dome.set_safe(safe);
        let night = self.current_ephemeris(&mut memory, now).await?.is_night(now);
        let state = {
            let mut state = self.state.lock();
            state.safe = safe;
            state.night = night;
            state.observing = self.observer.is_observing();
            state.calibrating = self.calibrations.running().is_some();
            *state
        };
        let previous = std::mem::replace(&mut memory.previous, state);

        if !state.safe {
            if state.observing && !self.observer.is_cancelling() && !state.dry_run {
                if let Err(e) = self.observer.stop_observing(true).await {
                    log::error!("(Overwatcher) failed stopping observations: {e}");
                }
            }
            let reason = match alert {
                Some(reason) if weather_safe => reason,
                _ => "unsafe conditions",
            };
            return self.shutdown(reason).await;
        }

        if !state.night {
            if previous.night && !memory.pending_close {
                log::info!("(Overwatcher) daytime reached.");
                memory.pending_close = true;
            }
            if state.calibrating {
                return Ok(());
            }
            if state.observing {
                match daytime_stop_mode(self.observer.remaining(), self.config.daytime_finish_threshold) {
                    DaytimeStop::Graceful => self.observer.stop_observing(false).await?,
                    DaytimeStop::Immediate => self.observer.stop_observing(true).await?,
                }
            }
            if !self.observer.is_observing() && memory.pending_close {
                self.shutdown("daytime").await?;
                memory.pending_close = false;
                self.notifier.email_night_log().await;
            }
            return Ok(());
        }

        if !state.enabled {
            if state.observing {
                self.observer.stop_observing(false).await?;
            }
            return Ok(());
        }
        if self.observer.is_cancelling() {
            self.observer.resume();
            return Ok(());
        }
        if !state.observing {
            if state.dry_run {
                log::warn!("(Overwatcher) dry run: not starting observations.");
            } else if let Err(e) = self.observer.start_observing().await {
                self.handle_error("Failed starting observations.", e).await;
            }
        }
        Ok(())
    }
    /// Notifies `error`, a failed dome move also disables the overwatcher
    async fn handle_error(&self, message: &str, error: Error) {
        if matches!(error, Error::DomeMotion(_)) {
            self.notifier
                .notify(
                    Notification::new(format!("{message} The overwatcher will be disabled."))
                        .level(Level::Critical)
                        .error(&error),
                )
                .await;
            if let Err(e) = self.force_disable().await {
                log::error!("(Overwatcher) failed disabling: {e}");
            }
        } else {
            self.notifier
                .notify(Notification::new(message).error(&error))
                .await;
        }
    }
    /// Stops observing and closes the dome, unless it is already closed or closing
    pub async fn shutdown(&self, reason: &str) -> Result<()> {
        if self.dome.is_closing().await? {
            return Ok(());
        }
        let reason = if reason.ends_with('.') {
            reason.to_string()
        } else {
            format!("{reason}.")
        };
        self.notifier
            .notify(
                Notification::new(format!("Triggering shutdown. Reason: {reason}"))
                    .level(Level::Warning),
            )
            .await;
        if self.state().dry_run {
            log::warn!("(Overwatcher) dry run enabled. Not shutting down.");
            return Ok(());
        }

        self.events.record(Event::DomeClosing, Map::new()).await;
        let (stopped, closed) = tokio::join!(
            self.observer.stop_observing(true),
            self.dome.shutdown(false, true)
        );
        if let Err(e) = stopped {
            self.handle_error("Error stopping observations during shutdown.", e)
                .await;
        }
        match closed {
            Ok(()) => self.events.record(Event::DomeClosed, Map::new()).await,
            Err(e) => self.handle_error("Error during shutdown.", e).await,
        }
        Ok(())
    }
    async fn main_loop(&self) {
        loop {
            let delay = match self.tick(Utc::now()).await {
                Ok(()) => self.config.tick_interval,
                Err(e) => {
                    self.notifier
                        .notify(Notification::new("Error in main overwatcher task:").error(&e))
                        .await;
                    self.config.error_backoff
                }
            };
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }
    async fn ping_loop(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(self.config.ping_interval)).await;
            self.notifier
                .notify(Notification::new("I am alive!").quiet())
                .await;
        }
    }
    /// Tells the heartbeat actor the overwatcher is alive
    async fn heartbeat_loop(&self) {
        loop {
            if let Err(e) = self
                .heartbeat
                .invoke("set", Args::new().arg("overwatcher"))
                .await
            {
                log::warn!("(Overwatcher) failed to emit heartbeat: {e}");
            }
            tokio::time::sleep(Duration::from_secs(self.config.heartbeat_interval)).await;
        }
    }
    /// Starts the supervision, ping and heartbeat tasks
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let dry_run = {
            let mut state = self.state.lock();
            if state.running {
                return Err(Error::Overwatcher("overwatcher is already running".to_string()));
            }
            state.running = true;
            state.dry_run
        };
        let main = {
            let overwatcher = self.clone();
            tokio::spawn(async move { overwatcher.main_loop().await })
        };
        let ping = {
            let overwatcher = self.clone();
            tokio::spawn(async move { overwatcher.ping_loop().await })
        };
        let heartbeat = {
            let overwatcher = self.clone();
            tokio::spawn(async move { overwatcher.heartbeat_loop().await })
        };
        self.tasks.lock().extend([main, ping, heartbeat]);

        let mut payload = Map::new();
        payload.insert("dry-run".to_string(), Value::Bool(dry_run));
        self.notifier
            .notify(Notification::new("Overwatcher is starting.").payload(payload))
            .await;
        if dry_run {
            log::warn!("(Overwatcher) running in dry mode.");
        }
        Ok(())
    }
    /// Stops the supervision tasks
    pub fn cancel(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.lock().running = false;
    }
}
