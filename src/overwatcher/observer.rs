//! # Observing loop
//!
//! Observes the tiles suggested by the scheduler, one after the other,
//! until asked to stop.

use super::{
    dome::DomeHelper,
    events::{Event, EventRecorder},
};
use crate::{
    config::ObserverConfig,
    observatory::{Observatory, TileRequest},
    observer::Exposed,
    Result,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct LoopFlags {
    observing: AtomicBool,
    cancelling: AtomicBool,
}
impl LoopFlags {
    fn observing(&self) -> bool {
        self.observing.load(Ordering::SeqCst)
    }
    fn cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }
    fn set_observing(&self, value: bool) {
        self.observing.store(value, Ordering::SeqCst)
    }
    fn set_cancelling(&self, value: bool) {
        self.cancelling.store(value, Ordering::SeqCst)
    }
}

struct ObservingLoop {
    observatory: Arc<Observatory>,
    events: Arc<EventRecorder>,
    params: ObserverConfig,
    backoff: Duration,
    flags: Arc<LoopFlags>,
}
impl ObservingLoop {
    async fn observe_next(&self) -> Result<Exposed> {
        let tile = self.observatory.build_tile(TileRequest::Next).await?;
        let mut payload = Map::new();
        payload.insert("tile_id".to_string(), json!(tile.tile_id));
        payload.insert("dither_position".to_string(), Value::from(tile.dither_position));
        self.events.record(Event::ObserverNewTile, payload).await;
        self.observatory.observe(tile, &self.params).await
    }
    async fn run(self) {
        if let Err(e) = self.observatory.cleanup(true).await {
            log::warn!("(Observer) initial cleanup failed: {e}");
        }
        loop {
            if let Err(e) = self.observe_next().await {
                log::error!("(Observer) error during observation: {e}");
                if let Err(e) = self.observatory.cleanup(false).await {
                    log::error!("(Observer) cleanup failed: {e}");
                }
                if !self.flags.cancelling() {
                    tokio::time::sleep(self.backoff).await;
                }
            }
            if self.flags.cancelling() {
                log::warn!("(Observer) cancelling observations.");
                break;
            }
        }
        self.flags.set_observing(false);
        self.flags.set_cancelling(false);
    }
}

/// Starts and stops the observing loop
pub struct ObserverOverwatcher {
    observatory: Arc<Observatory>,
    dome: Arc<DomeHelper>,
    events: Arc<EventRecorder>,
    params: ObserverConfig,
    backoff: Duration,
    flags: Arc<LoopFlags>,
    observe_loop: Mutex<Option<JoinHandle<()>>>,
}
impl ObserverOverwatcher {
    pub fn new(
        observatory: Arc<Observatory>,
        dome: Arc<DomeHelper>,
        events: Arc<EventRecorder>,
        params: ObserverConfig,
        backoff: Duration,
    ) -> Self {
        Self {
            observatory,
            dome,
            events,
            params,
            backoff,
            flags: Default::default(),
            observe_loop: Mutex::new(None),
        }
    }
    pub fn is_observing(&self) -> bool {
        self.flags.observing()
    }
    pub fn is_cancelling(&self) -> bool {
        self.flags.cancelling()
    }
    /// Seconds left in the current exposure
    pub fn remaining(&self) -> Option<f64> {
        self.observatory.specs.remaining()
    }
    /// Opens the dome if needed and starts the observing loop
    ///
    /// If the loop is already running, a pending stop is withdrawn.
    pub async fn start_observing(&self) -> Result<()> {
        if self.flags.observing() {
            self.flags.set_cancelling(false);
            return Ok(());
        }
        self.flags.set_observing(true);
        self.flags.set_cancelling(false);
        log::warn!("(Observer) starting observations.");

        let opened = async {
            if !self.dome.is_opening().await? {
                log::info!("(Observer) opening the dome.");
                self.events.record(Event::DomeOpening, Map::new()).await;
                self.dome.startup().await?;
                self.events.record(Event::DomeOpen, Map::new()).await;
            }
            Ok(())
        };
        if let Err(e) = opened.await {
            self.flags.set_observing(false);
            return Err(e);
        }

        let observing_loop = ObservingLoop {
            observatory: self.observatory.clone(),
            events: self.events.clone(),
            params: self.params.clone(),
            backoff: self.backoff,
            flags: self.flags.clone(),
        };
        let task = tokio::spawn(observing_loop.run());
        if let Some(previous) = self.observe_loop.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }
    /// Stops observing, either now or once the current tile is done
    pub async fn stop_observing(&self, immediate: bool) -> Result<()> {
        if !self.flags.observing() {
            return Ok(());
        }
        if immediate {
            log::warn!("(Observer) stopping observations now.");
            let task = self.observe_loop.lock().take();
            if let Some(task) = task {
                task.abort();
                let _ = task.await;
            }
            self.flags.set_observing(false);
            self.flags.set_cancelling(false);
            self.observatory.cleanup(false).await?;
        } else if !self.flags.cancelling() {
            log::warn!("(Observer) stopping observations after this tile.");
            self.flags.set_cancelling(true);
        }
        Ok(())
    }
    /// Withdraws a pending stop
    pub fn resume(&self) {
        if self.flags.observing() && self.flags.cancelling() {
            log::info!("(Observer) resuming observations.");
            self.flags.set_cancelling(false);
        }
    }
}
impl Drop for ObserverOverwatcher {
    fn drop(&mut self) {
        if let Some(task) = self.observe_loop.lock().take() {
            task.abort();
        }
    }
}
