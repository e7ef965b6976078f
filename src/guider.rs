//! # Guiders
//!
//! Closed loop guiding of each telescope. The guider status and the measured
//! pointing error are tracked from the replies the guider actor broadcasts
//! while guiding.

use crate::{
    actor::{Args, RemoteActor},
    bus::BusReply,
    device::{Device, DeviceSet},
    Error, Result,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::{
    ops::Deref,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

/// Default guider exposure time in seconds
pub const GUIDE_EXPOSURE_TIME: f64 = 5.;
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_POLL: Duration = Duration::from_millis(500);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuiderStatus: u32 {
        const IDLE = 1 << 0;
        const ACQUIRING = 1 << 1;
        const GUIDING = 1 << 2;
        const EXPOSING = 1 << 3;
        const PROCESSING = 1 << 4;
        const CORRECTING = 1 << 5;
        const STOPPING = 1 << 6;
        const FAILED = 1 << 7;
        const WAITING = 1 << 8;
        const DRIFTING = 1 << 9;
    }
}
impl GuiderStatus {
    /// Parses the status word, reported as a hex string or an integer
    pub fn parse(value: &Value) -> Option<Self> {
        let bits = match value {
            Value::String(hex) => {
                let hex = hex.trim();
                let hex = hex
                    .strip_prefix("0x")
                    .or_else(|| hex.strip_prefix("0X"))
                    .unwrap_or(hex);
                u32::from_str_radix(hex, 16).ok()?
            }
            Value::Number(n) => u32::try_from(n.as_u64()?).ok()?,
            _ => return None,
        };
        Some(Self::from_bits_truncate(bits))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuideState {
    pub status: GuiderStatus,
    /// Measured pointing error in arcsec
    pub separation: Option<f64>,
}
impl Default for GuideState {
    fn default() -> Self {
        Self {
            status: GuiderStatus::IDLE,
            separation: None,
        }
    }
}
impl GuideState {
    fn update(&mut self, body: &Map<String, Value>) {
        if let Some(status) = body.get("status").and_then(GuiderStatus::parse) {
            self.status = status;
        }
        if let Some(separation) = body
            .get("measured_pointing")
            .and_then(|p| p.get("separation"))
            .and_then(Value::as_f64)
        {
            self.separation = Some(separation);
        }
    }
}

/// Outcome of [Guider::wait_until_guiding]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub reached: bool,
    pub status: GuiderStatus,
    pub separation: Option<f64>,
    pub timed_out: bool,
}

fn listen(
    actor: String,
    state: Weak<Mutex<GuideState>>,
    mut replies: broadcast::Receiver<BusReply>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match replies.recv().await {
                Ok(reply) if reply.sender == actor => {
                    let Some(state) = state.upgrade() else {
                        break;
                    };
                    state.lock().update(&reply.body);
                }
                Ok(_) => (),
                Err(RecvError::Lagged(n)) => log::warn!("({actor}) missed {n} guider replies"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub struct Guider {
    name: String,
    actor: Arc<RemoteActor>,
    ag: Option<Arc<RemoteActor>>,
    named_pixels: IndexMap<String, (f64, f64)>,
    state: Arc<Mutex<GuideState>>,
    listener: JoinHandle<()>,
}
impl Device for Guider {
    fn name(&self) -> &str {
        &self.name
    }
    fn actor(&self) -> &Arc<RemoteActor> {
        &self.actor
    }
}
impl Drop for Guider {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
impl Guider {
    /// Creates the guider of telescope `name`, tracking its state from `replies`
    pub fn new(
        name: impl Into<String>,
        actor: Arc<RemoteActor>,
        ag: Option<Arc<RemoteActor>>,
        named_pixels: IndexMap<String, (f64, f64)>,
        replies: broadcast::Receiver<BusReply>,
    ) -> Self {
        let state = Arc::new(Mutex::new(GuideState::default()));
        let listener = listen(actor.name().to_string(), Arc::downgrade(&state), replies);
        Self {
            name: name.into(),
            actor,
            ag,
            named_pixels,
            state,
            listener,
        }
    }
    pub fn state(&self) -> GuideState {
        *self.state.lock()
    }
    pub fn status(&self) -> GuiderStatus {
        self.state.lock().status
    }
    /// The master frame pixel associated with a fibre name
    pub fn named_pixel(&self, name: &str) -> Result<(f64, f64)> {
        self.named_pixels
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidPixel {
                guider: self.name.clone(),
                pixel: name.to_string(),
            })
    }
    /// Guides on RA/Dec, in degrees, at `pixel` or the frame centre
    ///
    /// Returns when the guide loop is stopped.
    pub async fn guide(
        &self,
        ra: f64,
        dec: f64,
        pixel: Option<(f64, f64)>,
        exposure_time: f64,
    ) -> Result<()> {
        self.state.lock().separation = None;
        self.write_to_log(
            &format!("Guiding at ra={ra:.6} dec={dec:.6} pixel={pixel:?}."),
            log::Level::Info,
        );
        let mut args = Args::new()
            .kwarg("ra", ra)
            .kwarg("dec", dec)
            .kwarg("exposure_time", exposure_time);
        if let Some((x, y)) = pixel {
            args = args.kwarg("reference_pixel", vec![x, y]);
        }
        let result = self.actor.invoke("guide", args).await;
        self.state.lock().separation = None;
        result.map_err(|e| Error::Guider(format!("({}) guide loop failed: {e}", self.name)))?;
        Ok(())
    }
    /// Waits until the guider is guiding within `tolerance` arcsec
    ///
    /// Without a tolerance any non-drifting guiding state is enough. Without a
    /// timeout it waits forever.
    pub async fn wait_until_guiding(
        &self,
        tolerance: Option<f64>,
        timeout: Option<Duration>,
    ) -> Convergence {
        let tick = Duration::from_secs(1);
        tokio::time::sleep(tick).await;
        let mut elapsed = tick;
        loop {
            let GuideState { status, separation } = self.state();
            let converged = status.contains(GuiderStatus::GUIDING)
                && !status.contains(GuiderStatus::DRIFTING)
                && match (tolerance, separation) {
                    (None, _) => true,
                    (Some(tolerance), Some(separation)) => separation < tolerance,
                    (Some(_), None) => false,
                };
            if converged {
                return Convergence {
                    reached: true,
                    status,
                    separation,
                    timed_out: false,
                };
            }
            if timeout.map_or(false, |timeout| elapsed > timeout) {
                return Convergence {
                    reached: false,
                    status,
                    separation,
                    timed_out: true,
                };
            }
            tokio::time::sleep(tick).await;
            elapsed += tick;
        }
    }
    /// Stops guiding and waits until the guider is idle
    pub async fn stop(&self, now: bool) -> Result<()> {
        if self.status().contains(GuiderStatus::IDLE) {
            return Ok(());
        }
        self.write_to_log("Stopping guider.", log::Level::Info);
        self.actor.invoke("stop", Args::new().kwarg("now", now)).await?;
        tokio::time::timeout(STOP_TIMEOUT, async {
            while !self.status().contains(GuiderStatus::IDLE) {
                tokio::time::sleep(STOP_POLL).await;
            }
        })
        .await
        .map_err(|_| Error::Timeout(format!("guider {} did not stop", self.name)))
    }
    /// Takes dark frames with the acquisition cameras
    pub async fn take_darks(&self) -> Result<()> {
        let Some(ag) = &self.ag else {
            return Ok(());
        };
        self.write_to_log("Taking darks.", log::Level::Info);
        ag.invoke("expose", Args::new().kwarg("flavour", "dark"))
            .await?;
        Ok(())
    }
}

pub struct GuiderSet {
    guiders: DeviceSet<Guider>,
}
impl Deref for GuiderSet {
    type Target = DeviceSet<Guider>;
    fn deref(&self) -> &Self::Target {
        &self.guiders
    }
}
impl GuiderSet {
    pub fn new(guiders: DeviceSet<Guider>) -> Self {
        Self { guiders }
    }
    pub async fn stop(&self, now: bool) -> Result<()> {
        self.guiders
            .call_on_all(|guider| async move { guider.stop(now).await })
            .await?;
        Ok(())
    }
    pub async fn take_darks(&self) -> Result<()> {
        self.guiders
            .call_on_all(|guider| async move { guider.take_darks().await })
            .await?;
        Ok(())
    }
}
