//! # Observer
//!
//! Observation of one tile: slew, acquire, expose and finish.
//!
//! [Observer::observe] always runs [Observer::finish] whatever the outcome
//! of the previous stages, so the guide loops and the standards iteration
//! never outlive the observation.

use crate::{
    config::ObserverConfig,
    coordinates::julian_date,
    device::{gather, Device},
    guider::{Guider, GUIDE_EXPOSURE_TIME},
    observatory::Observatory,
    scheduler::Registration,
    spectrograph::{Exposure, ExposureHook, Header},
    standards::{Standards, StandardsDevices},
    telemetry::GuideMonitor,
    tile::{SkyArm, Tile},
    Error, Result,
};
use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

/// Telescopes in guiding order
const GUIDE_ORDER: [&str; 4] = ["sci", "skye", "skyw", "spec"];
/// Wait between starting the guide loops and checking their convergence
const ACQUISITION_SETTLE: Duration = Duration::from_secs(5);
/// Steps moved by the fibre mask to cover all the standard fibres
const MASK_BLOCK_OFFSET: i64 = 500;
/// Seeing reported when registering an observation
const DEFAULT_SEEING: f64 = 10.;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Slewing,
    Acquiring,
    Exposing,
    Finishing,
}

/// The exposures taken on a tile
#[derive(Debug, Clone)]
pub enum Exposed {
    Single(Exposure),
    Sequence(Vec<Exposure>),
}
impl Exposed {
    pub fn exposures(&self) -> &[Exposure] {
        match self {
            Exposed::Single(exposure) => std::slice::from_ref(exposure),
            Exposed::Sequence(exposures) => exposures,
        }
    }
}

fn round6(value: f64) -> Value {
    Value::from((value * 1e6).round() / 1e6)
}

struct GuideLoop {
    telescope: &'static str,
    guider: Arc<Guider>,
    ra: f64,
    dec: f64,
    pixel: Option<(f64, f64)>,
}

pub struct Observer {
    observatory: Arc<Observatory>,
    tile: Tile,
    mask_positions: Vec<String>,
    stage: Mutex<Stage>,
    guide_task: Mutex<Option<JoinHandle<Result<()>>>>,
    monitor: GuideMonitor,
    standards: Standards,
}
impl Observer {
    /// Prepares the observation of `tile`
    ///
    /// The standards are observed through the fibre mask positions matching
    /// `params.mask_positions_pattern`, in motor steps order.
    pub fn new(observatory: Arc<Observatory>, tile: Tile, params: &ObserverConfig) -> Result<Self> {
        let fibsel = observatory.telescopes.fibsel.clone();
        let mask_positions = fibsel.select_positions(&params.mask_positions_pattern)?;
        let guiders: IndexMap<String, String> = observatory
            .guiders
            .iter()
            .map(|guider| (guider.actor().name().to_string(), guider.name().to_string()))
            .collect();
        let monitor = GuideMonitor::new(observatory.client.clone(), guiders);
        let standards = Standards::new(
            tile.standards.clone(),
            mask_positions.clone(),
            StandardsDevices {
                telescope: observatory.telescopes.device("spec")?.clone(),
                fibsel,
                guider: observatory.guiders.device("spec")?.clone(),
            },
            params.guide_tolerance,
        );
        Ok(Self {
            observatory,
            tile,
            mask_positions,
            stage: Mutex::new(Stage::Idle),
            guide_task: Mutex::new(None),
            monitor,
            standards,
        })
    }
    pub fn tile(&self) -> &Tile {
        &self.tile
    }
    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }
    pub fn mask_positions(&self) -> &[String] {
        &self.mask_positions
    }
    pub fn has_standards(&self) -> bool {
        !self.standards.is_empty()
    }
    fn set_stage(&self, stage: Stage) {
        *self.stage.lock() = stage;
    }
    fn write_to_log(&self, message: &str, level: log::Level) {
        log::log!(level, "(Observer) {message}");
    }
    /// Slews, acquires and exposes, then finishes the observation
    pub async fn observe(&self, params: &ObserverConfig) -> Result<Exposed> {
        let result = async {
            self.slew().await?;
            self.acquire(
                params.guide_tolerance,
                Duration::from_secs_f64(params.acquisition_timeout),
            )
            .await?;
            self.expose(params.exposure_time, params.count, None).await
        }
        .await;
        self.finish().await;
        result
    }
    /// Points every telescope at its tile target and the fibre mask at the first standard
    pub async fn slew(&self) -> Result<()> {
        self.set_stage(Stage::Slewing);
        let observatory = &self.observatory;
        observatory.guiders.stop(false).await?;

        self.write_to_log(&format!("Slewing to {}.", self.tile), log::Level::Info);
        let mut targets = IndexMap::new();
        for telescope in GUIDE_ORDER {
            if let Some(target) = self.tile.target(telescope) {
                self.write_to_log(&format!("{telescope}: {target}"), log::Level::Debug);
                targets.insert(telescope.to_string(), (target.ra, target.dec));
            }
        }
        let fibsel = &observatory.telescopes.fibsel;
        let mask = async {
            match self.mask_positions.first() {
                Some(position) => fibsel.move_to_position(position).await,
                None => Ok(()),
            }
        };
        let (slewed, masked) = tokio::join!(observatory.telescopes.goto(&targets, false), mask);
        slewed?;
        masked
    }
    /// Starts guiding every telescope with a target and waits for convergence
    ///
    /// The science and standards telescopes must converge within `timeout`,
    /// the sky telescopes may not.
    pub async fn acquire(&self, guide_tolerance: f64, timeout: Duration) -> Result<()> {
        self.set_stage(Stage::Acquiring);
        let guiders = &self.observatory.guiders;
        let mut loops = Vec::new();
        for telescope in GUIDE_ORDER {
            let (Some(target), Some(guider)) = (self.tile.target(telescope), guiders.get(telescope))
            else {
                continue;
            };
            let pixel = if telescope == "spec" {
                match self.mask_positions.first() {
                    Some(position) => Some(guider.named_pixel(position)?),
                    None => None,
                }
            } else {
                target.guide_pixel()
            };
            loops.push(GuideLoop {
                telescope,
                guider: guider.clone(),
                ra: target.ra,
                dec: target.dec,
                pixel,
            });
        }
        if !loops.iter().any(|l| l.telescope == "spec") {
            self.write_to_log("No standards defined. Blocking fibre mask.", log::Level::Warn);
            self.observatory
                .telescopes
                .fibsel
                .move_relative(MASK_BLOCK_OFFSET)
                .await?;
        }
        if !loops.iter().any(|l| l.telescope.starts_with("sky")) {
            self.write_to_log("No sky positions defined.", log::Level::Warn);
        }

        self.monitor.restart();
        let guiding: Vec<_> = loops
            .iter()
            .map(|l| {
                let (guider, ra, dec, pixel) = (l.guider.clone(), l.ra, l.dec, l.pixel);
                async move { guider.guide(ra, dec, pixel, GUIDE_EXPOSURE_TIME).await }
            })
            .collect();
        let previous = self
            .guide_task
            .lock()
            .replace(tokio::spawn(async move { gather(guiding).await.map(|_| ()) }));
        if let Some(previous) = previous {
            previous.abort();
        }

        tokio::time::sleep(ACQUISITION_SETTLE).await;
        self.write_to_log("Waiting for guiders to converge.", log::Level::Debug);
        let convergence = join_all(
            loops
                .iter()
                .map(|l| l.guider.wait_until_guiding(Some(guide_tolerance), Some(timeout))),
        )
        .await;
        if convergence.iter().any(|c| c.timed_out) {
            self.write_to_log("Some acquisitions timed out.", log::Level::Warn);
        }

        let mut failure = None;
        for (l, c) in loops.iter().zip(&convergence) {
            if c.reached {
                continue;
            }
            match l.telescope {
                "sci" | "spec" => {
                    failure.get_or_insert_with(|| {
                        Error::Acquisition(format!("{} telescope is not guiding", l.telescope))
                    });
                }
                telescope => self.write_to_log(
                    &format!("{telescope} telescope is not guiding."),
                    log::Level::Warn,
                ),
            }
        }
        if let Some(e) = failure {
            self.write_to_log("Stopping guide loops.", log::Level::Warn);
            if let Err(stop) = guiders.stop(false).await {
                self.write_to_log(&format!("Failed stopping guiders: {stop}"), log::Level::Error);
            }
            return Err(e);
        }
        self.write_to_log("All telescopes are now guiding.", log::Level::Info);
        Ok(())
    }
    /// Takes `count` exposures, iterating over the standards during each of them
    pub async fn expose(
        &self,
        exposure_time: f64,
        count: usize,
        object: Option<&str>,
    ) -> Result<Exposed> {
        self.set_stage(Stage::Exposing);
        let object = object.or(self.tile.object.as_deref());
        let count = count.max(1);
        let mut exposures = Vec::with_capacity(count);
        for n in 1..=count {
            self.write_to_log(
                &format!("Starting {exposure_time:.1} s exposure ({n}/{count})."),
                log::Level::Info,
            );
            if n > 1 {
                self.monitor.restart();
            }
            self.standards.start_iterating(exposure_time).await?;
            let exposure = self
                .observatory
                .specs
                .expose("object", exposure_time, object, Some(self as &dyn ExposureHook))
                .await?;
            self.register(&exposure).await?;
            exposures.push(exposure);
        }
        Ok(match exposures.len() {
            1 => Exposed::Single(exposures.remove(0)),
            _ => Exposed::Sequence(exposures),
        })
    }
    async fn register(&self, exposure: &Exposure) -> Result<()> {
        let Some(tile_id) = self.tile.tile_id else {
            self.write_to_log("Tile has no tile_id. Not registering.", log::Level::Debug);
            return Ok(());
        };
        let source_ids = |pointings: Vec<&crate::Coordinates>| -> Vec<i64> {
            pointings
                .into_iter()
                .filter_map(|c| c.source_id)
                .filter(|id| *id > 0)
                .collect()
        };
        let registration = Registration {
            tile_id,
            dither: self.tile.dither_position,
            jd: julian_date(exposure.start_time),
            seeing: DEFAULT_SEEING,
            standards: source_ids(self.tile.standards.iter().collect()),
            skies: source_ids(self.tile.sky.values().collect()),
            exposure_no: exposure.exp_no,
        };
        self.write_to_log(
            &format!("Registering exposure {} of tile {tile_id}.", exposure.exp_no),
            log::Level::Info,
        );
        self.observatory
            .scheduler()
            .register_observation(&registration)
            .await
    }
    /// Stops the standards iteration and the guide loops
    ///
    /// Safe to call more than once and after a failed stage.
    pub async fn finish(&self) {
        self.set_stage(Stage::Finishing);
        self.write_to_log("Finishing observation.", log::Level::Info);
        self.standards.cancel().await;
        self.monitor.stop();
        let task = self.guide_task.lock().take();
        if let Some(task) = task {
            if !task.is_finished() {
                if let Err(e) = self.observatory.guiders.stop(false).await {
                    self.write_to_log(&format!("Failed stopping guiders: {e}"), log::Level::Error);
                    task.abort();
                }
            }
            match task.await {
                Ok(Err(e)) => {
                    self.write_to_log(&format!("Guide loop failed: {e}"), log::Level::Warn)
                }
                Err(e) if e.is_panic() => {
                    self.write_to_log("Guide loop panicked.", log::Level::Error)
                }
                _ => (),
            }
        }
        self.set_stage(Stage::Idle);
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(task) = self.guide_task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ExposureHook for Observer {
    /// Adds the pointings, guider frames and standards to the header
    async fn pre_readout(&self, exposure: &Exposure, header: &mut Header) -> Result<()> {
        let tile = &self.tile;
        header.insert("TILE_ID".into(), tile.tile_id.unwrap_or(-999).into());
        header.insert("DPOS".into(), tile.dither_position.into());
        header.insert("POSCIRA".into(), round6(tile.science.ra));
        header.insert("POSCIDE".into(), round6(tile.science.dec));
        for (arm, key) in [(SkyArm::East, "SKYE"), (SkyArm::West, "SKYW")] {
            if let Some(sky) = tile.sky.get(&arm) {
                header.insert(format!("PO{key}RA"), round6(sky.ra));
                header.insert(format!("PO{key}DE"), round6(sky.dec));
            }
        }

        self.monitor.update_data();
        header.extend(self.monitor.to_header());

        // the shutter is closed: the current standard is done
        if self.has_standards() {
            self.standards.cancel().await;
            self.standards.set_first_t0(exposure.start_time);
            header.extend(self.standards.to_header());
        }
        Ok(())
    }
}
