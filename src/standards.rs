//! # Standards
//!
//! During a science exposure the standards telescope visits the tile
//! standard stars in turn, each one observed through its own fibre of the
//! fibre mask. The time on each star is split evenly across the exposure,
//! minus the time needed to acquire it.

use crate::{
    coordinates::Coordinates,
    guider::{Guider, GUIDE_EXPOSURE_TIME},
    spectrograph::Header,
    telescope::{FibreSelector, Telescope},
    Result,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};

/// Seconds needed to acquire a standard
pub const ACQUISITION_OVERHEAD: f64 = 30.;
/// Seconds allowed for the guider to converge on a new standard
pub const STANDARD_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(60);
/// Steps moved by the fibre mask to cover all the fibres while slewing
const MASK_PARK_OFFSET: i64 = 500;

/// Seconds to spend on each of `n` standards during an exposure
///
/// The second value is `false` when the exposure is too short to afford the
/// acquisition overhead, the time being then split evenly.
pub fn time_per_standard(exposure_time: f64, n: usize) -> (f64, bool) {
    let even = exposure_time / n.max(1) as f64;
    let on_target = even - ACQUISITION_OVERHEAD;
    if on_target < 0. {
        (even, false)
    } else {
        (on_target, true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StandardRow {
    /// 1-based sequence number
    pub n: usize,
    pub source_id: Option<i64>,
    pub ra: f64,
    pub dec: f64,
    pub acquired: bool,
    pub observed: bool,
    pub t0: Option<DateTime<Utc>>,
    pub t1: Option<DateTime<Utc>>,
    pub fibre: Option<String>,
}

/// Progress of the standards during one exposure
#[derive(Debug, Clone, Default, Serialize)]
pub struct StandardsTable {
    rows: Vec<StandardRow>,
    /// Sequence number of the current standard
    current: usize,
}
impl StandardsTable {
    pub fn new(standards: &[Coordinates]) -> Self {
        Self {
            rows: standards
                .iter()
                .enumerate()
                .map(|(i, c)| StandardRow {
                    n: i + 1,
                    source_id: c.source_id,
                    ra: c.ra,
                    dec: c.dec,
                    acquired: false,
                    observed: false,
                    t0: None,
                    t1: None,
                    fibre: None,
                })
                .collect(),
            current: 1,
        }
    }
    pub fn rows(&self) -> &[StandardRow] {
        &self.rows
    }
    pub fn current(&self) -> usize {
        self.current
    }
    pub fn row(&self, n: usize) -> Option<&StandardRow> {
        n.checked_sub(1).and_then(|i| self.rows.get(i))
    }
    fn row_mut(&mut self, n: usize) -> Option<&mut StandardRow> {
        n.checked_sub(1).and_then(move |i| self.rows.get_mut(i))
    }
    fn acquire(&mut self, n: usize, fibre: &str, now: DateTime<Utc>) {
        self.current = n;
        if let Some(row) = self.row_mut(n) {
            row.acquired = true;
            row.t0 = Some(now);
            row.fibre = Some(fibre.to_string());
        }
    }
    /// Closes the interval of the current standard if it was acquired
    fn close_current(&mut self, now: DateTime<Utc>) {
        let current = self.current;
        if let Some(row) = self.row_mut(current) {
            if row.acquired && !row.observed {
                row.observed = true;
                row.t1 = Some(now);
            }
        }
    }
    /// Header keywords describing the observed standards
    pub fn to_header(&self) -> Header {
        let isot = |t: &Option<DateTime<Utc>>| {
            t.map(|t| Value::from(t.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .unwrap_or(Value::Null)
        };
        let mut header = Header::new();
        for row in &self.rows {
            let n = row.n;
            header.insert(
                format!("STD{n}ID"),
                row.source_id.filter(|id| *id > 0).into(),
            );
            header.insert(format!("STD{n}RA"), row.ra.into());
            header.insert(format!("STD{n}DE"), row.dec.into());
            header.insert(format!("STD{n}ACQ"), row.observed.into());
            if row.observed {
                header.insert(format!("STD{n}T0"), isot(&row.t0));
                header.insert(format!("STD{n}T1"), isot(&row.t1));
                let exposed = match (row.t0, row.t1) {
                    (Some(t0), Some(t1)) => {
                        let seconds = (t1 - t0).num_milliseconds() as f64 / 1e3;
                        Value::from((seconds * 10.).round() / 10.)
                    }
                    _ => Value::Null,
                };
                header.insert(format!("STD{n}EXP"), exposed);
                header.insert(format!("STD{n}FIB"), row.fibre.clone().into());
            }
        }
        header
    }
}

/// The devices the standards are observed with
#[derive(Clone)]
pub struct StandardsDevices {
    pub telescope: Arc<Telescope>,
    pub fibsel: Arc<FibreSelector>,
    pub guider: Arc<Guider>,
}

pub struct Standards {
    standards: Vec<Coordinates>,
    mask_positions: Vec<String>,
    devices: StandardsDevices,
    /// Guide tolerance in arcsec
    guide_tolerance: f64,
    table: Arc<Mutex<StandardsTable>>,
    task: Mutex<Option<JoinHandle<()>>>,
}
impl Standards {
    pub fn new(
        standards: Vec<Coordinates>,
        mask_positions: Vec<String>,
        devices: StandardsDevices,
        guide_tolerance: f64,
    ) -> Self {
        let table = StandardsTable::new(&standards);
        Self {
            standards,
            mask_positions,
            devices,
            guide_tolerance,
            table: Arc::new(Mutex::new(table)),
            task: Mutex::new(None),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.standards.is_empty()
    }
    /// A snapshot of the standards table
    pub fn table(&self) -> StandardsTable {
        self.table.lock().clone()
    }
    /// Exposes the first fibre and starts cycling through the standards
    pub async fn start_iterating(&self, exposure_time: f64) -> Result<()> {
        let Some(first_fibre) = self.mask_positions.first() else {
            return Ok(());
        };
        if self.standards.is_empty() {
            return Ok(());
        }
        self.devices.fibsel.move_to_position(first_fibre).await?;
        self.cancel().await;

        let mut table = StandardsTable::new(&self.standards);
        table.acquire(1, first_fibre, Utc::now());
        *self.table.lock() = table;

        let cycle = Cycle {
            devices: self.devices.clone(),
            standards: self.standards.clone(),
            mask_positions: self.mask_positions.clone(),
            guide_tolerance: self.guide_tolerance,
            table: self.table.clone(),
            guiding: Mutex::new(None),
        };
        *self.task.lock() = Some(tokio::spawn(cycle.run(exposure_time)));
        Ok(())
    }
    /// Stops cycling; the current standard, if acquired, is marked observed
    pub async fn cancel(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.table.lock().close_current(Utc::now());
    }
    /// Sets the start of the first standard, e.g. to the exposure start time
    pub fn set_first_t0(&self, t0: DateTime<Utc>) {
        let mut table = self.table.lock();
        if let Some(row) = table.row_mut(1).filter(|row| row.acquired) {
            row.t0 = Some(t0);
        }
    }
    pub fn to_header(&self) -> Header {
        self.table.lock().to_header()
    }
}
impl Drop for Standards {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

struct Cycle {
    devices: StandardsDevices,
    standards: Vec<Coordinates>,
    mask_positions: Vec<String>,
    guide_tolerance: f64,
    table: Arc<Mutex<StandardsTable>>,
    /// Guide loop on the current standard
    guiding: Mutex<Option<JoinHandle<()>>>,
}
impl Cycle {
    async fn run(self, exposure_time: f64) {
        self.iterate(exposure_time).await;
        // the last guide loop runs until the guiders are stopped
        self.guiding.lock().take();
    }
    async fn iterate(&self, exposure_time: f64) {
        let n = self.standards.len();
        if n <= 1 {
            return;
        }
        let (per_standard, exact) = time_per_standard(exposure_time, n);
        if !exact {
            log::warn!(
                "(Standards) Exposure time is too short to observe this many standards. \
                 Not all time budgets are exact."
            );
        }
        let start = Instant::now();
        let mut last_swap = start;
        let mut observed = 1;
        let mut index = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if start.elapsed().as_secs_f64() > exposure_time - 2. * ACQUISITION_OVERHEAD {
                log::debug!("(Standards) Exiting standard loop.");
                log::info!("(Standards) Standards observed: {observed}/{n}.");
                return;
            }
            if last_swap.elapsed().as_secs_f64() <= per_standard {
                continue;
            }
            // stay on the last standard
            if index + 1 >= n.min(self.mask_positions.len()) {
                continue;
            }
            index += 1;
            match self.swap(index).await {
                Ok(true) => {
                    observed += 1;
                    last_swap = Instant::now();
                }
                Ok(false) => {
                    log::warn!("(Standards) Failed to acquire standard position. Skipping.");
                }
                Err(e) => {
                    log::error!("(Standards) Standards loop failed: {e}");
                    return;
                }
            }
        }
    }
    /// Moves to standard `index`, returns whether it was acquired
    async fn swap(&self, index: usize) -> Result<bool> {
        let StandardsDevices {
            telescope,
            fibsel,
            guider,
        } = &self.devices;
        fibsel.move_relative(MASK_PARK_OFFSET).await?;
        {
            let mut table = self.table.lock();
            table.close_current(Utc::now());
            table.current = index + 1;
        }

        let target = &self.standards[index];
        let fibre = &self.mask_positions[index];
        let pixel = guider.named_pixel(fibre)?;
        log::info!(
            "(Standards) Moving to standard #{} ({target}) on fibre {fibre}.",
            index + 1
        );

        log::debug!("(Standards) Stopping guiding on spec and reslewing.");
        let (stopped, slewed) = tokio::join!(
            guider.stop(false),
            telescope.goto_radec(target.ra, target.dec, false)
        );
        stopped?;
        slewed?;

        log::debug!("(Standards) Starting to guide on spec telescope.");
        let (ra, dec) = (target.ra, target.dec);
        let guiding = guider.clone();
        let guide_loop = tokio::spawn(async move {
            if let Err(e) = guiding.guide(ra, dec, Some(pixel), GUIDE_EXPOSURE_TIME).await {
                log::warn!("(Standards) {e}");
            }
        });
        if let Some(previous) = self.guiding.lock().replace(guide_loop) {
            previous.abort();
        }
        let convergence = guider
            .wait_until_guiding(
                Some(self.guide_tolerance),
                Some(STANDARD_ACQUISITION_TIMEOUT),
            )
            .await;
        if !convergence.reached {
            return Ok(false);
        }
        log::debug!("(Standards) Standard {fibre} acquired.");
        fibsel.move_to_position(fibre).await?;
        self.table.lock().acquire(index + 1, fibre, Utc::now());
        Ok(true)
    }
}
impl Drop for Cycle {
    fn drop(&mut self) {
        if let Some(guide_loop) = self.guiding.get_mut().take() {
            guide_loop.abort();
        }
    }
}
