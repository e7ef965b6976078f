//! # Guide telemetry
//!
//! The guiders broadcast one report per processed frame, sometimes split
//! over several replies. [GuideMonitor] buffers the reports for the duration
//! of an exposure and folds them into one row per frame and telescope.

use crate::{actor::ActorClient, bus::BusReply, spectrograph::Header};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

/// One, possibly partial, guider report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuideRecord {
    pub frameno: u64,
    pub telescope: String,
    pub fwhm: Option<f64>,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub separation: Option<f64>,
}
impl GuideRecord {
    /// Extracts the report carried by a guider reply body, if any
    pub fn from_body(telescope: &str, body: &Map<String, Value>) -> Option<Self> {
        let report = body
            .get("frame")
            .or_else(|| body.get("measured_pointing"))?
            .as_object()?;
        let number = |key: &str| report.get(key).and_then(Value::as_f64);
        Some(Self {
            frameno: report.get("frameno")?.as_u64()?,
            telescope: telescope.to_string(),
            fwhm: number("fwhm"),
            ra: number("ra"),
            dec: number("dec"),
            separation: number("separation"),
        })
    }
}

/// A complete guider frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuideFrame {
    pub frameno: u64,
    pub telescope: String,
    pub fwhm: f64,
    pub ra: f64,
    pub dec: f64,
    pub separation: f64,
}

/// Groups records by frame and telescope, keeping the first value reported
/// for each column; incomplete frames are dropped and the rest sorted by frame number
pub fn aggregate(records: &[GuideRecord]) -> Vec<GuideFrame> {
    let mut groups: IndexMap<(u64, &str), GuideRecord> = IndexMap::new();
    for record in records {
        let group = groups
            .entry((record.frameno, record.telescope.as_str()))
            .or_insert_with(|| GuideRecord {
                frameno: record.frameno,
                telescope: record.telescope.clone(),
                ..Default::default()
            });
        group.fwhm = group.fwhm.or(record.fwhm);
        group.ra = group.ra.or(record.ra);
        group.dec = group.dec.or(record.dec);
        group.separation = group.separation.or(record.separation);
    }
    let mut frames: Vec<GuideFrame> = groups
        .into_values()
        .filter_map(|g| {
            Some(GuideFrame {
                fwhm: g.fwhm?,
                ra: g.ra?,
                dec: g.dec?,
                separation: g.separation?,
                frameno: g.frameno,
                telescope: g.telescope,
            })
        })
        .collect();
    frames.sort_by_key(|f| f.frameno);
    frames
}

fn collect(
    mut replies: broadcast::Receiver<BusReply>,
    guiders: IndexMap<String, String>,
    buffer: Arc<Mutex<Vec<GuideRecord>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match replies.recv().await {
                Ok(reply) => {
                    let Some(telescope) = guiders.get(&reply.sender) else {
                        continue;
                    };
                    if let Some(record) = GuideRecord::from_body(telescope, &reply.body) {
                        buffer.lock().push(record);
                    }
                }
                Err(RecvError::Lagged(n)) => log::warn!("(GuideMonitor) missed {n} replies"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Collects guider frames while an exposure is integrating
pub struct GuideMonitor {
    client: Arc<ActorClient>,
    /// Guider actor name to telescope name
    guiders: IndexMap<String, String>,
    buffer: Arc<Mutex<Vec<GuideRecord>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    data: Mutex<Option<Vec<GuideFrame>>>,
}
impl GuideMonitor {
    pub fn new(client: Arc<ActorClient>, guiders: IndexMap<String, String>) -> Self {
        Self {
            client,
            guiders,
            buffer: Default::default(),
            task: Mutex::new(None),
            data: Mutex::new(None),
        }
    }
    pub fn start(&self) {
        self.buffer.lock().clear();
        let replies = self.client.subscribe();
        let task = collect(replies, self.guiders.clone(), self.buffer.clone());
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }
    /// Stops collecting and folds what was received
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.update_data();
    }
    /// Discards the frames collected so far and starts over
    pub fn restart(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.data.lock() = None;
        self.start();
    }
    pub fn update_data(&self) {
        let records = self.buffer.lock().clone();
        if !records.is_empty() {
            *self.data.lock() = Some(aggregate(&records));
        }
    }
    pub fn frames(&self) -> Vec<GuideFrame> {
        self.data.lock().clone().unwrap_or_default()
    }
    /// First and last guider frame numbers of each telescope
    ///
    /// Telescopes with fewer than two frames get null values.
    pub fn to_header(&self) -> Header {
        let mut header = Header::new();
        let data = self.data.lock();
        let Some(frames) = data.as_ref() else {
            return header;
        };
        for telescope in self.guiders.values() {
            let numbers: Vec<u64> = frames
                .iter()
                .filter(|f| &f.telescope == telescope)
                .map(|f| f.frameno)
                .collect();
            let (first, last) = match numbers.len() {
                0 | 1 => (Value::Null, Value::Null),
                _ => (
                    numbers.iter().min().copied().into(),
                    numbers.iter().max().copied().into(),
                ),
            };
            let tel = telescope.to_uppercase();
            header.insert(format!("G{tel}FR0"), first);
            header.insert(format!("G{tel}FRN"), last);
        }
        header
    }
}
impl Drop for GuideMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
