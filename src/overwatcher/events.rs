//! # Events
//!
//! Significant overwatcher events, persisted as an append-only table of
//! `{date, event, payload}` rows.

use super::notifier::Notifier;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::PathBuf,
    sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Error,
    RecipeStart,
    RecipeEnd,
    RecipeFailed,
    ObserverNewTile,
    ObserverStageRunning,
    ObserverStageDone,
    ObserverStageFailed,
    ObserverAcquisitionStart,
    ObserverAcquisitionDone,
    ObserverStandardAcquisitionFailed,
    DomeOpening,
    DomeOpen,
    DomeClosing,
    DomeClosed,
    EmergencyShutdown,
    UnexpectedFibselRehome,
    Uncategorised,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub date: DateTime<Utc>,
    pub event: Event,
    /// JSON object
    pub payload: String,
}
impl EventRecord {
    pub fn new(event: Event, payload: &Map<String, Value>) -> Self {
        Self {
            date: Utc::now(),
            event,
            payload: Value::Object(payload.clone()).to_string(),
        }
    }
}

pub trait EventStore: Send + Sync {
    fn append(&self, record: &EventRecord) -> Result<()>;
}

/// Events appended as bincode records to a file
pub struct FileEventStore {
    path: PathBuf,
    lock: Mutex<()>,
}
impl FileEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
    /// Reads back every record of the file
    pub fn read_all(&self) -> Result<Vec<EventRecord>> {
        let _guard = self.lock.lock();
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        loop {
            match bincode::deserialize_from::<_, EventRecord>(&mut reader) {
                Ok(record) => records.push(record),
                Err(e) if matches!(&*e, bincode::ErrorKind::Io(io) if io.kind() == ErrorKind::UnexpectedEof) => {
                    break Ok(records)
                }
                Err(e) => break Err(Error::Bincode(e)),
            }
        }
    }
}
impl EventStore for FileEventStore {
    fn append(&self, record: &EventRecord) -> Result<()> {
        let _guard = self.lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, record)?;
        writer.flush()?;
        Ok(())
    }
}

/// Persists events, notifying the ones operators care about
pub struct EventRecorder {
    store: Arc<dyn EventStore>,
    notifier: Arc<Notifier>,
}
impl EventRecorder {
    pub fn new(store: Arc<dyn EventStore>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }
    pub async fn record(&self, event: Event, payload: Map<String, Value>) {
        if let Err(e) = self.store.append(&EventRecord::new(event, &payload)) {
            log::error!("(Overwatcher) failed to write event {event:?}: {e}");
        }
        if event == Event::ObserverNewTile {
            if let Some(tile_id) = payload.get("tile_id").filter(|id| !id.is_null()) {
                let dither = payload
                    .get("dither_position")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                self.notifier
                    .info(format!("Observing tile {tile_id} on dither position #{dither}."))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overwatcher::notifier::tests::RecordingSink;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn record_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileEventStore::new(dir.path().join("events.bin")));
        assert!(store.read_all().unwrap().is_empty());
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(Notifier::new(sink.clone(), "lvm-overwatcher", Duration::from_secs(60)));
        let recorder = EventRecorder::new(store.clone(), notifier);

        recorder.record(Event::DomeOpening, Map::new()).await;
        let Value::Object(payload) = json!({"tile_id": 1024, "dither_position": 2}) else {
            unreachable!()
        };
        recorder.record(Event::ObserverNewTile, payload).await;

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, Event::DomeOpening);
        assert_eq!(records[0].payload, "{}");
        let payload: Value = serde_json::from_str(&records[1].payload).unwrap();
        assert_eq!(payload["tile_id"], 1024);
        assert_eq!(sink.relayed(), vec!["Observing tile 1024 on dither position #2."]);
    }

    #[test]
    fn event_names() {
        assert_eq!(
            serde_json::to_string(&Event::ObserverNewTile).unwrap(),
            r#""OBSERVER_NEW_TILE""#
        );
    }
}
