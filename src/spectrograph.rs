//! # Spectrographs
//!
//! Science exposures are taken by all the spectrographs at once: integrate,
//! run the pre-readout hook, then read out with the header the hook filled.

use crate::{
    actor::{Args, RemoteActor},
    device::{parse_labels, Device, DeviceSet},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{future::Future, ops::Deref, sync::Arc, time::Duration};
use tokio::time::Instant;

/// Extra time allowed to the `expose` command beyond the exposure time
const EXPOSE_MARGIN: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Header keywords added to the raw frames
pub type Header = IndexMap<String, Value>;

#[derive(Debug, Clone, Serialize)]
pub struct Exposure {
    pub exp_no: u64,
    pub flavour: String,
    pub object: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Seconds
    pub exposure_time: f64,
    pub header: Header,
}

/// Called once the shutter closes, before the frames are read
#[async_trait]
pub trait ExposureHook: Send + Sync {
    async fn pre_readout(&self, exposure: &Exposure, header: &mut Header) -> Result<()>;
}

pub struct Spectrograph {
    name: String,
    actor: Arc<RemoteActor>,
}
impl Device for Spectrograph {
    fn name(&self) -> &str {
        &self.name
    }
    fn actor(&self) -> &Arc<RemoteActor> {
        &self.actor
    }
}
impl Spectrograph {
    pub fn new(name: impl Into<String>, actor: Arc<RemoteActor>) -> Self {
        Self {
            name: name.into(),
            actor,
        }
    }
    pub async fn status(&self) -> Result<Map<String, Value>> {
        let reply = self.actor.invoke("status", Args::new()).await?;
        Ok(match reply.flatten().remove("status") {
            Some(Value::Object(status)) => status,
            _ => Map::new(),
        })
    }
    /// Status labels, e.g. `IDLE`, `READOUT_PENDING`
    pub async fn status_names(&self) -> Result<Vec<String>> {
        let status = self.status().await?;
        Ok(status.get("status_names").map(parse_labels).unwrap_or_default())
    }
    /// Idle and with no readout pending
    pub async fn is_idle(&self) -> Result<bool> {
        let names = self.status_names().await?;
        Ok(names.iter().any(|n| n == "IDLE") && !names.iter().any(|n| n == "READOUT_PENDING"))
    }
    pub async fn abort(&self) -> Result<()> {
        self.write_to_log("Aborting exposures.", log::Level::Warn);
        if let Err(e) = self.actor.invoke("abort", Args::new()).await {
            self.write_to_log(&format!("abort failed: {e}"), log::Level::Debug);
        }
        self.actor.invoke("reset", Args::new()).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    started: Instant,
    exposure_time: f64,
}

async fn within<T>(
    timeout: Duration,
    what: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::Timeout(what.to_string()))?
}

pub struct SpectrographSet {
    specs: DeviceSet<Spectrograph>,
    progress: Mutex<Option<Progress>>,
    last_exp_no: Mutex<u64>,
}
impl Deref for SpectrographSet {
    type Target = DeviceSet<Spectrograph>;
    fn deref(&self) -> &Self::Target {
        &self.specs
    }
}
impl SpectrographSet {
    pub fn new(specs: DeviceSet<Spectrograph>) -> Self {
        Self {
            specs,
            progress: Mutex::new(None),
            last_exp_no: Mutex::new(0),
        }
    }
    /// Status of each spectrograph, in member order
    pub async fn status(&self) -> Result<IndexMap<String, Map<String, Value>>> {
        let statuses = self
            .specs
            .call_on_all(|spec| async move { spec.status().await })
            .await?;
        Ok(self.specs.names().map(String::from).zip(statuses).collect())
    }
    pub async fn are_idle(&self) -> Result<bool> {
        let idle = self
            .specs
            .call_on_all(|spec| async move { spec.is_idle().await })
            .await?;
        Ok(idle.into_iter().all(|idle| idle))
    }
    pub async fn reset(&self) -> Result<()> {
        self.specs.broadcast_command("reset", Args::new()).await?;
        Ok(())
    }
    pub async fn abort(&self) -> Result<()> {
        self.specs
            .call_on_all(|spec| async move { spec.abort().await })
            .await?;
        *self.progress.lock() = None;
        Ok(())
    }
    /// Reads out or aborts any exposure waiting for readout
    pub async fn finish_pending(&self, readout: bool) -> Result<()> {
        self.specs
            .call_on_all(|spec| async move {
                let names = spec.status_names().await?;
                if !names.iter().any(|n| n == "READOUT_PENDING") {
                    return Ok(());
                }
                if readout {
                    spec.write_to_log("Reading pending exposure.", log::Level::Warn);
                    spec.actor().invoke("read", Args::new()).await?;
                    Ok(())
                } else {
                    spec.abort().await
                }
            })
            .await?;
        *self.progress.lock() = None;
        Ok(())
    }
    /// Seconds left in the current integration, `None` when not exposing
    pub fn remaining(&self) -> Option<f64> {
        self.progress.lock().map(|p| {
            (p.exposure_time - p.started.elapsed().as_secs_f64()).max(0.)
        })
    }
    pub fn is_exposing(&self) -> bool {
        self.progress.lock().is_some()
    }
    /// The next exposure number, from the largest `last_exposure_no` reported
    async fn next_exposure_no(&self) -> Result<u64> {
        let statuses = self.status().await?;
        let reported = statuses
            .values()
            .filter_map(|s| s.get("last_exposure_no").and_then(Value::as_u64))
            .max()
            .unwrap_or(0);
        let mut last = self.last_exp_no.lock();
        *last = (*last).max(reported) + 1;
        Ok(*last)
    }
    async fn check_idle(&self) -> Result<()> {
        for (name, status) in self.status().await? {
            let names = status.get("status_names").map(parse_labels).unwrap_or_default();
            if !names.iter().any(|n| n == "IDLE") {
                return Err(Error::SpectrographNotIdle(format!("{name} is not idle")));
            }
            if names.iter().any(|n| n == "ERROR") {
                return Err(Error::SpectrographNotIdle(format!(
                    "{name} has ERROR status, solve it manually before exposing"
                )));
            }
        }
        Ok(())
    }
    /// Takes one exposure with all the spectrographs
    pub async fn expose(
        &self,
        flavour: &str,
        exposure_time: f64,
        object: Option<&str>,
        hook: Option<&dyn ExposureHook>,
    ) -> Result<Exposure> {
        self.check_idle().await?;
        self.reset().await?;
        let exp_no = self.next_exposure_no().await?;
        log::info!("Taking spectrograph exposure {exp_no} ({flavour}, {exposure_time:.1} s).");

        let mut header = Header::new();
        header.insert(
            "OBJECT".to_string(),
            Value::from(object.unwrap_or(if flavour == "object" { "" } else { flavour })),
        );
        let mut exposure = Exposure {
            exp_no,
            flavour: flavour.to_string(),
            object: object.map(String::from),
            start_time: Utc::now(),
            exposure_time,
            header: Header::new(),
        };
        *self.progress.lock() = Some(Progress {
            started: Instant::now(),
            exposure_time,
        });
        let result = self.integrate_and_read(&exposure, &mut header, hook).await;
        *self.progress.lock() = None;
        result.map_err(|e| match e {
            e @ Error::Spectrograph(_) => e,
            e => Error::Spectrograph(format!("exposure {exp_no} failed with error {e}")),
        })?;
        log::info!("Exposure {exp_no} completed.");
        exposure.header = header;
        Ok(exposure)
    }
    async fn integrate_and_read(
        &self,
        exposure: &Exposure,
        header: &mut Header,
        hook: Option<&dyn ExposureHook>,
    ) -> Result<()> {
        let expose = Args::new()
            .arg(exposure.exposure_time)
            .kwarg("flavour", exposure.flavour.as_str())
            .kwarg("seqno", exposure.exp_no)
            .kwarg("readout", false);
        within(
            Duration::from_secs_f64(exposure.exposure_time.max(0.)) + EXPOSE_MARGIN,
            "spectrograph integration",
            self.specs.broadcast_command("expose", expose),
        )
        .await?;
        if let Some(hook) = hook {
            hook.pre_readout(exposure, header).await?;
        }
        let header = serde_json::to_string(&*header)?;
        within(
            READ_TIMEOUT,
            "spectrograph readout",
            self.specs
                .broadcast_command("read", Args::new().kwarg("header", header)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Scripted};
    use serde_json::json;

    /// A spectrograph bus reporting `labels` on status
    pub(crate) fn spec_bus(labels: &'static str) -> Arc<MockBus> {
        Arc::new(MockBus::new(move |_, command| match command {
            "status" => Scripted::done(vec![json!({
                "status": {"status_names": labels, "last_exposure_no": 41}
            })]),
            _ => Scripted::ok(),
        }))
    }

    pub(crate) fn specs(bus: &Arc<MockBus>) -> SpectrographSet {
        SpectrographSet::new(DeviceSet::new(
            "specs",
            ["sp1", "sp2"].map(|name| {
                Spectrograph::new(name, Arc::new(RemoteActor::new(format!("lvmscp.{name}"), bus.clone())))
            }),
        ))
    }

    struct Tagger;
    #[async_trait]
    impl ExposureHook for Tagger {
        async fn pre_readout(&self, exposure: &Exposure, header: &mut Header) -> Result<()> {
            header.insert("EXPNO".into(), exposure.exp_no.into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn exposure_sequence() {
        let bus = spec_bus("IDLE");
        let specs = specs(&bus);
        let exposure = specs
            .expose("object", 900., Some("tile 1"), Some(&Tagger))
            .await
            .unwrap();
        assert_eq!(exposure.exp_no, 42);
        assert_eq!(exposure.header["OBJECT"], "tile 1");
        assert_eq!(exposure.header["EXPNO"], 42);
        let sent: Vec<String> = bus
            .sent_to("lvmscp.sp1", "")
            .into_iter()
            .filter(|c| c != "status")
            .collect();
        assert_eq!(
            sent,
            vec![
                "reset".to_string(),
                "expose 900.0 --flavour object --seqno 42".to_string(),
                r#"read --header "{\"OBJECT\":\"tile 1\",\"EXPNO\":42}""#.to_string(),
            ]
        );
        assert!(!specs.is_exposing());
        // numbers keep increasing even if the actors do not report them
        assert_eq!(specs.next_exposure_no().await.unwrap(), 43);
    }

    #[tokio::test]
    async fn not_idle() {
        let bus = spec_bus("IDLE|ERROR");
        let err = specs(&bus)
            .expose("object", 10., None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code().value(), 302);
        assert!(bus.sent_to("lvmscp.sp1", "expose").is_empty());
    }

    #[tokio::test]
    async fn failed_exposure() {
        let bus = Arc::new(MockBus::new(|actor, command| match command {
            "status" => Scripted::done(vec![json!({"status": {"status_names": "IDLE"}})]),
            c if c.starts_with("expose") && actor == "lvmscp.sp2" => Scripted::fail("shutter"),
            _ => Scripted::ok(),
        }));
        let specs = specs(&bus);
        let err = specs.expose("object", 10., None, None).await.unwrap_err();
        assert_eq!(err.code().value(), 300);
        assert!(bus.sent_to("lvmscp.sp1", "read").is_empty());
        assert_eq!(specs.remaining(), None);
    }

    #[tokio::test]
    async fn pending_readout() {
        let bus = spec_bus("IDLE READOUT_PENDING");
        let specs = specs(&bus);
        assert!(!specs.are_idle().await.unwrap());
        specs.finish_pending(true).await.unwrap();
        assert_eq!(bus.sent_to("lvmscp.sp2", "read"), vec!["read"]);
        specs.finish_pending(false).await.unwrap();
        assert_eq!(bus.sent_to("lvmscp.sp2", "abort"), vec!["abort"]);
    }
}
