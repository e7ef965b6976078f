//! # Dome motion
//!
//! Serialises the dome moves and the composite startup and shutdown
//! sequences.

use crate::{observatory::Observatory, retry::Retrier, Error, Result};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Mutex;

const STATUS_RETRY: Duration = Duration::from_secs(1);
const MOVE_RETRY: Duration = Duration::from_secs(5);
/// Wait before re-reading the dome after a failed move
const RECONCILE_DELAY: Duration = Duration::from_secs(3);
const STOP_SETTLE: Duration = Duration::from_secs(1);
const IDLE_POLL: Duration = Duration::from_secs(2);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DomeStatus: u8 {
        const OPEN = 1 << 0;
        const CLOSED = 1 << 1;
        const OPENING = 1 << 2;
        const CLOSING = 1 << 3;
        const MOVING = 1 << 4;
        const UNKNOWN = 1 << 5;
    }
}

/// Label combinations and the status they map to, first match wins
const LABELS: [(&[&str], DomeStatus); 6] = [
    (&["MOTOR_OPENING"], DomeStatus::OPENING.union(DomeStatus::MOVING)),
    (&["MOTOR_CLOSING"], DomeStatus::CLOSING.union(DomeStatus::MOVING)),
    (&["OPEN", "MOVING"], DomeStatus::OPENING.union(DomeStatus::MOVING)),
    (&["OPEN"], DomeStatus::OPEN),
    (&["CLOSED", "MOVING"], DomeStatus::CLOSING.union(DomeStatus::MOVING)),
    (&["CLOSED"], DomeStatus::CLOSED),
];

impl DomeStatus {
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let has = |label: &str| labels.iter().any(|l| l.as_ref() == label);
        LABELS
            .iter()
            .find(|(required, _)| required.iter().all(|l| has(*l)))
            .map(|(_, status)| *status)
            .unwrap_or(DomeStatus::UNKNOWN)
    }
}

/// The hardware behind the dome and its composite sequences
#[async_trait]
pub trait DomeHardware: Send + Sync {
    async fn dome_labels(&self) -> Result<Vec<String>>;
    async fn is_local(&self) -> Result<bool>;
    async fn open_dome(&self) -> Result<()>;
    async fn close_dome(&self) -> Result<()>;
    async fn stop_dome(&self) -> Result<()>;
    async fn startup_devices(&self) -> Result<()>;
    async fn lamps_off(&self) -> Result<()>;
    async fn stop_guiders(&self) -> Result<()>;
    async fn park_telescopes(&self) -> Result<()>;
}

#[async_trait]
impl DomeHardware for Observatory {
    async fn dome_labels(&self) -> Result<Vec<String>> {
        self.enclosure.dome_labels().await
    }
    async fn is_local(&self) -> Result<bool> {
        self.enclosure.is_local().await
    }
    async fn open_dome(&self) -> Result<()> {
        self.enclosure.open().await
    }
    async fn close_dome(&self) -> Result<()> {
        self.enclosure.close(false).await
    }
    async fn stop_dome(&self) -> Result<()> {
        self.enclosure.stop().await
    }
    async fn startup_devices(&self) -> Result<()> {
        Observatory::startup_devices(self).await
    }
    async fn lamps_off(&self) -> Result<()> {
        self.power.all_off().await
    }
    async fn stop_guiders(&self) -> Result<()> {
        self.guiders.stop(true).await
    }
    async fn park_telescopes(&self) -> Result<()> {
        self.park().await
    }
}

/// Dome moves, one at a time
///
/// Opening is refused until the conditions are reported safe.
pub struct DomeHelper {
    hardware: Arc<dyn DomeHardware>,
    move_lock: Mutex<()>,
    action_lock: Mutex<()>,
    safe: AtomicBool,
}
impl DomeHelper {
    pub fn new(hardware: Arc<dyn DomeHardware>) -> Self {
        Self {
            hardware,
            move_lock: Mutex::new(()),
            action_lock: Mutex::new(()),
            safe: AtomicBool::new(false),
        }
    }
    pub fn set_safe(&self, safe: bool) {
        self.safe.store(safe, Ordering::SeqCst);
    }
    pub fn is_safe(&self) -> bool {
        self.safe.load(Ordering::SeqCst)
    }
    pub async fn status(&self) -> Result<DomeStatus> {
        let labels = Retrier::new(3, STATUS_RETRY)
            .run(|| self.hardware.dome_labels())
            .await?;
        Ok(DomeStatus::from_labels(&labels))
    }
    pub async fn is_opening(&self) -> Result<bool> {
        Ok(self
            .status()
            .await?
            .intersects(DomeStatus::OPEN | DomeStatus::OPENING))
    }
    pub async fn is_closing(&self) -> Result<bool> {
        Ok(self
            .status()
            .await?
            .intersects(DomeStatus::CLOSED | DomeStatus::CLOSING))
    }
    pub async fn is_moving(&self) -> Result<bool> {
        Ok(self.status().await?.contains(DomeStatus::MOVING))
    }
    pub async fn wait_until_idle(&self) -> Result<()> {
        while self.is_moving().await? {
            tokio::time::sleep(IDLE_POLL).await;
        }
        Ok(())
    }
    pub async fn open(&self) -> Result<()> {
        self.move_dome(true).await
    }
    pub async fn close(&self) -> Result<()> {
        self.move_dome(false).await
    }
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.move_lock.lock().await;
        self.stop_motion().await
    }
    async fn stop_motion(&self) -> Result<()> {
        self.hardware.stop_dome().await?;
        tokio::time::sleep(STOP_SETTLE).await;
        if self.is_moving().await? {
            return Err(Error::DomeMotion("dome is still moving after stop".to_string()));
        }
        Ok(())
    }
    async fn move_dome(&self, open: bool) -> Result<()> {
        let _guard = self.move_lock.lock().await;
        let (verb, target, transit) = if open {
            ("open", DomeStatus::OPEN, DomeStatus::OPENING)
        } else {
            ("close", DomeStatus::CLOSED, DomeStatus::CLOSING)
        };

        let status = self.status().await?;
        if status.intersects(target | transit) {
            log::debug!("(Dome) already at or moving to the {verb} position.");
            return Ok(());
        }
        if open && !self.is_safe() {
            return Err(Error::Unsafe(
                "cannot open the dome when conditions are unsafe".to_string(),
            ));
        }
        if status.contains(DomeStatus::UNKNOWN) {
            log::warn!("(Dome) status is unknown. Stopping the dome.");
            self.stop_motion().await?;
        }
        if self.hardware.is_local().await? {
            return Err(Error::LocalMode(format!("cannot {verb} the dome in local mode")));
        }
        if status.contains(DomeStatus::MOVING) {
            log::warn!("(Dome) is moving. Stopping it before the {verb} move.");
            self.stop_motion().await?;
        }

        log::info!("(Dome) moving to {verb}.");
        let moved = Retrier::new(2, MOVE_RETRY)
            .run(|| async {
                if open {
                    self.hardware.open_dome().await
                } else {
                    self.hardware.close_dome().await
                }
            })
            .await;
        if let Err(e) = moved {
            log::warn!("(Dome) failed to {verb}: {e}. Checking the dome status.");
            tokio::time::sleep(RECONCILE_DELAY).await;
            let status = self.status().await?;
            if status.contains(DomeStatus::MOVING) {
                if let Err(e) = self.stop_motion().await {
                    log::error!("(Dome) {e}");
                }
            }
            if !status.contains(target) {
                return Err(Error::DomeMotion(format!("failed to {verb} the dome: {e}")));
            }
            log::warn!("(Dome) {verb} move reported an error but the dome reached its position.");
        }
        Ok(())
    }
    /// Prepares the devices and opens the dome
    pub async fn startup(&self) -> Result<()> {
        let _guard = self.action_lock.lock().await;
        log::info!("(Dome) running the startup sequence.");
        self.hardware.startup_devices().await?;
        self.open().await
    }
    /// Closes the dome, turning lamps off and stopping the guiders meanwhile
    ///
    /// Returns early if the dome is already closing, unless `force`.
    pub async fn shutdown(&self, force: bool, park: bool) -> Result<()> {
        let _guard = self.action_lock.lock().await;
        if !force && self.is_closing().await? {
            log::debug!("(Dome) already closed or closing.");
            return Ok(());
        }
        log::info!("(Dome) running the shutdown sequence.");
        let (lamps, guiders, closed) = tokio::join!(
            self.hardware.lamps_off(),
            self.hardware.stop_guiders(),
            self.close()
        );
        if let Err(e) = lamps {
            log::warn!("(Dome) failed turning lamps off: {e}");
        }
        if let Err(e) = guiders {
            log::warn!("(Dome) failed stopping guiders: {e}");
        }
        closed?;
        if park {
            self.hardware.park_telescopes().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;

    /// A dome taking 10 s to move, counting the commands it receives
    pub(crate) struct FakeDome {
        pub(crate) labels: SyncMutex<Vec<String>>,
        pub(crate) opens: AtomicUsize,
        pub(crate) closes: AtomicUsize,
        pub(crate) stops: AtomicUsize,
        pub(crate) parks: AtomicUsize,
        /// The close command fails, leaving the dome where it is
        pub(crate) jammed: bool,
        /// The open command reaches the open position but reports a failure
        pub(crate) flaky: bool,
    }
    impl FakeDome {
        pub(crate) fn new(label: &str) -> Self {
            Self {
                labels: SyncMutex::new(vec![label.to_string()]),
                opens: Default::default(),
                closes: Default::default(),
                stops: Default::default(),
                parks: Default::default(),
                jammed: false,
                flaky: false,
            }
        }
        fn set(&self, labels: &[&str]) {
            *self.labels.lock() = labels.iter().map(|l| l.to_string()).collect();
        }
    }
    #[async_trait]
    impl DomeHardware for FakeDome {
        async fn dome_labels(&self) -> Result<Vec<String>> {
            Ok(self.labels.lock().clone())
        }
        async fn is_local(&self) -> Result<bool> {
            Ok(false)
        }
        async fn open_dome(&self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.set(&["OPEN", "MOVING"]);
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.set(&["OPEN"]);
            if self.flaky {
                return Err(Error::Enclosure("lost the motor controller reply".to_string()));
            }
            Ok(())
        }
        async fn close_dome(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.jammed {
                return Err(Error::Enclosure("motor fault".to_string()));
            }
            self.set(&["CLOSED", "MOVING"]);
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.set(&["CLOSED"]);
            Ok(())
        }
        async fn stop_dome(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn startup_devices(&self) -> Result<()> {
            Ok(())
        }
        async fn lamps_off(&self) -> Result<()> {
            Ok(())
        }
        async fn stop_guiders(&self) -> Result<()> {
            Ok(())
        }
        async fn park_telescopes(&self) -> Result<()> {
            self.parks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn labels() {
        assert_eq!(DomeStatus::from_labels(&["OPEN"]), DomeStatus::OPEN);
        assert_eq!(
            DomeStatus::from_labels(&["CLOSED", "MOVING"]),
            DomeStatus::CLOSING | DomeStatus::MOVING
        );
        assert_eq!(
            DomeStatus::from_labels(&["OPEN", "MOTOR_CLOSING"]),
            DomeStatus::CLOSING | DomeStatus::MOVING
        );
        assert_eq!(DomeStatus::from_labels::<&str>(&[]), DomeStatus::UNKNOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_opens() {
        let hardware = Arc::new(FakeDome::new("CLOSED"));
        let dome = DomeHelper::new(hardware.clone());
        dome.set_safe(true);
        let (first, second) = tokio::join!(dome.open(), dome.open());
        first.unwrap();
        second.unwrap();
        assert_eq!(hardware.opens.load(Ordering::SeqCst), 1);
        assert!(dome.is_opening().await.unwrap());
        // already open
        dome.open().await.unwrap();
        assert_eq!(hardware.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_close() {
        let hardware = Arc::new(FakeDome {
            jammed: true,
            ..FakeDome::new("OPEN")
        });
        let dome = DomeHelper::new(hardware.clone());
        let err = dome.shutdown(false, true).await.unwrap_err();
        assert_eq!(err.code().value(), 502);
        assert_eq!(hardware.closes.load(Ordering::SeqCst), 2);
        assert_eq!(hardware.parks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_parks() {
        let hardware = Arc::new(FakeDome::new("OPEN"));
        let dome = DomeHelper::new(hardware.clone());
        dome.shutdown(false, true).await.unwrap();
        assert_eq!(hardware.parks.load(Ordering::SeqCst), 1);
        // closed already
        dome.shutdown(false, true).await.unwrap();
        assert_eq!(hardware.closes.load(Ordering::SeqCst), 1);
        assert_eq!(hardware.parks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_unsafe_open() {
        let hardware = Arc::new(FakeDome::new("CLOSED"));
        let dome = DomeHelper::new(hardware.clone());
        let err = dome.open().await.unwrap_err();
        assert!(matches!(err, Error::Unsafe(_)));
        assert_eq!(hardware.opens.load(Ordering::SeqCst), 0);
        // closing is always allowed
        hardware.set(&["OPEN"]);
        dome.close().await.unwrap();
        assert_eq!(hardware.closes.load(Ordering::SeqCst), 1);
        dome.set_safe(true);
        hardware.set(&["CLOSED"]);
        dome.open().await.unwrap();
        assert_eq!(hardware.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_at_target_is_reconciled() {
        let hardware = Arc::new(FakeDome {
            flaky: true,
            ..FakeDome::new("CLOSED")
        });
        let dome = DomeHelper::new(hardware.clone());
        dome.set_safe(true);
        dome.open().await.unwrap();
        assert_eq!(hardware.opens.load(Ordering::SeqCst), 2);
        assert_eq!(hardware.stops.load(Ordering::SeqCst), 0);
        assert_eq!(dome.status().await.unwrap(), DomeStatus::OPEN);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_stops_first() {
        let hardware = Arc::new(FakeDome::new("ERROR"));
        let dome = DomeHelper::new(hardware.clone());
        dome.set_safe(true);
        dome.open().await.unwrap();
        assert_eq!(hardware.stops.load(Ordering::SeqCst), 1);
        assert_eq!(hardware.opens.load(Ordering::SeqCst), 1);
        assert_eq!(dome.status().await.unwrap(), DomeStatus::OPEN);
    }
}
