//! # Telescopes
//!
//! Mount control with pointing verification, the k-mirrors derotating the
//! science and sky fields, and the fibre selector mounted on the standards
//! telescope.

use crate::{
    actor::{Args, RemoteActor},
    config::{AltAz, KMirrorConfig, TelescopesConfig},
    coordinates::angular_separation,
    device::{gather, Device, DeviceSet},
    enclosure::Enclosure,
    Error, Result,
};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::{ops::Deref, sync::Arc, time::Duration};

/// Largest accepted distance, in degrees, between commanded and reported positions
pub const POINTING_TOLERANCE: f64 = 0.1;
/// Wait before re-sending a goto that missed its target
pub const POINTING_RETRY_DELAY: Duration = Duration::from_secs(3);

/// A mount target
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// J2000 RA/Dec in degrees
    RaDec { ra: f64, dec: f64 },
    /// Horizontal coordinates in degrees
    AltAz { alt: f64, az: f64 },
}
impl Target {
    fn separation(&self, other: &Target) -> Option<f64> {
        match (self, other) {
            (Target::RaDec { ra, dec }, Target::RaDec { ra: ra2, dec: dec2 }) => {
                Some(angular_separation(*ra, *dec, *ra2, *dec2))
            }
            (Target::AltAz { alt, az }, Target::AltAz { alt: alt2, az: az2 }) => {
                Some(angular_separation(*az, *alt, *az2, *alt2))
            }
            _ => None,
        }
    }
}

/// A pointing offset in arcsec, either on the sky or along the mount axes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Offset {
    RaDec { ra: f64, dec: f64 },
    Axis { axis0: f64, axis1: f64 },
}

fn number(status: &Map<String, Value>, key: &str) -> Result<f64> {
    status
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::InvalidPosition(format!("status has no {key}")))
}

/// Field derotator, tracking alongside the mount
pub struct KMirror {
    name: String,
    actor: Arc<RemoteActor>,
    /// Wait before each move so the k-mirrors do not start together
    slew_delay: Duration,
}
impl Device for KMirror {
    fn name(&self) -> &str {
        &self.name
    }
    fn actor(&self) -> &Arc<RemoteActor> {
        &self.actor
    }
}
impl KMirror {
    pub fn new(name: impl Into<String>, actor: Arc<RemoteActor>, slew_delay: Duration) -> Self {
        Self {
            name: name.into(),
            actor,
            slew_delay,
        }
    }
    pub fn from_config(telescope: &str, config: &KMirrorConfig, actor: Arc<RemoteActor>) -> Self {
        Self::new(
            format!("{telescope}.km"),
            actor,
            Duration::from_secs_f64(config.slew_delay.max(0.)),
        )
    }
    pub async fn home(&self) -> Result<()> {
        tokio::time::sleep(self.slew_delay).await;
        self.write_to_log("Homing k-mirror.", log::Level::Info);
        self.actor.invoke("moveToHome", Args::new()).await?;
        Ok(())
    }
    /// Moves to `degs` and stays there
    pub async fn move_to(&self, degs: f64) -> Result<()> {
        tokio::time::sleep(self.slew_delay).await;
        self.write_to_log(&format!("Moving k-mirror to {degs:.3} degrees."), log::Level::Info);
        self.actor.invoke("slewStop", Args::new()).await?;
        self.actor
            .invoke("moveAbsolute", Args::new().arg(degs).arg("deg"))
            .await?;
        Ok(())
    }
    pub async fn park(&self) -> Result<()> {
        self.move_to(90.).await
    }
    /// Starts derotating the field at J2000 RA/Dec, in degrees
    pub async fn slew(&self, ra: f64, dec: f64) -> Result<()> {
        tokio::time::sleep(self.slew_delay).await;
        self.write_to_log(
            &format!("Slewing k-mirror to ra={ra:.6} dec={dec:.6} and tracking."),
            log::Level::Info,
        );
        self.actor
            .invoke("slewStart", Args::new().arg(ra / 15.).arg(dec))
            .await?;
        Ok(())
    }
}

pub struct Telescope {
    name: String,
    actor: Arc<RemoteActor>,
    enclosure: Arc<Enclosure>,
    kmirror: Option<KMirror>,
    /// RA/Dec offsets in arcsec
    pointing_offsets: Option<(f64, f64)>,
    named_positions: IndexMap<String, AltAz>,
}
impl Device for Telescope {
    fn name(&self) -> &str {
        &self.name
    }
    fn actor(&self) -> &Arc<RemoteActor> {
        &self.actor
    }
}
impl Telescope {
    pub fn new(
        name: impl Into<String>,
        actor: Arc<RemoteActor>,
        enclosure: Arc<Enclosure>,
        pointing_offsets: Option<(f64, f64)>,
        named_positions: IndexMap<String, AltAz>,
    ) -> Self {
        Self {
            name: name.into(),
            actor,
            enclosure,
            pointing_offsets,
            named_positions,
            kmirror: None,
        }
    }
    pub fn with_kmirror(mut self, kmirror: KMirror) -> Self {
        self.kmirror = Some(kmirror);
        self
    }
    pub fn kmirror(&self) -> Option<&KMirror> {
        self.kmirror.as_ref()
    }
    pub async fn status(&self) -> Result<Map<String, Value>> {
        Ok(self.actor.invoke("status", Args::new()).await?.flatten())
    }
    /// Connected and with the axes enabled
    pub async fn is_ready(&self) -> Result<bool> {
        let status = self.status().await?;
        let flag = |key: &str| status.get(key).and_then(Value::as_bool).unwrap_or(false);
        Ok(flag("is_connected") && flag("is_enabled"))
    }
    /// Connects the mount and enables the axes if needed
    pub async fn initialise(&self) -> Result<()> {
        if self.is_ready().await? {
            return Ok(());
        }
        self.write_to_log("Initialising telescope.", log::Level::Info);
        self.actor.invoke("setConnected", Args::new().arg(true)).await?;
        self.actor.invoke("setEnabled", Args::new().arg(true)).await?;
        Ok(())
    }
    async fn check_local(&self, force: bool) -> Result<()> {
        if !force && self.enclosure.is_local().await? {
            return Err(Error::LocalMode(format!(
                "cannot move telescope {} in local mode",
                self.name
            )));
        }
        Ok(())
    }
    pub async fn home(&self, force: bool) -> Result<()> {
        self.check_local(force).await?;
        self.initialise().await?;
        self.write_to_log("Homing telescope.", log::Level::Info);
        self.actor.invoke("findHome", Args::new()).await?;
        if let Some(kmirror) = &self.kmirror {
            kmirror.home().await?;
        }
        Ok(())
    }
    /// Moves to the `park` named position, optionally disabling the axes
    ///
    /// The k-mirror, if any, is parked afterwards.
    pub async fn park(&self, disable: bool, force: bool) -> Result<()> {
        self.goto_named("park", force).await?;
        if disable {
            self.write_to_log("Disabling telescope.", log::Level::Info);
            self.actor.invoke("setEnabled", Args::new().arg(false)).await?;
        }
        if let Some(kmirror) = &self.kmirror {
            kmirror.park().await?;
        }
        Ok(())
    }
    pub async fn stop(&self) -> Result<()> {
        self.write_to_log("Stopping telescope.", log::Level::Info);
        self.actor.invoke("stop", Args::new()).await?;
        Ok(())
    }
    /// Slews to J2000 RA/Dec, in degrees, and starts tracking
    ///
    /// The per-telescope pointing offsets are applied first, then RA is
    /// clipped to [0, 360] and Dec to [-90, 90]. The k-mirror, if any,
    /// starts tracking the field while the mount slews.
    pub async fn goto_radec(&self, ra: f64, dec: f64, force: bool) -> Result<()> {
        let (mut mount_ra, mut mount_dec) = (ra, dec);
        if let Some((ra_offset, dec_offset)) = self.pointing_offsets {
            mount_ra += ra_offset / 3600. / dec.to_radians().cos();
            mount_dec += dec_offset / 3600.;
        }
        let target = Target::RaDec {
            ra: mount_ra.clamp(0., 360.),
            dec: mount_dec.clamp(-90., 90.),
        };
        let Some(kmirror) = &self.kmirror else {
            return self.goto(target, false, force).await;
        };
        self.check_local(force).await?;
        let (slewed, tracking) = tokio::join!(self.goto(target, false, force), kmirror.slew(ra, dec));
        slewed?;
        tracking
    }
    /// Slews to Alt/Az, in degrees
    pub async fn goto_altaz(&self, alt: f64, az: f64, tracking: bool, force: bool) -> Result<()> {
        self.goto(Target::AltAz { alt, az }, tracking, force).await
    }
    /// Slews to one of the configured named positions, e.g. `park` or `zenith`
    pub async fn goto_named(&self, name: &str, force: bool) -> Result<()> {
        let position = self
            .named_positions
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidPosition(format!("unknown named position {name:?}")))?;
        self.write_to_log(&format!("Moving to named position {name:?}."), log::Level::Info);
        self.goto_altaz(position.alt, position.az, false, force).await
    }
    pub async fn offset(&self, offset: Offset) -> Result<()> {
        let args = match offset {
            Offset::RaDec { ra, dec } => Args::new()
                .kwarg("ra_add_arcsec", ra)
                .kwarg("dec_add_arcsec", dec),
            Offset::Axis { axis0, axis1 } => Args::new()
                .kwarg("axis0_add_arcsec", axis0)
                .kwarg("axis1_add_arcsec", axis1),
        };
        self.actor.invoke("offset", args).await?;
        Ok(())
    }
    async fn send_goto(&self, target: Target) -> Result<()> {
        let (command, args) = match target {
            Target::RaDec { ra, dec } => {
                self.write_to_log(
                    &format!("Moving to ra={ra:.6} dec={dec:.6}."),
                    log::Level::Info,
                );
                ("gotoRaDecJ2000", Args::new().arg(ra / 15.).arg(dec))
            }
            Target::AltAz { alt, az } => {
                self.write_to_log(&format!("Moving to alt={alt:.6} az={az:.6}."), log::Level::Info);
                ("gotoAltAzJ2000", Args::new().arg(alt).arg(az))
            }
        };
        self.actor.invoke(command, args).await?;
        Ok(())
    }
    async fn reported(&self, target: &Target) -> Result<Target> {
        let status = self.status().await?;
        Ok(match target {
            Target::RaDec { .. } => Target::RaDec {
                ra: number(&status, "ra_j2000_hours")? * 15.,
                dec: number(&status, "dec_j2000_degs")?,
            },
            Target::AltAz { .. } => Target::AltAz {
                alt: number(&status, "altitude_degs")?,
                az: number(&status, "azimuth_degs")?,
            },
        })
    }
    async fn pointing_error(&self, target: &Target) -> Result<f64> {
        let reported = self.reported(target).await?;
        target
            .separation(&reported)
            .ok_or_else(|| Error::InvalidPosition("mismatched coordinate frames".to_string()))
    }
    async fn goto(&self, target: Target, tracking: bool, force: bool) -> Result<()> {
        self.check_local(force).await?;
        self.initialise().await?;
        self.send_goto(target).await?;
        let separation = self.pointing_error(&target).await?;
        if separation > POINTING_TOLERANCE {
            self.write_to_log(
                &format!("Failed to reach the desired position ({separation:.3} deg off). Retrying."),
                log::Level::Warn,
            );
            tokio::time::sleep(POINTING_RETRY_DELAY).await;
            self.send_goto(target).await?;
            let separation = self.pointing_error(&target).await?;
            if separation > POINTING_TOLERANCE {
                self.actor.invoke("setEnabled", Args::new().arg(false)).await?;
                return Err(Error::Pointing {
                    telescope: self.name.clone(),
                    separation,
                });
            }
        }
        if tracking {
            self.actor.invoke("setTracking", Args::new().arg(true)).await?;
        }
        self.write_to_log("Position reached.", log::Level::Debug);
        Ok(())
    }
}

/// The fibre mask selecting which standard star fibre is exposed
pub struct FibreSelector {
    name: String,
    actor: Arc<RemoteActor>,
    positions: IndexMap<String, i64>,
}
impl Device for FibreSelector {
    fn name(&self) -> &str {
        &self.name
    }
    fn actor(&self) -> &Arc<RemoteActor> {
        &self.actor
    }
}
impl FibreSelector {
    pub fn new(actor: Arc<RemoteActor>, positions: IndexMap<String, i64>) -> Self {
        Self {
            name: "fibsel".to_string(),
            actor,
            positions,
        }
    }
    pub fn list_positions(&self) -> Vec<&str> {
        self.positions.keys().map(String::as_str).collect()
    }
    /// Names of the positions matching the regular expression prefix `pattern`, sorted by motor steps
    pub fn select_positions(&self, pattern: &str) -> Result<Vec<String>> {
        let re = Regex::new(&format!("^(?:{pattern})"))
            .map_err(|e| Error::InvalidArgument(format!("invalid position pattern: {e}")))?;
        let mut selected: Vec<(&String, i64)> = self
            .positions
            .iter()
            .filter(|(name, _)| re.is_match(name))
            .map(|(name, steps)| (name, *steps))
            .collect();
        selected.sort_by_key(|(_, steps)| *steps);
        Ok(selected.into_iter().map(|(name, _)| name.clone()).collect())
    }
    pub async fn move_to_position(&self, position: &str) -> Result<()> {
        let steps = *self.positions.get(position).ok_or_else(|| {
            Error::FibreSelector(format!("cannot find position {position:?}"))
        })?;
        self.write_to_log(
            &format!("Moving mask to {position}: {steps} steps."),
            log::Level::Info,
        );
        self.move_absolute(steps).await
    }
    pub async fn move_absolute(&self, steps: i64) -> Result<()> {
        self.actor.invoke("moveAbsolute", Args::new().arg(steps)).await?;
        Ok(())
    }
    pub async fn move_relative(&self, steps: i64) -> Result<()> {
        self.write_to_log(&format!("Moving mask {steps} steps."), log::Level::Debug);
        self.actor.invoke("moveRelative", Args::new().arg(steps)).await?;
        Ok(())
    }
    pub async fn home(&self) -> Result<()> {
        self.actor.invoke("moveToHome", Args::new()).await?;
        Ok(())
    }
}

/// The telescopes with the fibre selector and the enclosure they sit in
pub struct TelescopeSet {
    telescopes: DeviceSet<Telescope>,
    pub fibsel: Arc<FibreSelector>,
    enclosure: Arc<Enclosure>,
}
impl Deref for TelescopeSet {
    type Target = DeviceSet<Telescope>;
    fn deref(&self) -> &Self::Target {
        &self.telescopes
    }
}
impl TelescopeSet {
    pub fn new(
        telescopes: DeviceSet<Telescope>,
        fibsel: FibreSelector,
        enclosure: Arc<Enclosure>,
    ) -> Self {
        Self {
            telescopes,
            fibsel: Arc::new(fibsel),
            enclosure,
        }
    }
    /// Builds the set from the configuration
    pub fn from_config(
        config: &TelescopesConfig,
        actor: impl Fn(&str) -> Arc<RemoteActor>,
        enclosure: Arc<Enclosure>,
    ) -> Self {
        let telescopes = DeviceSet::new(
            "telescopes",
            config.devices.iter().map(|(name, telescope)| {
                let mount = Telescope::new(
                    name,
                    actor(&telescope.actor),
                    enclosure.clone(),
                    telescope.pointing_offsets,
                    config.named_positions.clone(),
                );
                match &telescope.kmirror {
                    Some(km) => mount.with_kmirror(KMirror::from_config(name, km, actor(&km.actor))),
                    None => mount,
                }
            }),
        );
        let fibsel = FibreSelector::new(actor(&config.fibsel), config.mask_positions.clone());
        Self::new(telescopes, fibsel, enclosure)
    }
    /// Slews the named telescopes concurrently to RA/Dec targets
    ///
    /// Local mode is checked once for the whole set.
    pub async fn goto(&self, targets: &IndexMap<String, (f64, f64)>, force: bool) -> Result<()> {
        if !force && self.enclosure.is_local().await? {
            return Err(Error::LocalMode(
                "cannot move telescopes in local mode".to_string(),
            ));
        }
        let moves = targets
            .iter()
            .map(|(name, &(ra, dec))| async move {
                self.telescopes.device(name)?.goto_radec(ra, dec, true).await
            })
            .collect::<Vec<_>>();
        gather(moves).await?;
        Ok(())
    }
    pub async fn park(&self, disable: bool, force: bool) -> Result<()> {
        self.telescopes
            .call_on_all(|tel| async move { tel.park(disable, force).await })
            .await?;
        Ok(())
    }
    pub async fn home(&self, force: bool) -> Result<()> {
        self.telescopes
            .call_on_all(|tel| async move { tel.home(force).await })
            .await?;
        self.fibsel.home().await
    }
    pub async fn stop(&self) -> Result<()> {
        self.telescopes
            .call_on_all(|tel| async move { tel.stop().await })
            .await?;
        Ok(())
    }
    pub async fn goto_named(&self, name: &str, force: bool) -> Result<()> {
        self.telescopes
            .call_on_all(|tel| async move { tel.goto_named(name, force).await })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Scripted};
    use crate::config::test_config;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports 0.2 deg off until `reached_on` gotos were sent
    fn pointing_bus(reached_on: usize, local: bool) -> Arc<MockBus> {
        let gotos = Arc::new(AtomicUsize::new(0));
        Arc::new(MockBus::new(move |actor, command| {
            if actor == "lvmecp" {
                let labels = if local { "LOCAL" } else { "DOOR_CLOSED" };
                return Scripted::done(vec![json!({ "safety_status_labels": labels })]);
            }
            if command.starts_with("gotoRaDecJ2000") {
                gotos.fetch_add(1, Ordering::SeqCst);
            } else if command == "status" {
                let dec = if gotos.load(Ordering::SeqCst) >= reached_on {
                    20.
                } else {
                    20.2
                };
                return Scripted::done(vec![json!({
                    "is_connected": true,
                    "is_enabled": true,
                    "ra_j2000_hours": 10. / 15.,
                    "dec_j2000_degs": dec,
                    "altitude_degs": -60.,
                    "azimuth_degs": 90.,
                })]);
            }
            Scripted::ok()
        }))
    }

    fn telescopes(bus: Arc<MockBus>) -> TelescopeSet {
        let enclosure = Arc::new(Enclosure::new(
            Arc::new(RemoteActor::new("lvmecp", bus.clone())),
            false,
        ));
        TelescopeSet::from_config(
            &test_config().telescopes,
            |name| Arc::new(RemoteActor::new(name, bus.clone())),
            enclosure,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn pointing_retry_succeeds() {
        let bus = pointing_bus(2, false);
        let tels = telescopes(bus.clone());
        tels.device("sci")
            .unwrap()
            .goto_radec(10., 20., false)
            .await
            .unwrap();
        assert_eq!(
            bus.sent_to("lvm.sci.pwi", "gotoRaDecJ2000"),
            vec!["gotoRaDecJ2000 0.6666666666666666 20.0"; 2]
        );
        assert!(bus.sent_to("lvm.sci.pwi", "setEnabled false").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pointing_failure_disables_axes() {
        let bus = pointing_bus(usize::MAX, false);
        let tels = telescopes(bus.clone());
        let err = tels
            .device("sci")
            .unwrap()
            .goto_radec(10., 20., false)
            .await
            .unwrap_err();
        assert_eq!(err.code().value(), 102);
        assert_eq!(bus.sent_to("lvm.sci.pwi", "gotoRaDecJ2000").len(), 2);
        assert_eq!(bus.sent_to("lvm.sci.pwi", "setEnabled false").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_mode_refuses_to_move() {
        let bus = pointing_bus(0, true);
        let tels = telescopes(bus.clone());
        let targets: IndexMap<String, (f64, f64)> =
            [("sci".to_string(), (10., 20.))].into_iter().collect();
        let err = tels.goto(&targets, false).await.unwrap_err();
        assert_eq!(err.code().value(), 101);
        assert!(bus.sent_to("lvm.sci.pwi", "goto").is_empty());
        // forcing skips the check
        tels.goto(&targets, true).await.unwrap();
        assert_eq!(bus.sent_to("lvm.sci.pwi", "goto").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pointing_offsets() {
        let bus = pointing_bus(0, false);
        let enclosure = Arc::new(Enclosure::new(
            Arc::new(RemoteActor::new("lvmecp", bus.clone())),
            false,
        ));
        let tel = Telescope::new(
            "spec",
            Arc::new(RemoteActor::new("lvm.spec.pwi", bus.clone())),
            enclosure,
            Some((0., 3600.)),
            IndexMap::new(),
        );
        // the 1 deg Dec offset lands the commanded position on the reported one
        tel.goto_radec(10., 19., false).await.unwrap();
        assert_eq!(
            bus.sent_to("lvm.spec.pwi", "gotoRaDecJ2000"),
            vec!["gotoRaDecJ2000 0.6666666666666666 20.0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn kmirror_follows_the_mount() {
        let bus = pointing_bus(0, false);
        let tels = telescopes(bus.clone());
        let sci = tels.device("sci").unwrap();
        assert!(sci.kmirror().is_some());
        assert!(tels.device("spec").unwrap().kmirror().is_none());

        let start = tokio::time::Instant::now();
        sci.goto_radec(10., 20., false).await.unwrap();
        assert_eq!(bus.sent_to("lvm.sci.km", "slewStart"), vec!["slewStart 0.6666666666666666 20.0"]);
        // the slew delay runs alongside the mount move
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));

        sci.park(false, false).await.unwrap();
        assert_eq!(bus.sent_to("lvm.sci.km", "slewStop").len(), 1);
        assert_eq!(bus.sent_to("lvm.sci.km", "moveAbsolute"), vec!["moveAbsolute 90.0 deg"]);
        sci.home(false).await.unwrap();
        assert_eq!(bus.sent_to("lvm.sci.km", "moveToHome").len(), 1);
    }

    #[tokio::test]
    async fn kmirror_stays_put_in_local_mode() {
        let bus = pointing_bus(0, true);
        let tels = telescopes(bus.clone());
        let err = tels.device("sci").unwrap().goto_radec(10., 20., false).await.unwrap_err();
        assert_eq!(err.code().value(), 101);
        assert!(bus.sent_to("lvm.sci.km", "").is_empty());
    }

    #[test]
    fn fibre_positions() {
        let bus = Arc::new(MockBus::silent());
        let tels = telescopes(bus);
        assert_eq!(
            tels.fibsel.select_positions("P1-").unwrap(),
            vec!["P1-1", "P1-2", "P1-3", "P1-4"]
        );
        assert_eq!(
            tels.fibsel.select_positions("P").unwrap(),
            vec!["P1-1", "P2-1", "P1-2", "P1-3", "P1-4"]
        );
        assert_eq!(tels.fibsel.list_positions().len(), 5);
    }

    #[tokio::test]
    async fn fibre_invalid_position() {
        let bus = Arc::new(MockBus::silent());
        let tels = telescopes(bus.clone());
        let err = tels.fibsel.move_to_position("P9-9").await.unwrap_err();
        assert_eq!(err.code().value(), 110);
        tels.fibsel.move_to_position("P1-3").await.unwrap();
        tels.fibsel.move_relative(500).await.unwrap();
        assert_eq!(
            bus.sent_to("lvm.spec.fibsel", "move"),
            vec!["moveAbsolute 3000", "moveRelative 500"]
        );
    }
}
