//! # Observatory
//!
//! All the devices of the observatory, built from the configuration and
//! driven through one message bus connection.

use crate::{
    actor::ActorClient,
    bus::Transport,
    config::{Config, ObserverConfig},
    coordinates::{Coordinates, Site},
    device::DeviceSet,
    enclosure::Enclosure,
    guider::{Guider, GuiderSet},
    observer::{Exposed, Observer},
    power::{PowerSet, PowerSwitch},
    scheduler::{Calibrators, HttpScheduler, SchedulerApi},
    spectrograph::{Spectrograph, SpectrographSet},
    telescope::TelescopeSet,
    tile::{CachedCatalog, FileCatalog, SkyArm, TargetCatalog, Tile, TileBuilder},
    Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// How the next tile is chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileRequest {
    /// The tile suggested by the scheduler
    Next,
    /// A science pointing in degrees, with the scheduler calibrators around it
    Position { ra: f64, dec: f64, pa: f64 },
}

pub struct Observatory {
    pub config: Config,
    pub client: Arc<ActorClient>,
    pub enclosure: Arc<Enclosure>,
    pub telescopes: TelescopeSet,
    pub guiders: GuiderSet,
    pub specs: SpectrographSet,
    pub power: PowerSet,
    scheduler: Arc<dyn SchedulerApi>,
    catalog: Option<Arc<dyn TargetCatalog>>,
}
impl Observatory {
    /// Connects the configured devices to the bus, with the configured scheduler and catalog
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let scheduler = Arc::new(HttpScheduler::new(config.services.scheduler.clone())?);
        let catalog = config
            .catalog
            .clone()
            .map(|path| Arc::new(CachedCatalog::new(FileCatalog::new(path))) as Arc<dyn TargetCatalog>);
        Ok(Self::with_services(config, transport, scheduler, catalog))
    }
    pub fn with_services(
        config: Config,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn SchedulerApi>,
        catalog: Option<Arc<dyn TargetCatalog>>,
    ) -> Self {
        let client = Arc::new(ActorClient::new(transport));
        let actor = |name: &str| client.actor(name);

        let enclosure = Arc::new(Enclosure::new(
            actor(&config.enclosure.actor),
            config.enclosure.bypass_local_mode,
        ));
        let telescopes = TelescopeSet::from_config(&config.telescopes, actor, enclosure.clone());
        let guiders = GuiderSet::new(DeviceSet::new(
            "guiders",
            config.guiders.iter().map(|(name, guider)| {
                Guider::new(
                    name,
                    actor(&guider.actor),
                    guider.ag.as_deref().map(actor),
                    guider.named_pixels.clone(),
                    client.subscribe(),
                )
            }),
        ));
        let specs = SpectrographSet::new(DeviceSet::new(
            "specs",
            config
                .spectrographs
                .iter()
                .map(|(name, spec)| Spectrograph::new(name, actor(&spec.actor))),
        ));
        let power = PowerSet::new(
            DeviceSet::new(
                "nps",
                config
                    .power
                    .devices
                    .iter()
                    .map(|(name, switch)| PowerSwitch::new(name, actor(&switch.actor))),
            ),
            config.power.lamps.clone(),
        );
        Self {
            config,
            client,
            enclosure,
            telescopes,
            guiders,
            specs,
            power,
            scheduler,
            catalog,
        }
    }
    /// Loads the command model of every actor, returns the number of actors that failed
    ///
    /// An actor offline at start-up is not an error: its commands are
    /// inferred until the next refresh.
    pub async fn init(&self) -> usize {
        let failed = self.client.refresh_all().await;
        if failed > 0 {
            log::warn!("{failed} actors did not report their command model.");
        }
        failed
    }
    pub fn site(&self) -> &Site {
        &self.config.site
    }
    pub fn scheduler(&self) -> &Arc<dyn SchedulerApi> {
        &self.scheduler
    }
    pub async fn build_tile(&self, request: TileRequest) -> Result<Tile> {
        self.build_tile_at(request, Utc::now()).await
    }
    /// Builds a tile, validating its calibrators for an observation at `time`
    pub async fn build_tile_at(&self, request: TileRequest, time: DateTime<Utc>) -> Result<Tile> {
        let (builder, ra, dec) = match request {
            TileRequest::Next => {
                let next = self.scheduler.next_tile().await?;
                let (ra, dec, pa) = next.pointing()?;
                log::info!("Scheduler suggests tile {} (dither {}).", next.tile_id, next.dither_pos);
                let builder = TileBuilder::new(Coordinates::science(ra, dec, pa))
                    .tile_id(Some(next.tile_id))
                    .dither_position(next.dither_pos)
                    .object(format!("tile_id={}", next.tile_id));
                (builder, ra, dec)
            }
            TileRequest::Position { ra, dec, pa } => {
                (TileBuilder::new(Coordinates::science(ra, dec, pa)), ra, dec)
            }
        };
        let Calibrators {
            sky_pos,
            standard_pos,
            sky_pks,
            standard_pks,
        } = self.scheduler.calibrators(ra, dec).await?;
        let mut builder = builder;
        for (i, (arm, (ra, dec))) in SkyArm::ALL.into_iter().zip(sky_pos).enumerate() {
            let mut sky = Coordinates::sky(ra, dec);
            sky.source_id = sky_pks.get(i).copied();
            builder = builder.sky(arm, sky);
        }
        let standards = standard_pos
            .into_iter()
            .enumerate()
            .map(|(i, (ra, dec))| Coordinates::standard(ra, dec, standard_pks.get(i).copied()));
        builder
            .standards(standards)
            .build(self.catalog.as_deref(), self.site(), time)
            .await
    }
    /// Observes `tile` with the given observing parameters
    pub async fn observe(self: &Arc<Self>, tile: Tile, params: &ObserverConfig) -> Result<Exposed> {
        let observer = Observer::new(self.clone(), tile, params)?;
        observer.observe(params).await
    }
    pub async fn observe_tile(
        self: &Arc<Self>,
        request: TileRequest,
        params: &ObserverConfig,
    ) -> Result<Exposed> {
        let tile = self.build_tile(request).await?;
        self.observe(tile, params).await
    }
    /// Brings the devices back to a known idle state
    ///
    /// Pending spectrograph exposures are read if `readout`, aborted otherwise.
    pub async fn cleanup(&self, readout: bool) -> Result<()> {
        log::info!("Running the cleanup sequence.");
        let (guiders, specs, lamps) = tokio::join!(
            self.guiders.stop(true),
            self.specs.finish_pending(readout),
            self.power.all_off()
        );
        guiders?;
        specs?;
        lamps
    }
    /// Homes the telescopes, turns the lamps off and takes the guider darks
    pub async fn startup_devices(&self) -> Result<()> {
        log::info!("Running the startup sequence.");
        let (homed, lamps) = tokio::join!(self.telescopes.home(false), self.power.all_off());
        homed?;
        lamps?;
        self.guiders.take_darks().await
    }
    /// Parks the telescopes and disables their axes
    pub async fn park(&self) -> Result<()> {
        log::info!("Parking telescopes.");
        self.telescopes.park(true, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::mock::MockBus,
        observer::tests::{observatory, observatory_bus, FakeScheduler},
        scheduler::NextTile,
        tile::tests::{night, ra},
    };

    fn scheduler() -> Arc<FakeScheduler> {
        Arc::new(FakeScheduler {
            tiles: parking_lot::Mutex::new(vec![NextTile {
                tile_id: 1024,
                tile_pos: vec![ra(0.), -29., 5.],
                dither_pos: 1,
            }]),
            calibrators: Calibrators {
                sky_pos: vec![(ra(0.5), -30.), (ra(-0.5), -28.)],
                standard_pos: vec![(ra(0.2), -29.5), (ra(10.), -29.)],
                sky_pks: vec![5, 6],
                standard_pks: vec![11, 12],
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn next_tile() {
        let bus = Arc::new(MockBus::silent());
        let observatory = observatory(&bus, scheduler());
        let tile = observatory
            .build_tile_at(TileRequest::Next, night())
            .await
            .unwrap();
        assert_eq!(tile.tile_id, Some(1024));
        assert_eq!(tile.dither_position, 1);
        assert_eq!(tile.science.pa, 5.);
        assert_eq!(tile.sky[&SkyArm::West].source_id, Some(6));
        // the second standard is below the horizon and there is no catalog
        assert_eq!(tile.standards.len(), 1);
        assert_eq!(tile.standards[0].source_id, Some(11));
    }

    #[tokio::test]
    async fn explicit_position() {
        let bus = Arc::new(MockBus::silent());
        let observatory = observatory(&bus, scheduler());
        let tile = observatory
            .build_tile_at(
                TileRequest::Position {
                    ra: ra(0.),
                    dec: -29.,
                    pa: 0.,
                },
                night(),
            )
            .await
            .unwrap();
        assert_eq!(tile.tile_id, None);
        assert_eq!(tile.sky.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_turns_lamps_off() {
        let bus = observatory_bus(0.5);
        let observatory = observatory(&bus, scheduler());
        observatory.cleanup(true).await.unwrap();
        assert_eq!(bus.sent_to("lvmnps.calib", "off"), vec!["off Argon", "off Neon"]);
        // no pending readout reported
        assert!(bus.sent_to("lvmscp.sp1", "read").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_sequence() {
        let bus = observatory_bus(0.5);
        let observatory = observatory(&bus, scheduler());
        observatory.startup_devices().await.unwrap();
        for tel in ["sci", "spec", "skye", "skyw"] {
            assert_eq!(bus.sent_to(&format!("lvm.{tel}.pwi"), "findHome").len(), 1);
        }
        assert_eq!(
            bus.sent_to("lvm.sci.agcam", "expose"),
            vec!["expose --flavour dark"]
        );
        // only the science guider has an acquisition camera
        assert!(bus.sent_to("lvm.spec.agcam", "expose").is_empty());
    }
}
