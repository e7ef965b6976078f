//! # Tiles
//!
//! A tile is one science pointing with the sky and standard star pointings
//! observed alongside it. Calibration pointings are validated when the tile
//! is built: those too low or repeating an already assigned pointing are
//! replaced from the calibrator catalog, or dropped if replacement is off.

use crate::{
    coordinates::{separation_arcsec, CoordKind, Coordinates, Site},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use tokio::sync::OnceCell;

/// Two pointings closer than this, in arcsec, are the same pointing
pub const DUPLICATE_TOLERANCE: f64 = 1.;
/// Replacements are at least this far, in degrees, from every assigned pointing
pub const EXCLUSION_RADIUS: f64 = 1.;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkyArm {
    East,
    West,
}
impl SkyArm {
    pub const ALL: [SkyArm; 2] = [SkyArm::East, SkyArm::West];
    /// Name of the telescope observing this arm
    pub fn telescope(&self) -> &'static str {
        match self {
            SkyArm::East => "skye",
            SkyArm::West => "skyw",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tile {
    pub tile_id: Option<i64>,
    pub dither_position: u32,
    pub science: Coordinates,
    pub sky: IndexMap<SkyArm, Coordinates>,
    pub standards: Vec<Coordinates>,
    pub object: Option<String>,
    pub allow_replacement: bool,
}
impl Tile {
    /// The pointing of telescope `telescope`
    ///
    /// The standards telescope points at the first standard.
    pub fn target(&self, telescope: &str) -> Option<&Coordinates> {
        match telescope {
            "sci" => Some(&self.science),
            "skye" => self.sky.get(&SkyArm::East),
            "skyw" => self.sky.get(&SkyArm::West),
            "spec" => self.standards.first(),
            _ => None,
        }
    }
}
impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tile_id {
            Some(id) => write!(f, "<Tile (tile_id={id}, science={})>", self.science),
            None => write!(f, "<Tile (science={})>", self.science),
        }
    }
}

/// Source of candidate sky and standard pointings
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    async fn targets(&self, kind: CoordKind) -> Result<Vec<Coordinates>>;
}

/// Keeps the first answer of a catalog for the lifetime of the wrapper
pub struct CachedCatalog<C> {
    catalog: C,
    sky: OnceCell<Vec<Coordinates>>,
    standards: OnceCell<Vec<Coordinates>>,
}
impl<C: TargetCatalog> CachedCatalog<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            sky: OnceCell::new(),
            standards: OnceCell::new(),
        }
    }
}
#[async_trait]
impl<C: TargetCatalog> TargetCatalog for CachedCatalog<C> {
    async fn targets(&self, kind: CoordKind) -> Result<Vec<Coordinates>> {
        let cell = match kind {
            CoordKind::Sky => &self.sky,
            CoordKind::Standard => &self.standards,
            _ => return Ok(Vec::new()),
        };
        cell.get_or_try_init(|| self.catalog.targets(kind))
            .await
            .cloned()
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    sky: Vec<(f64, f64)>,
    #[serde(default)]
    standards: Vec<(f64, f64, Option<i64>)>,
}

/// Catalog read from a JSON file `{"sky": [[ra, dec], ..], "standards": [[ra, dec, source_id], ..]}`
pub struct FileCatalog {
    path: PathBuf,
}
impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}
#[async_trait]
impl TargetCatalog for FileCatalog {
    async fn targets(&self, kind: CoordKind) -> Result<Vec<Coordinates>> {
        log::debug!("Reading calibrators from {}", self.path.display());
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let file: CatalogFile = serde_json::from_str(&contents)?;
        Ok(match kind {
            CoordKind::Sky => file
                .sky
                .into_iter()
                .map(|(ra, dec)| Coordinates::sky(ra, dec))
                .collect(),
            CoordKind::Standard => file
                .standards
                .into_iter()
                .map(|(ra, dec, id)| Coordinates::standard(ra, dec, id))
                .collect(),
            _ => Vec::new(),
        })
    }
}

/// The observable candidate nearest to `near`, excluding the surroundings of `exclude`
pub fn nearest_valid(
    candidates: &[Coordinates],
    near: &Coordinates,
    exclude: &[Coordinates],
    site: &Site,
    time: DateTime<Utc>,
) -> Option<Coordinates> {
    candidates
        .iter()
        .filter(|c| exclude.iter().all(|e| c.separation(e) > EXCLUSION_RADIUS))
        .filter(|c| c.is_observable(site, time))
        .map(|c| (c.separation(near), c))
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, c)| c.clone())
}

pub struct TileBuilder {
    science: Coordinates,
    tile_id: Option<i64>,
    dither_position: u32,
    sky: IndexMap<SkyArm, Coordinates>,
    standards: Vec<Coordinates>,
    object: Option<String>,
    allow_replacement: bool,
}
impl TileBuilder {
    pub fn new(science: Coordinates) -> Self {
        Self {
            science,
            tile_id: None,
            dither_position: 0,
            sky: IndexMap::new(),
            standards: Vec::new(),
            object: None,
            allow_replacement: true,
        }
    }
    pub fn tile_id(self, tile_id: Option<i64>) -> Self {
        Self { tile_id, ..self }
    }
    pub fn dither_position(self, dither_position: u32) -> Self {
        Self {
            dither_position,
            ..self
        }
    }
    pub fn sky(mut self, arm: SkyArm, coordinates: Coordinates) -> Self {
        self.sky.insert(arm, coordinates);
        self
    }
    pub fn standards(mut self, standards: impl IntoIterator<Item = Coordinates>) -> Self {
        self.standards.extend(standards);
        self
    }
    pub fn object(self, object: impl Into<String>) -> Self {
        Self {
            object: Some(object.into()),
            ..self
        }
    }
    pub fn allow_replacement(self, allow_replacement: bool) -> Self {
        Self {
            allow_replacement,
            ..self
        }
    }
    /// Validates the calibration pointings and builds the tile
    pub async fn build(
        self,
        catalog: Option<&dyn TargetCatalog>,
        site: &Site,
        time: DateTime<Utc>,
    ) -> Result<Tile> {
        let mut validator = Validator {
            catalog,
            site,
            time,
            allow_replacement: self.allow_replacement,
            science: &self.science,
            assigned: Vec::new(),
        };
        let mut sky = IndexMap::new();
        for arm in SkyArm::ALL {
            let entry = self.sky.get(&arm).cloned();
            if let Some(coordinates) = validator.resolve(entry, CoordKind::Sky, arm.telescope()).await {
                sky.insert(arm, coordinates);
            }
        }
        let mut standards = Vec::with_capacity(self.standards.len());
        for (i, entry) in self.standards.into_iter().enumerate() {
            let label = format!("standard #{}", i + 1);
            if let Some(coordinates) = validator
                .resolve(Some(entry), CoordKind::Standard, &label)
                .await
            {
                standards.push(coordinates);
            }
        }
        Ok(Tile {
            tile_id: self.tile_id,
            dither_position: self.dither_position,
            science: self.science,
            sky,
            standards,
            object: self.object,
            allow_replacement: self.allow_replacement,
        })
    }
}

struct Validator<'a> {
    catalog: Option<&'a dyn TargetCatalog>,
    site: &'a Site,
    time: DateTime<Utc>,
    allow_replacement: bool,
    science: &'a Coordinates,
    assigned: Vec<Coordinates>,
}
impl<'a> Validator<'a> {
    fn is_valid(&self, coordinates: &Coordinates) -> bool {
        coordinates.is_observable(self.site, self.time)
            && self
                .assigned
                .iter()
                .all(|a| separation_arcsec(a, coordinates) >= DUPLICATE_TOLERANCE)
    }
    async fn replacement(&self, near: &Coordinates, kind: CoordKind) -> Result<Coordinates> {
        let catalog = self
            .catalog
            .ok_or_else(|| Error::Tile("no calibrator catalog".to_string()))?;
        let candidates = catalog.targets(kind).await?;
        nearest_valid(&candidates, near, &self.assigned, self.site, self.time)
            .ok_or_else(|| Error::Tile(format!("no valid {kind:?} pointing found")))
    }
    /// The pointing to use for `entry`, `None` if it is dropped
    async fn resolve(
        &mut self,
        entry: Option<Coordinates>,
        kind: CoordKind,
        label: &str,
    ) -> Option<Coordinates> {
        let resolved = match entry {
            Some(coordinates) if self.is_valid(&coordinates) => Some(coordinates),
            entry if !self.allow_replacement => {
                if let Some(coordinates) = entry {
                    log::warn!("Dropping invalid {label} pointing {coordinates}.");
                }
                None
            }
            entry => {
                let near = entry.as_ref().unwrap_or(self.science);
                match self.replacement(near, kind).await {
                    Ok(coordinates) => {
                        log::info!("Replacing {label} pointing with {coordinates}.");
                        Some(coordinates)
                    }
                    Err(e) => {
                        log::warn!("Failed getting {label} pointing: {e}");
                        None
                    }
                }
            }
        };
        if let Some(coordinates) = &resolved {
            self.assigned.push(coordinates.clone());
        }
        resolved
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coordinates::local_sidereal_time;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn lco() -> Site {
        Site {
            lat: -29.008999964,
            lon: -70.688663912,
            height: 2800.,
        }
    }

    pub(crate) fn night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap()
    }

    /// RA of the meridian at [night], offset by `hours`
    pub(crate) fn ra(hours: f64) -> f64 {
        (local_sidereal_time(&lco(), night()) + hours * 15.).rem_euclid(360.)
    }

    /// Catalog of candidates near the meridian, counting queries
    #[derive(Default)]
    pub(crate) struct Candidates {
        pub(crate) queries: AtomicUsize,
    }
    #[async_trait]
    impl TargetCatalog for Candidates {
        async fn targets(&self, kind: CoordKind) -> Result<Vec<Coordinates>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let positions = [(ra(0.2), -29.), (ra(0.23), -29.), (ra(0.7), -29.), (ra(12.), 10.)];
            Ok(positions
                .into_iter()
                .map(|(ra, dec)| match kind {
                    CoordKind::Standard => Coordinates::standard(ra, dec, Some(7)),
                    _ => Coordinates::sky(ra, dec),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn replaces_invalid_sky() {
        let site = lco();
        let low = Coordinates::sky(ra(12.), 0.);
        let catalog = Candidates::default();
        let tile = TileBuilder::new(Coordinates::science(ra(0.), -30., 0.))
            .sky(SkyArm::East, low.clone())
            .build(Some(&catalog), &site, night())
            .await
            .unwrap();
        let east = &tile.sky[&SkyArm::East];
        let west = &tile.sky[&SkyArm::West];
        assert_ne!(east, &low);
        assert!(east.altaz(&site, night()).0 >= 30.);
        assert!(west.altaz(&site, night()).0 >= 30.);
        assert!(east.separation(west) > EXCLUSION_RADIUS);
        assert_eq!(tile.target("skyw"), Some(west));
    }

    #[tokio::test]
    async fn duplicate_standard_is_replaced() {
        let site = lco();
        let catalog = Candidates::default();
        let standard = Coordinates::standard(ra(0.1), -25., Some(1));
        let tile = TileBuilder::new(Coordinates::science(ra(0.), -30., 0.))
            .sky(SkyArm::East, Coordinates::sky(ra(-0.5), -40.))
            .sky(SkyArm::West, Coordinates::sky(ra(-1.), -40.))
            .standards([standard.clone(), standard.clone()])
            .build(Some(&catalog), &site, night())
            .await
            .unwrap();
        assert_eq!(tile.standards.len(), 2);
        assert_eq!(tile.standards[0], standard);
        assert_eq!(tile.standards[1].source_id, Some(7));
        assert_eq!(tile.target("spec"), Some(&standard));
    }

    #[tokio::test]
    async fn standard_on_science_pointing_is_kept() {
        let standard = Coordinates::standard(ra(0.), -30., Some(3));
        let tile = TileBuilder::new(Coordinates::science(ra(0.), -30., 0.))
            .standards([standard.clone()])
            .allow_replacement(false)
            .build(None, &lco(), night())
            .await
            .unwrap();
        assert_eq!(tile.standards, vec![standard]);
    }

    #[tokio::test]
    async fn drops_without_replacement() {
        let site = lco();
        let valid = Coordinates::standard(ra(0.1), -25., Some(1));
        let tile = TileBuilder::new(Coordinates::science(ra(0.), -30., 0.))
            .standards([valid.clone(), Coordinates::standard(ra(12.), 0., Some(2))])
            .allow_replacement(false)
            .build(None, &site, night())
            .await
            .unwrap();
        assert_eq!(tile.standards, vec![valid]);
        assert!(tile.sky.is_empty());
    }

    #[tokio::test]
    async fn catalog_is_cached() {
        let catalog = CachedCatalog::new(Candidates::default());
        for _ in 0..3 {
            TileBuilder::new(Coordinates::science(ra(0.), -30., 0.))
                .build(Some(&catalog), &lco(), night())
                .await
                .unwrap();
        }
        assert_eq!(catalog.catalog.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibrators.json");
        std::fs::write(&path, r#"{"sky": [[10.0, -20.0]], "standards": [[11.0, -21.0, 42]]}"#).unwrap();
        let catalog = FileCatalog::new(&path);
        let standards = catalog.targets(CoordKind::Standard).await.unwrap();
        assert_eq!(standards, vec![Coordinates::standard(11., -21., Some(42))]);
        assert_eq!(catalog.targets(CoordKind::Sky).await.unwrap().len(), 1);
    }
}
