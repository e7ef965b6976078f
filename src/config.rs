//! # Observatory configuration
//!
//! Loaded from the TOML file named by the `NIGHTWATCH_CONFIG` environment
//! variable, falling back to `config/observatory.toml`.

use crate::{coordinates::Site, Error, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{env, fs, path::PathBuf, str::FromStr};

pub const CONFIG_ENV: &str = "NIGHTWATCH_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub site: Site,
    pub services: ServicesConfig,
    pub telescopes: TelescopesConfig,
    pub guiders: IndexMap<String, GuiderConfig>,
    pub spectrographs: IndexMap<String, ActorConfig>,
    pub power: PowerConfig,
    pub enclosure: EnclosureConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub overwatcher: OverwatcherConfig,
    #[serde(default)]
    pub weather: WeatherLimits,
    /// JSON file with the sky and standard star candidates
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}
impl Config {
    /// Loads the configuration file at `path`
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        log::info!("Loading configuration from {}", path.display());
        let contents = fs::read_to_string(&path)?;
        contents.parse()
    }
    /// Loads the configuration file named by `NIGHTWATCH_CONFIG`
    pub fn from_env() -> Result<Self> {
        let path = env::var(CONFIG_ENV).unwrap_or_else(|_| "config/observatory.toml".to_string());
        Self::load(path)
    }
    fn validate(self) -> Result<Self> {
        for name in self.guiders.keys() {
            if !self.telescopes.devices.contains_key(name) {
                return Err(Error::Config(format!(
                    "guider {name:?} has no matching telescope"
                )));
            }
        }
        for lamp in &self.power.lamps {
            if !self.power.devices.contains_key(&lamp.switch) {
                return Err(Error::Config(format!(
                    "lamp {:?} refers to unknown power switch {:?}",
                    lamp.outlet, lamp.switch
                )));
            }
        }
        Ok(self)
    }
}
impl FromStr for Config {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str::<Config>(s)?.validate()
    }
}

/// Addresses of the external services
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    /// Message bus gateway, `host:port`
    pub bus: String,
    /// Scheduler base URL
    pub scheduler: String,
    /// Operations API base URL (notifications, weather, ephemeris, night logs)
    pub api: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    pub actor: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelescopeConfig {
    pub actor: String,
    /// RA/Dec pointing offsets in arcsec
    #[serde(default)]
    pub pointing_offsets: Option<(f64, f64)>,
    #[serde(default)]
    pub kmirror: Option<KMirrorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KMirrorConfig {
    pub actor: String,
    /// Seconds to wait before each move, staggering the k-mirrors
    #[serde(default)]
    pub slew_delay: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AltAz {
    pub alt: f64,
    pub az: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelescopesConfig {
    pub devices: IndexMap<String, TelescopeConfig>,
    /// Actor of the fibre selector mounted on the standards telescope
    pub fibsel: String,
    /// Fibre selector named positions in motor steps
    pub mask_positions: IndexMap<String, i64>,
    #[serde(default)]
    pub named_positions: IndexMap<String, AltAz>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuiderConfig {
    pub actor: String,
    /// Acquisition camera actor used for darks
    #[serde(default)]
    pub ag: Option<String>,
    #[serde(default)]
    pub named_pixels: IndexMap<String, (f64, f64)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LampConfig {
    pub switch: String,
    pub outlet: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerConfig {
    pub devices: IndexMap<String, ActorConfig>,
    #[serde(default)]
    pub lamps: Vec<LampConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnclosureConfig {
    pub actor: String,
    #[serde(default)]
    pub bypass_local_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub exposure_time: f64,
    pub count: usize,
    /// Guide tolerance in arcsec
    pub guide_tolerance: f64,
    /// Acquisition timeout in seconds
    pub acquisition_timeout: f64,
    /// Regular expression prefix selecting the standards fibres
    pub mask_positions_pattern: String,
}
impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            exposure_time: 900.,
            count: 1,
            guide_tolerance: 3.,
            acquisition_timeout: 180.,
            mask_positions_pattern: "P1-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverwatcherConfig {
    /// Seconds between two decisions
    pub tick_interval: u64,
    /// Seconds to wait after a failed tick
    pub error_backoff: u64,
    /// An exposure ending within this many seconds is allowed to finish at daybreak
    pub daytime_finish_threshold: f64,
    pub notification_channel: String,
    /// Seconds during which a repeated notification is not sent out again
    pub repeat_window: u64,
    pub ping_interval: u64,
    /// Actor told every `heartbeat_interval` seconds that the overwatcher is alive
    pub heartbeat_actor: String,
    pub heartbeat_interval: u64,
    /// Consecutive failures reading the alerts before conditions are deemed unsafe
    pub max_alerts_failures: usize,
    pub events_file: PathBuf,
    pub dry_run: bool,
}
impl Default for OverwatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: 5,
            error_backoff: 30,
            daytime_finish_threshold: 300.,
            notification_channel: "lvm-overwatcher".to_string(),
            repeat_window: 60,
            ping_interval: 300,
            heartbeat_actor: "lvmbeat".to_string(),
            heartbeat_interval: 5,
            max_alerts_failures: 5,
            events_file: PathBuf::from("events.bin"),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherLimits {
    /// km/h
    pub max_wind_speed: f64,
    /// %
    pub max_humidity: f64,
    /// Seconds of weather history requested
    pub delta_time: u64,
}
impl Default for WeatherLimits {
    fn default() -> Self {
        Self {
            max_wind_speed: 35.,
            max_humidity: 80.,
            delta_time: 600,
        }
    }
}

#[cfg(test)]
pub(crate) const TEST_CONFIG: &str = r#"
[site]
lat = -29.008999964
lon = -70.688663912
height = 2800.0

[services]
bus = "127.0.0.1:5672"
scheduler = "http://127.0.0.1:8083"
api = "http://127.0.0.1:8085"

[telescopes]
fibsel = "lvm.spec.fibsel"

[telescopes.devices.sci]
actor = "lvm.sci.pwi"
kmirror = { actor = "lvm.sci.km", slew_delay = 1.0 }
[telescopes.devices.spec]
actor = "lvm.spec.pwi"
[telescopes.devices.skye]
actor = "lvm.skye.pwi"
[telescopes.devices.skyw]
actor = "lvm.skyw.pwi"

[telescopes.mask_positions]
P1-1 = 1000
P1-2 = 2000
P1-3 = 3000
P1-4 = 4000
P2-1 = 1500

[telescopes.named_positions]
park = { alt = -60.0, az = 90.0 }
zenith = { alt = 90.0, az = 0.0 }

[guiders.sci]
actor = "lvm.sci.guider"
ag = "lvm.sci.agcam"
[guiders.spec]
actor = "lvm.spec.guider"
named_pixels = { P1-1 = [2000.0, 1000.0], P1-2 = [2100.0, 1000.0], P1-3 = [2200.0, 1000.0], P1-4 = [2300.0, 1000.0] }
[guiders.skye]
actor = "lvm.skye.guider"
[guiders.skyw]
actor = "lvm.skyw.guider"

[spectrographs.sp1]
actor = "lvmscp.sp1"

[power.devices.calib]
actor = "lvmnps.calib"

[[power.lamps]]
switch = "calib"
outlet = "Argon"

[[power.lamps]]
switch = "calib"
outlet = "Neon"

[enclosure]
actor = "lvmecp"
"#;

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    TEST_CONFIG.parse().unwrap()
}
