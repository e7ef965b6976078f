//! # Scheduler client
//!
//! `GET next_tile`, `GET cals` and `PUT register_observation` against the
//! scheduler HTTP service.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NextTile {
    pub tile_id: i64,
    /// `[ra, dec, pa]` in degrees
    pub tile_pos: Vec<f64>,
    #[serde(default)]
    pub dither_pos: u32,
}
impl NextTile {
    /// RA, Dec and position angle of the science pointing
    pub fn pointing(&self) -> Result<(f64, f64, f64)> {
        match self.tile_pos.as_slice() {
            [ra, dec] => Ok((*ra, *dec, 0.)),
            [ra, dec, pa, ..] => Ok((*ra, *dec, *pa)),
            _ => Err(Error::Tile(format!(
                "invalid pointing for tile {}: {:?}",
                self.tile_id, self.tile_pos
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Calibrators {
    #[serde(default)]
    pub sky_pos: Vec<(f64, f64)>,
    #[serde(default)]
    pub standard_pos: Vec<(f64, f64)>,
    /// Catalog ids of the sky pointings, when known
    #[serde(default)]
    pub sky_pks: Vec<i64>,
    #[serde(default)]
    pub standard_pks: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub tile_id: i64,
    pub dither: u32,
    /// Julian date at the start of the exposure
    pub jd: f64,
    pub seeing: f64,
    pub standards: Vec<i64>,
    pub skies: Vec<i64>,
    pub exposure_no: u64,
}

#[derive(Debug, Deserialize)]
struct RegistrationReply {
    success: bool,
}

#[async_trait]
pub trait SchedulerApi: Send + Sync {
    async fn next_tile(&self) -> Result<NextTile>;
    /// Sky and standard candidates for a science pointing
    async fn calibrators(&self, ra: f64, dec: f64) -> Result<Calibrators>;
    async fn register_observation(&self, registration: &Registration) -> Result<()>;
}

pub struct HttpScheduler {
    base_url: String,
    client: reqwest::Client,
}
impl HttpScheduler {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| Error::SchedulerUnavailable(format!("GET /{path}: {e}")))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::SchedulerUnavailable(format!(
                "failed request to /{path} (status={})",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Tile(format!("invalid reply from /{path}: {e}")))
    }
}
#[async_trait]
impl SchedulerApi for HttpScheduler {
    async fn next_tile(&self) -> Result<NextTile> {
        self.get("next_tile", &[]).await
    }
    async fn calibrators(&self, ra: f64, dec: f64) -> Result<Calibrators> {
        self.get("cals", &[("ra", ra.to_string()), ("dec", dec.to_string())])
            .await
    }
    async fn register_observation(&self, registration: &Registration) -> Result<()> {
        log::debug!("Registration payload {registration:?}");
        let response = self
            .client
            .put(self.url("register_observation"))
            .json(registration)
            .send()
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;
        let status = response.status();
        let reply: Option<RegistrationReply> = response.json().await.ok();
        match (status, reply) {
            (reqwest::StatusCode::OK, Some(RegistrationReply { success: true })) => Ok(()),
            (status, _) => Err(Error::Registration(format!(
                "tile {} not registered (status={status})",
                registration.tile_id
            ))),
        }
    }
}
