//! # Weather, alerts and ephemeris
//!
//! All read from the operations API.

use crate::{config::WeatherLimits, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One weather station reading
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WeatherRecord {
    pub ts: NaiveDateTime,
    /// km/h
    pub wind_speed_avg: f64,
    /// %
    pub relative_humidity: f64,
    #[serde(default)]
    pub rain_intensity: f64,
}

/// Whether the latest reading is within the limits
///
/// An empty report is unsafe.
pub fn is_safe(records: &[WeatherRecord], limits: &WeatherLimits) -> bool {
    let Some(latest) = records.iter().max_by_key(|r| r.ts) else {
        log::warn!("(Weather) no weather data.");
        return false;
    };
    let mut safe = true;
    if latest.wind_speed_avg > limits.max_wind_speed {
        log::warn!("(Weather) wind speed {:.1} km/h above limit.", latest.wind_speed_avg);
        safe = false;
    }
    if latest.relative_humidity > limits.max_humidity {
        log::warn!("(Weather) humidity {:.0}% above limit.", latest.relative_humidity);
        safe = false;
    }
    if latest.rain_intensity > 0. {
        log::warn!("(Weather) rain detected.");
        safe = false;
    }
    safe
}

/// The observatory alarms, as summarised by the operations API
///
/// Absent fields mean the alarm is not reported.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AlertsSummary {
    pub humidity_alert: Option<bool>,
    pub dew_point_alert: Option<bool>,
    pub wind_alert: Option<bool>,
    pub rain: Option<bool>,
    pub door_alert: Option<bool>,
    pub camera_temperature_alert: Option<bool>,
    pub o2_alert: Option<bool>,
    pub heater_alert: Option<bool>,
}
impl AlertsSummary {
    /// The first alarm preventing the dome from opening, if any
    pub fn unsafe_reason(&self) -> Option<&'static str> {
        [
            (self.rain, "rain alert"),
            (self.humidity_alert, "humidity alert"),
            (self.dew_point_alert, "dew point alert"),
            (self.wind_alert, "wind alert"),
        ]
        .into_iter()
        .find(|(alert, _)| alert.unwrap_or(false))
        .map(|(_, reason)| reason)
    }
}

/// The latest alerts and how many reads failed since
#[derive(Debug, Default)]
pub struct AlertsMonitor {
    latest: Option<AlertsSummary>,
    failures: usize,
}
impl AlertsMonitor {
    /// Records the outcome of one read of the alerts
    pub fn update(&mut self, read: Result<AlertsSummary>) {
        match read {
            Ok(summary) => {
                self.latest = Some(summary);
                self.failures = 0;
            }
            Err(e) => {
                if self.failures == 0 {
                    log::error!("(Alerts) failed to get alerts data: {e}");
                }
                self.failures += 1;
            }
        }
    }
    /// Why it is unsafe to observe, if it is
    ///
    /// No data, or `max_failures` failed reads in a row, are unsafe.
    pub fn unsafe_reason(&self, max_failures: usize) -> Option<&'static str> {
        if self.failures >= max_failures {
            return Some("alerts data unavailable");
        }
        let Some(latest) = &self.latest else {
            log::warn!("(Alerts) no alerts data.");
            return Some("alerts data unavailable");
        };
        let reason = latest.unsafe_reason();
        if let Some(reason) = reason {
            log::warn!("(Alerts) {reason} detected.");
        }
        reason
    }
}

/// Twilight times bracketing the current or next night
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Ephemeris {
    /// End of the evening twilight
    pub twilight_end: DateTime<Utc>,
    /// Start of the morning twilight
    pub twilight_start: DateTime<Utc>,
}
impl Ephemeris {
    pub fn is_night(&self, now: DateTime<Utc>) -> bool {
        now >= self.twilight_end && now < self.twilight_start
    }
    /// Whether these twilights are already in the past
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.twilight_start
    }
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Readings over the last `delta_time` seconds
    async fn weather(&self, delta_time: u64) -> Result<Vec<WeatherRecord>>;
}

#[async_trait]
pub trait AlertsSource: Send + Sync {
    async fn alerts(&self) -> Result<AlertsSummary>;
}

#[async_trait]
pub trait EphemerisSource: Send + Sync {
    async fn ephemeris(&self) -> Result<Ephemeris>;
}

/// Client of the operations API
pub struct OpsApi {
    base_url: String,
    client: reqwest::Client,
}
impl OpsApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
    pub fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self.client.get(self.url(path)).query(query).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::Overwatcher(format!(
                "failed request to /{path} (status={})",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}
#[async_trait]
impl WeatherSource for OpsApi {
    async fn weather(&self, delta_time: u64) -> Result<Vec<WeatherRecord>> {
        self.get("weather", &[("delta_time", delta_time.to_string())])
            .await
    }
}
#[async_trait]
impl AlertsSource for OpsApi {
    async fn alerts(&self) -> Result<AlertsSummary> {
        self.get("alerts/summary", &[]).await
    }
}
#[async_trait]
impl EphemerisSource for OpsApi {
    async fn ephemeris(&self) -> Result<Ephemeris> {
        self.get("ephemeris", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::serve;
    use chrono::TimeZone;

    fn record(minute: u32, wind: f64) -> WeatherRecord {
        WeatherRecord {
            ts: Utc
                .with_ymd_and_hms(2024, 3, 1, 4, minute, 0)
                .unwrap()
                .naive_utc(),
            wind_speed_avg: wind,
            relative_humidity: 40.,
            rain_intensity: 0.,
        }
    }

    #[test]
    fn safety() {
        let limits = WeatherLimits::default();
        assert!(!is_safe(&[], &limits));
        // the latest reading decides
        assert!(is_safe(&[record(10, 10.), record(0, 50.)], &limits));
        assert!(!is_safe(&[record(0, 10.), record(10, 50.)], &limits));
        let wet = WeatherRecord {
            rain_intensity: 0.5,
            ..record(0, 10.)
        };
        assert!(!is_safe(&[wet], &limits));
    }

    #[test]
    fn alerts() {
        let mut monitor = AlertsMonitor::default();
        assert_eq!(monitor.unsafe_reason(5), Some("alerts data unavailable"));
        monitor.update(Ok(AlertsSummary {
            door_alert: Some(true),
            wind_alert: Some(false),
            ..Default::default()
        }));
        // an open door does not prevent observing
        assert_eq!(monitor.unsafe_reason(5), None);
        monitor.update(Ok(AlertsSummary {
            humidity_alert: Some(true),
            rain: Some(true),
            ..Default::default()
        }));
        assert_eq!(monitor.unsafe_reason(5), Some("rain alert"));

        monitor.update(Ok(AlertsSummary::default()));
        for _ in 0..4 {
            monitor.update(Err(Error::Overwatcher("API down".to_string())));
        }
        // the last summary holds until too many reads fail
        assert_eq!(monitor.unsafe_reason(5), None);
        monitor.update(Err(Error::Overwatcher("API down".to_string())));
        assert_eq!(monitor.unsafe_reason(5), Some("alerts data unavailable"));
        monitor.update(Ok(AlertsSummary::default()));
        assert_eq!(monitor.unsafe_reason(5), None);
    }

    #[test]
    fn night() {
        let ephemeris = Ephemeris {
            twilight_end: Utc.with_ymd_and_hms(2024, 3, 1, 0, 30, 0).unwrap(),
            twilight_start: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        };
        assert!(ephemeris.is_night(Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap()));
        assert!(!ephemeris.is_night(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let morning = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        assert!(!ephemeris.is_night(morning));
        assert!(ephemeris.is_stale(morning));
    }

    #[tokio::test]
    async fn ops_api() {
        let (url, requests) = serve(vec![
            (
                200,
                r#"[{"ts": "2024-03-01T04:00:00.000", "wind_speed_avg": 12.5, "relative_humidity": 30.0, "rain_intensity": 0.0}]"#,
            ),
            (
                200,
                r#"{"twilight_end": "2024-03-01T00:30:00Z", "twilight_start": "2024-03-01T09:00:00Z"}"#,
            ),
            (
                200,
                r#"{"humidity_alert": false, "wind_alert": true, "rain": null, "camera_alerts": {"sp1": false}}"#,
            ),
        ])
        .await;
        let api = OpsApi::new(url).unwrap();
        let weather = api.weather(600).await.unwrap();
        assert_eq!(weather[0].wind_speed_avg, 12.5);
        let ephemeris = api.ephemeris().await.unwrap();
        assert_eq!(ephemeris.twilight_start.to_rfc3339(), "2024-03-01T09:00:00+00:00");
        let alerts = api.alerts().await.unwrap();
        assert_eq!(alerts.rain, None);
        assert_eq!(alerts.unsafe_reason(), Some("wind alert"));
        let requests = requests.await.unwrap();
        assert!(requests[0].starts_with("GET /weather?delta_time=600 "));
        assert!(requests[1].starts_with("GET /ephemeris "));
        assert!(requests[2].starts_with("GET /alerts/summary "));
    }
}
