//! Weather provider client (Open-Meteo).
//!
//! No API key is needed. Current conditions and the daily forecast are two
//! separate requests; either may fail independently, and a failure only
//! means "no weather data" for that half of the snapshot.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{CurrentConditions, ForecastDay, WeatherSnapshot};

const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com/v1";

/// Days of daily forecast requested.
const FORECAST_DAYS: u32 = 7;

#[derive(Clone)]
pub struct WeatherClient {
    client: Client,
    base_url: String,
    latitude: f64,
    longitude: f64,
}

// ---------------------------------------------------------------------------
// Open-Meteo response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    current: CurrentBlock,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    temperature_2m: f64,
    relative_humidity_2m: f64,
    wind_speed_10m: f64,
    weather_code: u8,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    daily: DailyBlock,
}

/// Column-oriented; missing model values come back as `null`.
#[derive(Debug, Deserialize)]
struct DailyBlock {
    time: Vec<String>,
    temperature_2m_max: Vec<Option<f64>>,
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_probability_max: Vec<Option<f64>>,
}

impl WeatherClient {
    pub fn new(latitude: f64, longitude: f64, timeout: Duration) -> EngineResult<Self> {
        Self::with_base_url(latitude, longitude, timeout, DEFAULT_BASE_URL)
    }

    /// Point the client at another Open-Meteo compatible endpoint.
    pub fn with_base_url(
        latitude: f64,
        longitude: f64,
        timeout: Duration,
        base_url: &str,
    ) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ExternalUnavailable(format!("weather client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            latitude,
            longitude,
        })
    }

    pub async fn current(&self) -> EngineResult<CurrentConditions> {
        let url = format!(
            "{}/forecast?latitude={}&longitude={}\
             &current=temperature_2m,relative_humidity_2m,wind_speed_10m,weather_code\
             &wind_speed_unit=kmh",
            self.base_url, self.latitude, self.longitude
        );
        let data: CurrentResponse = self.get_json(&url).await?;
        Ok(convert_current(data.current))
    }

    pub async fn forecast(&self) -> EngineResult<Vec<ForecastDay>> {
        let url = format!(
            "{}/forecast?latitude={}&longitude={}\
             &daily=temperature_2m_max,temperature_2m_min,precipitation_probability_max\
             &timezone=auto&forecast_days={FORECAST_DAYS}",
            self.base_url, self.latitude, self.longitude
        );
        let data: DailyResponse = self.get_json(&url).await?;
        Ok(convert_daily(data.daily))
    }

    /// Fetch both halves. `None` when neither could be fetched.
    pub async fn snapshot(&self, now: OffsetDateTime) -> Option<WeatherSnapshot> {
        let (current, forecast) = tokio::join!(self.current(), self.forecast());

        let current = current
            .map_err(|e| warn!("weather: current conditions unavailable: {e}"))
            .ok();
        let forecast = forecast
            .map_err(|e| warn!("weather: forecast unavailable: {e}"))
            .ok();

        if current.is_none() && forecast.is_none() {
            return None;
        }
        Some(WeatherSnapshot {
            current,
            forecast: forecast.unwrap_or_default(),
            fetched_at: now,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> EngineResult<T> {
        debug!(%url, "weather: request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::ExternalUnavailable(format!("weather request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ExternalUnavailable(format!(
                "weather API error: {status} - {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::ExternalUnavailable(format!("bad weather response: {e}")))
    }
}

fn convert_current(c: CurrentBlock) -> CurrentConditions {
    CurrentConditions {
        temperature_c: c.temperature_2m,
        humidity_pct: c.relative_humidity_2m,
        wind_speed_kmh: c.wind_speed_10m,
        description: describe_wmo(c.weather_code).to_string(),
    }
}

/// Zip the daily columns into rows, dropping days with missing temperatures.
/// A missing precipitation probability counts as zero.
fn convert_daily(d: DailyBlock) -> Vec<ForecastDay> {
    d.time
        .into_iter()
        .enumerate()
        .filter_map(|(i, date)| {
            let max = d.temperature_2m_max.get(i).copied().flatten()?;
            let min = d.temperature_2m_min.get(i).copied().flatten()?;
            let precip = d
                .precipitation_probability_max
                .get(i)
                .copied()
                .flatten()
                .unwrap_or(0.0);
            Some(ForecastDay {
                date,
                temp_min_c: min,
                temp_max_c: max,
                precipitation_signal: precip,
            })
        })
        .collect()
}

/// WMO weather interpretation codes as used by Open-Meteo.
pub fn describe_wmo(code: u8) -> &'static str {
    match code {
        0 => "clear sky",
        1 => "mainly clear",
        2 => "partly cloudy",
        3 => "overcast",
        45 | 48 => "fog",
        51 => "light drizzle",
        53 => "moderate drizzle",
        55 => "dense drizzle",
        56 | 57 => "freezing drizzle",
        61 => "slight rain",
        63 => "moderate rain",
        65 => "heavy rain",
        66 | 67 => "freezing rain",
        71 => "slight snow",
        73 => "moderate snow",
        75 => "heavy snow",
        77 => "snow grains",
        80 => "slight rain showers",
        81 => "moderate rain showers",
        82 => "violent rain showers",
        85 | 86 => "snow showers",
        95 => "thunderstorm",
        96 | 99 => "thunderstorm with hail",
        _ => "unknown",
    }
}

// ===========================================================================
// Tests
// ===========================================================================
