//! OpenWeather producers and the weather tracker image.
//!
//! Base data is the current weather for `city_name`; the augment step fetches
//! the daily forecast for the coordinates that came back with it.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use tracker_core::{DataNodeSpec, Error, Producer, Result, Snapshot, TrackerImage};

pub const WEATHER_DATA: &str = "weather_data";
pub const FORECAST: &str = "forecast";

#[derive(Clone)]
pub struct OpenWeatherClient {
    client: Client,
    api_base: String,
}

impl OpenWeatherClient {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| Error::backend("build openweather http client", e))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/{path}", self.api_base);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::backend(format!("GET {path}"), e))?
            .error_for_status()
            .map_err(|e| Error::backend(format!("GET {path}"), e))?;
        resp.json()
            .await
            .map_err(|e| Error::backend(format!("decode {path} response"), e))
    }

    #[instrument(level = "debug", skip(self, api_key))]
    pub async fn current_weather(&self, api_key: &str, city_name: &str) -> Result<Value> {
        self.get_json("weather", &[("q", city_name), ("appid", api_key)])
            .await
    }

    #[instrument(level = "debug", skip(self, api_key))]
    pub async fn daily_forecast(&self, api_key: &str, lat: f64, lon: f64) -> Result<Value> {
        let (lat, lon) = (lat.to_string(), lon.to_string());
        self.get_json(
            "onecall",
            &[
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("exclude", "current,minutely,hourly,alerts"),
                ("appid", api_key),
            ],
        )
        .await
    }
}

struct CurrentWeather(OpenWeatherClient);

#[async_trait]
impl Producer for CurrentWeather {
    async fn produce(&self, snapshot: &Snapshot) -> Result<Value> {
        let api_key = str_field(snapshot, "api_key")?;
        let city_name = str_field(snapshot, "city_name")?;
        self.0.current_weather(api_key, city_name).await
    }
}

struct DailyForecast(OpenWeatherClient);

#[async_trait]
impl Producer for DailyForecast {
    async fn produce(&self, snapshot: &Snapshot) -> Result<Value> {
        let api_key = str_field(snapshot, "api_key")?;
        let (lat, lon) = coordinates(snapshot)?;
        self.0.daily_forecast(api_key, lat, lon).await
    }
}

fn str_field<'a>(snapshot: &'a Snapshot, name: &str) -> Result<&'a str> {
    snapshot
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BackendMessage(format!("'{name}' must be a string")))
}

fn coordinates(snapshot: &Snapshot) -> Result<(f64, f64)> {
    let coord = snapshot.get(WEATHER_DATA).and_then(|w| w.get("coord"));
    let axis = |key: &str| coord.and_then(|c| c.get(key)).and_then(Value::as_f64);
    match (axis("lat"), axis("lon")) {
        (Some(lat), Some(lon)) => Ok((lat, lon)),
        _ => Err(Error::BackendMessage(format!(
            "{WEATHER_DATA} has no coord.lat/coord.lon"
        ))),
    }
}

fn observed_at(snapshot: &Snapshot) -> Option<i64> {
    snapshot.get(WEATHER_DATA)?.get("dt")?.as_i64()
}

/// A new observation is one whose `dt` is strictly later than the last
/// committed one.
pub fn weather_changed(previous: &Snapshot, current: &Snapshot) -> bool {
    match (observed_at(previous), observed_at(current)) {
        (Some(previous), Some(current)) => current > previous,
        (None, Some(_)) => true,
        _ => false,
    }
}

pub fn weather_image(client: OpenWeatherClient) -> Result<Arc<TrackerImage>> {
    TrackerImage::builder()
        .required_inputs(["api_key", "city_name"])
        .min_time_to_update(Duration::from_secs(1))
        .base(
            WEATHER_DATA,
            DataNodeSpec::new(Arc::new(CurrentWeather(client.clone()))),
        )
        .augment(
            FORECAST,
            DataNodeSpec::new(Arc::new(DailyForecast(client))).depends_on([WEATHER_DATA]),
        )
        .change_predicate(weather_changed)
        .build()
}
