//! IQAir `/city` response body.

use serde::Deserialize;
use serde_json::Value;

use crate::publisher::Reading;

/// Outer envelope. `data` is kept raw because its shape depends on
/// `status`: current conditions on success, `{ "message": ... }` otherwise.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default)]
    pub data: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.data.get("message")?.as_str()
    }
}

#[derive(Debug, Deserialize)]
pub struct CityData {
    pub current: Current,
}

#[derive(Debug, Deserialize)]
pub struct Current {
    pub pollution: Pollution,
    pub weather: Weather,
}

#[derive(Debug, Deserialize)]
pub struct Pollution {
    pub ts: String,
    pub aqius: f64,
    pub aqicn: f64,
}

#[derive(Debug, Deserialize)]
pub struct Weather {
    pub ts: String,
    /// Temperature, °C
    pub tp: f64,
    /// Pressure, hPa
    pub pr: f64,
    /// Humidity, %
    pub hu: f64,
    /// Wind speed, m/s
    pub ws: f64,
    /// Wind direction, degrees
    pub wd: f64,
}

impl From<CityData> for Reading {
    fn from(data: CityData) -> Self {
        let Current { pollution, weather } = data.current;
        Reading {
            aqi_us: pollution.aqius,
            aqi_cn: pollution.aqicn,
            temperature: weather.tp,
            pressure_hpa: weather.pr,
            humidity: weather.hu,
            wind_speed: weather.ws,
            wind_direction: weather.wd,
            weather_ts: weather.ts,
            pollution_ts: pollution.ts,
        }
    }
}
