//! Reading publisher — maps a provider-neutral [`Reading`] onto the
//! canonical `airquality_*` gauges.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{error, warn};

use crate::metrics::{MetricKind, MetricsSink};

pub const AQI_US: &str = "airquality_aqius";
pub const AQI_CN: &str = "airquality_aqicn";
pub const TEMPERATURE: &str = "airquality_temperature";
pub const PRESSURE_HPA: &str = "airquality_pressure_hpa";
pub const HUMIDITY: &str = "airquality_humidity";
pub const WIND_SPEED: &str = "airquality_wind_speed";
pub const WIND_DIRECTION: &str = "airquality_wind_direction";
pub const LAST_UPDATE: &str = "airquality_last_update";

/// Declare the reading gauges. Safe to call more than once.
pub fn describe(sink: &dyn MetricsSink) {
    let gauges = [
        (AQI_US, "AQI value based on US EPA standard"),
        (AQI_CN, "AQI value based on China MEP standard"),
        (TEMPERATURE, "Temperature in Celsius"),
        (PRESSURE_HPA, "Atmospheric pressure in hPa"),
        (HUMIDITY, "Humidity %"),
        (WIND_SPEED, "Wind speed (m/s)"),
        (WIND_DIRECTION, "Wind direction, as an angle of 360° (N=0, E=90, S=180, W=270)"),
        (LAST_UPDATE, "Unix time of the provider's last update, per subject"),
    ];
    for (name, help) in gauges {
        sink.init(name, MetricKind::Gauge, help);
    }
}

/// One set of current conditions for a target.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub aqi_us: f64,
    pub aqi_cn: f64,
    pub temperature: f64,
    pub pressure_hpa: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
    /// Provider timestamp of the weather sub-reading.
    pub weather_ts: String,
    /// Provider timestamp of the pollution sub-reading.
    pub pollution_ts: String,
}

/// Publish every gauge of `reading` under `labels`. The two sub-readings
/// carry their own timestamps, so `last_update` is split by `subject`.
pub fn publish(sink: &dyn MetricsSink, reading: &Reading, labels: &[(&str, &str)]) {
    sink.set(AQI_US, reading.aqi_us, labels);
    sink.set(AQI_CN, reading.aqi_cn, labels);
    sink.set(TEMPERATURE, reading.temperature, labels);
    sink.set(PRESSURE_HPA, reading.pressure_hpa, labels);
    sink.set(HUMIDITY, reading.humidity, labels);
    sink.set(WIND_SPEED, reading.wind_speed, labels);
    sink.set(WIND_DIRECTION, reading.wind_direction, labels);

    for (subject, ts) in [("weather", &reading.weather_ts), ("pollution", &reading.pollution_ts)] {
        let mut subject_labels = Vec::with_capacity(labels.len() + 1);
        subject_labels.push(("subject", subject));
        subject_labels.extend_from_slice(labels);
        sink.set(LAST_UPDATE, extract_timestamp(ts) as f64, &subject_labels);
    }
}

/// Unix seconds from a provider timestamp such as `2019-04-08T18:00:00.000Z`.
///
/// Everything from the first `.` on is dropped before parsing. Anything
/// unparseable falls back to the current time; this never fails.
pub fn extract_timestamp(ts: &str) -> i64 {
    let head = ts.split('.').next().unwrap_or(ts).trim();

    match parse_timestamp(head) {
        Some(secs) => secs,
        None => {
            error!(ts, "Couldn't extract time from provider timestamp");
            warn!("Falling back to local time as update timestamp");
            Utc::now().timestamp()
        }
    }
}

/// Offset-qualified values are honoured; naive values are taken as UTC,
/// which is what providers report.
fn parse_timestamp(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }

    let naive = s.trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusSink;

    fn reading() -> Reading {
        Reading {
            aqi_us: 42.0,
            aqi_cn: 15.0,
            temperature: 21.0,
            pressure_hpa: 1013.0,
            humidity: 61.0,
            wind_speed: 2.57,
            wind_direction: 270.0,
            weather_ts: "2019-04-08T18:00:00.000Z".into(),
            pollution_ts: "2019-04-08T17:00:00.000Z".into(),
        }
    }

    #[test]
    fn test_extract_timestamp_strips_fraction() {
        assert_eq!(extract_timestamp("2019-04-08T18:00:00.000Z"), 1_554_746_400);
    }

    #[test]
    fn test_extract_timestamp_without_fraction() {
        assert_eq!(extract_timestamp("2019-04-08T18:00:00Z"), 1_554_746_400);
        assert_eq!(extract_timestamp("2019-04-08T18:00:00"), 1_554_746_400);
        assert_eq!(extract_timestamp("2019-04-08T20:00:00+02:00"), 1_554_746_400);
    }

    #[test]
    fn test_malformed_timestamp_falls_back_to_now() {
        let before = Utc::now().timestamp();
        let ts = extract_timestamp("yesterday-ish");
        let after = Utc::now().timestamp();
        assert!(ts >= before && ts <= after);

        let ts = extract_timestamp("");
        assert!(ts >= before);
    }

    #[test]
    fn test_publish_sets_all_gauges() {
        let sink = PrometheusSink::new();
        describe(&sink);
        let labels = [("provider", "IQAir"), ("city", "Los Angeles")];

        publish(&sink, &reading(), &labels);

        assert_eq!(sink.sample(AQI_US, &labels), Some(42.0));
        assert_eq!(sink.sample(AQI_CN, &labels), Some(15.0));
        assert_eq!(sink.sample(PRESSURE_HPA, &labels), Some(1013.0));
        assert_eq!(sink.sample(WIND_SPEED, &labels), Some(2.57));
        assert_eq!(sink.sample(WIND_DIRECTION, &labels), Some(270.0));
    }

    #[test]
    fn test_last_update_split_by_subject() {
        let sink = PrometheusSink::new();
        describe(&sink);
        let labels = [("provider", "IQAir"), ("city", "Los Angeles")];

        publish(&sink, &reading(), &labels);

        let weather = [("subject", "weather"), ("provider", "IQAir"), ("city", "Los Angeles")];
        let pollution = [("subject", "pollution"), ("provider", "IQAir"), ("city", "Los Angeles")];
        assert_eq!(sink.sample(LAST_UPDATE, &weather), Some(1_554_746_400.0));
        assert_eq!(sink.sample(LAST_UPDATE, &pollution), Some(1_554_742_800.0));
    }
}
