//! # Health Checkin
//!
//! Collaborator that polls station sensors and reports station health to
//! the backend.
//!
//! [`HttpServerApi`] gathers device details from the local hardware server,
//! adds the filtered beep statistics and buffered sensor readings, and posts
//! the bundle to the checkin endpoint.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CheckinConfig;
use crate::data::StatsAggregator;
use crate::error::{Result, StationError};

/// Hardware server paths gathered into every checkin
const DETAIL_PATHS: [(&str, &str); 4] = [
    ("modem", "modem"),
    ("gps", "gps"),
    ("about", "about"),
    ("uploads", "internet/pending-upload"),
];

/// Hardware server path of the sensor reading
const SENSOR_PATH: &str = "sensor/details";

/// Sink for station health reports
#[async_trait]
pub trait HealthCheckin: Send + Sync {
    /// Take one sensor reading
    async fn poll_sensors(&self) -> Result<Value>;

    /// Send a checkin; `Ok` means the backend accepted it
    async fn checkin(&self, stats: &StatsAggregator, sensor_data: &[Value]) -> Result<()>;
}

/// Checkin client talking to the hardware server and the backend over HTTP
#[derive(Debug, Clone)]
pub struct HttpServerApi {
    client: reqwest::Client,
    endpoint: String,
    hardware_endpoint: String,
}

impl HttpServerApi {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed
    pub fn new(config: &CheckinConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        let mut hardware_endpoint = config.hardware_endpoint.clone();
        if !hardware_endpoint.ends_with('/') {
            hardware_endpoint.push('/');
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            hardware_endpoint,
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.hardware_endpoint, path);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Fetch every detail; an unreachable detail becomes `null`
    async fn gather_details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        for (key, path) in DETAIL_PATHS {
            let value = match self.get_json(path).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Failed to fetch {} details: {}", key, e);
                    Value::Null
                }
            };
            details.insert(key.to_string(), value);
        }
        details
    }
}

#[async_trait]
impl HealthCheckin for HttpServerApi {
    async fn poll_sensors(&self) -> Result<Value> {
        self.get_json(SENSOR_PATH).await
    }

    async fn checkin(&self, stats: &StatsAggregator, sensor_data: &[Value]) -> Result<()> {
        let details = self.gather_details().await;
        let body = checkin_body(details, stats, sensor_data)?;

        debug!("Checking in to {}", self.endpoint);
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(StationError::Checkin(format!(
                "server answered checkin with status {}",
                response.status()
            )));
        }
        info!("Checked in with {} sensor readings", sensor_data.len());
        Ok(())
    }
}

/// Assemble the checkin JSON from hardware details, stats and sensor data
pub fn checkin_body(
    mut details: Map<String, Value>,
    stats: &StatsAggregator,
    sensor_data: &[Value],
) -> Result<Value> {
    let gps = details.remove("gps").unwrap_or(Value::Null);
    details.insert("gps".to_string(), gps_summary(&gps));
    details.insert("stats".to_string(), serde_json::to_value(stats)?);
    details.insert("sensor".to_string(), Value::Array(sensor_data.to_vec()));
    Ok(Value::Object(details))
}

/// Mean position from the hardware server's GPS report, stamped with the
/// fix time
fn gps_summary(gps: &Value) -> Value {
    let time = gps.pointer("/gps/time").cloned().unwrap_or(Value::Null);
    match gps.get("mean") {
        Some(Value::Object(mean)) => {
            let mut mean = mean.clone();
            mean.insert("time".to_string(), time);
            Value::Object(mean)
        }
        _ => json!({ "lat": null, "lng": null, "time": null }),
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records checkins; accepts them unless told to fail
    #[derive(Default)]
    pub struct MockCheckin {
        pub checkins: Mutex<Vec<(StatsAggregator, Vec<Value>)>>,
        pub sensor_reading: Mutex<Value>,
        fail: AtomicBool,
    }

    impl MockCheckin {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn checkin_count(&self) -> usize {
            self.checkins.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HealthCheckin for MockCheckin {
        async fn poll_sensors(&self) -> Result<Value> {
            Ok(self.sensor_reading.lock().unwrap().clone())
        }

        async fn checkin(&self, stats: &StatsAggregator, sensor_data: &[Value]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StationError::Checkin("mock backend down".to_string()));
            }
            self.checkins
                .lock()
                .unwrap()
                .push((stats.clone(), sensor_data.to_vec()));
            Ok(())
        }
    }
}
