//! # Base Station
//!
//! Wires radios, classification, data logs, statistics and the heartbeat
//! together.
//!
//! This module handles:
//! - Starting one [`RadioChannel`] per configured radio and configuring it
//!   after every open
//! - Routing classified records to the category logs, the statistics and
//!   the event broadcast
//! - Running timer events: flushes inline, network work on detached tasks
//! - Operator commands received through a [`StationHandle`]
//!
//! Errors from timer work are logged and broadcast; nothing here stops the
//! ingestion loop except shutdown.

pub mod checkin;
pub mod commands;
pub mod events;
pub mod gps;
pub mod qaqc;

pub use checkin::{HealthCheckin, HttpServerApi};
pub use commands::{RadioMode, StationCommand};
pub use events::{AboutInfo, RadioStatus, StationEvent};
pub use gps::{GpsSource, SharedGpsState};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{Config, StationIdentity};
use crate::data::rotation::ROTATED_DIR;
use crate::data::{DataManager, ObjectStore, StatsAggregator, UploadManager};
use crate::error::{Result, StationError};
use crate::record::{classify, ClassifiedRecord, GpsRecord};
use crate::scheduler::{Heartbeat, Schedule, TimerEvent};
use crate::serial::{PortConnector, RadioChannel, RadioEvent, RadioOptions, RawMessage};

/// External collaborators a station talks to
pub struct Collaborators {
    pub connector: Arc<dyn PortConnector>,
    pub gps: Arc<dyn GpsSource>,
    /// Health backend; `None` disables checkins and sensor polling
    pub checkin: Option<Arc<dyn HealthCheckin>>,
    /// Upload target; `None` keeps rotated files locally
    pub store: Option<Arc<dyn ObjectStore>>,
}

/// Cloneable handle for sending commands to, and watching, a station
#[derive(Debug, Clone)]
pub struct StationHandle {
    commands: mpsc::UnboundedSender<StationCommand>,
    events: broadcast::Sender<StationEvent>,
}

impl StationHandle {
    /// Queue a command for the station
    ///
    /// # Errors
    ///
    /// Returns `InvalidCommand` if the station has stopped
    pub fn send(&self, command: StationCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| StationError::InvalidCommand("station is not running".to_string()))
    }

    /// Subscribe to station events
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }
}

/// The base station orchestrator
pub struct BaseStation {
    config: Config,
    station_id: String,
    started_at: DateTime<Utc>,
    data: Arc<DataManager>,
    stats: Arc<Mutex<StatsAggregator>>,
    sensor_data: Arc<Mutex<VecDeque<Value>>>,
    connector: Arc<dyn PortConnector>,
    gps: Arc<dyn GpsSource>,
    checkin: Option<Arc<dyn HealthCheckin>>,
    radios: BTreeMap<u8, RadioChannel>,
    events: broadcast::Sender<StationEvent>,
    commands: mpsc::UnboundedSender<StationCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<StationCommand>>,
}

impl std::fmt::Debug for BaseStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseStation")
            .field("station_id", &self.station_id)
            .field("radios", &self.radios)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl BaseStation {
    /// Build a station; nothing runs until [`BaseStation::run`]
    pub fn new(config: Config, identity: StationIdentity, collaborators: Collaborators) -> Self {
        let station_id = identity.id;
        let uploader = if config.upload.enabled {
            collaborators.store.map(|store| {
                UploadManager::new(
                    store,
                    station_id.clone(),
                    config.record.base_dir().join(ROTATED_DIR),
                    &config.upload,
                )
            })
        } else {
            None
        };
        let data = DataManager::new(station_id.clone(), &config.record, &config.gps, uploader);

        let (events, _) = broadcast::channel(events::EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();

        Self {
            sensor_data: Arc::new(Mutex::new(VecDeque::with_capacity(config.checkin.max_sensor_records))),
            config,
            station_id,
            started_at: Utc::now(),
            data: Arc::new(data),
            stats: Arc::new(Mutex::new(StatsAggregator::new())),
            connector: collaborators.connector,
            gps: collaborators.gps,
            checkin: collaborators.checkin,
            radios: BTreeMap::new(),
            events,
            commands,
            command_rx: Some(command_rx),
        }
    }

    pub fn handle(&self) -> StationHandle {
        StationHandle {
            commands: self.commands.clone(),
            events: self.events.clone(),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn data(&self) -> &Arc<DataManager> {
        &self.data
    }

    /// Copy of the live statistics
    pub fn stats(&self) -> StatsAggregator {
        lock(&self.stats).clone()
    }

    /// Run until `shutdown` completes, then stop radios and flush every log
    ///
    /// # Errors
    ///
    /// Returns an error if the base log directory cannot be created.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.data.init().await?;
        self.record(format!("initializing base station {}", self.station_id));

        let Some(mut command_rx) = self.command_rx.take() else {
            return Err(StationError::InvalidCommand("station already ran".to_string()));
        };

        let (radio_tx, mut radio_rx) = mpsc::unbounded_channel();
        self.start_radios(radio_tx);

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let (heartbeat_stop, heartbeat_stop_rx) = watch::channel(false);
        let heartbeat = Heartbeat::new(Schedule::from_config(&self.config)).spawn(timer_tx, heartbeat_stop_rx);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(event) = radio_rx.recv() => self.handle_radio_event(event),
                Some(event) = timer_rx.recv() => self.handle_timer(event).await,
                Some(command) = command_rx.recv() => {
                    if let Err(e) = self.handle_command(command) {
                        self.record(format!("command failed: {}", e));
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        info!("Shutting down base station");
        let _ = heartbeat_stop.send(true);
        let _ = heartbeat.await;

        for radio in std::mem::take(&mut self.radios).into_values() {
            radio.stop().await;
        }

        let rows = self.data.flush_all().await;
        info!("Final flush wrote {} rows", rows);
        Ok(())
    }

    fn start_radios(&mut self, events: mpsc::UnboundedSender<RadioEvent>) {
        self.record("starting radio receivers".to_string());
        for radio in &self.config.radios {
            let options = RadioOptions::from_config(radio, &self.config.serial);
            let channel = RadioChannel::open(options, self.connector.clone(), events.clone());
            self.radios.insert(radio.channel, channel);
        }
    }

    fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Opened { channel, path } => {
                self.record(format!("opened radio {} on port {}", channel, path));
                self.emit(StationEvent::RadioOpen { channel, path });
                self.configure_radio(channel);
            }
            RadioEvent::Closed { channel, path, reason } => {
                self.record(format!("radio {} on port {} closed: {}", channel, path, reason));
                self.emit(StationEvent::RadioClose { channel, path, reason });
            }
            RadioEvent::OpenFailed { channel, path, error } => {
                debug!("Radio {} on {} unavailable: {}", channel, path, error);
            }
            RadioEvent::Message(message) => {
                self.ingest(&message);
            }
            RadioEvent::Raw(message) => {
                self.record(format!("radio {} unparsed line: {}", message.channel, message.line));
            }
        }
    }

    /// Queue the configured start-up commands for a freshly opened radio
    fn configure_radio(&self, channel: u8) {
        let Some(radio) = self.radios.get(&channel) else {
            return;
        };
        let commands = self
            .config
            .radios
            .iter()
            .filter(|r| r.channel == channel)
            .flat_map(|r| r.config.iter());
        for command in commands {
            if let Err(e) = radio.write(command) {
                warn!("Failed to configure radio {}: {}", channel, e);
            }
        }
    }

    fn persists(&self, channel: u8) -> bool {
        self.config.record.enabled
            && self
                .config
                .radios
                .iter()
                .find(|r| r.channel == channel)
                .map_or(true, |r| r.record)
    }

    /// Classify one line and route the record to stats, logs and the
    /// broadcast
    pub fn ingest(&self, message: &RawMessage) -> ClassifiedRecord {
        let record = classify(message);
        let persist = self.persists(record.channel());

        match &record {
            ClassifiedRecord::Beep(beep) => {
                lock(&self.stats).add_beep(beep);
                if persist {
                    self.data.record_beep(beep);
                }
                self.emit(StationEvent::Beep(beep.clone()));
            }
            ClassifiedRecord::NodeRelayBeep(relay) => {
                lock(&self.stats).add_beep(&relay.beep);
                if persist {
                    self.data.record_beep(&relay.beep);
                }
                self.emit(StationEvent::Beep(relay.beep.clone()));
            }
            ClassifiedRecord::NodeHealth(health) => {
                lock(&self.stats).add_node_health(health);
                if persist {
                    self.data.record_node_health(health);
                }
                self.emit(StationEvent::NodeAlive(health.clone()));
            }
            ClassifiedRecord::Telemetry(telemetry) => {
                lock(&self.stats).add_telemetry_beep(telemetry);
                if persist {
                    self.data.record_telemetry(telemetry);
                }
                self.emit(StationEvent::Telemetry(telemetry.clone()));
            }
            ClassifiedRecord::Unrecognized(unknown) => {
                self.record(format!(
                    "radio {} unrecognized record ({}): {}",
                    unknown.channel, unknown.reason, unknown.line
                ));
            }
        }
        record
    }

    async fn handle_timer(&self, event: TimerEvent) {
        match event {
            TimerEvent::Flush => {
                let rows = self.data.flush_all().await;
                if rows > 0 {
                    debug!("Flushed {} rows", rows);
                }
            }
            TimerEvent::Rotate => {
                let data = self.data.clone();
                tokio::spawn(async move {
                    let rotated = data.rotate_and_upload().await;
                    info!("Rotation cycle produced {} files", rotated.len());
                });
            }
            TimerEvent::Upload => self.spawn_upload(),
            TimerEvent::GpsPoll => {
                if self.config.record.enabled {
                    self.data.record_gps(&GpsRecord {
                        recorded_at: Utc::now(),
                        fix: self.gps.latest_fix(),
                    });
                }
            }
            TimerEvent::SensorPoll => self.spawn_sensor_poll(),
            TimerEvent::Checkin => self.spawn_checkin(),
        }
    }

    fn handle_command(&self, command: StationCommand) -> Result<()> {
        match command {
            StationCommand::About => {
                self.emit(StationEvent::About { data: self.about() });
            }
            StationCommand::SaveRadio => {
                for (channel, radio) in &self.radios {
                    self.record(format!("saving config for radio {}", channel));
                    if let Err(e) = radio.write(commands::SAVE_COMMAND) {
                        warn!("Failed to save radio {}: {}", channel, e);
                    }
                }
            }
            StationCommand::ToggleRadio { channel, mode } => {
                let radio = self
                    .radios
                    .get(&channel)
                    .ok_or_else(|| StationError::InvalidCommand(format!("no radio on channel {}", channel)))?;
                self.record(format!("toggle {:?} mode on radio {}", mode, channel));
                radio.write(mode.preset())?;
            }
            StationCommand::Checkin => self.spawn_checkin(),
            StationCommand::UploadNow => self.spawn_upload(),
            StationCommand::Qaqc => {
                let results = qaqc::channel_results(
                    &lock(&self.stats),
                    &self.config.qaqc.tag,
                    self.config.qaqc.beep_threshold,
                );
                let passed = results.iter().filter(|r| r.passed).count();
                self.record(format!("qaqc: reference tag passed on {} of {} channels", passed, results.len()));
                self.emit(StationEvent::Qaqc { data: results });
            }
        }
        Ok(())
    }

    /// Station and radio summary for the `about` command
    pub fn about(&self) -> AboutInfo {
        AboutInfo {
            station_id: self.station_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            radios: self
                .radios
                .values()
                .map(|radio| RadioStatus {
                    channel: radio.channel(),
                    path: radio.device_path().to_string(),
                    state: radio.state(),
                    last_opened: radio.last_opened(),
                })
                .collect(),
        }
    }

    fn spawn_upload(&self) {
        let data = self.data.clone();
        tokio::spawn(async move {
            if data.upload_all().await.is_none() {
                debug!("Uploads not configured");
            }
        });
    }

    fn spawn_sensor_poll(&self) {
        let Some(checkin) = self.checkin.clone() else {
            return;
        };
        let sensor_data = self.sensor_data.clone();
        let max_records = self.config.checkin.max_sensor_records;
        tokio::spawn(async move {
            match checkin.poll_sensors().await {
                Ok(reading) => push_bounded(&mut lock(&sensor_data), reading, max_records),
                Err(e) => warn!("Sensor poll failed: {}", e),
            }
        });
    }

    fn spawn_checkin(&self) {
        let Some(checkin) = self.checkin.clone() else {
            debug!("Checkin not configured");
            return;
        };
        tokio::spawn(run_checkin(
            checkin,
            self.stats.clone(),
            self.sensor_data.clone(),
            self.events.clone(),
            self.config.checkin.min_beep_count,
            self.config.checkin.max_sensor_records,
        ));
    }

    /// Log a message and mirror it to UI subscribers
    fn record(&self, message: String) {
        info!("{}", message);
        self.emit(StationEvent::log(message));
    }

    fn emit(&self, event: StationEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Send a filtered stats snapshot with the buffered sensor readings
///
/// The readings leave the buffer for the duration of the request and go
/// back in front of any newer ones if it fails. On success the counts that
/// were current when the request started are subtracted from the live
/// stats, so beeps heard meanwhile are reported next time.
///
/// Returns whether the backend accepted the checkin.
async fn run_checkin(
    checkin: Arc<dyn HealthCheckin>,
    stats: Arc<Mutex<StatsAggregator>>,
    sensor_data: Arc<Mutex<VecDeque<Value>>>,
    events: broadcast::Sender<StationEvent>,
    min_beep_count: u64,
    max_sensor_records: usize,
) -> bool {
    let counted = lock(&stats).clone();
    let snapshot = counted.snapshot(min_beep_count);
    let mut readings = std::mem::take(&mut *lock(&sensor_data));

    match checkin.checkin(&snapshot, readings.make_contiguous()).await {
        Ok(()) => {
            lock(&stats).subtract(&counted);
            info!("Health checkin accepted");
            true
        }
        Err(e) => {
            error!("Health checkin failed: {}", e);
            let mut buffered = lock(&sensor_data);
            let newer = std::mem::replace(&mut *buffered, readings);
            for reading in newer {
                push_bounded(&mut buffered, reading, max_sensor_records);
            }
            drop(buffered);
            let _ = events.send(StationEvent::log(format!("checkin failed: {}", e)));
            false
        }
    }
}

fn push_bounded(buffer: &mut VecDeque<Value>, value: Value, max: usize) {
    buffer.push_back(value);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::checkin::mocks::MockCheckin;
    use super::gps::MockGpsSource;
    use super::*;
    use crate::config::RadioConfig;
    use crate::record::GpsFix;
    use crate::serial::port_trait::mocks::MockConnector;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn radio(channel: u8, record: bool) -> RadioConfig {
        RadioConfig {
            channel,
            path: format!("/dev/mock{}", channel),
            baud_rate: 115_200,
            config: vec!["preset:fsktag".to_string()],
            record,
        }
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.radios = vec![radio(1, true), radio(2, true), radio(3, false)];
        config.record.base_log_directory = dir.path().to_string_lossy().into_owned();
        config.upload.enabled = false;
        config.checkin.enabled = false;
        config
    }

    fn station(config: Config, gps: Arc<dyn GpsSource>, checkin: Option<Arc<dyn HealthCheckin>>) -> BaseStation {
        BaseStation::new(
            config,
            StationIdentity { id: "abc123".to_string() },
            Collaborators {
                connector: Arc::new(MockConnector::new()),
                gps,
                checkin,
                store: None,
            },
        )
    }

    const DIRECT: &str = r#"{"tag":{"id":"ABCD1234"},"rssi":-71}"#;
    const RELAYED: &str = r#"{"protocol":"1.0.0","meta":{"data_type":"node_coded_id","rssi":-90},"source":{"id":"N7"},"data":{"id":"ABCD1234"}}"#;

    #[tokio::test]
    async fn test_direct_and_relayed_beeps_end_to_end() {
        let dir = TempDir::new().unwrap();
        let station = station(config(&dir), Arc::new(SharedGpsState::new()), None);
        station.data().init().await.unwrap();
        let mut events = station.handle().subscribe();

        for _ in 0..3 {
            station.ingest(&RawMessage::now(2, DIRECT));
        }
        station.ingest(&RawMessage::now(2, RELAYED));

        let stats = station.stats();
        assert_eq!(stats.direct_count(2, "ABCD1234"), 3);
        assert_eq!(stats.relayed_count(2, "ABCD1234"), 1);

        assert_eq!(station.data().flush_all().await, 4);
        let contents = std::fs::read_to_string(dir.path().join("CTT-abc123-raw-data.csv")).unwrap();
        assert_eq!(contents.lines().count(), 5);
        assert!(contents.lines().last().unwrap().contains(",N7,"));

        for _ in 0..4 {
            assert!(matches!(events.recv().await.unwrap(), StationEvent::Beep(_)));
        }
    }

    #[tokio::test]
    async fn test_unrecorded_channel_counts_but_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let station = station(config(&dir), Arc::new(SharedGpsState::new()), None);
        station.data().init().await.unwrap();

        station.ingest(&RawMessage::now(3, DIRECT));

        assert_eq!(station.stats().direct_count(3, "ABCD1234"), 1);
        assert_eq!(station.data().flush_all().await, 0);
        assert!(!dir.path().join("CTT-abc123-raw-data.csv").exists());
    }

    #[tokio::test]
    async fn test_unrecognized_line_is_logged_not_persisted() {
        let dir = TempDir::new().unwrap();
        let station = station(config(&dir), Arc::new(SharedGpsState::new()), None);
        let mut events = station.handle().subscribe();

        let record = station.ingest(&RawMessage::now(1, r#"{"hello":"world"}"#));

        assert!(matches!(record, ClassifiedRecord::Unrecognized(_)));
        assert!(matches!(events.recv().await.unwrap(), StationEvent::Log { .. }));
        assert_eq!(station.data().flush_all().await, 0);
    }

    #[tokio::test]
    async fn test_gps_poll_records_fix() {
        let dir = TempDir::new().unwrap();
        let mut gps = MockGpsSource::new();
        gps.expect_latest_fix().times(1).returning(|| {
            Some(GpsFix {
                time: None,
                lat: 38.25,
                lon: -77.5,
                alt: Some(12.0),
                mode: 3,
            })
        });
        let station = station(config(&dir), Arc::new(gps), None);
        station.data().init().await.unwrap();

        station.handle_timer(TimerEvent::GpsPoll).await;
        station.handle_timer(TimerEvent::Flush).await;

        let contents = std::fs::read_to_string(dir.path().join("CTT-abc123-gps.csv")).unwrap();
        assert!(contents.starts_with("recorded at,gps at"));
        assert!(contents.contains(",38.250000,-77.500000,12,3"));
    }

    #[tokio::test]
    async fn test_gps_poll_without_client_writes_time_only_row() {
        let dir = TempDir::new().unwrap();
        let station = station(config(&dir), Arc::new(SharedGpsState::new()), None);
        station.data().init().await.unwrap();

        station.handle_timer(TimerEvent::GpsPoll).await;
        station.handle_timer(TimerEvent::Flush).await;

        let contents = std::fs::read_to_string(dir.path().join("CTT-abc123-gps.csv")).unwrap();
        let row = contents.lines().nth(1).unwrap();
        assert!(row.ends_with(",,,,,"));
    }

    fn beep(tag_id: &str) -> crate::record::BeepRecord {
        let now = Utc::now();
        crate::record::BeepRecord {
            channel: 1,
            received_at: now,
            recorded_at: now,
            tag_id: tag_id.to_string(),
            rssi: None,
            node_id: None,
            validated: false,
            error_bits: None,
        }
    }

    /// Backend that takes a while; beeps and sensor readings keep arriving
    /// before it answers
    struct SlowCheckin {
        stats: Arc<Mutex<StatsAggregator>>,
        sensors: Arc<Mutex<VecDeque<Value>>>,
        reported: Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl HealthCheckin for SlowCheckin {
        async fn poll_sensors(&self) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn checkin(&self, stats: &StatsAggregator, _sensor_data: &[Value]) -> Result<()> {
            self.reported.lock().unwrap().push(stats.direct_count(1, "ABCD1234"));
            {
                let mut live = lock(&self.stats);
                for _ in 0..7 {
                    live.add_beep(&beep("ABCD1234"));
                }
            }
            push_bounded(&mut lock(&self.sensors), json!("late"), 3);
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_checkin_success_resets_stats_and_sensor_data() {
        let stats = Arc::new(Mutex::new(StatsAggregator::new()));
        let sensors = Arc::new(Mutex::new(VecDeque::from(vec![json!({"temp": 20})])));
        let (events, _) = broadcast::channel(8);
        let checkin = Arc::new(MockCheckin::new());

        {
            let mut live = lock(&stats);
            for tag in ["KEEP0001", "KEEP0001", "DROP0001"] {
                live.add_beep(&beep(tag));
            }
        }

        assert!(run_checkin(checkin.clone(), stats.clone(), sensors.clone(), events, 2, 10).await);

        let sent = checkin.checkins.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.direct_count(1, "KEEP0001"), 2);
        assert_eq!(sent[0].0.direct_count(1, "DROP0001"), 0);
        assert_eq!(sent[0].1, vec![json!({"temp": 20})]);

        assert_eq!(*lock(&stats), StatsAggregator::new());
        assert!(lock(&sensors).is_empty());
    }

    #[tokio::test]
    async fn test_checkin_keeps_beeps_counted_during_request() {
        let stats = Arc::new(Mutex::new(StatsAggregator::new()));
        let sensors = Arc::new(Mutex::new(VecDeque::from(vec![json!(0), json!(1), json!(2)])));
        let (events, _) = broadcast::channel(8);
        for _ in 0..5 {
            lock(&stats).add_beep(&beep("ABCD1234"));
        }
        let checkin = Arc::new(SlowCheckin {
            stats: stats.clone(),
            sensors: sensors.clone(),
            reported: Mutex::new(Vec::new()),
        });

        assert!(run_checkin(checkin.clone(), stats.clone(), sensors.clone(), events, 1, 3).await);

        assert_eq!(*checkin.reported.lock().unwrap(), vec![5]);
        assert_eq!(lock(&stats).direct_count(1, "ABCD1234"), 7);
        assert_eq!(*lock(&sensors), VecDeque::from(vec![json!("late")]));
    }

    #[tokio::test]
    async fn test_failed_checkin_keeps_state() {
        let stats = Arc::new(Mutex::new(StatsAggregator::new()));
        lock(&stats).add_beep(&beep("ABCD1234"));
        let sensors = Arc::new(Mutex::new(VecDeque::from(vec![json!(1)])));
        let (events, mut rx) = broadcast::channel(8);
        let checkin = Arc::new(MockCheckin::new());
        checkin.set_fail(true);

        assert!(!run_checkin(checkin.clone(), stats.clone(), sensors.clone(), events, 5, 10).await);
        assert_eq!(lock(&stats).direct_count(1, "ABCD1234"), 1);
        assert_eq!(*lock(&sensors), VecDeque::from(vec![json!(1)]));
        assert!(matches!(rx.recv().await.unwrap(), StationEvent::Log { .. }));
    }

    #[tokio::test]
    async fn test_failed_checkin_puts_readings_back_before_newer_ones() {
        let stats = Arc::new(Mutex::new(StatsAggregator::new()));
        let sensors = Arc::new(Mutex::new(VecDeque::from(vec![json!(0), json!(1)])));
        let (events, _) = broadcast::channel(8);

        struct DownCheckin(Arc<Mutex<VecDeque<Value>>>);

        #[async_trait::async_trait]
        impl HealthCheckin for DownCheckin {
            async fn poll_sensors(&self) -> Result<Value> {
                Ok(Value::Null)
            }

            async fn checkin(&self, _stats: &StatsAggregator, _sensor_data: &[Value]) -> Result<()> {
                push_bounded(&mut lock(&self.0), json!(2), 2);
                Err(StationError::Checkin("backend down".to_string()))
            }
        }

        let checkin = Arc::new(DownCheckin(sensors.clone()));
        assert!(!run_checkin(checkin, stats, sensors.clone(), events, 1, 2).await);
        assert_eq!(*lock(&sensors), VecDeque::from(vec![json!(1), json!(2)]));
    }

    #[test]
    fn test_push_bounded_drops_oldest() {
        let mut buffer = VecDeque::new();
        for i in 0..5 {
            push_bounded(&mut buffer, json!(i), 3);
        }
        assert_eq!(buffer, VecDeque::from(vec![json!(2), json!(3), json!(4)]));
    }

    #[tokio::test]
    async fn test_toggle_unknown_radio_is_rejected() {
        let dir = TempDir::new().unwrap();
        let station = station(config(&dir), Arc::new(SharedGpsState::new()), None);

        let result = station.handle_command(StationCommand::ToggleRadio {
            channel: 4,
            mode: RadioMode::Node,
        });
        assert!(matches!(result, Err(StationError::InvalidCommand(_))));
    }

    #[test]
    fn test_handle_send_fails_after_station_dropped() {
        let dir = TempDir::new().unwrap();
        let station = station(config(&dir), Arc::new(SharedGpsState::new()), None);
        let handle = station.handle();

        tokio_test::assert_ok!(handle.send(StationCommand::About));
        drop(station);
        tokio_test::assert_err!(handle.send(StationCommand::About));
    }

    #[tokio::test]
    async fn test_about_lists_station() {
        let dir = TempDir::new().unwrap();
        let station = station(config(&dir), Arc::new(SharedGpsState::new()), None);
        let mut events = station.handle().subscribe();

        station.handle_command(StationCommand::About).unwrap();

        match events.recv().await.unwrap() {
            StationEvent::About { data } => assert_eq!(data.station_id, "abc123"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_qaqc_command_reports_reference_tag_per_channel() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.qaqc.tag = "78787878".to_string();
        config.qaqc.beep_threshold = 2;
        let station = station(config, Arc::new(SharedGpsState::new()), None);
        let mut events = station.handle().subscribe();

        let reference = r#"{"tag":{"id":"78787878"},"rssi":-50}"#;
        for _ in 0..3 {
            station.ingest(&RawMessage::now(1, reference));
        }
        station.ingest(&RawMessage::now(2, reference));

        station.handle_command(StationCommand::Qaqc).unwrap();

        let results = loop {
            match events.recv().await.unwrap() {
                StationEvent::Qaqc { data } => break data,
                _ => continue,
            }
        };
        assert_eq!(results.len(), 5);
        assert_eq!((results[0].channel, results[0].direct, results[0].passed), (1, 3, true));
        assert_eq!((results[1].channel, results[1].direct, results[1].passed), (2, 1, false));
        assert!(results[2..].iter().all(|r| !r.passed));
    }

    async fn read_command(device: &mut BufReader<tokio::io::DuplexStream>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), device.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line
    }

    #[tokio::test]
    async fn test_run_configures_radio_routes_commands_and_flushes_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.radios = vec![radio(1, true)];
        let connector = Arc::new(MockConnector::new());
        let mut device = BufReader::new(connector.push_port());

        let station = BaseStation::new(
            config,
            StationIdentity { id: "abc123".to_string() },
            Collaborators {
                connector,
                gps: Arc::new(SharedGpsState::new()),
                checkin: None,
                store: None,
            },
        );
        let handle = station.handle();
        let mut events = handle.subscribe();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(station.run(async {
            let _ = stop_rx.await;
        }));

        assert_eq!(read_command(&mut device).await, "preset:fsktag\r\n");

        device.get_mut().write_all(format!("{}\n", DIRECT).as_bytes()).await.unwrap();
        let beep = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let StationEvent::Beep(beep) = events.recv().await.unwrap() {
                    return beep;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(beep.channel, 1);
        assert_eq!(beep.tag_id, "ABCD1234");

        handle
            .send(StationCommand::ToggleRadio { channel: 1, mode: RadioMode::Ook })
            .unwrap();
        assert_eq!(read_command(&mut device).await, "preset:node3\r\n");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let contents = std::fs::read_to_string(dir.path().join("CTT-abc123-raw-data.csv")).unwrap();
        assert!(contents.contains("ABCD1234"));
    }
}
