//! # Heartbeat Scheduler
//!
//! One 1-second clock that fires named timer events at configured multiples
//! of its tick.
//!
//! The heartbeat only sends events; handlers run on the receiving side, so
//! a slow handler never delays the clock.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::Config;

/// Base tick of the heartbeat
pub const TICK: Duration = Duration::from_secs(1);

/// Named events dispatched by the heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerEvent {
    Flush,
    Rotate,
    Upload,
    GpsPoll,
    Checkin,
    SensorPoll,
}

/// Which events fire, and every how many ticks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    entries: Vec<(TimerEvent, u64)>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `event` every `every_ticks` ticks; zero disables it
    pub fn every(mut self, event: TimerEvent, every_ticks: u64) -> Self {
        if every_ticks > 0 {
            self.entries.push((event, every_ticks));
        }
        self
    }

    /// Build the station schedule from configuration
    ///
    /// Disabled features get no event.
    pub fn from_config(config: &Config) -> Self {
        let ticks = |seconds: u64| seconds / TICK.as_secs().max(1);
        let record = &config.record;
        let mut schedule = Schedule::new();

        if record.enabled {
            schedule = schedule
                .every(TimerEvent::Flush, ticks(record.flush_data_cache_seconds))
                .every(TimerEvent::Rotate, ticks(record.rotation_frequency_minutes * 60));
        }
        if config.upload.enabled {
            schedule = schedule.every(TimerEvent::Upload, ticks(record.upload_frequency_minutes * 60));
        }
        if config.gps.enabled && config.gps.record {
            schedule = schedule.every(TimerEvent::GpsPoll, ticks(config.gps.seconds_between_fixes));
        }
        if config.checkin.enabled {
            schedule = schedule
                .every(TimerEvent::Checkin, ticks(record.checkin_frequency_minutes * 60))
                .every(TimerEvent::SensorPoll, ticks(record.sensor_data_frequency_minutes * 60));
        }
        schedule
    }

    /// Events due on tick number `tick`; tick 0 fires nothing
    pub fn due_events(&self, tick: u64) -> Vec<TimerEvent> {
        if tick == 0 {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|(_, every)| tick % every == 0)
            .map(|(event, _)| *event)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodic clock driving the station's timer events
#[derive(Debug)]
pub struct Heartbeat {
    schedule: Schedule,
    tick: Duration,
}

impl Heartbeat {
    pub fn new(schedule: Schedule) -> Self {
        Self { schedule, tick: TICK }
    }

    /// Override the tick length
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run the clock on its own task until `shutdown` turns true or the
    /// receiver goes away
    pub fn spawn(
        self,
        events: mpsc::UnboundedSender<TimerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut clock = interval(self.tick);
            clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            clock.tick().await;

            info!("Heartbeat started");
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = clock.tick() => {
                        tick += 1;
                        for event in self.schedule.due_events(tick) {
                            debug!("Heartbeat {}: {:?}", tick, event);
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Heartbeat stopped after {} ticks", tick);
                        return;
                    }
                }
            }
        })
    }
}
