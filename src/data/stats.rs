//! # Beep Statistics
//!
//! Per-channel detection counters used by the health checkin and QA/QC.
//!
//! Serialises as `{"channels": {"1": {"beeps": {..}, "nodes": {"beeps": {..},
//! "health": {..}}, "telemetry": {..}}}}`.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::MAX_RADIO_CHANNELS;
use crate::record::{BeepRecord, NodeHealthRecord, TelemetryRecord};

/// Beeps forwarded by nodes, plus the latest health report of each node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeStats {
    /// Tag id -> relayed beep count
    pub beeps: BTreeMap<String, u64>,
    /// Node id -> last health report
    pub health: BTreeMap<String, NodeHealthRecord>,
}

/// Counters for one radio channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    /// Tag id -> beeps heard directly
    pub beeps: BTreeMap<String, u64>,
    pub nodes: NodeStats,
    /// Hardware id -> telemetry packet count
    pub telemetry: BTreeMap<String, u64>,
}

/// Live detection statistics for every channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsAggregator {
    channels: BTreeMap<u8, ChannelStats>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    /// Aggregator with empty counters for channels 1..=5
    pub fn new() -> Self {
        let channels = (1..=MAX_RADIO_CHANNELS)
            .map(|channel| (channel, ChannelStats::default()))
            .collect();
        Self { channels }
    }

    pub fn channels(&self) -> &BTreeMap<u8, ChannelStats> {
        &self.channels
    }

    pub fn channel(&self, channel: u8) -> Option<&ChannelStats> {
        self.channels.get(&channel)
    }

    fn channel_mut(&mut self, channel: u8) -> &mut ChannelStats {
        self.channels.entry(channel).or_default()
    }

    /// Count a beep as direct, or relayed when it carries a node id
    pub fn add_beep(&mut self, record: &BeepRecord) {
        let channel = self.channel_mut(record.channel);
        let bucket = if record.is_relayed() {
            &mut channel.nodes.beeps
        } else {
            &mut channel.beeps
        };
        *bucket.entry(record.tag_id.clone()).or_insert(0) += 1;
    }

    /// Replace the stored health report for the record's node
    pub fn add_node_health(&mut self, record: &NodeHealthRecord) {
        self.channel_mut(record.channel)
            .nodes
            .health
            .insert(record.node_id.clone(), record.clone());
    }

    pub fn add_telemetry_beep(&mut self, record: &TelemetryRecord) {
        *self
            .channel_mut(record.channel)
            .telemetry
            .entry(record.hardware_id.clone())
            .or_insert(0) += 1;
    }

    /// Direct beep count of `tag_id` on `channel`
    pub fn direct_count(&self, channel: u8, tag_id: &str) -> u64 {
        self.channels
            .get(&channel)
            .and_then(|c| c.beeps.get(tag_id))
            .copied()
            .unwrap_or(0)
    }

    /// Relayed beep count of `tag_id` on `channel`
    pub fn relayed_count(&self, channel: u8, tag_id: &str) -> u64 {
        self.channels
            .get(&channel)
            .and_then(|c| c.nodes.beeps.get(tag_id))
            .copied()
            .unwrap_or(0)
    }

    /// Copy of the aggregate without any counter below `min_count`
    ///
    /// Node health reports are kept; the live counters are not modified.
    pub fn snapshot(&self, min_count: u64) -> StatsAggregator {
        let mut snapshot = self.clone();
        for channel in snapshot.channels.values_mut() {
            channel.beeps.retain(|_, count| *count >= min_count);
            channel.nodes.beeps.retain(|_, count| *count >= min_count);
            channel.telemetry.retain(|_, count| *count >= min_count);
        }
        snapshot
    }

    /// Remove counts already reported in `sent`
    ///
    /// Counters that reach zero are dropped. A node's health report is
    /// dropped only if it has not been replaced since `sent` was taken.
    pub fn subtract(&mut self, sent: &StatsAggregator) {
        for (channel, reported) in &sent.channels {
            let Some(live) = self.channels.get_mut(channel) else {
                continue;
            };
            subtract_counts(&mut live.beeps, &reported.beeps);
            subtract_counts(&mut live.nodes.beeps, &reported.nodes.beeps);
            subtract_counts(&mut live.telemetry, &reported.telemetry);
            for (node_id, record) in &reported.nodes.health {
                if live.nodes.health.get(node_id) == Some(record) {
                    live.nodes.health.remove(node_id);
                }
            }
        }
    }
}

fn subtract_counts(live: &mut BTreeMap<String, u64>, sent: &BTreeMap<String, u64>) {
    for (key, count) in sent {
        let Some(current) = live.get(key).copied() else {
            continue;
        };
        match current.saturating_sub(*count) {
            0 => {
                live.remove(key);
            }
            remaining => {
                live.insert(key.clone(), remaining);
            }
        }
    }
}
