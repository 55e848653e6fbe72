//! On-site QA/QC check: is the reference tag heard on every radio channel?

use serde::Serialize;

use crate::config::MAX_RADIO_CHANNELS;
use crate::data::StatsAggregator;

/// Reference tag result for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelResult {
    pub channel: u8,
    pub direct: u64,
    pub relayed: u64,
    /// Heard more than the threshold, directly or through a node
    pub passed: bool,
}

/// Reference tag counts for channels 1..=5
pub fn channel_results(stats: &StatsAggregator, tag: &str, threshold: u64) -> Vec<ChannelResult> {
    (1..=MAX_RADIO_CHANNELS)
        .map(|channel| {
            let direct = stats.direct_count(channel, tag);
            let relayed = stats.relayed_count(channel, tag);
            ChannelResult {
                channel,
                direct,
                relayed,
                passed: direct > threshold || relayed > threshold,
            }
        })
        .collect()
}
