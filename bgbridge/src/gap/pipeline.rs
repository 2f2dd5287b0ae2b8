//! Extended scan responses in, legacy scan responses and decoded
//! advertisements out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::dedup::{RepeatFilter, DEDUP_TTL, SWEEP_INTERVAL};
use super::report;
use super::vendor::{self, Decoded, Vendor};
use super::Advertisement;
use crate::bglib::protocol::scan;
use crate::bglib::Frame;
use crate::clock::Clock;
use crate::keys::{KeyProvider, KeyQuery, QueryLimiter, KEY_QUERY_INTERVAL};
use crate::mibeacon::Usefulness;
use crate::sink::EventSink;
use crate::tracing::prelude::*;
use crate::types::HexBytes;

/// Sightings of a tracker id that are swallowed before it is reported.
pub const TRACKER_THRESHOLD: u8 = 10;

/// A tracker unseen for this long starts counting from zero again.
pub const TRACKER_EXPIRY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dedup_ttl: Duration,
    pub key_query_interval: Duration,
    pub tracker_threshold: u8,
    pub tracker_expiry: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: DEDUP_TTL,
            key_query_interval: KEY_QUERY_INTERVAL,
            tracker_threshold: TRACKER_THRESHOLD,
            tracker_expiry: TRACKER_EXPIRY,
        }
    }
}

/// Owns the per-advertisement state: the repeat filter, the key query limiter
/// and the tracker sighting counts. Only the chip reader calls it.
pub struct AdvertisementPipeline {
    repeats: RepeatFilter,
    limiter: QueryLimiter,
    trackers: TrackerSightings,
    keys: Arc<dyn KeyProvider>,
    key_query: Arc<dyn KeyQuery>,
    sink: Arc<dyn EventSink>,
}

impl AdvertisementPipeline {
    pub fn new(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        keys: Arc<dyn KeyProvider>,
        key_query: Arc<dyn KeyQuery>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            repeats: RepeatFilter::with_ttl(clock.clone(), config.dedup_ttl),
            limiter: QueryLimiter::new(config.key_query_interval, clock.clone()),
            trackers: TrackerSightings::new(config.tracker_threshold, config.tracker_expiry, clock),
            keys,
            key_query,
            sink,
        }
    }

    /// Process an extended scan response in place.
    ///
    /// Returns the number of bytes of `frame` to forward: 0 for a repeat,
    /// otherwise the length of the legacy scan response it was rewritten to.
    pub fn process(&mut self, frame: &mut Frame) -> usize {
        let raw = frame.raw_mut();
        if raw.len() < scan::DATA {
            return raw.len();
        }

        let rssi = raw[scan::RSSI];
        raw[scan::RSSI] = 0;
        raw[scan::CHANNEL] = 0;
        if self.repeats.seen(&raw[..]) {
            return 0;
        }
        raw[scan::RSSI] = rssi;

        let len = report::to_legacy(raw);
        trace!(target: "bgbridge::gap", data = %HexBytes(&raw[..len]), "<=gap");
        let Some(mut report) = report::parse(&raw[..len]) else {
            return len;
        };

        let decoded = if report.malformed {
            debug!(
                target: "bgbridge::gap",
                addr = %report.address,
                reason = report.comment.unwrap_or_default(),
                "Malformed advertisement"
            );
            Decoded::default()
        } else {
            vendor::decode(&mut report, self.keys.as_ref())
        };
        let Decoded {
            vendor: data,
            mut tracker,
        } = decoded;

        if let Some(Vendor::MiBeacon {
            beacon,
            usefulness: Usefulness::Encrypted,
            ..
        }) = &data
        {
            if let Some(mac) = beacon.mac {
                if self.limiter.allow(mac) {
                    self.key_query.query(mac, beacon.product_id);
                }
            }
        }

        if let Some(id) = tracker.as_ref().map(|t| t.id.as_str()) {
            if !self.trackers.sighted(id) {
                tracker = None;
                // Nothing else to report
                if data.is_none() {
                    return len;
                }
            }
        }

        self.sink.advertisement(&Advertisement {
            report,
            data,
            tracker,
        });
        len
    }
}

struct Sighting {
    count: u8,
    last_seen: Instant,
}

/// Sighting counts per tracker id, forgotten after a quiet period.
struct TrackerSightings {
    counts: HashMap<String, Sighting>,
    threshold: u8,
    expiry: Duration,
    next_sweep: Instant,
    clock: Arc<dyn Clock>,
}

impl TrackerSightings {
    fn new(threshold: u8, expiry: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
            expiry,
            next_sweep: clock.now() + SWEEP_INTERVAL,
            clock,
        }
    }

    /// Count a sighting of `id`. True once it was seen more than the
    /// threshold.
    fn sighted(&mut self, id: &str) -> bool {
        let now = self.clock.now();
        let expiry = self.expiry;
        if now >= self.next_sweep {
            self.counts
                .retain(|_, s| now.duration_since(s.last_seen) < expiry);
            self.next_sweep = now + SWEEP_INTERVAL;
        }

        let sighting = self.counts.entry(id.to_string()).or_insert(Sighting {
            count: 0,
            last_seen: now,
        });
        if now.duration_since(sighting.last_seen) >= expiry {
            sighting.count = 0;
        }
        sighting.last_seen = now;
        sighting.count = sighting.count.saturating_add(1);
        sighting.count > self.threshold
    }
}
