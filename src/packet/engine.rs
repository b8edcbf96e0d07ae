use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::packet::frame::{parse_frame, FrameKind, ParsedFrame};
use crate::queue::task::to_delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Known,
    Unknown,
    Rogue,
    Hidden,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Known => write!(f, "known"),
            Classification::Unknown => write!(f, "unknown"),
            Classification::Rogue => write!(f, "rogue"),
            Classification::Hidden => write!(f, "hidden"),
        }
    }
}

/// An aggregate entity in the working set: one access point or station,
/// deduplicated across every frame it transmitted.
#[derive(Debug, Clone)]
pub struct Device {
    pub identifier: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub observation_count: u64,
    pub best_signal_dbm: Option<i8>,
    pub classification: Classification,
    ssids: HashSet<String>,
    hidden_beacon: bool,
    channel: Option<u8>,
    signal_min: Option<i8>,
    signal_max: Option<i8>,
    milestone_mark: Option<i8>,
    last_observation_at: DateTime<Utc>,
}

impl Device {
    fn new(frame: &ParsedFrame, now: DateTime<Utc>) -> Self {
        let mut device = Self {
            identifier: frame.identifier.clone(),
            first_seen: now,
            last_seen: now,
            observation_count: 1,
            best_signal_dbm: frame.signal_dbm,
            classification: Classification::Unknown,
            ssids: HashSet::new(),
            hidden_beacon: false,
            channel: frame.channel,
            signal_min: frame.signal_dbm,
            signal_max: frame.signal_dbm,
            milestone_mark: frame.signal_dbm,
            last_observation_at: now,
        };
        device.absorb(frame, now);
        device
    }

    /// Fold one frame into the aggregate. Classification is recomputed by
    /// the caller outside the debounce window.
    fn absorb(&mut self, frame: &ParsedFrame, now: DateTime<Utc>) {
        self.last_seen = now;
        if let Some(channel) = frame.channel {
            self.channel = Some(channel);
        }
        match frame.ssid.as_deref() {
            Some("") | None
                if matches!(frame.kind, FrameKind::Beacon | FrameKind::ProbeResponse) =>
            {
                self.hidden_beacon = true;
            }
            Some(name) if !name.is_empty() => {
                self.ssids.insert(name.to_string());
            }
            _ => {}
        }
        if let Some(signal) = frame.signal_dbm {
            self.best_signal_dbm = Some(self.best_signal_dbm.map_or(signal, |b| b.max(signal)));
            self.signal_min = Some(self.signal_min.map_or(signal, |m| m.min(signal)));
            self.signal_max = Some(self.signal_max.map_or(signal, |m| m.max(signal)));
            if self.milestone_mark.is_none() {
                self.milestone_mark = Some(signal);
            }
        }
    }

    /// Spread between weakest and strongest observation, in dB.
    fn signal_spread(&self) -> u8 {
        match (self.signal_min, self.signal_max) {
            (Some(min), Some(max)) => (max as i16 - min as i16).unsigned_abs() as u8,
            _ => 0,
        }
    }

    pub fn ssids(&self) -> impl Iterator<Item = &str> {
        self.ssids.iter().map(String::as_str)
    }

    pub fn channel(&self) -> Option<u8> {
        self.channel
    }
}

/// Externally visible change in the working set. Everything else a frame
/// does is internal aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationDelta {
    NewDevice {
        identifier: String,
        classification: Classification,
    },
    Reclassified {
        identifier: String,
        from: Classification,
        to: Classification,
    },
    SignalMilestone {
        identifier: String,
        best_signal_dbm: i8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The frame changed something downstream consumers care about.
    Delta(ObservationDelta),
    /// The frame was folded into existing state without a visible change.
    Merged,
    /// Structural validation failed; counted, never an error.
    Dropped,
}

/// Lock-free engine counters, shared with the health monitor.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub frames_seen: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub observations: AtomicU64,
    pub merged: AtomicU64,
    pub evictions: AtomicU64,
    pub reclassifications: AtomicU64,
    /// Gauge: devices currently tracked.
    pub devices: AtomicU64,
}

/// Turns raw capture frames into deduplicated, classified device records.
///
/// Owned by a single consuming loop; the bounded working set means a full
/// survey run cannot exhaust memory. Eviction at the ceiling is a cache
/// policy, not data loss: exporters needing completeness must drain deltas
/// as they happen, not scrape the working set.
pub struct PacketEngine {
    config: EngineConfig,
    devices: HashMap<String, Device>,
    stats: Arc<EngineStats>,
}

impl PacketEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            devices: HashMap::new(),
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, identifier: &str) -> Option<&Device> {
        self.devices.get(identifier)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn ingest(&mut self, raw: &[u8]) -> IngestOutcome {
        self.ingest_at(raw, Utc::now())
    }

    /// Clock-injected ingest, the actual implementation.
    pub fn ingest_at(&mut self, raw: &[u8], now: DateTime<Utc>) -> IngestOutcome {
        self.stats.frames_seen.fetch_add(1, Ordering::Relaxed);
        if raw.len() > self.config.max_frame_len {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Dropped;
        }
        match parse_frame(raw) {
            Ok(frame) => self.observe(frame, now),
            Err(err) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(error = %err, "Malformed frame dropped");
                IngestOutcome::Dropped
            }
        }
    }

    fn observe(&mut self, frame: ParsedFrame, now: DateTime<Utc>) -> IngestOutcome {
        if !self.devices.contains_key(&frame.identifier) {
            self.evict_if_full();
            let mut device = Device::new(&frame, now);
            device.classification = classify(&self.config, &device);
            let delta = ObservationDelta::NewDevice {
                identifier: device.identifier.clone(),
                classification: device.classification,
            };
            self.devices.insert(frame.identifier.clone(), device);
            self.stats.observations.fetch_add(1, Ordering::Relaxed);
            self.stats
                .devices
                .store(self.devices.len() as u64, Ordering::Relaxed);
            return IngestOutcome::Delta(delta);
        }

        let Some(device) = self.devices.get_mut(&frame.identifier) else {
            return IngestOutcome::Merged;
        };
        let within_debounce =
            now - device.last_observation_at < to_delta(self.config.debounce);
        device.absorb(&frame, now);

        if within_debounce {
            self.stats.merged.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Merged;
        }

        device.last_observation_at = now;
        device.observation_count += 1;
        self.stats.observations.fetch_add(1, Ordering::Relaxed);

        let fresh = classify(&self.config, device);
        if fresh != device.classification {
            let from = device.classification;
            device.classification = fresh;
            self.stats.reclassifications.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Delta(ObservationDelta::Reclassified {
                identifier: device.identifier.clone(),
                from,
                to: fresh,
            });
        }

        if let (Some(best), Some(mark)) = (device.best_signal_dbm, device.milestone_mark) {
            if best as i16 - mark as i16 >= self.config.signal_milestone_db as i16 {
                device.milestone_mark = Some(best);
                return IngestOutcome::Delta(ObservationDelta::SignalMilestone {
                    identifier: device.identifier.clone(),
                    best_signal_dbm: best,
                });
            }
        }

        IngestOutcome::Merged
    }

    /// Evict the least-recently-seen device once the ceiling is reached.
    fn evict_if_full(&mut self) {
        if self.devices.len() < self.config.working_set_cap {
            return;
        }
        let victim = self
            .devices
            .values()
            .min_by_key(|d| d.last_seen)
            .map(|d| d.identifier.clone());
        if let Some(identifier) = victim {
            self.devices.remove(&identifier);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(identifier = %identifier, "Working set full, evicted least-recent device");
        }
    }

    /// Age out devices unseen for the configured inactivity window. Returns
    /// how many were removed.
    pub fn sweep_inactive(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_delta(self.config.inactivity_window);
        let before = self.devices.len();
        self.devices.retain(|_, d| d.last_seen >= cutoff);
        let removed = before - self.devices.len();
        self.stats
            .devices
            .store(self.devices.len() as u64, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!(removed, "Swept inactive devices from working set");
        }
        removed
    }
}

fn classify(config: &EngineConfig, device: &Device) -> Classification {
    if config.allowlist.contains(&device.identifier) {
        return Classification::Known;
    }
    // one transmitter advertising several networks, or a wildly swinging
    // signal, matches the survey heuristics for rogue gear
    if device.ssids.len() > 1 || device.signal_spread() > config.volatility_threshold_db {
        return Classification::Rogue;
    }
    if device.hidden_beacon && device.ssids.is_empty() {
        return Classification::Hidden;
    }
    Classification::Unknown
}
