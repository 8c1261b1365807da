//! Per-key dwell state machine.
//!
//! A key identifies a (camera, label, zone set) combination. Each key flips
//! between inside and outside as detections appear and disappear, and fires at
//! most once per stable episode once it has held its state for the required
//! number of whole minutes.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Local};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DwellKey {
    pub camera_id: u64,
    pub label: String,
    /// Sorted, comma-joined zone names. Empty when no zone matched.
    pub zones: String,
}

impl DwellKey {
    pub fn new<S: AsRef<str>>(camera_id: u64, label: &str, zone_names: &[S]) -> Self {
        let mut names: Vec<&str> = zone_names.iter().map(|z| z.as_ref()).collect();
        names.sort_unstable();
        names.dedup();
        Self {
            camera_id,
            label: label.to_string(),
            zones: names.join(","),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwellState {
    Inside,
    Outside,
}

impl fmt::Display for DwellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DwellState::Inside => write!(f, "inside"),
            DwellState::Outside => write!(f, "outside"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DwellEvent {
    pub state: DwellState,
    pub start: DateTime<Local>,
    pub required_minutes: u32,
    pub fired: bool,
    pub score: f32,
    /// Last frame the key was present in.
    last_seen: DateTime<Local>,
    /// Last frame of its camera that was processed at all.
    last_observed: DateTime<Local>,
}

/// What a single frame says about a key that is currently present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Presence {
    pub required_minutes: u32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FiredEvent {
    pub key: DwellKey,
    pub state: DwellState,
    pub elapsed_minutes: i64,
    pub score: f32,
    pub at: DateTime<Local>,
}

#[derive(Debug)]
pub struct DwellTracker {
    cameras: HashMap<u64, HashMap<DwellKey, DwellEvent>>,
    retention: Duration,
}

impl DwellTracker {
    pub fn new(retention: std::time::Duration) -> Self {
        Self {
            cameras: HashMap::new(),
            retention: Duration::from_std(retention).unwrap_or(Duration::MAX),
        }
    }

    /// Advances every key of `camera_id` by one observation. Keys of other
    /// cameras are untouched.
    pub fn update(
        &mut self,
        camera_id: u64,
        present: &HashMap<DwellKey, Presence>,
        now: DateTime<Local>,
    ) -> Vec<FiredEvent> {
        let tracked = self.cameras.entry(camera_id).or_default();
        let mut fired = Vec::new();

        for (key, event) in tracked.iter_mut() {
            event.last_observed = now;
            if present.contains_key(key) {
                continue;
            }
            let (required, score) = (event.required_minutes, event.score);
            if let Some(elapsed) = observe(event, DwellState::Outside, required, score, now) {
                fired.push(fired_event(key, event, elapsed, now));
            }
        }

        for (key, presence) in present {
            debug_assert_eq!(key.camera_id, camera_id);
            match tracked.get_mut(key) {
                Some(event) => {
                    event.last_seen = now;
                    if let Some(elapsed) = observe(
                        event,
                        DwellState::Inside,
                        presence.required_minutes,
                        presence.score,
                        now,
                    ) {
                        fired.push(fired_event(key, event, elapsed, now));
                    }
                }
                None => {
                    tracing::debug!(camera_id, label = %key.label, zones = %key.zones, "new dwell key");
                    tracked.insert(
                        key.clone(),
                        DwellEvent {
                            state: DwellState::Inside,
                            start: now,
                            required_minutes: presence.required_minutes,
                            fired: false,
                            score: presence.score,
                            last_seen: now,
                            last_observed: now,
                        },
                    );
                }
            }
        }

        fired.sort_by(|a, b| a.key.cmp(&b.key));
        fired
    }

    /// Drops outside keys not seen for longer than the retention period, and
    /// keys of any state whose camera has not been processed for that long.
    pub fn evict(&mut self, now: DateTime<Local>) -> usize {
        let retention = self.retention;
        let mut removed = 0;
        for tracked in self.cameras.values_mut() {
            let before = tracked.len();
            tracked.retain(|_, e| {
                now - e.last_observed <= retention
                    && (e.state == DwellState::Inside || now - e.last_seen <= retention)
            });
            removed += before - tracked.len();
        }
        self.cameras.retain(|_, t| !t.is_empty());
        removed
    }

    pub fn get(&self, key: &DwellKey) -> Option<&DwellEvent> {
        self.cameras.get(&key.camera_id)?.get(key)
    }

    pub fn len(&self) -> usize {
        self.cameras.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn observe(
    event: &mut DwellEvent,
    observed: DwellState,
    required_minutes: u32,
    score: f32,
    now: DateTime<Local>,
) -> Option<i64> {
    event.required_minutes = required_minutes;
    if event.state != observed {
        event.state = observed;
        event.start = now;
        event.fired = false;
        event.score = score;
        return None;
    }
    event.score = event.score.max(score);
    let elapsed_minutes = (now - event.start).num_seconds().div_euclid(60);
    if !event.fired && elapsed_minutes >= i64::from(required_minutes) {
        event.fired = true;
        return Some(elapsed_minutes);
    }
    None
}

fn fired_event(key: &DwellKey, event: &DwellEvent, elapsed: i64, now: DateTime<Local>) -> FiredEvent {
    FiredEvent {
        key: key.clone(),
        state: event.state,
        elapsed_minutes: elapsed,
        score: event.score,
        at: now,
    }
}
