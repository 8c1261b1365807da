//! Per-frame zone event evaluation: time gate, mask gate, zone mapping and dwell.

use std::collections::HashMap;

use chrono::{DateTime, Local};

use super::dwell::{DwellKey, DwellTracker, FiredEvent, Presence};
use super::geometry::{Mask, PixelRect, Point, Polygon};
use super::object::{Detection, LabelMap};
use super::window::TimeWindow;
use crate::registry::ZoneRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub name: String,
    pub polygon: Polygon,
    /// BGR for drawing.
    pub color: (u8, u8, u8),
    pub required_minutes: u32,
}

const DEFAULT_ZONE_COLOR: (u8, u8, u8) = (0, 255, 255);

impl Zone {
    pub fn from_record(record: &ZoneRecord) -> Option<Self> {
        let points = record
            .points
            .iter()
            .map(|[x, y]| Point::new(*x, *y))
            .collect();
        let Some(polygon) = Polygon::new(points) else {
            tracing::warn!(zone = %record.name, "zone has fewer than three points, ignoring");
            return None;
        };
        Some(Self {
            name: record.name.clone(),
            polygon,
            color: record
                .color
                .as_deref()
                .and_then(parse_hex_color)
                .unwrap_or(DEFAULT_ZONE_COLOR),
            required_minutes: record.duration.max(0).min(u32::MAX as i64) as u32,
        })
    }
}

pub fn zones_from_records(records: &[ZoneRecord]) -> Vec<Zone> {
    records.iter().filter_map(Zone::from_record).collect()
}

/// `#RRGGBB` to BGR.
fn parse_hex_color(value: &str) -> Option<(u8, u8, u8)> {
    let hex = value.trim().strip_prefix('#').unwrap_or(value.trim());
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some((channel(4)?, channel(2)?, channel(0)?))
}

/// A detection that passed the mask gate, with the zones its center falls in.
#[derive(Debug, Clone, PartialEq)]
pub struct ZonedDetection {
    pub rect: PixelRect,
    pub label: String,
    pub confidence: f32,
    pub zones: Vec<String>,
    pub required_minutes: u32,
}

#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// False when the frame fell outside the arming window.
    pub armed: bool,
    pub detections: Vec<ZonedDetection>,
    pub fired: Vec<FiredEvent>,
}

pub struct FrameInput<'a> {
    pub camera_id: u64,
    pub detections: &'a [Detection],
    pub labels: &'a LabelMap,
    pub mask: Option<&'a Mask>,
    pub zones: &'a [Zone],
    pub window: &'a TimeWindow,
    pub frame_width: u32,
    pub frame_height: u32,
    pub now: DateTime<Local>,
}

pub struct ZoneEventEngine {
    tracker: DwellTracker,
    overlap_threshold: f64,
}

impl ZoneEventEngine {
    pub fn new(overlap_threshold: f64, retention: std::time::Duration) -> Self {
        Self {
            tracker: DwellTracker::new(retention),
            overlap_threshold,
        }
    }

    pub fn tracker(&self) -> &DwellTracker {
        &self.tracker
    }

    pub fn process_frame(&mut self, input: FrameInput<'_>) -> FrameOutcome {
        let armed = input.window.contains(input.now.time());
        let mask = input.mask.filter(|m| !m.is_degenerate());

        let mut detections = Vec::new();
        for detection in input.detections {
            let Some(rect) = detection.bbox.clip(input.frame_width, input.frame_height) else {
                continue;
            };
            if let Some(mask) = mask {
                if mask.overlap_ratio(&rect) < self.overlap_threshold {
                    continue;
                }
            }
            let center = rect.center();
            let matched: Vec<&Zone> = input
                .zones
                .iter()
                .filter(|z| z.polygon.contains(center))
                .collect();
            detections.push(ZonedDetection {
                rect,
                label: input.labels.label(detection.class_id),
                confidence: detection.confidence,
                zones: matched.iter().map(|z| z.name.clone()).collect(),
                required_minutes: matched.iter().map(|z| z.required_minutes).max().unwrap_or(0),
            });
        }

        if !armed {
            return FrameOutcome {
                armed,
                detections,
                fired: Vec::new(),
            };
        }

        let mut present: HashMap<DwellKey, Presence> = HashMap::new();
        for d in &detections {
            let key = DwellKey::new(input.camera_id, &d.label, &d.zones);
            let entry = present.entry(key).or_insert(Presence {
                required_minutes: 0,
                score: 0.0,
            });
            entry.required_minutes = entry.required_minutes.max(d.required_minutes);
            entry.score = entry.score.max(d.confidence);
        }

        let fired = self.tracker.update(input.camera_id, &present, input.now);
        for event in &fired {
            tracing::info!(
                camera_id = event.key.camera_id,
                label = %event.key.label,
                zones = %event.key.zones,
                state = %event.state,
                minutes = event.elapsed_minutes,
                "dwell event fired"
            );
        }

        FrameOutcome {
            armed,
            detections,
            fired,
        }
    }

    pub fn evict(&mut self, now: DateTime<Local>) -> usize {
        self.tracker.evict(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::dwell::DwellState;
    use crate::analytics::geometry::BoundingBox;
    use chrono::{Duration, TimeZone};

    fn zone(name: &str, x1: f64, y1: f64, x2: f64, y2: f64, minutes: i64) -> Zone {
        Zone::from_record(&ZoneRecord {
            name: name.into(),
            points: vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]],
            color: None,
            duration: minutes,
        })
        .unwrap()
    }

    fn person(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_id: 0,
            confidence: 0.8,
        }
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    struct Scene {
        labels: LabelMap,
        zones: Vec<Zone>,
        window: TimeWindow,
    }

    impl Scene {
        fn new(zones: Vec<Zone>) -> Self {
            Self {
                labels: LabelMap::coco(),
                zones,
                window: TimeWindow::always(),
            }
        }

        fn input<'a>(
            &'a self,
            detections: &'a [Detection],
            mask: Option<&'a Mask>,
            now: DateTime<Local>,
        ) -> FrameInput<'a> {
            FrameInput {
                camera_id: 3,
                detections,
                labels: &self.labels,
                mask,
                zones: &self.zones,
                window: &self.window,
                frame_width: 640,
                frame_height: 480,
                now,
            }
        }
    }

    fn engine() -> ZoneEventEngine {
        ZoneEventEngine::new(0.5, std::time::Duration::from_secs(3600))
    }

    #[test]
    fn test_zone_record_conversion() {
        let z = Zone::from_record(&ZoneRecord {
            name: "dock".into(),
            points: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
            color: Some("#FF8000".into()),
            duration: -4,
        })
        .unwrap();
        assert_eq!(z.required_minutes, 0);
        assert_eq!(z.color, (0x00, 0x80, 0xFF));
        let degenerate = ZoneRecord {
            name: "line".into(),
            points: vec![[0.0, 0.0], [1.0, 0.0]],
            color: None,
            duration: 1,
        };
        assert!(zones_from_records(&[degenerate]).is_empty());
    }

    #[test]
    fn test_malformed_colors_fall_back() {
        assert_eq!(parse_hex_color("#ab€c"), None);
        assert_eq!(parse_hex_color("€€"), None);
        assert_eq!(parse_hex_color("#12345G"), None);
        assert_eq!(parse_hex_color("0000ff"), Some((0xff, 0, 0)));
        let z = Zone::from_record(&ZoneRecord {
            name: "dock".into(),
            points: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
            color: Some("#ab€c".into()),
            duration: 1,
        })
        .unwrap();
        assert_eq!(z.color, DEFAULT_ZONE_COLOR);
    }

    #[test]
    fn test_overlapping_zones_form_one_key() {
        let scene = Scene::new(vec![
            zone("b", 0.0, 0.0, 200.0, 200.0, 1),
            zone("a", 50.0, 50.0, 300.0, 300.0, 4),
        ]);
        let mut engine = engine();
        let dets = [person(90.0, 90.0, 110.0, 110.0)];
        let outcome = engine.process_frame(scene.input(&dets, None, noon()));
        assert!(outcome.armed);
        assert_eq!(outcome.detections[0].required_minutes, 4);
        let key = DwellKey::new(3, "person", &["a", "b"]);
        assert_eq!(engine.tracker().get(&key).unwrap().required_minutes, 4);
        assert_eq!(key.zones, "a,b");
    }

    #[test]
    fn test_dwell_fires_once_in_dock() {
        let scene = Scene::new(vec![zone("DockA", 0.0, 0.0, 320.0, 480.0, 3)]);
        let mut engine = engine();
        let dets = [person(100.0, 100.0, 150.0, 200.0)];
        let mut fired = Vec::new();
        for i in 0..200 {
            let now = noon() + Duration::seconds(i);
            for f in engine.process_frame(scene.input(&dets, None, now)).fired {
                fired.push((i, f));
            }
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 180);
        assert_eq!(fired[0].1.key.zones, "DockA");
        assert_eq!(fired[0].1.state, DwellState::Inside);
    }

    #[test]
    fn test_outside_window_does_not_touch_tracker() {
        let mut scene = Scene::new(vec![zone("z", 0.0, 0.0, 640.0, 480.0, 0)]);
        scene.window = TimeWindow::parse("08:00", "09:00").unwrap();
        let mut engine = engine();
        let dets = [person(10.0, 10.0, 50.0, 50.0)];
        let outcome = engine.process_frame(scene.input(&dets, None, noon()));
        assert!(!outcome.armed);
        assert_eq!(outcome.detections.len(), 1);
        assert!(outcome.fired.is_empty());
        assert!(engine.tracker().is_empty());
    }

    #[test]
    fn test_mask_gate_threshold() {
        // columns 0..5 of rows 0..10 are in-region
        let mut data = vec![0u8; 640 * 480];
        for y in 0..10 {
            for x in 0..5 {
                data[y * 640 + x] = 1;
            }
        }
        let mask = Mask::new(640, 480, data).unwrap();
        let scene = Scene::new(Vec::new());
        let mut engine = engine();

        let half = [person(0.0, 0.0, 10.0, 10.0)];
        let outcome = engine.process_frame(scene.input(&half, Some(&mask), noon()));
        assert_eq!(outcome.detections.len(), 1);

        let mostly_out = [person(0.0, 0.0, 11.0, 10.0)];
        let outcome = engine.process_frame(scene.input(&mostly_out, Some(&mask), noon()));
        assert!(outcome.detections.is_empty());
    }

    #[test]
    fn test_mask_gate_just_below_threshold() {
        // 1000-pixel box (100x10); the left half is in-region
        let mut data = vec![0u8; 640 * 480];
        for y in 0..10 {
            for x in 0..50 {
                data[y * 640 + x] = 1;
            }
        }
        let half = Mask::new(640, 480, data.clone()).unwrap();
        data[9 * 640 + 49] = 0;
        let below = Mask::new(640, 480, data).unwrap();
        let scene = Scene::new(Vec::new());
        let mut engine = engine();
        let dets = [person(0.0, 0.0, 100.0, 10.0)];

        let outcome = engine.process_frame(scene.input(&dets, Some(&below), noon()));
        assert!(outcome.detections.is_empty());

        let outcome = engine.process_frame(scene.input(&dets, Some(&half), noon()));
        assert_eq!(outcome.detections.len(), 1);
    }

    #[test]
    fn test_degenerate_mask_and_offscreen_boxes() {
        let mask = Mask::new(640, 480, vec![0; 640 * 480]).unwrap();
        let scene = Scene::new(Vec::new());
        let mut engine = engine();
        let dets = [person(10.0, 10.0, 20.0, 20.0), person(700.0, 10.0, 800.0, 20.0)];
        let outcome = engine.process_frame(scene.input(&dets, Some(&mask), noon()));
        assert_eq!(outcome.detections.len(), 1);
        assert!(outcome.detections[0].zones.is_empty());
        assert!(engine.tracker().get(&DwellKey::new::<&str>(3, "person", &[])).is_some());
    }

    #[test]
    fn test_absence_flips_to_outside() {
        let scene = Scene::new(vec![zone("z", 0.0, 0.0, 640.0, 480.0, 1)]);
        let mut engine = engine();
        let dets = [person(10.0, 10.0, 50.0, 50.0)];
        engine.process_frame(scene.input(&dets, None, noon()));
        engine.process_frame(scene.input(&[], None, noon() + Duration::seconds(5)));
        let key = DwellKey::new(3, "person", &["z"]);
        let event = engine.tracker().get(&key).unwrap();
        assert_eq!(event.state, DwellState::Outside);
        assert_eq!(event.start, noon() + Duration::seconds(5));
    }
}
