//! Event engine: detection, zone mapping and dwell tracking over captured frames.

mod dwell;
mod events;
mod geometry;
mod object;
mod pipeline;
pub mod render;
mod window;

pub use dwell::{DwellKey, DwellState, FiredEvent};
pub use pipeline::{load_detectors, EngineSettings, EventPipeline};
