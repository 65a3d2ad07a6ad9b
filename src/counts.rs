//! Object-count statistics
//!
//! One mutex around one map, shared between the capture pipeline and the
//! HTTP handlers. The lock is held for every read or write of the map and
//! for nothing else.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::detector::Detection;

#[derive(Default)]
struct ClassCounts {
    live: usize,
    track_ids: HashSet<u64>,
}

#[derive(Default)]
struct CountState {
    frames: u64,
    classes: HashMap<String, ClassCounts>,
}

/// Shared counter registry
#[derive(Default)]
pub struct CountRegistry {
    state: Mutex<CountState>,
}

/// Per-class counts in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassCount {
    /// Detections of this class in the most recent frame
    pub live: usize,
    /// Distinct track IDs ever seen for this class
    pub unique: usize,
}

/// Consistent copy of the registry for the JSON endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct CountSnapshot {
    pub frames: u64,
    pub classes: BTreeMap<String, ClassCount>,
    /// Sum of per-class unique counts
    pub total_unique: usize,
}

impl CountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame's detections in. Single lock acquisition: live counts
    /// are reset so they reflect exactly this frame, unique IDs accumulate.
    pub fn record(&self, detections: &[Detection]) {
        let mut state = self.state.lock();
        state.frames += 1;
        for counts in state.classes.values_mut() {
            counts.live = 0;
        }
        for det in detections {
            let counts = state.classes.entry(det.class.clone()).or_default();
            counts.live += 1;
            if let Some(id) = det.track_id {
                counts.track_ids.insert(id);
            }
        }
    }

    pub fn snapshot(&self) -> CountSnapshot {
        let state = self.state.lock();
        let classes: BTreeMap<String, ClassCount> = state
            .classes
            .iter()
            .map(|(name, counts)| {
                (
                    name.clone(),
                    ClassCount {
                        live: counts.live,
                        unique: counts.track_ids.len(),
                    },
                )
            })
            .collect();
        let total_unique = classes.values().map(|c| c.unique).sum();
        CountSnapshot {
            frames: state.frames,
            classes,
            total_unique,
        }
    }

    /// Wipe all statistics
    pub fn reset(&self) {
        *self.state.lock() = CountState::default();
    }
}
