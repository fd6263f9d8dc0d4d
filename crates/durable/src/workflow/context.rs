//! Per-instance context passed to decision callbacks
//!
//! The context is the decision function's only window onto engine state.
//! Today that state is the version-marker table: recorded branch choices
//! that keep replay stable while the code evolves.

use std::collections::HashMap;

use tracing::warn;

/// Version returned for instances that passed a branch point before it was
/// versioned
pub const DEFAULT_VERSION: i32 = -1;

/// Context handed to every decision callback
///
/// Built by the engine before each decision pass: the marker table is
/// seeded from `VersionMarked` history events, so replay re-derives the
/// same branch choices regardless of what the code supports today.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    /// Recorded (change_id -> version) pairs for this instance
    markers: HashMap<String, i32>,

    /// Markers requested for the first time during the current pass;
    /// drained by the engine and appended to history as VersionMarked
    new_markers: Vec<(String, i32)>,
}

impl WorkflowContext {
    /// Create a context seeded with previously recorded markers
    pub fn new(markers: HashMap<String, i32>) -> Self {
        Self {
            markers,
            new_markers: Vec::new(),
        }
    }

    /// Resolve the version for a branch point
    ///
    /// On the first call for a given `change_id`, records `max_supported`
    /// (the newest branch) and returns it. Every later call — including
    /// replays after a deployment that raised `max_supported` — returns the
    /// originally recorded value, so an in-flight instance never switches
    /// branches mid-history.
    pub fn version(&mut self, change_id: &str, min_supported: i32, max_supported: i32) -> i32 {
        if let Some(&recorded) = self.markers.get(change_id) {
            if recorded < min_supported {
                warn!(
                    change_id,
                    recorded,
                    min_supported,
                    "recorded branch version is below the minimum this code supports"
                );
            }
            return recorded;
        }

        self.markers.insert(change_id.to_string(), max_supported);
        self.new_markers
            .push((change_id.to_string(), max_supported));
        max_supported
    }

    /// Check whether a marker has been recorded for a change id
    pub fn has_version(&self, change_id: &str) -> bool {
        self.markers.contains_key(change_id)
    }

    /// Drain markers first requested during this pass
    pub(crate) fn take_new_markers(&mut self) -> Vec<(String, i32)> {
        std::mem::take(&mut self.new_markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_records_max() {
        let mut ctx = WorkflowContext::default();

        let v = ctx.version("Step2", DEFAULT_VERSION, 1);
        assert_eq!(v, 1);
        assert_eq!(ctx.take_new_markers(), vec![("Step2".to_string(), 1)]);
    }

    #[test]
    fn test_later_calls_return_recorded_value() {
        let mut ctx = WorkflowContext::default();

        assert_eq!(ctx.version("Step2", DEFAULT_VERSION, 1), 1);
        ctx.take_new_markers();

        // A later deployment raises max_supported; the recorded choice wins.
        assert_eq!(ctx.version("Step2", DEFAULT_VERSION, 5), 1);
        assert!(ctx.take_new_markers().is_empty());
    }

    #[test]
    fn test_seeded_markers_survive_code_evolution() {
        let mut markers = HashMap::new();
        markers.insert("Step2".to_string(), DEFAULT_VERSION);
        let mut ctx = WorkflowContext::new(markers);

        // Instance passed this branch point before it was versioned.
        assert_eq!(ctx.version("Step2", DEFAULT_VERSION, 3), DEFAULT_VERSION);
        assert!(ctx.take_new_markers().is_empty());
    }

    #[test]
    fn test_independent_change_ids() {
        let mut ctx = WorkflowContext::default();

        assert_eq!(ctx.version("Step2", DEFAULT_VERSION, 1), 1);
        assert_eq!(ctx.version("Step3", DEFAULT_VERSION, 2), 2);

        let recorded = ctx.take_new_markers();
        assert_eq!(recorded.len(), 2);
    }
}
