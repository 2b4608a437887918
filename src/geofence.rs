use crate::geo::haversine_distance;
use crate::types::{Checkpoint, PositionSample};

/// A position sample that fell inside a checkpoint's radius
#[derive(Clone, Debug, PartialEq)]
pub struct Arrival {
    pub checkpoint_id: String,
    pub distance_m: f64,
    pub radius_m: f64,
}

/// Proximity detection against the checkpoint set of one run.
///
/// The set (and with it every effective radius) is captured when the
/// detector is built and stays fixed for the run.
#[derive(Clone, Debug)]
pub struct GeofenceDetector {
    checkpoints: Vec<Checkpoint>,
}

impl GeofenceDetector {
    pub fn new(checkpoints: &[Checkpoint]) -> Self {
        let checkpoints = checkpoints
            .iter()
            .filter(|cp| {
                let ok = cp.has_valid_coordinates();
                if !ok {
                    log::warn!(
                        "Geofence: ignoring checkpoint {} with invalid coordinates",
                        cp.checkpoint_id
                    );
                }
                ok
            })
            .cloned()
            .collect();
        GeofenceDetector { checkpoints }
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Evaluate one sample; every in-range checkpoint for which
    /// `is_completed` is false yields an arrival in this pass.
    pub fn evaluate<F>(&self, position: &PositionSample, is_completed: F) -> Vec<Arrival>
    where
        F: Fn(&str) -> bool,
    {
        if !position.is_valid() {
            return Vec::new();
        }

        self.checkpoints
            .iter()
            .filter(|cp| !is_completed(&cp.checkpoint_id))
            .filter_map(|cp| {
                let distance = haversine_distance(
                    position.latitude,
                    position.longitude,
                    cp.latitude,
                    cp.longitude,
                );
                let radius = cp.effective_radius();
                // NaN distance never satisfies the comparison
                (distance < radius).then(|| Arrival {
                    checkpoint_id: cp.checkpoint_id.clone(),
                    distance_m: distance,
                    radius_m: radius,
                })
            })
            .collect()
    }

    /// Distance to the nearest checkpoint not yet completed
    pub fn nearest_pending<F>(&self, position: &PositionSample, is_completed: F) -> Option<(String, f64)>
    where
        F: Fn(&str) -> bool,
    {
        self.checkpoints
            .iter()
            .filter(|cp| !is_completed(&cp.checkpoint_id))
            .map(|cp| {
                let d = haversine_distance(
                    position.latitude,
                    position.longitude,
                    cp.latitude,
                    cp.longitude,
                );
                (cp.checkpoint_id.clone(), d)
            })
            .filter(|(_, d)| d.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}
