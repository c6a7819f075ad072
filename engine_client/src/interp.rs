//! Interpolation.
//!
//! The server sends discrete snapshots at tick boundaries. The client renders
//! at its own rate and draws remote entities between the two newest buffered
//! snapshots, scaled by the real time elapsed since the newer one arrived.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use engine_shared::{
    ecs::EntityId,
    math::Vec3,
    net::{EntityState, Snapshot},
    render::RenderEntity,
};

#[derive(Debug, Clone)]
struct Buffered {
    snap: Snapshot,
    arrived: Instant,
}

/// Bounded snapshot history, oldest evicted first.
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    history: VecDeque<Buffered>,
    max: usize,
}

impl SnapshotBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max),
            max: max.max(2),
        }
    }

    /// Buffers `snap` if it is newer than everything buffered.
    pub fn push(&mut self, snap: Snapshot, arrived: Instant) -> bool {
        if self.latest().is_some_and(|l| snap.server_tick <= l.server_tick) {
            return false;
        }
        self.history.push_back(Buffered { snap, arrived });
        while self.history.len() > self.max {
            self.history.pop_front();
        }
        true
    }

    /// Returns the number of buffered snapshots.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns true if no snapshots are buffered.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.history.back().map(|b| &b.snap)
    }

    /// Interpolation factor between the two newest snapshots, in `[0, 1]`.
    ///
    /// The interval is the gap between their arrivals; `fallback` stands in
    /// when both arrived at the same instant.
    pub fn alpha(&self, now: Instant, fallback: Duration) -> Option<f32> {
        let [older, newer] = self.newest_pair()?;
        let mut interval = newer.arrived.saturating_duration_since(older.arrived);
        if interval.is_zero() {
            interval = fallback;
        }
        if interval.is_zero() {
            return Some(1.0);
        }
        let elapsed = now.saturating_duration_since(newer.arrived);
        Some((elapsed.as_secs_f32() / interval.as_secs_f32()).clamp(0.0, 1.0))
    }

    /// Render positions for every entity with a transform, except `exclude`.
    ///
    /// With fewer than two snapshots, entities render at their last known
    /// state.
    pub fn interpolate(&self, now: Instant, fallback: Duration, exclude: Option<EntityId>) -> Vec<RenderEntity> {
        let Some(newest) = self.history.back() else {
            return Vec::new();
        };
        let pair = self.newest_pair();
        let alpha = self.alpha(now, fallback).unwrap_or(1.0);

        newest
            .snap
            .entities
            .iter()
            .filter(|e| Some(e.id) != exclude)
            .filter_map(|e| {
                let to = e.bundle.transform?;
                let from = pair
                    .and_then(|[older, _]| find_entity(&older.snap, e.id))
                    .and_then(|o| o.bundle.transform);
                let (origin, angles) = match from {
                    Some(from) => (
                        from.origin.lerp(to.origin, alpha),
                        lerp_angles(from.angles, to.angles, alpha),
                    ),
                    None => (to.origin, to.angles),
                };
                Some(RenderEntity {
                    id: e.id,
                    origin,
                    angles,
                    predicted: false,
                })
            })
            .collect()
    }

    fn newest_pair(&self) -> Option<[&Buffered; 2]> {
        let n = self.history.len();
        if n < 2 {
            return None;
        }
        Some([&self.history[n - 2], &self.history[n - 1]])
    }
}

/// Convenience: find entity state in a snapshot.
pub fn find_entity(snap: &Snapshot, id: EntityId) -> Option<&EntityState> {
    snap.entities.iter().find(|e| e.id == id)
}

/// Per-axis angle lerp along the shorter arc.
fn lerp_angles(from: Vec3, to: Vec3, t: f32) -> Vec3 {
    let axis = |a: f32, b: f32| {
        let delta = (b - a + 180.0).rem_euclid(360.0) - 180.0;
        a + delta * t
    };
    Vec3::new(axis(from.x, to.x), axis(from.y, to.y), axis(from.z, to.z))
}
