//! Shared snapshots for the external viewer/logger collaborator.
//!
//! The renderer runs on its own thread; the only objects shared with the
//! filter are two latest-value slots, each behind its own lock. The writer
//! holds a lock just long enough to copy in a POD-sized value, the reader
//! copies out and releases. There is no queue and no back-pressure: a slow
//! reader simply misses intermediate states.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Isometry3;
use parking_lot::Mutex;

use crate::state::NavState;

/// Latest-value slots plus the cooperative stop flag.
#[derive(Default)]
pub struct SharedSink {
    nav: Mutex<Option<NavState>>,
    gnss_pose: Mutex<Option<Isometry3<f64>>>,
    stop: AtomicBool,
}

impl SharedSink {
    pub fn new() -> Self {
        SharedSink::default()
    }

    /// Publishes the newest fused state, replacing any unread one.
    pub fn update_nav_state(&self, state: NavState) {
        *self.nav.lock() = Some(state);
    }

    /// Publishes the newest prepared GNSS pose, replacing any unread one.
    pub fn update_gps_pose(&self, pose: Isometry3<f64>) {
        *self.gnss_pose.lock() = Some(pose);
    }

    pub fn latest_nav_state(&self) -> Option<NavState> {
        *self.nav.lock()
    }

    pub fn latest_gps_pose(&self) -> Option<Isometry3<f64>> {
        *self.gnss_pose.lock()
    }

    /// Asks the driver to stop; checked between samples.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};
    use std::sync::Arc;

    #[test]
    fn slots_keep_only_the_latest_value() {
        let sink = SharedSink::new();
        assert!(sink.latest_nav_state().is_none());

        let mut state = NavState::default();
        state.position = Vector3::new(1.0, 0.0, 0.0);
        sink.update_nav_state(state);
        state.position = Vector3::new(2.0, 0.0, 0.0);
        sink.update_nav_state(state);

        let read = sink.latest_nav_state().unwrap();
        assert_eq!(read.position.x, 2.0);
    }

    #[test]
    fn pose_slot_and_stop_flag_cross_threads() {
        let sink = Arc::new(SharedSink::new());
        let writer = Arc::clone(&sink);
        let handle = std::thread::spawn(move || {
            let pose = Isometry3::from_parts(
                Translation3::new(5.0, 6.0, 7.0),
                UnitQuaternion::identity(),
            );
            writer.update_gps_pose(pose);
            writer.request_stop();
        });
        handle.join().unwrap();

        assert!(sink.stop_requested());
        let pose = sink.latest_gps_pose().unwrap();
        assert_eq!(pose.translation.vector.y, 6.0);
    }
}
