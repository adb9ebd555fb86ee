//! Progress reporting for front ends.

use std::time::Duration;

use serde::Serialize;

use crate::item::Item;

/// Overall progress of a run, passed to [`AcquireStatus::pulse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Items created so far, successors included.
    pub total_items: usize,
    /// Items finished successfully.
    pub done_items: usize,
    pub failed_items: usize,
    /// Bytes transferred over the network this run.
    pub fetched_bytes: u64,
    /// Bytes of the items currently being fetched.
    pub current_bytes: u64,
    /// Sum of the known item sizes.
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Progress as a percentage based on bytes.
    ///
    /// Falls back to item counts if no size is known.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_items == 0 {
                100.0
            } else {
                ((self.done_items + self.failed_items) as f64 / self.total_items as f64) * 100.0
            }
        } else {
            let done = (self.current_bytes).min(self.total_bytes);
            (done as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Transfer rate in bytes per second.
    pub fn rate(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0
        } else {
            (self.fetched_bytes as f64 / secs) as u64
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed_items > 0
    }
}

/// Receives progress callbacks from the engine.
///
/// Every method has an empty default, so sinks implement only what they
/// display.
pub trait AcquireStatus: Send {
    /// A transfer for `item` started.
    fn fetch(&mut self, _item: &Item) {}

    /// `item` finished a transfer and its handler ran.
    fn done(&mut self, _item: &Item) {}

    /// `item` failed a transfer and its handler ran.
    fn fail(&mut self, _item: &Item) {}

    /// `bytes` arrived, of which `resume_point` were already on disk.
    fn fetched(&mut self, _bytes: u64, _resume_point: u64) {}

    /// Periodic overall progress.
    fn pulse(&mut self, _progress: &ProgressSnapshot) {}

    /// The run ended.
    fn stop(&mut self, _progress: &ProgressSnapshot) {}
}

/// Discards every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStatus;

impl AcquireStatus for NoStatus {}

/// Counts callbacks, for tests and simple front ends.
#[derive(Debug, Default, Clone)]
pub struct CountingStatus {
    pub fetches: usize,
    pub done: usize,
    pub failures: usize,
    pub fetched_bytes: u64,
    pub pulses: usize,
    /// URIs of the started transfers, in order.
    pub started: Vec<String>,
    pub last: Option<ProgressSnapshot>,
}

impl AcquireStatus for CountingStatus {
    fn fetch(&mut self, item: &Item) {
        self.fetches += 1;
        self.started.push(item.desc().uri.clone());
    }

    fn done(&mut self, _item: &Item) {
        self.done += 1;
    }

    fn fail(&mut self, _item: &Item) {
        self.failures += 1;
    }

    fn fetched(&mut self, bytes: u64, resume_point: u64) {
        self.fetched_bytes += bytes.saturating_sub(resume_point);
    }

    fn pulse(&mut self, progress: &ProgressSnapshot) {
        self.pulses += 1;
        self.last = Some(progress.clone());
    }

    fn stop(&mut self, progress: &ProgressSnapshot) {
        self.last = Some(progress.clone());
    }
}
