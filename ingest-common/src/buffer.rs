use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::point::DataPoint;

/// An in-memory FIFO of points waiting to be flushed to the time-series store.
///
/// Many poll workers push while a single flusher takes chunks from the front. Every
/// operation takes the lock once, so a chunk is removed or restored atomically and no
/// point is ever observed by two drains. The lock is never held across an `.await`.
///
/// The buffer has no capacity limit: under a sustained sink outage it keeps growing until
/// the sink recovers or the process exits. Its contents are lost if the process crashes.
#[derive(Default)]
pub struct IngestionBuffer {
    points: Mutex<VecDeque<DataPoint>>,
}

impl IngestionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DataPoint>> {
        // A panic while holding the lock cannot leave the deque half-modified.
        match self.points.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append points at the back of the buffer, preserving their order.
    pub fn push(&self, points: Vec<DataPoint>) {
        if points.is_empty() {
            return;
        }
        self.lock().extend(points);
    }

    /// Remove up to `max` points from the front of the buffer.
    pub fn take_front(&self, max: usize) -> Vec<DataPoint> {
        let mut points = self.lock();
        let count = max.min(points.len());
        points.drain(..count).collect()
    }

    /// Put points back at the front of the buffer, ahead of anything pushed since they were taken.
    pub fn restore_front(&self, chunk: Vec<DataPoint>) {
        let mut points = self.lock();
        for point in chunk.into_iter().rev() {
            points.push_front(point);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current contents, front first. Meant for diagnostics and tests.
    pub fn snapshot(&self) -> Vec<DataPoint> {
        self.lock().iter().cloned().collect()
    }
}
