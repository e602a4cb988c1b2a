//! Bounded buffer of input reports
//!
//! The read loop pushes every completed interrupt IN transfer here; readers
//! pop from the front. When nobody reads, the oldest reports are dropped so
//! the newest device state is always kept.

use std::collections::VecDeque;
use tracing::{debug, trace};

/// Default number of buffered reports per device
pub const DEFAULT_REPORT_BUFFER_SIZE: usize = 32;

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Reports currently buffered
    pub buffered: usize,
    /// Total reports pushed
    pub total_received: u64,
    /// Total reports evicted because the queue was full
    pub total_dropped: u64,
}

/// FIFO of raw reports with drop-oldest overflow
#[derive(Debug)]
pub struct ReportQueue {
    reports: VecDeque<Vec<u8>>,
    capacity: usize,
    total_received: u64,
    total_dropped: u64,
}

impl Default for ReportQueue {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_BUFFER_SIZE)
    }
}

impl ReportQueue {
    /// Create a queue holding at most `capacity` reports (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reports: VecDeque::with_capacity(capacity),
            capacity,
            total_received: 0,
            total_dropped: 0,
        }
    }

    /// Append a report, evicting from the front while over capacity
    pub fn push(&mut self, data: Vec<u8>) {
        self.total_received += 1;
        self.reports.push_back(data);

        while self.reports.len() > self.capacity {
            self.reports.pop_front();
            self.total_dropped += 1;
            debug!(
                "Report queue full, dropped oldest report (total dropped: {})",
                self.total_dropped
            );
        }

        trace!("Queued input report, buffered={}", self.reports.len());
    }

    /// Remove and return the oldest report
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.reports.pop_front()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            buffered: self.reports.len(),
            total_received: self.total_received,
            total_dropped: self.total_dropped,
        }
    }
}
