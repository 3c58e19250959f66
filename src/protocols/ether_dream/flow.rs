//! Device buffer occupancy estimation for flow control.
//!
//! The DAC only reports its buffer fullness inside command acknowledgements,
//! so between replies the session must estimate how full the device buffer
//! is. The estimate combines the last reported fullness, the points written
//! since that report (tracked as a FIFO of outstanding batch sizes —
//! acknowledgements always correspond to the oldest outstanding batch), and
//! the points the device has drawn in the meantime at its current rate.

use std::collections::VecDeque;
use std::time::Instant;

/// Estimator for the number of points queued on the device.
#[derive(Debug)]
pub struct BufferEstimator {
    capacity: u32,
    point_rate: u32,
    playing: bool,
    /// Fullness from the most recent status reply.
    reported_fullness: u32,
    /// When that reply arrived.
    reported_at: Option<Instant>,
    /// Sizes of batches written but not yet acknowledged, oldest first.
    outstanding: VecDeque<u32>,
}

impl BufferEstimator {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            point_rate: 0,
            playing: false,
            reported_fullness: 0,
            reported_at: None,
            outstanding: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn set_point_rate(&mut self, pps: u32) {
        self.point_rate = pps;
    }

    /// Consumption is only estimated while the device is actively playing;
    /// a prepared device holds its buffer without draining it.
    pub fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }

    /// Record a batch written to the device.
    pub fn record_write(&mut self, points: u32) {
        self.outstanding.push_back(points);
    }

    /// Record a status reply: the oldest outstanding batch is now accounted
    /// for in the device-reported fullness.
    pub fn acknowledge(&mut self, fullness: u16, now: Instant) {
        self.outstanding.pop_front();
        self.reported_fullness = u32::from(fullness);
        self.reported_at = Some(now);
    }

    /// Record a status reply that does not settle a batch (replies to
    /// prepare/begin/update/ping). The report refreshes the fullness
    /// baseline without touching the outstanding FIFO.
    pub fn sync_report(&mut self, fullness: u16, now: Instant) {
        self.reported_fullness = u32::from(fullness);
        self.reported_at = Some(now);
    }

    /// Record an acknowledgement that never arrived (reply timeout). The
    /// oldest outstanding batch is dropped so the FIFO cannot grow without
    /// bound; the fullness estimate keeps running on the previous report.
    pub fn acknowledge_lost(&mut self) {
        self.outstanding.pop_front();
    }

    /// Number of batches written but not yet acknowledged.
    pub fn outstanding_batches(&self) -> usize {
        self.outstanding.len()
    }

    /// Estimated points currently queued on the device, never negative and
    /// never above the buffer capacity.
    pub fn estimated_fullness(&self, now: Instant) -> u32 {
        let written_since: u32 = self.outstanding.iter().sum();
        let consumed = match (self.playing, self.reported_at) {
            (true, Some(at)) => {
                let elapsed = now.saturating_duration_since(at);
                (elapsed.as_secs_f64() * f64::from(self.point_rate)) as u32
            }
            _ => 0,
        };
        self.reported_fullness
            .saturating_add(written_since)
            .saturating_sub(consumed)
            .min(self.capacity)
    }
}
