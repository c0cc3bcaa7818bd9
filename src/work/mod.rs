//! Work simulator
//!
//! Stands in for real task work: a payload costs one time unit per marker
//! byte (`.` by default) it contains. Pure and deterministic, so queueing and
//! out-of-order completion across workers can be reproduced from payloads
//! alone.

use std::time::Duration;

pub const DEFAULT_MARKER: u8 = b'.';
pub const DEFAULT_UNIT: Duration = Duration::from_secs(1);

/// One second per `.` in `payload`.
pub fn simulated_duration(payload: &[u8]) -> Duration {
    WorkSimulator::default().duration_for(payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSimulator {
    marker: u8,
    unit: Duration,
}

impl WorkSimulator {
    pub fn new(marker: u8, unit: Duration) -> Self {
        Self { marker, unit }
    }

    /// The default marker with a custom unit.
    pub fn with_unit(unit: Duration) -> Self {
        Self::new(DEFAULT_MARKER, unit)
    }

    pub fn marker(&self) -> u8 {
        self.marker
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    pub fn marker_count(&self, payload: &[u8]) -> usize {
        payload.iter().filter(|&&b| b == self.marker).count()
    }

    pub fn duration_for(&self, payload: &[u8]) -> Duration {
        let count = u32::try_from(self.marker_count(payload)).unwrap_or(u32::MAX);
        self.unit.saturating_mul(count)
    }
}

impl Default for WorkSimulator {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER, DEFAULT_UNIT)
    }
}
