pub mod nvidia;
pub mod rapl;

use crate::error::Result;

/// One source of energy channels: the on-chip RAPL counters, or an optional
/// accelerator. A backend that is not present on the machine simply never gets
/// constructed; the sampling core carries no conditional compilation.
///
/// Channel order is fixed at construction time. `columns`, `sample`, and
/// `totals` all follow that order, which is what keeps the header and every
/// data row structurally consistent.
pub trait EnergyBackend {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Column labels in enumeration order, fixed for the run.
    fn columns(&self) -> &[String];

    /// Capture baseline readings for a new measurement region.
    fn reset(&mut self) -> Result<()>;

    /// Append one instantaneous power value in watts per column. `elapsed` is
    /// the wall-clock seconds since the previous tick.
    fn sample(&mut self, elapsed: f64, row: &mut Vec<f64>) -> Result<()>;

    /// Append the total energy in joules per column, accumulated since the
    /// last `reset`.
    fn totals(&mut self, out: &mut Vec<f64>) -> Result<()>;

    /// Release counter handles. The caller disarms the sampling timer before
    /// calling this.
    fn close(&mut self);
}

/// Raw-counter bookkeeping for one channel: the reading at measurement start
/// and the reading at the previous tick, both in unscaled counter units.
/// Counters are monotonic within a session but may wrap; wraparound is
/// accepted, not corrected, hence the wrapping subtraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterState {
    first: u64,
    last: u64,
}

impl CounterState {
    /// Start a measurement region at the given raw reading.
    pub fn reset(&mut self, raw: u64) {
        self.first = raw;
        self.last = raw;
    }

    /// Power in watts for the delta since the previous tick; advances the
    /// tick baseline.
    pub fn power(&mut self, raw: u64, scale: f64, elapsed: f64) -> f64 {
        let delta = raw.wrapping_sub(self.last);
        self.last = raw;
        delta as f64 * scale / elapsed
    }

    /// Total energy in joules since the region started.
    pub fn energy(&self, raw: u64, scale: f64) -> f64 {
        raw.wrapping_sub(self.first) as f64 * scale
    }
}
