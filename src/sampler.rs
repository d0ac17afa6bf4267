use crate::backend::EnergyBackend;
use crate::error::Result;
use crate::writer::OutputWriter;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

/// Timer-driven sampling state machine. Idle until armed; while armed, each
/// timer expiry reads every open channel, converts the energy delta to power,
/// and writes one output row.
///
/// The timer is a non-blocking `timerfd` so the event loop can wait on it and
/// the child's output pipe with a single `poll(2)`.
pub struct Sampler {
    timer: TimerFd,
    interval: Duration,
    backends: Vec<Box<dyn EnergyBackend>>,
    writer: OutputWriter,
    emit_totals: bool,
    armed: bool,
    /// Wall-clock start of the current measurement region.
    epoch: Option<Instant>,
    /// Offset of the previous tick from the epoch, in seconds.
    prev_now: Option<f64>,
    /// Last valid tick delta; the fallback when the timer fires twice within
    /// timestamp resolution.
    prev_elapsed: f64,
    /// Reused row buffer so a tick does not grow the heap.
    row: Vec<f64>,
}

impl Sampler {
    pub fn new(
        backends: Vec<Box<dyn EnergyBackend>>,
        interval: Duration,
        writer: OutputWriter,
        emit_totals: bool,
    ) -> Result<Self> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        let prev_elapsed = interval.as_secs_f64();
        let column_count = writer.column_count();
        Ok(Self {
            timer,
            interval,
            backends,
            writer,
            emit_totals,
            armed: false,
            epoch: None,
            prev_now: None,
            prev_elapsed,
            row: Vec::with_capacity(column_count),
        })
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn timer_fd(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.writer.write_header()?;
        Ok(())
    }

    /// Begin a measurement region: capture baselines on every backend, start
    /// the epoch, and program the repeating timer. A second Begin while armed
    /// starts a fresh region.
    pub fn arm(&mut self) -> Result<()> {
        for backend in &mut self.backends {
            backend.reset()?;
        }
        self.timer.set(
            Expiration::Interval(TimeSpec::from_duration(self.interval)),
            TimerSetTimeFlags::empty(),
        )?;
        self.armed = true;
        self.epoch = Some(Instant::now());
        self.prev_now = None;
        self.prev_elapsed = self.interval.as_secs_f64();
        Ok(())
    }

    /// End the measurement region: stop the timer and, when requested, emit
    /// the totals row. Harmless when already idle, which is what makes the
    /// disarm-exactly-once property hold on the child-exit path.
    pub fn disarm(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        self.timer.unset()?;
        self.armed = false;
        if self.emit_totals {
            self.write_totals()?;
        }
        Ok(())
    }

    /// Consume pending timer expirations. Called on poll readiness; separate
    /// from `tick` so a stale expiry after disarming is swallowed without
    /// sampling.
    pub fn drain_timer(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(
                    self.timer.as_fd().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// One sampling pass: compute the tick delta, read every channel, write
    /// the row. Caller checks `is_armed` first.
    pub fn tick(&mut self) -> Result<()> {
        let Some(epoch) = self.epoch else {
            return Ok(());
        };
        let now = epoch.elapsed().as_secs_f64();
        let elapsed = effective_elapsed(
            now,
            self.prev_now,
            self.prev_elapsed,
            self.interval.as_secs_f64(),
        );

        self.row.clear();
        let mut row = std::mem::take(&mut self.row);
        for backend in &mut self.backends {
            backend.sample(elapsed, &mut row)?;
        }
        self.writer.write_row(now, &row)?;
        self.row = row;

        self.prev_now = Some(now);
        self.prev_elapsed = elapsed;
        Ok(())
    }

    fn write_totals(&mut self) -> Result<()> {
        let Some(epoch) = self.epoch else {
            return Ok(());
        };
        let elapsed = epoch.elapsed().as_secs_f64();
        let mut energies = Vec::with_capacity(self.writer.column_count());
        for backend in &mut self.backends {
            backend.totals(&mut energies)?;
        }
        self.writer.write_totals(elapsed, &energies)?;
        Ok(())
    }

    /// Release everything. The timer is disarmed before any backend handle is
    /// closed, so no pending tick can observe a closed handle.
    pub fn close(&mut self) {
        let _ = self.timer.unset();
        self.armed = false;
        for backend in &mut self.backends {
            backend.close();
        }
    }
}

/// Tick delta in seconds. The first tick after arming has no previous tick to
/// measure from; it approximates the delta with the configured interval, as
/// the original accounting did. A zero delta (two expirations within
/// timestamp resolution) falls back to the last valid delta so power is never
/// divided by zero.
fn effective_elapsed(now: f64, prev_now: Option<f64>, prev_elapsed: f64, interval: f64) -> f64 {
    match prev_now {
        None => interval,
        Some(prev) => {
            let elapsed = now - prev;
            if elapsed > 0.0 { elapsed } else { prev_elapsed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SharedBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct FakeState {
        open: bool,
        resets: usize,
        closes: usize,
        elapsed_seen: Vec<f64>,
    }

    struct FakeBackend {
        state: Arc<Mutex<FakeState>>,
        columns: Vec<String>,
        power: f64,
    }

    impl FakeBackend {
        fn new(power: f64) -> (Self, Arc<Mutex<FakeState>>) {
            let state = Arc::new(Mutex::new(FakeState {
                open: true,
                ..Default::default()
            }));
            let backend = Self {
                state: Arc::clone(&state),
                columns: vec!["fake_0".to_string()],
                power,
            };
            (backend, state)
        }
    }

    impl EnergyBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn columns(&self) -> &[String] {
            &self.columns
        }

        fn reset(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            assert!(state.open, "reset on a closed backend");
            state.resets += 1;
            Ok(())
        }

        fn sample(&mut self, elapsed: f64, row: &mut Vec<f64>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            assert!(state.open, "sampled a closed backend");
            state.elapsed_seen.push(elapsed);
            row.push(self.power);
            Ok(())
        }

        fn totals(&mut self, out: &mut Vec<f64>) -> Result<()> {
            assert!(self.state.lock().unwrap().open, "totals on a closed backend");
            out.push(self.power * 2.0);
            Ok(())
        }

        fn close(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.open = false;
            state.closes += 1;
        }
    }

    fn sampler_with_fake(
        interval_ms: u64,
        emit_totals: bool,
    ) -> (Sampler, Arc<Mutex<FakeState>>, SharedBuf) {
        let (backend, state) = FakeBackend::new(5.0);
        let buf = SharedBuf::default();
        let writer = OutputWriter::new(Box::new(buf.clone()), vec!["fake_0".to_string()]);
        let sampler = Sampler::new(
            vec![Box::new(backend)],
            Duration::from_millis(interval_ms),
            writer,
            emit_totals,
        )
        .unwrap();
        (sampler, state, buf)
    }

    #[test]
    fn arm_resets_backends_and_arms() {
        let (mut sampler, state, _buf) = sampler_with_fake(50, false);
        assert!(!sampler.is_armed());
        sampler.arm().unwrap();
        assert!(sampler.is_armed());
        assert_eq!(state.lock().unwrap().resets, 1);
    }

    #[test]
    fn first_tick_approximates_elapsed_with_interval() {
        let (mut sampler, state, buf) = sampler_with_fake(50, false);
        sampler.arm().unwrap();
        sampler.tick().unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.elapsed_seen.len(), 1);
        assert!((state.elapsed_seen[0] - 0.05).abs() < 1e-12);
        assert_eq!(buf.contents().lines().count(), 1);
    }

    #[test]
    fn rows_have_one_value_per_column() {
        let (mut sampler, _state, buf) = sampler_with_fake(50, false);
        sampler.write_header().unwrap();
        sampler.arm().unwrap();
        sampler.tick().unwrap();
        sampler.tick().unwrap();

        let text = buf.contents();
        let mut widths = text.lines().map(|l| l.split_whitespace().count());
        let header = widths.next().unwrap();
        assert_eq!(header, 2);
        assert!(widths.all(|w| w == header));
    }

    #[test]
    fn disarm_emits_totals_once_and_only_when_requested() {
        let (mut sampler, _state, buf) = sampler_with_fake(50, true);
        sampler.arm().unwrap();
        sampler.tick().unwrap();
        sampler.disarm().unwrap();
        sampler.disarm().unwrap();
        assert_eq!(buf.contents().matches("Totals: ").count(), 1);

        let (mut sampler, _state, buf) = sampler_with_fake(50, false);
        sampler.arm().unwrap();
        sampler.disarm().unwrap();
        assert!(!buf.contents().contains("Totals"));
    }

    #[test]
    fn disarm_while_idle_is_a_no_op() {
        let (mut sampler, _state, buf) = sampler_with_fake(50, true);
        sampler.disarm().unwrap();
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn close_disarms_then_closes_backends() {
        let (mut sampler, state, _buf) = sampler_with_fake(50, false);
        sampler.arm().unwrap();
        sampler.close();
        assert!(!sampler.is_armed());
        let state = state.lock().unwrap();
        assert!(!state.open);
        assert_eq!(state.closes, 1);
    }

    #[test]
    fn rearming_starts_a_fresh_region() {
        let (mut sampler, state, _buf) = sampler_with_fake(50, false);
        sampler.arm().unwrap();
        sampler.tick().unwrap();
        sampler.disarm().unwrap();
        sampler.arm().unwrap();
        sampler.tick().unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.resets, 2);
        // First tick of each region uses the interval approximation.
        assert!((state.elapsed_seen[0] - 0.05).abs() < 1e-12);
        assert!((state.elapsed_seen[1] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn zero_delta_falls_back_to_previous_elapsed() {
        assert_eq!(effective_elapsed(1.0, None, 0.25, 0.5), 0.5);
        assert_eq!(effective_elapsed(1.5, Some(1.0), 0.25, 0.5), 0.5);
        assert_eq!(effective_elapsed(1.0, Some(1.0), 0.25, 0.5), 0.25);
        assert_eq!(effective_elapsed(0.9, Some(1.0), 0.25, 0.5), 0.25);
    }
}
