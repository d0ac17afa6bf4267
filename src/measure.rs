use crate::backend::EnergyBackend;
use crate::error::{Error, Result};
use crate::roi::{self, RoiMark};
use crate::sampler::Sampler;
use crate::supervisor::Supervisor;
use crate::writer::OutputWriter;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::Write;
use std::process::ExitStatus;
use std::time::Duration;

pub struct Options {
    /// Measure only between ROI markers instead of the whole run.
    pub roi: bool,
    /// Emit a totals row when a measurement region ends.
    pub totals: bool,
    pub interval: Duration,
}

/// Supervise the already-spawned child and sample the given backends until
/// the child closes its output. Returns the child's exit status.
///
/// Single thread, two event sources: the child's stdout pipe and the
/// sampler's timerfd, multiplexed with one `poll(2)` per iteration. Tick work
/// and line handling are dispatched sequentially from the same loop, so they
/// cannot race each other over channel state.
pub fn run(
    opts: &Options,
    mut supervisor: Supervisor,
    backends: Vec<Box<dyn EnergyBackend>>,
    out: Box<dyn Write>,
    echo: &mut dyn Write,
) -> Result<ExitStatus> {
    let columns: Vec<String> = backends
        .iter()
        .flat_map(|b| b.columns().iter().cloned())
        .collect();
    let writer = OutputWriter::new(out, columns);
    let mut sampler = Sampler::new(backends, opts.interval, writer, opts.totals)?;

    sampler.write_header()?;
    if !opts.roi {
        sampler.arm()?;
    }

    match event_loop(opts, &mut supervisor, &mut sampler, echo) {
        Ok(()) => {
            // Child exit ends any still-active measurement; totals (when
            // requested) are emitted even if no End marker was seen.
            let disarmed = sampler.disarm();
            sampler.close();
            disarmed?;
            Ok(supervisor.reap()?)
        }
        Err(e) => {
            // Error path: timer disarmed and handles released before the
            // failure propagates. The closing pipe orphans the child.
            sampler.close();
            Err(e)
        }
    }
}

fn event_loop(
    opts: &Options,
    supervisor: &mut Supervisor,
    sampler: &mut Sampler,
    echo: &mut dyn Write,
) -> Result<()> {
    while !supervisor.is_eof() {
        let (timer_ready, child_ready) = wait_for_event(supervisor, sampler)?;

        // Service the timer before buffered lines so a tick that expired
        // while lines were being handled is not starved by a chatty child.
        if timer_ready {
            sampler.drain_timer();
            if sampler.is_armed() {
                sampler.tick()?;
            }
        }

        if child_ready {
            for line in supervisor.read_lines()? {
                if opts.roi {
                    match roi::scan(&line) {
                        RoiMark::Begin => sampler.arm()?,
                        RoiMark::End => sampler.disarm()?,
                        RoiMark::None => {}
                    }
                }
                // Echoed verbatim, markers included.
                echo.write_all(&line)?;
            }
            echo.flush()?;
        }
    }
    Ok(())
}

/// Block until the timer or the child pipe is ready.
fn wait_for_event(supervisor: &Supervisor, sampler: &Sampler) -> Result<(bool, bool)> {
    let mut fds = [
        PollFd::new(sampler.timer_fd(), PollFlags::POLLIN),
        PollFd::new(supervisor.stdout_fd(), PollFlags::POLLIN),
    ];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::EventLoop(e)),
        }
    }

    let timer = fds[0].revents().unwrap_or(PollFlags::empty());
    let child = fds[1].revents().unwrap_or(PollFlags::empty());
    Ok((
        timer.contains(PollFlags::POLLIN),
        child.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR),
    ))
}
