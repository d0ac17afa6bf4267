use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::io::Write;
use wattrun::backend::EnergyBackend;
use wattrun::backend::nvidia::NvidiaBackend;
use wattrun::backend::rapl::{self, RaplBackend};
use wattrun::cli::Cli;
use wattrun::measure::{self, Options};
use wattrun::supervisor::Supervisor;
use wattrun::sysfs::SysfsRoot;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(std::fs::File::create(path).with_context(|| {
            format!("could not open output file {} for writing", path.display())
        })?),
        None => Box::new(std::io::stderr()),
    };

    // The child is spawned before any counter is opened, so a spawn failure
    // leaves no handles behind.
    let supervisor = Supervisor::spawn(&cli.command)?;

    let sysfs = SysfsRoot::system();
    let cpus = cli
        .cpus
        .clone()
        .unwrap_or_else(|| rapl::default_query_cpus(&sysfs));

    let mut backends: Vec<Box<dyn EnergyBackend>> = Vec::new();
    let cpu_counters = RaplBackend::open(&sysfs, &cpus)?;
    if cpu_counters.channel_count() == 0 {
        eprintln!(
            "  {} no RAPL domains resolved for cpus {:?}; no on-chip channels will be reported",
            "Note:".yellow(),
            cpus
        );
    }
    backends.push(Box::new(cpu_counters));

    if let Some(gpu) = NvidiaBackend::probe()? {
        if gpu.device_count() > 0 {
            backends.push(Box::new(gpu));
        }
    }

    let opts = Options {
        roi: cli.roi,
        totals: cli.totals,
        interval: cli.interval(),
    };
    let mut stdout = std::io::stdout();
    let status = measure::run(&opts, supervisor, backends, out, &mut stdout)?;

    match status.code() {
        Some(code) => std::process::exit(code),
        None => {
            use std::os::unix::process::ExitStatusExt;
            let signal = status.signal().unwrap_or(0);
            eprintln!(
                "  {} command terminated by signal {}",
                "Note:".yellow(),
                signal
            );
            std::process::exit(128 + signal);
        }
    }
}
