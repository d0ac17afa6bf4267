use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "wattrun",
    about = "Run a command and sample its power and energy consumption while it executes",
    long_about = "Performs a sequence of power measurements during the execution of a command.\n\
                  Samples CPU/RAM energy counters (and NVIDIA GPUs when present) at a fixed\n\
                  interval and writes one row per sample: elapsed seconds followed by the\n\
                  instantaneous power of every available counter, in watts.",
    version,
    disable_version_flag = true
)]
pub struct Cli {
    /// Write samples to FILE instead of standard error
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Measure only within the region of interest (ROI). The ROI starts when
    /// the command writes "+++ROI" to stdout and ends at "---ROI" or when the
    /// command exits.
    #[arg(short = 'r')]
    pub roi: bool,

    /// Append a totals line with overall elapsed time and per-counter energy
    /// in joules
    #[arg(short = 't')]
    pub totals: bool,

    /// Sampling interval in milliseconds (must be below 1000)
    #[arg(
        short = 'i',
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..1000)
    )]
    pub interval_ms: u64,

    /// CPUs to attach energy counters to (default: the first cpu of every
    /// physical package)
    #[arg(short = 'c', long = "cpus", value_name = "LIST", value_delimiter = ',')]
    pub cpus: Option<Vec<u32>>,

    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Command to supervise, with its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl Cli {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_command() {
        let cli =
            Cli::try_parse_from(["wattrun", "-r", "-t", "-i", "250", "stress", "-c", "4"]).unwrap();
        assert!(cli.roi);
        assert!(cli.totals);
        assert_eq!(cli.interval_ms, 250);
        assert_eq!(cli.command, vec!["stress", "-c", "4"]);
    }

    #[test]
    fn attached_short_values() {
        let cli = Cli::try_parse_from(["wattrun", "-i250", "-ofoo.dat", "true"]).unwrap();
        assert_eq!(cli.interval_ms, 250);
        assert_eq!(cli.output.as_deref(), Some(std::path::Path::new("foo.dat")));
    }

    #[test]
    fn interval_must_stay_below_one_second() {
        assert!(Cli::try_parse_from(["wattrun", "-i", "1000", "true"]).is_err());
        assert!(Cli::try_parse_from(["wattrun", "-i", "0", "true"]).is_err());
        assert!(Cli::try_parse_from(["wattrun", "-i", "999", "true"]).is_ok());
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["wattrun", "-r"]).is_err());
    }

    #[test]
    fn cpu_list_splits_on_commas() {
        let cli = Cli::try_parse_from(["wattrun", "-c", "0,6", "true"]).unwrap();
        assert_eq!(cli.cpus, Some(vec![0, 6]));
    }
}
