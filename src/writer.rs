use std::io::Write;

/// Formats the measurement stream: one header row, one data row per tick, and
/// an optional totals row. Column labels are fixed at construction, so the
/// header and every row carry the same column set in the same order.
pub struct OutputWriter {
    out: Box<dyn Write>,
    columns: Vec<String>,
}

impl OutputWriter {
    pub fn new(out: Box<dyn Write>, columns: Vec<String>) -> Self {
        Self { out, columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// `time` followed by one space-separated label per open channel.
    pub fn write_header(&mut self) -> std::io::Result<()> {
        write!(self.out, "time")?;
        for column in &self.columns {
            write!(self.out, " {}", column)?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }

    /// Elapsed seconds followed by one power value per channel. Values keep
    /// the original printf `%f` rendering: six decimals, space-terminated.
    pub fn write_row(&mut self, elapsed: f64, powers: &[f64]) -> std::io::Result<()> {
        debug_assert_eq!(powers.len(), self.columns.len());
        write!(self.out, "{:.6} ", elapsed)?;
        for power in powers {
            write!(self.out, "{:.6} ", power)?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }

    /// Overall elapsed time and per-channel energy in joules.
    pub fn write_totals(&mut self, elapsed: f64, energies: &[f64]) -> std::io::Result<()> {
        debug_assert_eq!(energies.len(), self.columns.len());
        write!(self.out, "Totals: {:.6} ", elapsed)?;
        for energy in energies {
            write!(self.out, "{:.6} ", energy)?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}
