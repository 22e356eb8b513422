//! CSV export of accumulator windows.

use super::store::Window;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// File name for an export, stamped with the experiment start time.
///
/// `export_file_name("fish", t)` gives e.g. `20240305_142501_fish.csv`.
pub fn export_file_name(prefix: &str, started: DateTime<Utc>) -> String {
    format!("{}_{prefix}.csv", started.format("%Y%m%d_%H%M%S"))
}

/// Writes `window` to `path`, `t` first. Missing values become empty cells.
pub fn write_csv(window: &Window, path: &Path) -> Result<(), ExportError> {
    let file = std::fs::File::create(path)?;
    write_csv_to(window, file)?;
    tracing::info!(rows = window.len(), path = %path.display(), "Exported CSV");
    Ok(())
}

pub fn write_csv_to<W: Write>(window: &Window, writer: W) -> Result<(), ExportError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(window.columns())?;
    for (t, values) in window.rows() {
        wtr.write_record(std::iter::once(t).chain(values.iter().copied()).map(format_cell))?;
    }
    wtr.flush()?;
    Ok(())
}

fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}
