//! Time-indexed storage of feature tuples and estimator logs.

mod export;
mod store;

pub use export::{export_file_name, write_csv, write_csv_to, ExportError};
pub use store::{
    Accumulator, AccumulatorConfig, AccumulatorError, AppendOutcome, Sample, Window, TIME_COLUMN,
};
