// Stimulus Events
// Trigger tables extracted from the stimulus channel

pub mod table;

pub use table::{concatenate, delay_in_samples, Event, EventTable, TriggerMask};

use thiserror::Error;

/// Errors raised while reading or combining event tables
#[derive(Debug, Error)]
pub enum StimulusError {
    #[error("event table line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("event table has no '# {0}:' header")]
    MissingHeader(&'static str),

    #[error("cannot concatenate runs sampled at {expected} Hz and {found} Hz")]
    SampleRateMismatch { expected: f64, found: f64 },

    #[error("no event tables to concatenate")]
    Empty,

    #[error("run {run}: event at sample {sample} precedes the first sample {first_samp}")]
    BeforeFirstSample {
        run: usize,
        sample: u64,
        first_samp: u64,
    },
}
