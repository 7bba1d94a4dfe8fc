//! # burrow-inspect
//!
//! Builds sparse symmetric co-occurrence matrices over traffic sessions:
//! how much two sessions overlap in time under a pluggable overlap kernel.
//! The matrix feeds downstream clustering; this crate owns everything up to
//! (and including) its serialized on-disk form.

/// On-disk codecs for matrices and timestamp lists
pub mod codec;
/// Sparse symmetric co-occurrence matrix
pub mod matrix;
/// Pluggable overlap kernels over sorted timestamp lists
pub mod overlap;
/// Session identity, interning and timestamp storage
pub mod session;

pub use codec::InspectError;
pub use matrix::CoOccurrence;
pub use overlap::{FixedMarginSweep, GaussianCutoff, OverlapKernel};
pub use session::{SessionId, SessionIndex, TimestampStore};

/// Nanoseconds per second, the unit conversions the pipelines use.
pub const NANOS_PER_SEC: f64 = 1e9;

/// Convert a nanosecond overlap total to seconds.
pub fn overlap_in_secs(overlap: u64) -> f64 {
    overlap as f64 / NANOS_PER_SEC
}

/// Convert seconds to integer nanoseconds (saturating).
pub fn secs_to_nanos(secs: f64) -> u64 {
    let nanos = secs * NANOS_PER_SEC;
    if nanos >= u64::MAX as f64 {
        u64::MAX
    } else if nanos <= 0.0 {
        0
    } else {
        nanos as u64
    }
}
