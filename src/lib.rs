//! # Medir
//!
//! Medir (Spanish: "to measure") analyzes the bit-level utilization of the
//! numeric weights stored in safetensors archives. For each tensor it
//! counts how many distinct values the sign, exponent and mantissa fields
//! actually exhibit and derives how many of the allocated bits are
//! information-bearing versus wasted. Aggregated across a model, the
//! figures quantify how much of the on-disk representation a better-chosen
//! numeric format could remove.
//!
//! ## Example
//!
//! ```rust
//! use medir::analyze::analyze_tensor;
//! use medir::safetensors::Dtype;
//!
//! // Two bfloat16 weights: +1.0 and -1.0.
//! let data = [0x80u8, 0x3F, 0x80, 0xBF];
//! let analysis = analyze_tensor("w", Dtype::BF16, &data).unwrap();
//!
//! assert_eq!(analysis.numel, 2);
//! assert_eq!(analysis.sign.effective(), 2);
//! assert_eq!(analysis.exponent.effective(), 1);
//! assert_eq!(analysis.min, -1.0);
//! assert_eq!(analysis.max, 1.0);
//! ```
//!
//! ## Architecture
//!
//! - [`floatx`]: total decoders from BF16/F16/F8 bit patterns to `f32`
//! - [`sets`]: compact population containers behind the histograms
//! - [`analyze`]: the single-sweep per-tensor analyzer and its records
//! - [`safetensors`]: memory-mapped archive reader
//! - [`pipeline`]: concurrent multi-file driver
//! - [`hf`]: HuggingFace snapshot fetcher
//! - [`report`]: terminal formatting
//! - [`cli`]: subcommand implementations

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::upper_case_acronyms)]

pub mod analyze;
pub mod cli;
pub mod error;
pub mod floatx;
pub mod hf;
pub mod pipeline;
pub mod report;
pub mod safetensors;
pub mod sets;

// Re-exports for convenience
pub use error::{MedirError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
