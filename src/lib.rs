#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! ical orchestrates a radio-interferometric calibration and imaging (ICAL)
//! pipeline: it configures an observation, simulates and predicts
//! visibilities, derives and applies antenna gains, inverts the visibilities
//! into a sky image and deconvolves it, writing the image products as FITS.
//!
//! The numerical work is done by a collaborator implementing [`Processor`].
//! This crate owns the data model, the lifecycle of every large buffer handed
//! to the collaborator, and the order of the calls.
//!
//! # Examples
//!
//! ```rust,no_run
//! use ical::{IcalContextBuilder, Processor};
//!
//! fn run_ical(processor: &dyn Processor) -> Result<(), ical::IcalError> {
//!     let context = IcalContextBuilder::default()
//!         .max_radius(300.0)
//!         .output_dir("results")
//!         .build()?;
//!     let report = context.run(processor)?;
//!     for failure in report.failures() {
//!         eprintln!("{} was not written", failure.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Details
//!
//! Each stage of the pipeline is a type of its own in [`pipeline`]; a stage's
//! methods exist only on its predecessor, and every buffer is released exactly
//! once when its last reader has finished, which the run's
//! [`BufferLedger`] can confirm.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use lazy_static::lazy_static;

pub use marlu::{self, c64, ndarray, RADec};

pub mod buffers;
pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod processor;
pub mod verify;

pub use buffers::{
    AllocationError, BlockVisibility, BufferAllocator, BufferId, BufferKind, BufferLedger,
    GainTable, Image, ImageShape, IndexBuffer, VisSample, Visibility, VisibilityData,
    VisibilityView,
};
pub use config::{AntennaCounts, ConfigError, ObservationConfig, PolFrame};
pub use error::IcalError;
pub use io::{ExportError, ExportTarget};
pub use pipeline::{ExportReport, IcalContext, IcalContextBuilder, Stage};
pub use processor::{AdviceRequest, ExternalCallError, Processor, WideFieldAdvice};
pub use verify::{verify_copy, CopyOutcome, VerificationError};

#[cfg(test)]
pub(crate) mod test_common;

lazy_static! {
    static ref DURATIONS: Mutex<HashMap<String, Duration>> = Mutex::new(HashMap::new());
}

/// Add `duration` to the total time spent in `name`.
#[doc(hidden)]
pub fn increment_duration(name: &str, duration: Duration) {
    let mut durations = DURATIONS.lock().unwrap_or_else(PoisonError::into_inner);
    *durations.entry(name.to_string()).or_default() += duration;
}

/// The total time spent in each timed section so far.
pub fn get_durations() -> HashMap<String, Duration> {
    DURATIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Evaluate an expression, adding the time it took to the named total in
/// [`get_durations`].
#[macro_export]
macro_rules! with_increment_duration {
    ($name:expr, $body:expr) => {{
        let _now = std::time::Instant::now();
        let _res = $body;
        $crate::increment_duration($name, _now.elapsed());
        _res
    }};
}

#[allow(dead_code)]
mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// The version of this crate.
pub const PKG_VERSION: &str = built_info::PKG_VERSION;

/// A description of how this crate was built.
pub fn fmt_build_info() -> String {
    let mut lines = vec![format!(
        "{} {}, compiled with {} for {}",
        built_info::PKG_NAME,
        built_info::PKG_VERSION,
        built_info::RUSTC_VERSION,
        built_info::TARGET
    )];
    if let Some(hash) = built_info::GIT_COMMIT_HASH {
        lines.push(format!(
            "git commit {hash}{}",
            match built_info::GIT_DIRTY {
                Some(true) => " (dirty)",
                _ => "",
            }
        ));
    }
    lines.push(format!("built at {}", built_info::BUILT_TIME_UTC));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_increment_duration() {
        let value = with_increment_duration!("test_with_increment_duration", 1 + 2);
        assert_eq!(value, 3);
        increment_duration("test_with_increment_duration", Duration::from_millis(5));
        let durations = get_durations();
        assert!(durations["test_with_increment_duration"] >= Duration::from_millis(5));
    }

    #[test]
    fn test_fmt_build_info() {
        let info = fmt_build_info();
        assert!(info.starts_with("ical "));
        assert!(info.contains(PKG_VERSION));
    }
}
