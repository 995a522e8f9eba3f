// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.
//!
//! Byte layouts here are shared with the numerical collaborator and must not
//! change without changing it too.

/// Size of the fixed header at the start of every visibility data region.
pub const VIS_HEADER_BYTES: usize = 80;

/// Bytes per polarisation per visibility sample: visibility (real and
/// imaginary), weight and imaging weight, each an `f64`.
pub const VIS_BYTES_PER_POL_SAMPLE: usize = 32;

/// The value stored in an index buffer entry that maps to no block record.
pub const UNMATCHED_INDEX: i64 = -1;

/// Leading character of an export path asking for an existing file to be
/// overwritten.
pub const OVERWRITE_MARKER: char = '!';

/// The array layout used when none is given.
pub const DEFAULT_LAYOUT: &str = "LOWBD2-CORE";

/// Maximum distance of an antenna from the array centre \[metres\] used when
/// none is given.
pub const DEFAULT_MAX_RADIUS_M: f64 = 300.0;

/// Phase centre right ascension \[degrees\] used when none is given.
pub const DEFAULT_PHASE_CENTRE_RA_DEG: f64 = 30.0;

/// Phase centre declination \[degrees\] used when none is given.
pub const DEFAULT_PHASE_CENTRE_DEC_DEG: f64 = -60.0;

/// Lowest channel frequency \[Hz\] used when none is given.
pub const DEFAULT_FREQ_START_HZ: f64 = 0.8e8;

/// Highest channel frequency \[Hz\] used when none is given.
pub const DEFAULT_FREQ_END_HZ: f64 = 1.2e8;

/// Number of channels used when none is given.
pub const DEFAULT_NUM_FREQS: usize = 5;

/// Number of time samples used when none is given.
pub const DEFAULT_NUM_TIMES: usize = 11;

/// Fraction of the image to use as a guard band in wide-field advice.
pub const DEFAULT_GUARD_BAND_IMAGE: f64 = 4.0;

/// Amplitude error tolerated in wide-field advice.
pub const DEFAULT_DEL_A: f64 = 0.02;

/// Number of w-projection planes requested in wide-field advice.
pub const DEFAULT_WPROJECTION_PLANES: usize = 1;

/// Directory the image products are written into when none is given.
pub const DEFAULT_OUTPUT_DIR: &str = "results";
