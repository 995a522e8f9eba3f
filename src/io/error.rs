//! Errors that can occur in the io module

use std::path::PathBuf;

use thiserror::Error;

use crate::marlu::fitsio;

#[derive(Error, Debug)]
/// All the errors that can occur while exporting image products
pub enum ExportError {
    /// An export path that names no file.
    #[error("Invalid export target {target:?}: no file name")]
    InvalidTarget {
        /// The target as given
        target: String,
    },

    /// The file exists and the target doesn't ask for it to be overwritten.
    #[error("{path} already exists; prefix the path with '!' to overwrite it")]
    Exists {
        /// The existing file
        path: PathBuf,
    },

    /// Error when creating a fits file.
    #[error("{source_file}:{source_line}\nCouldn't create {fits_filename}: {fits_error}")]
    FitsOpen {
        /// The [`fitsio::errors::Error`]
        fits_error: fitsio::errors::Error,
        /// The filename of the fits file
        fits_filename: String,
        /// The file where the error originated (usually `file!()`)
        source_file: &'static str,
        /// The line number where the error originated (usually `line!()`)
        source_line: u32,
    },

    /// A generic error associated with the fitsio crate.
    #[error("{source_file}:{source_line}\n{fits_filename}: {fits_error}")]
    #[allow(clippy::upper_case_acronyms)]
    FitsIO {
        /// The [`fitsio::errors::Error`]
        fits_error: fitsio::errors::Error,
        /// The filename of the fits file where the error occurred
        fits_filename: String,
        /// The file where the error originated (usually `file!()`)
        source_file: &'static str,
        /// The line number where the error originated (usually `line!()`)
        source_line: u32,
    },

    #[error(transparent)]
    /// An IO error from the standard library.
    IO(#[from] std::io::Error),
}
