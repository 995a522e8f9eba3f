//! Errors that can occur in ical

use thiserror::Error;

use crate::{
    buffers::{AllocationError, IndexBufferError},
    config::ConfigError,
    io::error::ExportError,
    pipeline::IcalContextBuilderError,
    processor::ExternalCallError,
    verify::VerificationError,
};

#[derive(Error, Debug)]
/// An enum of all the errors possible in ical
pub enum IcalError {
    /// Error derived from [`ConfigError`]
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error derived from [`AllocationError`]
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// Error derived from [`ExternalCallError`]
    #[error(transparent)]
    ExternalCall(#[from] ExternalCallError),

    /// Error derived from [`ExportError`]
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Error derived from [`VerificationError`]
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Error derived from [`IcalContextBuilderError`]
    #[error(transparent)]
    Builder(#[from] IcalContextBuilderError),

    /// The predicted index buffer doesn't describe a usable mapping.
    #[error("Bad index buffer: {0}")]
    BadIndexBuffer(#[from] IndexBufferError),

    /// The collaborator advised values that can't size an image.
    #[error("Invalid wide-field advice: vis_slices={vis_slices}, npixel={npixel}, cellsize={cellsize}")]
    InvalidAdvice {
        /// Advised number of visibility slices
        vis_slices: usize,
        /// Advised number of pixels per axis
        npixel: usize,
        /// Advised cell size \[radians\]
        cellsize: f64,
    },

    /// Error for bad array shape in provided argument
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        /// The argument name within the function
        argument: &'static str,
        /// The function name
        function: &'static str,
        /// The expected shape
        expected: String,
        /// The shape that was received instead
        received: String,
    },
}
