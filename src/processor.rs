//! The interface to the numerical collaborator.
//!
//! Everything numerical (gridding, inversion, deconvolution, gain solving and
//! the layout registry) lives behind [`Processor`]. The pipeline only decides
//! what gets allocated, in which order the calls are made and when each
//! buffer is released.

use log::info;
use thiserror::Error;

use crate::{
    buffers::{BlockVisibility, GainTable, Image, ImageShape, IndexBuffer, Visibility},
    config::{AntennaCounts, ConfigError, ObservationConfig},
    constants::{DEFAULT_DEL_A, DEFAULT_GUARD_BAND_IMAGE, DEFAULT_WPROJECTION_PLANES},
    error::IcalError,
    io::{
        error::ExportError,
        fits::{write_image_fits, ExportMeta, ExportTarget},
    },
    marlu::RADec,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{function} failed with status {status}: {message}")]
/// A collaborator call reported failure.
pub struct ExternalCallError {
    /// The collaborator function that failed
    pub function: &'static str,
    /// The status it reported
    pub status: i32,
    /// What went wrong
    pub message: String,
}

impl ExternalCallError {
    /// A failure of `function` with the given status.
    pub fn new(function: &'static str, status: i32, message: impl Into<String>) -> Self {
        Self {
            function,
            status,
            message: message.into(),
        }
    }
}

/// The inputs to wide-field imaging advice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdviceRequest {
    /// Size of the guard band around the image, as a multiple of its size
    pub guard_band_image: f64,
    /// Amplitude error that can be tolerated
    pub del_a: f64,
    /// Number of w-projection planes
    pub wprojection_planes: usize,
}

impl Default for AdviceRequest {
    fn default() -> Self {
        Self {
            guard_band_image: DEFAULT_GUARD_BAND_IMAGE,
            del_a: DEFAULT_DEL_A,
            wprojection_planes: DEFAULT_WPROJECTION_PLANES,
        }
    }
}

/// Imaging parameters advised for a dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WideFieldAdvice {
    /// Number of visibility slices to invert in
    pub vis_slices: usize,
    /// Number of pixels along each image axis
    pub npixel: usize,
    /// Angular size of a pixel \[radians\]
    pub cellsize: f64,
}

impl WideFieldAdvice {
    /// Check that every advised value is usable for sizing images.
    ///
    /// # Errors
    ///
    /// Will return [`IcalError::InvalidAdvice`] if any value isn't positive.
    pub fn validate(self) -> Result<Self, IcalError> {
        if self.vis_slices == 0 || self.npixel == 0 || !(self.cellsize.is_finite() && self.cellsize > 0.) {
            return Err(IcalError::InvalidAdvice {
                vis_slices: self.vis_slices,
                npixel: self.npixel,
                cellsize: self.cellsize,
            });
        }
        info!(
            "Vis_slices = {}, npixel = {}, cellsize = {:e}",
            self.vis_slices, self.npixel, self.cellsize
        );
        Ok(self)
    }
}

/// The numerical collaborator.
///
/// Output buffers are always allocated by the caller with the correct shape
/// and lent as `&mut`; inputs are lent as `&`. Implementations must not keep
/// references to either beyond the call.
pub trait Processor {
    /// Set up, called by the driver at the start of every run before any
    /// other method. Implementations must tolerate being called again.
    ///
    /// # Errors
    ///
    /// The collaborator couldn't start.
    fn initialize(&self) -> Result<(), ExternalCallError> {
        Ok(())
    }

    /// The default configuration of the named array layout.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownLayout`] if the registry doesn't know `layout`.
    fn default_config(&self, layout: &str) -> Result<ObservationConfig, ConfigError>;

    /// Antenna and baseline counts of the named layout, keeping only antennas
    /// within `radius` metres of the array centre.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownLayout`] if the registry doesn't know `layout`.
    fn restricted_counts(&self, layout: &str, radius: f64) -> Result<AntennaCounts, ConfigError>;

    /// Fill `bvis` with simulated block visibilities for `config`, returning
    /// the number of receptors per antenna.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn create_blockvisibility(
        &self,
        config: &ObservationConfig,
        bvis: &mut BlockVisibility,
    ) -> Result<usize, ExternalCallError>;

    /// Imaging advice for `bvis`.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn advise_wide_field(
        &self,
        config: &ObservationConfig,
        bvis: &BlockVisibility,
        request: &AdviceRequest,
    ) -> Result<WideFieldAdvice, ExternalCallError>;

    /// The shape of a multi-frequency image for the advised pixel count.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn image_shape_multifreq(
        &self,
        config: &ObservationConfig,
        cellsize: f64,
        npixel: usize,
    ) -> Result<ImageShape, ExternalCallError>;

    /// Fill `model` with a sky model from the GLEAM catalogue.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn create_low_test_image_from_gleam(
        &self,
        config: &ObservationConfig,
        cellsize: f64,
        npixel: usize,
        phase_centre: RADec,
        model: &mut Image,
    ) -> Result<(), ExternalCallError>;

    /// Predict visibilities of `model` for the layout of `bvis`, filling the
    /// flat and block outputs and the flat-to-block index.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn predict(
        &self,
        config: &ObservationConfig,
        bvis: &BlockVisibility,
        model: &Image,
        vis_out: &mut Visibility,
        bvis_out: &mut BlockVisibility,
        index: &mut IndexBuffer,
    ) -> Result<(), ExternalCallError>;

    /// Scatter the flat `vis` into `bvis_out` following `index`, with
    /// `template` providing the block layout.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn convert_visibility_to_blockvisibility(
        &self,
        config: &ObservationConfig,
        vis: &Visibility,
        template: &BlockVisibility,
        index: &IndexBuffer,
        bvis_out: &mut BlockVisibility,
    ) -> Result<(), ExternalCallError>;

    /// Initialise `gaintable` from the layout of `bvis`.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn create_gaintable_from_blockvisibility(
        &self,
        config: &ObservationConfig,
        bvis: &BlockVisibility,
        gaintable: &mut GainTable,
    ) -> Result<(), ExternalCallError>;

    /// Fill `gaintable` with simulated gain errors.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn simulate_gaintable(
        &self,
        config: &ObservationConfig,
        gaintable: &mut GainTable,
    ) -> Result<(), ExternalCallError>;

    /// Write `bvis` corrupted by `gaintable` into `bvis_out`.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn apply_gaintable(
        &self,
        config: &ObservationConfig,
        bvis: &BlockVisibility,
        gaintable: &GainTable,
        bvis_out: &mut BlockVisibility,
    ) -> Result<(), ExternalCallError>;

    /// Fill `model` with an empty image matched to `bvis`.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn create_image_from_blockvisibility(
        &self,
        config: &ObservationConfig,
        bvis: &BlockVisibility,
        cellsize: f64,
        npixel: usize,
        phase_centre: RADec,
        model: &mut Image,
    ) -> Result<(), ExternalCallError>;

    /// Make the dirty image of `vis` on the grid of `model`.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    fn invert(
        &self,
        config: &ObservationConfig,
        vis: &Visibility,
        model: &Image,
        vis_slices: usize,
        dirty: &mut Image,
    ) -> Result<(), ExternalCallError>;

    /// Run self-calibration and deconvolution of `bvis` starting from
    /// `model`.
    ///
    /// # Errors
    ///
    /// The collaborator reported failure.
    #[allow(clippy::too_many_arguments)]
    fn ical(
        &self,
        config: &ObservationConfig,
        bvis: &BlockVisibility,
        model: &Image,
        vis_slices: usize,
        deconvolved: &mut Image,
        residual: &mut Image,
        restored: &mut Image,
    ) -> Result<(), ExternalCallError>;

    /// Write `image` to `target` as a FITS file.
    ///
    /// # Errors
    ///
    /// Will return an [`ExportError`] if the file can't be written.
    fn export_image(
        &self,
        image: &Image,
        target: &ExportTarget,
        meta: &ExportMeta<'_>,
    ) -> Result<(), ExportError> {
        write_image_fits(image, target, meta)
    }
}
