//! Write images to FITS files.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::trace;

use super::error::ExportError;
use crate::{
    buffers::Image,
    config::{ObservationConfig, PolFrame},
    constants::OVERWRITE_MARKER,
    marlu::fitsio::{
        self,
        hdu::FitsHdu,
        images::{ImageDescription, ImageType},
        FitsFile,
    },
};

/// Where to write an image, and whether an existing file may be replaced.
///
/// As text, a leading `!` asks for overwriting.
///
/// ```rust
/// use ical::io::ExportTarget;
///
/// let target: ExportTarget = "!results/dirty.fits".parse().unwrap();
/// assert!(target.overwrite());
/// assert_eq!(target.path(), std::path::Path::new("results/dirty.fits"));
/// assert_eq!(target.to_string(), "!results/dirty.fits");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    path: PathBuf,
    overwrite: bool,
}

impl ExportTarget {
    /// A target at `path`.
    pub fn new(path: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            path: path.into(),
            overwrite,
        }
    }

    /// The file to write.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an existing file at [`Self::path`] may be replaced.
    pub fn overwrite(&self) -> bool {
        self.overwrite
    }
}

impl FromStr for ExportTarget {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, overwrite) = match s.strip_prefix(OVERWRITE_MARKER) {
            Some(rest) => (rest, true),
            None => (s, false),
        };
        if path.is_empty() || path.ends_with('/') {
            return Err(ExportError::InvalidTarget {
                target: s.to_string(),
            });
        }
        Ok(Self::new(path, overwrite))
    }
}

impl Display for ExportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.overwrite {
            write!(f, "{OVERWRITE_MARKER}")?;
        }
        write!(f, "{}", self.path.display())
    }
}

/// Observation details written alongside the pixels.
#[derive(Debug, Clone, Copy)]
pub struct ExportMeta<'a> {
    /// Channel centre frequencies \[Hz\]
    pub freqs: &'a [f64],
    /// Channel bandwidths \[Hz\]
    pub channel_bandwidths: &'a [f64],
    /// Polarisation frame of the image
    pub pol_frame: PolFrame,
    /// A one line description of the run
    pub comment: &'a str,
}

impl<'a> ExportMeta<'a> {
    /// Details taken from `config`.
    pub fn from_config(config: &'a ObservationConfig, comment: &'a str) -> Self {
        Self {
            freqs: config.freqs(),
            channel_bandwidths: config.channel_bandwidths(),
            pol_frame: config.pol_frame,
            comment,
        }
    }

    /// Reference value and increment of the frequency axis of an image with
    /// `nchan` channels. An image with fewer channels than the observation
    /// covers the whole band in each.
    pub fn freq_axis(&self, nchan: usize) -> (f64, f64) {
        if self.freqs.is_empty() {
            return (0., 1.);
        }
        if nchan == self.freqs.len() {
            let cdelt = match self.freqs {
                [first, second, ..] => second - first,
                _ => self.channel_bandwidths.first().copied().unwrap_or(1.),
            };
            return (self.freqs[0], cdelt);
        }
        let mean = self.freqs.iter().sum::<f64>() / self.freqs.len() as f64;
        let total: f64 = self.channel_bandwidths.iter().sum();
        (mean, total / nchan.max(1) as f64)
    }

    /// Reference value and increment of the polarisation axis, in FITS
    /// Stokes codes.
    pub fn stokes_axis(&self) -> (i32, i32) {
        match self.pol_frame {
            PolFrame::StokesI | PolFrame::StokesIQUV => (1, 1),
            PolFrame::Linear => (-5, -1),
            PolFrame::Circular => (-1, -1),
        }
    }
}

fn write_header(
    fptr: &mut FitsFile,
    hdu: &FitsHdu,
    image: &Image,
    meta: &ExportMeta,
) -> Result<(), fitsio::errors::Error> {
    let shape = image.shape();
    let cellsize_deg = image.cellsize().to_degrees();
    let phase_centre = image.phase_centre();
    let (freq_crval, freq_cdelt) = meta.freq_axis(shape.nchan());
    let (stokes_crval, stokes_cdelt) = meta.stokes_axis();

    hdu.write_key(fptr, "BSCALE", 1.0f64)?;
    hdu.write_key(fptr, "BZERO", 0.0f64)?;
    hdu.write_key(fptr, "BUNIT", "JY/BEAM")?;

    hdu.write_key(fptr, "CTYPE1", "RA---SIN")?;
    hdu.write_key(fptr, "CRVAL1", phase_centre.ra.to_degrees())?;
    hdu.write_key(fptr, "CDELT1", -cellsize_deg)?;
    hdu.write_key(fptr, "CRPIX1", (shape.nx() / 2) as f64 + 1.0)?;
    hdu.write_key(fptr, "CUNIT1", "deg")?;

    hdu.write_key(fptr, "CTYPE2", "DEC--SIN")?;
    hdu.write_key(fptr, "CRVAL2", phase_centre.dec.to_degrees())?;
    hdu.write_key(fptr, "CDELT2", cellsize_deg)?;
    hdu.write_key(fptr, "CRPIX2", (shape.ny() / 2) as f64 + 1.0)?;
    hdu.write_key(fptr, "CUNIT2", "deg")?;

    hdu.write_key(fptr, "CTYPE3", "STOKES")?;
    hdu.write_key(fptr, "CRVAL3", stokes_crval)?;
    hdu.write_key(fptr, "CDELT3", stokes_cdelt)?;
    hdu.write_key(fptr, "CRPIX3", 1.0f64)?;

    hdu.write_key(fptr, "CTYPE4", "FREQ")?;
    hdu.write_key(fptr, "CRVAL4", freq_crval)?;
    hdu.write_key(fptr, "CDELT4", freq_cdelt)?;
    hdu.write_key(fptr, "CRPIX4", 1.0f64)?;
    hdu.write_key(fptr, "CUNIT4", "Hz")?;

    hdu.write_key(fptr, "RADESYS", "ICRS")?;
    hdu.write_key(fptr, "EQUINOX", 2000.0f64)?;
    hdu.write_key(fptr, "POLFRAME", meta.pol_frame.label())?;
    hdu.write_key(fptr, "SOFTWARE", format!("ical {}", crate::PKG_VERSION))?;
    if !meta.comment.is_empty() {
        hdu.write_key(fptr, "ICALRUN", meta.comment)?;
    }
    Ok(())
}

fn write_primary(
    fptr: &mut FitsFile,
    data: &[f64],
    image: &Image,
    meta: &ExportMeta,
) -> Result<(), fitsio::errors::Error> {
    let hdu = fptr.primary_hdu()?;
    hdu.write_image(fptr, data)?;
    write_header(fptr, &hdu, image, meta)
}

/// Write `image` into the primary HDU of a new FITS file at `target`.
///
/// # Errors
///
/// Will return [`ExportError::Exists`] if the file exists and `target` doesn't
/// allow overwriting, and [`ExportError::FitsOpen`] or [`ExportError::FitsIO`]
/// if cfitsio fails.
pub fn write_image_fits(
    image: &Image,
    target: &ExportTarget,
    meta: &ExportMeta,
) -> Result<(), ExportError> {
    trace!("start write_image_fits({target})");
    let path = target.path();
    if path.exists() {
        if !target.overwrite() {
            return Err(ExportError::Exists {
                path: path.to_path_buf(),
            });
        }
        std::fs::remove_file(path)?;
    }
    let fits_filename = path.display().to_string();

    let shape = image.shape();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &shape.0,
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()
        .map_err(|fits_error| ExportError::FitsOpen {
            fits_error,
            fits_filename: fits_filename.clone(),
            source_file: file!(),
            source_line: line!(),
        })?;

    let pixels = image.pixels();
    let contiguous;
    let data = match pixels.as_slice() {
        Some(data) => data,
        None => {
            contiguous = pixels.iter().copied().collect::<Vec<_>>();
            &contiguous
        }
    };

    write_primary(&mut fptr, data, image, meta)
        .map_err(|fits_error| ExportError::FitsIO {
            fits_error,
            fits_filename,
            source_file: file!(),
            source_line: line!(),
        })?;

    trace!("end write_image_fits({target})");
    Ok(())
}
