//! Observation configuration: the telescope, its frequencies and times.
//!
//! An [`ObservationConfig`] is created once from the collaborator's named
//! array-layout defaults and then selectively overridden. Everything sized
//! later in the pipeline is derived from the counts held here, so the
//! radius restriction must be applied before any buffer is allocated.

use std::{fmt::Display, str::FromStr};

use itertools::izip;
use log::{debug, trace};
use thiserror::Error;

use crate::{
    buffers::{checked_count, AllocationError},
    marlu::{ndarray::Array1, RADec},
    processor::Processor,
    ExternalCallError,
};

#[derive(Error, Debug)]
/// Errors that can occur while configuring an observation.
pub enum ConfigError {
    #[error("The array layout {name} is not known to the layout registry")]
    /// The layout registry does not know this name.
    UnknownLayout {
        /// The requested layout name
        name: String,
    },

    #[error("No antennas of layout {layout} lie within {radius} m of the array centre")]
    /// A radius restriction left nothing to observe with.
    NoAntennasInRadius {
        /// The layout name
        layout: String,
        /// The radius \[metres\]
        radius: f64,
    },

    #[error("Only {num_ants} antenna(s) of layout {layout} lie within {radius} m of the array centre, which leaves no baselines")]
    /// A radius restriction left antennas but no pair of them.
    NoBaselinesInRadius {
        /// The layout name
        layout: String,
        /// The radius \[metres\]
        radius: f64,
        /// The number of antennas left
        num_ants: usize,
    },

    #[error("The maximum radius must be positive and finite, received {0}")]
    /// A non-positive or non-finite radius.
    BadRadius(f64),

    #[error("Cannot make a {what} range with {count} samples")]
    /// A range needs at least one sample.
    NoSamples {
        /// What the range is of
        what: &'static str,
        /// The number of samples asked for
        count: usize,
    },

    #[error("Invalid {what} range: start {start}, end {end}")]
    /// The range bounds are unusable.
    BadRange {
        /// What the range is of
        what: &'static str,
        /// Start of the range
        start: f64,
        /// End of the range
        end: f64,
    },

    #[error("There are {freqs} frequencies but {bandwidths} channel bandwidths")]
    /// The frequency and bandwidth lists are not parallel.
    ChannelMismatch {
        /// The number of frequencies
        freqs: usize,
        /// The number of channel bandwidths
        bandwidths: usize,
    },

    #[error("Unknown polarisation frame {0}")]
    /// A polarisation frame label that isn't recognised.
    UnknownPolFrame(String),

    #[error(transparent)]
    /// The layout registry call itself failed.
    External(#[from] ExternalCallError),

    #[error(transparent)]
    /// A count derived from the layout can't be represented.
    Size(#[from] AllocationError),
}

/// The polarisation frame of the visibilities and images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolFrame {
    /// Total intensity only.
    #[default]
    StokesI,
    /// All four Stokes parameters.
    StokesIQUV,
    /// Linear feed correlations (XX, XY, YX, YY).
    Linear,
    /// Circular feed correlations (RR, RL, LR, LL).
    Circular,
}

impl PolFrame {
    /// The number of polarisations carried per visibility sample.
    pub fn num_pols(self) -> usize {
        match self {
            PolFrame::StokesI => 1,
            PolFrame::StokesIQUV | PolFrame::Linear | PolFrame::Circular => 4,
        }
    }

    /// The label used by the collaborator and in FITS headers.
    pub fn label(self) -> &'static str {
        match self {
            PolFrame::StokesI => "stokesI",
            PolFrame::StokesIQUV => "stokesIQUV",
            PolFrame::Linear => "linear",
            PolFrame::Circular => "circular",
        }
    }
}

impl Display for PolFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for PolFrame {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stokesI" => Ok(PolFrame::StokesI),
            "stokesIQUV" => Ok(PolFrame::StokesIQUV),
            "linear" => Ok(PolFrame::Linear),
            "circular" => Ok(PolFrame::Circular),
            other => Err(ConfigError::UnknownPolFrame(other.to_string())),
        }
    }
}

/// Antenna and baseline counts for a (possibly radius-restricted) layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AntennaCounts {
    /// Number of antennas
    pub num_ants: usize,
    /// Number of unique cross-correlation baselines
    pub num_baselines: usize,
}

impl AntennaCounts {
    /// Counts for `num_ants` antennas, with every unique pair a baseline.
    ///
    /// # Errors
    ///
    /// Will return [`AllocationError::Overflow`] if the baseline count can't
    /// be represented.
    pub fn from_num_ants(num_ants: usize) -> Result<Self, AllocationError> {
        let pairs = num_ants
            .checked_mul(num_ants.saturating_sub(1))
            .ok_or(AllocationError::Overflow {
                what: "baseline count",
                dims: vec![num_ants],
            })?;
        Ok(Self {
            num_ants,
            num_baselines: pairs / 2,
        })
    }
}

/// Telescope and observation parameters.
#[derive(Debug, Clone)]
pub struct ObservationConfig {
    /// The name of the array layout in the layout registry
    pub layout: String,
    /// The phase centre of the observation
    pub phase_centre: RADec,
    /// The polarisation frame
    pub pol_frame: PolFrame,
    num_ants: usize,
    num_baselines: usize,
    num_receptors: Option<usize>,
    max_radius: Option<f64>,
    freqs: Vec<f64>,
    channel_bandwidths: Vec<f64>,
    times: Vec<f64>,
}

impl ObservationConfig {
    /// Assemble a configuration from its parts. This is how layout registries
    /// hand back their defaults.
    ///
    /// # Errors
    ///
    /// Will return [`ConfigError::ChannelMismatch`] if `freqs` and
    /// `channel_bandwidths` aren't parallel, and [`ConfigError::NoSamples`] if
    /// either the frequency or time list is empty.
    pub fn new(
        layout: impl Into<String>,
        counts: AntennaCounts,
        pol_frame: PolFrame,
        freqs: Vec<f64>,
        channel_bandwidths: Vec<f64>,
        times: Vec<f64>,
        phase_centre: RADec,
    ) -> Result<Self, ConfigError> {
        if freqs.len() != channel_bandwidths.len() {
            return Err(ConfigError::ChannelMismatch {
                freqs: freqs.len(),
                bandwidths: channel_bandwidths.len(),
            });
        }
        if freqs.is_empty() {
            return Err(ConfigError::NoSamples {
                what: "frequency",
                count: 0,
            });
        }
        if times.is_empty() {
            return Err(ConfigError::NoSamples {
                what: "time",
                count: 0,
            });
        }
        Ok(Self {
            layout: layout.into(),
            phase_centre,
            pol_frame,
            num_ants: counts.num_ants,
            num_baselines: counts.num_baselines,
            num_receptors: None,
            max_radius: None,
            freqs,
            channel_bandwidths,
            times,
        })
    }

    /// Create a configuration populated with the defaults of the named array
    /// layout.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownLayout`] if the collaborator's registry doesn't
    /// know `name`.
    pub fn from_layout<P: Processor + ?Sized>(
        processor: &P,
        name: &str,
    ) -> Result<Self, ConfigError> {
        trace!("start ObservationConfig::from_layout({name})");
        let config = processor.default_config(name)?;
        debug!(
            "layout {name} defaults: {} antennas, {} baselines, {} channels, {} times",
            config.num_ants,
            config.num_baselines,
            config.num_chans(),
            config.num_times()
        );
        Ok(config)
    }

    /// Recompute the antenna and baseline counts, keeping only antennas within
    /// `radius` metres of the array centre.
    ///
    /// # Errors
    ///
    /// Will return [`ConfigError::BadRadius`] for a non-positive radius,
    /// [`ConfigError::NoAntennasInRadius`] if nothing is left and
    /// [`ConfigError::NoBaselinesInRadius`] if a single antenna is left.
    pub fn restrict_by_radius<P: Processor + ?Sized>(
        &mut self,
        processor: &P,
        radius: f64,
    ) -> Result<AntennaCounts, ConfigError> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(ConfigError::BadRadius(radius));
        }
        let counts = processor.restricted_counts(&self.layout, radius)?;
        if counts.num_ants == 0 {
            return Err(ConfigError::NoAntennasInRadius {
                layout: self.layout.clone(),
                radius,
            });
        }
        if counts.num_baselines == 0 {
            return Err(ConfigError::NoBaselinesInRadius {
                layout: self.layout.clone(),
                radius,
                num_ants: counts.num_ants,
            });
        }
        debug!(
            "restricting {} to {radius} m: {} antennas, {} baselines",
            self.layout, counts.num_ants, counts.num_baselines
        );
        self.num_ants = counts.num_ants;
        self.num_baselines = counts.num_baselines;
        self.max_radius = Some(radius);
        Ok(counts)
    }

    /// Replace the frequencies with `count` evenly spaced values from `start`
    /// to `end` inclusive. Every channel gets the spacing as its bandwidth.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoSamples`] if `count` is zero,
    /// [`ConfigError::BadRange`] if the bounds aren't positive, finite and
    /// ascending, or if a single channel would have no bandwidth.
    pub fn set_frequency_range(
        &mut self,
        start: f64,
        end: f64,
        count: usize,
    ) -> Result<(), ConfigError> {
        let bad_range = || ConfigError::BadRange {
            what: "frequency",
            start,
            end,
        };
        if !(start.is_finite() && end.is_finite() && start > 0.0 && end >= start) {
            return Err(bad_range());
        }
        let (freqs, step) = linspace("frequency", start, end, count)?;
        let step = if count == 1 { end - start } else { step };
        if step <= 0.0 {
            return Err(bad_range());
        }
        self.channel_bandwidths = vec![step; count];
        self.freqs = freqs;

        debug!("frequency and bandwidth list");
        for (i, freq, bandwidth) in izip!(0.., &self.freqs, &self.channel_bandwidths) {
            debug!("{i} {freq:e} {bandwidth:e}");
        }
        Ok(())
    }

    /// Replace the times (hour angles, radians) with `count` evenly spaced
    /// values from `start` to `end` inclusive. The range may run backwards.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoSamples`] if `count` is zero and
    /// [`ConfigError::BadRange`] if the bounds aren't finite.
    pub fn set_time_range(&mut self, start: f64, end: f64, count: usize) -> Result<(), ConfigError> {
        if !(start.is_finite() && end.is_finite()) {
            return Err(ConfigError::BadRange {
                what: "time",
                start,
                end,
            });
        }
        let (times, _) = linspace("time", start, end, count)?;
        self.times = times;

        debug!("list of the times (rad)");
        for (i, time) in self.times.iter().enumerate() {
            debug!("{i} {time:e}");
        }
        Ok(())
    }

    /// Record the receptor count reported when the block visibilities were
    /// synthesised.
    pub(crate) fn set_num_receptors(&mut self, num_receptors: usize) {
        self.num_receptors = Some(num_receptors);
    }

    /// Number of antennas.
    pub fn num_ants(&self) -> usize {
        self.num_ants
    }

    /// Number of unique cross-correlation baselines.
    pub fn num_baselines(&self) -> usize {
        self.num_baselines
    }

    /// Number of polarisations per visibility sample.
    pub fn num_pols(&self) -> usize {
        self.pol_frame.num_pols()
    }

    /// Number of receptors per antenna. Only known once visibilities have been
    /// synthesised.
    pub fn num_receptors(&self) -> Option<usize> {
        self.num_receptors
    }

    /// The radius restriction in effect, if any.
    pub fn max_radius(&self) -> Option<f64> {
        self.max_radius
    }

    /// Channel centre frequencies \[Hz\].
    pub fn freqs(&self) -> &[f64] {
        &self.freqs
    }

    /// Channel bandwidths \[Hz\], parallel to [`Self::freqs`].
    pub fn channel_bandwidths(&self) -> &[f64] {
        &self.channel_bandwidths
    }

    /// Sample times (hour angles) \[radians\].
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Number of frequency channels.
    pub fn num_chans(&self) -> usize {
        self.freqs.len()
    }

    /// Number of time samples.
    pub fn num_times(&self) -> usize {
        self.times.len()
    }

    /// Number of flat visibility records: baselines × channels × times.
    ///
    /// # Errors
    ///
    /// Will return [`AllocationError::Overflow`] if the count can't be
    /// represented.
    pub fn num_vis(&self) -> Result<usize, AllocationError> {
        checked_count(
            "visibility",
            &[self.num_baselines, self.num_chans(), self.num_times()],
        )
    }

    /// Number of block visibility records: antennas² × channels × times.
    ///
    /// # Errors
    ///
    /// As for [`Self::num_vis`].
    pub fn num_block_vis(&self) -> Result<usize, AllocationError> {
        checked_count(
            "block visibility",
            &[self.num_ants, self.num_ants, self.num_chans(), self.num_times()],
        )
    }
}

/// `count` evenly spaced values from `start` to `end` inclusive, and the step
/// between them (zero for a single value).
fn linspace(
    what: &'static str,
    start: f64,
    end: f64,
    count: usize,
) -> Result<(Vec<f64>, f64), ConfigError> {
    if count == 0 {
        return Err(ConfigError::NoSamples { what, count });
    }
    if count == 1 {
        return Ok((vec![start], 0.0));
    }
    let mut values = Array1::linspace(start, end, count);
    // rounding in the step must never lose the bound
    values[count - 1] = end;
    Ok((values.to_vec(), (end - start) / (count - 1) as f64))
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use approx::assert_abs_diff_eq;
    use float_cmp::{approx_eq, F64Margin};

    use super::*;
    use crate::test_common::get_config;

    #[test]
    fn test_antenna_counts_from_num_ants() {
        assert_eq!(AntennaCounts::from_num_ants(0).unwrap().num_baselines, 0);
        assert_eq!(AntennaCounts::from_num_ants(1).unwrap().num_baselines, 0);
        assert_eq!(AntennaCounts::from_num_ants(4).unwrap().num_baselines, 6);
        assert_eq!(AntennaCounts::from_num_ants(166).unwrap().num_baselines, 13695);
        assert!(matches!(
            AntennaCounts::from_num_ants(usize::MAX),
            Err(AllocationError::Overflow { .. })
        ));
    }

    #[test]
    fn test_new_rejects_non_parallel_channels() {
        let result = ObservationConfig::new(
            "TEST",
            AntennaCounts::from_num_ants(4).unwrap(),
            PolFrame::StokesI,
            vec![1e8, 2e8],
            vec![1e6],
            vec![0.0],
            RADec::from_degrees(0.0, 0.0),
        );
        assert!(matches!(
            result,
            Err(ConfigError::ChannelMismatch {
                freqs: 2,
                bandwidths: 1
            })
        ));
    }

    #[test]
    fn test_set_frequency_range() {
        let mut config = get_config();
        config.set_frequency_range(0.8e8, 1.2e8, 5).unwrap();

        let freqs = config.freqs();
        assert_eq!(freqs.len(), 5);
        assert_eq!(config.channel_bandwidths().len(), 5);
        assert!(approx_eq!(f64, freqs[0], 0.8e8, F64Margin::default()));
        assert!(approx_eq!(f64, freqs[4], 1.2e8, F64Margin::default()));
        for pair in freqs.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], 1e7, epsilon = 1e-6);
        }
        for &bandwidth in config.channel_bandwidths() {
            assert_abs_diff_eq!(bandwidth, 1e7, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_set_frequency_range_single_channel() {
        let mut config = get_config();
        config.set_frequency_range(1e8, 1.1e8, 1).unwrap();
        assert_eq!(config.freqs(), &[1e8]);
        assert_abs_diff_eq!(config.channel_bandwidths()[0], 1e7, epsilon = 1e-6);

        assert!(matches!(
            config.set_frequency_range(1e8, 1e8, 1),
            Err(ConfigError::BadRange { .. })
        ));
    }

    #[test]
    fn test_set_frequency_range_bad() {
        let mut config = get_config();
        assert!(matches!(
            config.set_frequency_range(1e8, 2e8, 0),
            Err(ConfigError::NoSamples { count: 0, .. })
        ));
        assert!(matches!(
            config.set_frequency_range(2e8, 1e8, 3),
            Err(ConfigError::BadRange { .. })
        ));
        assert!(matches!(
            config.set_frequency_range(-1.0, 1e8, 3),
            Err(ConfigError::BadRange { .. })
        ));
        // a failed call leaves the previous lists alone
        assert_eq!(config.freqs(), &[1e8]);
        assert_eq!(config.channel_bandwidths(), &[1e6]);
    }

    #[test]
    fn test_set_time_range() {
        let mut config = get_config();
        config.set_time_range(-PI / 3.0, PI / 3.0, 11).unwrap();

        let times = config.times();
        assert_eq!(times.len(), 11);
        assert_abs_diff_eq!(times[0], -PI / 3.0);
        assert_abs_diff_eq!(times[10], PI / 3.0);
        assert_abs_diff_eq!(times[5], 0.0, epsilon = 1e-12);
        let step = times[1] - times[0];
        for pair in times.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], step, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_derived_counts() {
        let mut config = get_config();
        config.set_frequency_range(0.8e8, 1.2e8, 5).unwrap();
        config.set_time_range(-1.0, 1.0, 11).unwrap();
        assert_eq!(config.num_vis().unwrap(), 6 * 5 * 11);
        assert_eq!(config.num_block_vis().unwrap(), 16 * 5 * 11);
        assert_eq!(config.num_pols(), 4);
        assert_eq!(config.num_receptors(), None);
    }

    #[test]
    fn test_derived_counts_overflow() {
        let config = ObservationConfig::new(
            "TEST",
            AntennaCounts {
                num_ants: usize::MAX / 2,
                num_baselines: usize::MAX / 2,
            },
            PolFrame::StokesI,
            vec![1e8; 5],
            vec![1e6; 5],
            vec![0.0; 11],
            RADec::from_degrees(0.0, 0.0),
        )
        .unwrap();
        assert!(matches!(
            config.num_vis(),
            Err(AllocationError::Overflow { .. })
        ));
        assert!(matches!(
            config.num_block_vis(),
            Err(AllocationError::Overflow { .. })
        ));
    }

    #[test]
    fn test_set_time_range_backwards() {
        let mut config = get_config();
        config.set_time_range(1.0, -1.0, 5).unwrap();
        assert_eq!(config.times().len(), 5);
        assert_abs_diff_eq!(config.times()[0], 1.0);
        assert_abs_diff_eq!(config.times()[2], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(config.times()[4], -1.0);

        assert!(matches!(
            config.set_time_range(f64::NAN, 1.0, 5),
            Err(ConfigError::BadRange { .. })
        ));
    }

    #[test]
    fn test_linspace_pins_bounds() {
        // a step that doesn't divide the range exactly
        let (values, step) = linspace("frequency", 0.1, 0.7, 7).unwrap();
        assert_eq!(values.len(), 7);
        assert_eq!(values[0], 0.1);
        assert_eq!(values[6], 0.7);
        assert_abs_diff_eq!(step, 0.1, epsilon = 1e-12);
        for pair in values.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], step, epsilon = 1e-12);
        }

        let (values, step) = linspace("time", 2.0, 5.0, 1).unwrap();
        assert_eq!(values, [2.0]);
        assert_eq!(step, 0.0);

        assert!(matches!(
            linspace("time", 0.0, 1.0, 0),
            Err(ConfigError::NoSamples { what: "time", count: 0 })
        ));
    }

    #[test]
    fn test_pol_frame_round_trip_labels() {
        for frame in [
            PolFrame::StokesI,
            PolFrame::StokesIQUV,
            PolFrame::Linear,
            PolFrame::Circular,
        ] {
            assert_eq!(frame.label().parse::<PolFrame>().unwrap(), frame);
        }
        assert!(matches!(
            "stokesV".parse::<PolFrame>(),
            Err(ConfigError::UnknownPolFrame(_))
        ));
    }
}
