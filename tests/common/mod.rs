//! A deterministic stand-in for the numerical collaborator.

#![allow(dead_code)]

use std::cell::RefCell;

use itertools::iproduct;

use ical::{
    c64,
    io::{write_image_fits, ExportMeta},
    AdviceRequest, AntennaCounts, BlockVisibility, ConfigError, ExportError, ExportTarget,
    ExternalCallError, GainTable, IcalContextBuilder, Image, ImageShape, IndexBuffer,
    ObservationConfig, PolFrame, Processor, RADec, VisSample, Visibility, WideFieldAdvice,
};

pub const TEST_LAYOUT: &str = "LOWBD2-CORE";

/// Antennas of the test layout are spaced this far apart along a line out of
/// the array centre \[metres\].
pub const ANTENNA_SPACING_M: f64 = 100.0;

/// Builder for a quiet run of the reference observation into `output_dir`.
pub fn get_context_builder() -> IcalContextBuilder {
    let mut builder = IcalContextBuilder::default();
    builder.draw_progress(false);
    builder
}

#[derive(Debug, Default)]
pub struct FakeProcessor {
    /// Total number of antennas in the layout
    pub num_ants: usize,
    /// The collaborator function that should fail
    pub fail_at: Option<&'static str>,
    /// Whether predict should leave the index buffer untouched
    pub skip_index: bool,
    /// Product names whose export should fail
    pub fail_exports: Vec<&'static str>,
    /// Whether image shapes should have no pixels
    pub zero_image: bool,
    /// Every collaborator function called, in order
    pub calls: RefCell<Vec<&'static str>>,
}

impl FakeProcessor {
    pub fn new(num_ants: usize) -> Self {
        Self {
            num_ants,
            ..Default::default()
        }
    }

    pub fn failing_at(num_ants: usize, function: &'static str) -> Self {
        Self {
            fail_at: Some(function),
            ..Self::new(num_ants)
        }
    }

    fn call(&self, function: &'static str) -> Result<(), ExternalCallError> {
        self.calls.borrow_mut().push(function);
        if self.fail_at == Some(function) {
            return Err(ExternalCallError::new(function, 1, "injected failure"));
        }
        Ok(())
    }

    fn antenna_radius(ant: usize) -> f64 {
        ant as f64 * ANTENNA_SPACING_M
    }

    /// The gain of receptor 0 of `ant`.
    fn gain(gaintable: &GainTable, time: usize, ant: usize, chan: usize) -> c64 {
        gaintable.gains()[[time, ant, chan, 0, 0]]
    }
}

/// Fill every pixel of every channel and polarisation with `f(chan)` at the
/// centre and zero elsewhere.
fn fill_centre(image: &mut Image, f: impl Fn(usize) -> f64) {
    let shape = image.shape();
    let (cy, cx) = (shape.ny() / 2, shape.nx() / 2);
    let pixels = image.pixels_mut();
    pixels.fill(0.0);
    for chan in 0..shape.nchan() {
        for pol in 0..shape.npol() {
            pixels[[chan, pol, cy, cx]] = f(chan);
        }
    }
}

fn centre(image: &Image) -> f64 {
    let shape = image.shape();
    image.pixels()[[0, 0, shape.ny() / 2, shape.nx() / 2]]
}

impl Processor for FakeProcessor {
    fn initialize(&self) -> Result<(), ExternalCallError> {
        self.call("initialize")
    }

    fn default_config(&self, layout: &str) -> Result<ObservationConfig, ConfigError> {
        if layout != TEST_LAYOUT {
            return Err(ConfigError::UnknownLayout {
                name: layout.to_string(),
            });
        }
        self.call("default_config")?;
        ObservationConfig::new(
            layout,
            AntennaCounts::from_num_ants(self.num_ants)?,
            PolFrame::StokesI,
            vec![1.5e8],
            vec![1e6],
            vec![0.0],
            RADec::new(0.0, 0.0),
        )
    }

    fn restricted_counts(&self, layout: &str, radius: f64) -> Result<AntennaCounts, ConfigError> {
        if layout != TEST_LAYOUT {
            return Err(ConfigError::UnknownLayout {
                name: layout.to_string(),
            });
        }
        self.call("restricted_counts")?;
        let num_ants = (0..self.num_ants)
            .filter(|&ant| Self::antenna_radius(ant) <= radius)
            .count();
        Ok(AntennaCounts::from_num_ants(num_ants)?)
    }

    fn create_blockvisibility(
        &self,
        _config: &ObservationConfig,
        bvis: &mut BlockVisibility,
    ) -> Result<usize, ExternalCallError> {
        self.call("create_blockvisibility")?;
        for record in 0..bvis.nvis() {
            for pol in 0..bvis.npol() {
                bvis.set_sample(
                    record,
                    pol,
                    VisSample {
                        vis: c64::new(1.0, 0.0),
                        weight: 1.0,
                        imaging_weight: 1.0,
                    },
                )
                .map_err(|e| ExternalCallError::new("create_blockvisibility", 2, e.to_string()))?;
            }
        }
        Ok(2)
    }

    fn advise_wide_field(
        &self,
        _config: &ObservationConfig,
        _bvis: &BlockVisibility,
        request: &AdviceRequest,
    ) -> Result<WideFieldAdvice, ExternalCallError> {
        self.call("advise_wide_field")?;
        Ok(WideFieldAdvice {
            vis_slices: request.wprojection_planes,
            npixel: 16,
            cellsize: 1e-3,
        })
    }

    fn image_shape_multifreq(
        &self,
        config: &ObservationConfig,
        _cellsize: f64,
        npixel: usize,
    ) -> Result<ImageShape, ExternalCallError> {
        self.call("image_shape_multifreq")?;
        let npixel = if self.zero_image { 0 } else { npixel };
        Ok(ImageShape([config.num_chans(), config.num_pols(), npixel, npixel]))
    }

    fn create_low_test_image_from_gleam(
        &self,
        _config: &ObservationConfig,
        _cellsize: f64,
        _npixel: usize,
        _phase_centre: RADec,
        model: &mut Image,
    ) -> Result<(), ExternalCallError> {
        self.call("create_low_test_image_from_gleam")?;
        fill_centre(model, |chan| 1.0 + chan as f64);
        Ok(())
    }

    fn predict(
        &self,
        _config: &ObservationConfig,
        _bvis: &BlockVisibility,
        model: &Image,
        vis_out: &mut Visibility,
        bvis_out: &mut BlockVisibility,
        index: &mut IndexBuffer,
    ) -> Result<(), ExternalCallError> {
        self.call("predict")?;
        let flux = centre(model);
        let err = |e: ical::IcalError| ExternalCallError::new("predict", 2, e.to_string());
        let mut flat = 0;
        for time in 0..bvis_out.ntimes() {
            for ant1 in 0..bvis_out.nants() {
                for ant2 in (ant1 + 1)..bvis_out.nants() {
                    for chan in 0..bvis_out.nchan() {
                        let block = bvis_out
                            .record_index(time, ant1, ant2, chan)
                            .ok_or_else(|| ExternalCallError::new("predict", 3, "out of range"))?;
                        for pol in 0..vis_out.npol() {
                            let sample = VisSample {
                                vis: c64::new(flux, (ant2 - ant1) as f64 * 0.01),
                                weight: 1.0,
                                imaging_weight: 1.0,
                            };
                            vis_out.set_sample(flat, pol, sample).map_err(err)?;
                            bvis_out.set_sample(block, pol, sample).map_err(err)?;
                        }
                        if !self.skip_index {
                            index.as_mut_slice()[block] = flat as i64;
                        }
                        flat += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn convert_visibility_to_blockvisibility(
        &self,
        _config: &ObservationConfig,
        vis: &Visibility,
        _template: &BlockVisibility,
        index: &IndexBuffer,
        bvis_out: &mut BlockVisibility,
    ) -> Result<(), ExternalCallError> {
        self.call("convert_visibility_to_blockvisibility")?;
        for (block, &flat) in index.as_slice().iter().enumerate() {
            let flat = match usize::try_from(flat) {
                Ok(flat) => flat,
                // unmatched block records keep zero weight
                Err(_) => continue,
            };
            for pol in 0..vis.npol() {
                let sample = vis
                    .sample(flat, pol)
                    .ok_or_else(|| ExternalCallError::new("convert", 3, "flat out of range"))?;
                bvis_out
                    .set_sample(block, pol, sample)
                    .map_err(|e| ExternalCallError::new("convert", 2, e.to_string()))?;
            }
        }
        Ok(())
    }

    fn create_gaintable_from_blockvisibility(
        &self,
        _config: &ObservationConfig,
        _bvis: &BlockVisibility,
        gaintable: &mut GainTable,
    ) -> Result<(), ExternalCallError> {
        self.call("create_gaintable_from_blockvisibility")?;
        for ((_, _, _, r1, r2), gain) in gaintable.gains_mut().indexed_iter_mut() {
            *gain = if r1 == r2 {
                c64::new(1.0, 0.0)
            } else {
                c64::new(0.0, 0.0)
            };
        }
        gaintable.weights_mut().fill(1.0);
        Ok(())
    }

    fn simulate_gaintable(
        &self,
        _config: &ObservationConfig,
        gaintable: &mut GainTable,
    ) -> Result<(), ExternalCallError> {
        self.call("simulate_gaintable")?;
        for ((_, ant, _, r1, r2), gain) in gaintable.gains_mut().indexed_iter_mut() {
            if r1 == r2 {
                *gain *= c64::from_polar(1.0, 0.1 * ant as f64);
            }
        }
        Ok(())
    }

    fn apply_gaintable(
        &self,
        _config: &ObservationConfig,
        bvis: &BlockVisibility,
        gaintable: &GainTable,
        bvis_out: &mut BlockVisibility,
    ) -> Result<(), ExternalCallError> {
        self.call("apply_gaintable")?;
        let (ntimes, nants, nchan) = (bvis.ntimes(), bvis.nants(), bvis.nchan());
        for (time, ant1, ant2, chan) in iproduct!(0..ntimes, 0..nants, 0..nants, 0..nchan) {
            let record = bvis
                .record_index(time, ant1, ant2, chan)
                .ok_or_else(|| ExternalCallError::new("apply", 3, "out of range"))?;
            let g1 = Self::gain(gaintable, time, ant1, chan);
            let g2 = Self::gain(gaintable, time, ant2, chan);
            for pol in 0..bvis.npol() {
                let mut sample = bvis
                    .sample(record, pol)
                    .ok_or_else(|| ExternalCallError::new("apply", 3, "out of range"))?;
                sample.vis = g1 * sample.vis * g2.conj();
                bvis_out
                    .set_sample(record, pol, sample)
                    .map_err(|e| ExternalCallError::new("apply", 2, e.to_string()))?;
            }
        }
        Ok(())
    }

    fn create_image_from_blockvisibility(
        &self,
        _config: &ObservationConfig,
        _bvis: &BlockVisibility,
        _cellsize: f64,
        _npixel: usize,
        _phase_centre: RADec,
        model: &mut Image,
    ) -> Result<(), ExternalCallError> {
        self.call("create_image_from_blockvisibility")?;
        model.pixels_mut().fill(0.0);
        Ok(())
    }

    fn invert(
        &self,
        _config: &ObservationConfig,
        vis: &Visibility,
        _model: &Image,
        _vis_slices: usize,
        dirty: &mut Image,
    ) -> Result<(), ExternalCallError> {
        self.call("invert")?;
        let mean = vis.samples().map(|s| s.vis.re).sum::<f64>() / (vis.nvis() * vis.npol()) as f64;
        fill_centre(dirty, |_| mean);
        Ok(())
    }

    fn ical(
        &self,
        _config: &ObservationConfig,
        bvis: &BlockVisibility,
        model: &Image,
        _vis_slices: usize,
        deconvolved: &mut Image,
        residual: &mut Image,
        restored: &mut Image,
    ) -> Result<(), ExternalCallError> {
        self.call("ical")?;
        let peak = bvis.qa().maxabs;
        let base = centre(model);
        fill_centre(deconvolved, |_| base + peak);
        residual.pixels_mut().fill(peak * 1e-3);
        fill_centre(restored, |_| base + peak);
        Ok(())
    }

    fn export_image(
        &self,
        image: &Image,
        target: &ExportTarget,
        meta: &ExportMeta<'_>,
    ) -> Result<(), ExportError> {
        self.calls.borrow_mut().push("export_image");
        let stem = target
            .path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if self.fail_exports.iter().any(|&name| name == stem) {
            return Err(ExportError::InvalidTarget {
                target: target.to_string(),
            });
        }
        write_image_fits(image, target, meta)
    }
}
