//! The ICAL pipeline: configure, synthesise, advise, model, predict, convert,
//! solve and apply gains, rebuild the model, invert, deconvolve and export.
//!
//! Each stage is its own type and each transition consumes the previous stage,
//! so stages can only run in order and every buffer has exactly one owner. A
//! buffer is dropped, and its release recorded in the run's
//! [`BufferLedger`], as soon as the stage that last reads it has finished. An
//! error at any stage drops everything still held.
//!
//! Calling a stage out of order doesn't compile:
//!
//! ```compile_fail
//! use ical::{pipeline::Synthesized, Processor};
//!
//! fn convert_before_predict<P: Processor>(synthesized: Synthesized<'_, P>) {
//!     let _ = synthesized.convert();
//! }
//! ```

use std::{
    f64::consts::PI,
    fmt::Display,
    path::{Path, PathBuf},
};

use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, trace, warn};

use crate::{
    buffers::{
        AllocationError, BlockVisibility, BufferAllocator, BufferLedger, GainTable, Image,
        ImageShape, IndexBuffer, Visibility,
    },
    config::{ConfigError, ObservationConfig, PolFrame},
    constants::{
        DEFAULT_FREQ_END_HZ, DEFAULT_FREQ_START_HZ, DEFAULT_LAYOUT, DEFAULT_MAX_RADIUS_M,
        DEFAULT_NUM_FREQS, DEFAULT_NUM_TIMES, DEFAULT_OUTPUT_DIR, DEFAULT_PHASE_CENTRE_DEC_DEG,
        DEFAULT_PHASE_CENTRE_RA_DEG, VIS_BYTES_PER_POL_SAMPLE, VIS_HEADER_BYTES,
    },
    error::IcalError,
    io::{ExportError, ExportMeta, ExportTarget},
    marlu::RADec,
    processor::{AdviceRequest, Processor, WideFieldAdvice},
    with_increment_duration,
};

/// The stages of the pipeline, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Simulate block visibilities
    Synthesize,
    /// Ask for imaging parameters
    Advise,
    /// Make the GLEAM sky model
    BuildModel,
    /// Predict visibilities of the sky model
    Predict,
    /// Convert predicted visibilities to block form
    Convert,
    /// Solve for and simulate gains
    SolveGains,
    /// Apply the gains
    ApplyGains,
    /// Make the single channel model image
    RebuildModel,
    /// Make the dirty image
    Invert,
    /// Self-calibrate and deconvolve
    Deconvolve,
    /// Write the image products
    Export,
}

impl Stage {
    /// Every stage, in order.
    pub const ALL: [Stage; 11] = [
        Stage::Synthesize,
        Stage::Advise,
        Stage::BuildModel,
        Stage::Predict,
        Stage::Convert,
        Stage::SolveGains,
        Stage::ApplyGains,
        Stage::RebuildModel,
        Stage::Invert,
        Stage::Deconvolve,
        Stage::Export,
    ];

    /// A short name for progress and timing.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Synthesize => "synthesize",
            Stage::Advise => "advise",
            Stage::BuildModel => "build_model",
            Stage::Predict => "predict",
            Stage::Convert => "convert",
            Stage::SolveGains => "solve_gains",
            Stage::ApplyGains => "apply_gains",
            Stage::RebuildModel => "rebuild_model",
            Stage::Invert => "invert",
            Stage::Deconvolve => "deconvolve",
            Stage::Export => "export",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What every stage carries: the collaborator, the allocator and the
/// configuration.
struct Run<'p, P: ?Sized> {
    processor: &'p P,
    allocator: BufferAllocator,
    config: ObservationConfig,
}

impl<P: Processor + ?Sized> Run<'_, P> {
    /// A block buffer sized by the configuration, its header filled with
    /// everything known so far.
    fn allocate_block(&self) -> Result<BlockVisibility, AllocationError> {
        let config = &self.config;
        let mut bvis = self.allocator.allocate_block_visibility(
            config.num_ants(),
            config.num_chans(),
            config.num_pols(),
            config.num_times(),
        )?;
        bvis.set_phase_centre(config.phase_centre);
        if let Some(nrec) = config.num_receptors() {
            bvis.set_num_receptors(nrec);
        }
        Ok(bvis)
    }
}

/// A configured observation, nothing allocated yet.
pub struct Configured<'p, P: ?Sized> {
    run: Run<'p, P>,
}

impl<'p, P: Processor + ?Sized> Configured<'p, P> {
    /// Start a pipeline. The counts of `config` must already reflect any
    /// radius restriction.
    pub fn new(processor: &'p P, allocator: BufferAllocator, config: ObservationConfig) -> Self {
        Self {
            run: Run {
                processor,
                allocator,
                config,
            },
        }
    }

    /// The configuration of the run.
    pub fn config(&self) -> &ObservationConfig {
        &self.run.config
    }

    /// Simulate the block visibilities, then allocate the gain table now that
    /// the receptor count is known.
    ///
    /// # Errors
    ///
    /// Allocation or collaborator failure.
    pub fn synthesize(self) -> Result<Synthesized<'p, P>, IcalError> {
        trace!("start synthesize");
        let mut run = self.run;
        let mut bvis = run.allocate_block()?;
        let nrec = run
            .processor
            .create_blockvisibility(&run.config, &mut bvis)?;
        info!("Nrec = {nrec}");
        run.config.set_num_receptors(nrec);
        bvis.set_num_receptors(nrec);
        info!("synthesized block visibilities: {}", bvis.qa());

        let config = &run.config;
        let gaintable = run.allocator.allocate_gaintable(
            config.num_ants(),
            config.num_chans(),
            nrec,
            config.num_times(),
        )?;
        trace!("end synthesize");
        Ok(Synthesized {
            run,
            bvis,
            gaintable,
        })
    }
}

/// Block visibilities have been simulated.
pub struct Synthesized<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis: BlockVisibility,
    gaintable: GainTable,
}

impl<'p, P: Processor + ?Sized> Synthesized<'p, P> {
    /// The simulated block visibilities.
    pub fn block_visibility(&self) -> &BlockVisibility {
        &self.bvis
    }

    /// The configuration, receptor count included.
    pub fn config(&self) -> &ObservationConfig {
        &self.run.config
    }

    /// Ask for wide-field imaging parameters.
    ///
    /// # Errors
    ///
    /// Collaborator failure, or advice that can't size an image.
    pub fn advise(self, request: &AdviceRequest) -> Result<Advised<'p, P>, IcalError> {
        trace!("start advise({request:?})");
        let advice = self
            .run
            .processor
            .advise_wide_field(&self.run.config, &self.bvis, request)?
            .validate()?;
        Ok(Advised {
            run: self.run,
            bvis: self.bvis,
            gaintable: self.gaintable,
            advice,
        })
    }
}

/// Imaging parameters are known.
pub struct Advised<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis: BlockVisibility,
    gaintable: GainTable,
    advice: WideFieldAdvice,
}

impl<'p, P: Processor + ?Sized> Advised<'p, P> {
    /// The advised imaging parameters.
    pub fn advice(&self) -> WideFieldAdvice {
        self.advice
    }

    /// Make the multi-frequency GLEAM sky model.
    ///
    /// # Errors
    ///
    /// Allocation or collaborator failure.
    pub fn build_model(self) -> Result<ModelBuilt<'p, P>, IcalError> {
        trace!("start build_model");
        let Self {
            run,
            bvis,
            gaintable,
            advice,
        } = self;
        let shape = run
            .processor
            .image_shape_multifreq(&run.config, advice.cellsize, advice.npixel)?;
        info!("A shape of the modeled GLEAM image: {shape}");
        let mut gleam_model = run.allocator.allocate_image(shape)?;
        gleam_model.set_cellsize(advice.cellsize);
        gleam_model.set_phase_centre(bvis.phase_centre());
        run.processor.create_low_test_image_from_gleam(
            &run.config,
            advice.cellsize,
            advice.npixel,
            bvis.phase_centre(),
            &mut gleam_model,
        )?;
        Ok(ModelBuilt {
            run,
            bvis,
            gaintable,
            advice,
            shape,
            gleam_model,
        })
    }
}

/// The GLEAM sky model has been made.
pub struct ModelBuilt<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis: BlockVisibility,
    gaintable: GainTable,
    advice: WideFieldAdvice,
    shape: ImageShape,
    gleam_model: Image,
}

impl<'p, P: Processor + ?Sized> ModelBuilt<'p, P> {
    /// The GLEAM sky model.
    pub fn gleam_model(&self) -> &Image {
        &self.gleam_model
    }

    /// Predict visibilities of the sky model, in both flat and block form,
    /// along with the flat-to-block index.
    ///
    /// # Errors
    ///
    /// Allocation or collaborator failure.
    pub fn predict(self) -> Result<Predicted<'p, P>, IcalError> {
        trace!("start predict");
        let config = &self.run.config;
        let mut vis_predicted = self
            .run
            .allocator
            .allocate_visibility(config.num_pols(), config.num_vis()?)?;
        vis_predicted.set_phase_centre(config.phase_centre);
        let mut bvis_predicted = self.run.allocate_block()?;
        let mut index = self.run.allocator.allocate_index_buffer(
            config.num_times(),
            config.num_ants(),
            config.num_chans(),
        )?;
        self.run.processor.predict(
            config,
            &self.bvis,
            &self.gleam_model,
            &mut vis_predicted,
            &mut bvis_predicted,
            &mut index,
        )?;
        info!("predicted visibilities: {}", vis_predicted.qa());
        Ok(Predicted {
            run: self.run,
            bvis: self.bvis,
            gaintable: self.gaintable,
            advice: self.advice,
            shape: self.shape,
            gleam_model: self.gleam_model,
            vis_predicted,
            bvis_predicted,
            index,
        })
    }
}

/// Visibilities of the sky model have been predicted.
///
/// Only a predicted run can be converted:
///
/// ```compile_fail
/// use ical::{pipeline::ModelBuilt, Processor};
///
/// fn convert_without_prediction<P: Processor>(model_built: ModelBuilt<'_, P>) {
///     let _ = model_built.convert();
/// }
/// ```
pub struct Predicted<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis: BlockVisibility,
    gaintable: GainTable,
    advice: WideFieldAdvice,
    shape: ImageShape,
    gleam_model: Image,
    vis_predicted: Visibility,
    bvis_predicted: BlockVisibility,
    index: IndexBuffer,
}

impl<'p, P: Processor + ?Sized> Predicted<'p, P> {
    /// The predicted flat visibilities.
    pub fn predicted_visibility(&self) -> &Visibility {
        &self.vis_predicted
    }

    /// Scatter the predicted flat visibilities into a new block buffer, which
    /// replaces the synthesised one.
    ///
    /// # Errors
    ///
    /// [`IcalError::BadIndexBuffer`] if the index from prediction doesn't map
    /// every flat record to its own block record, otherwise allocation or
    /// collaborator failure.
    pub fn convert(self) -> Result<Converted<'p, P>, IcalError> {
        trace!("start convert");
        self.index.check_mapping(self.vis_predicted.nvis())?;
        let mut bvis = self.run.allocate_block()?;
        self.run.processor.convert_visibility_to_blockvisibility(
            &self.run.config,
            &self.vis_predicted,
            &self.bvis_predicted,
            &self.index,
            &mut bvis,
        )?;
        info!("converted block visibilities: {}", bvis.qa());
        // the synthesised and predicted block buffers and the index are done
        // with here and drop with `self`.
        Ok(Converted {
            run: self.run,
            bvis,
            gaintable: self.gaintable,
            advice: self.advice,
            shape: self.shape,
            gleam_model: self.gleam_model,
            vis_predicted: self.vis_predicted,
        })
    }
}

/// The predicted visibilities are in block form.
pub struct Converted<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis: BlockVisibility,
    gaintable: GainTable,
    advice: WideFieldAdvice,
    shape: ImageShape,
    gleam_model: Image,
    vis_predicted: Visibility,
}

impl<'p, P: Processor + ?Sized> Converted<'p, P> {
    /// The converted block visibilities.
    pub fn block_visibility(&self) -> &BlockVisibility {
        &self.bvis
    }

    /// Initialise the gain table from the block visibilities, then fill it
    /// with simulated gains.
    ///
    /// # Errors
    ///
    /// Collaborator failure.
    pub fn solve_gains(mut self) -> Result<GainSolved<'p, P>, IcalError> {
        trace!("start solve_gains");
        let processor = self.run.processor;
        processor.create_gaintable_from_blockvisibility(
            &self.run.config,
            &self.bvis,
            &mut self.gaintable,
        )?;
        processor.simulate_gaintable(&self.run.config, &mut self.gaintable)?;
        Ok(GainSolved {
            run: self.run,
            bvis: self.bvis,
            gaintable: self.gaintable,
            advice: self.advice,
            shape: self.shape,
            gleam_model: self.gleam_model,
            vis_predicted: self.vis_predicted,
        })
    }
}

/// The gain table holds simulated gains.
pub struct GainSolved<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis: BlockVisibility,
    gaintable: GainTable,
    advice: WideFieldAdvice,
    shape: ImageShape,
    gleam_model: Image,
    vis_predicted: Visibility,
}

impl<'p, P: Processor + ?Sized> GainSolved<'p, P> {
    /// The gain table.
    pub fn gaintable(&self) -> &GainTable {
        &self.gaintable
    }

    /// The block visibilities the gains will be applied to.
    pub fn block_visibility(&self) -> &BlockVisibility {
        &self.bvis
    }

    /// Write the block visibilities corrupted by the gains into a new buffer,
    /// leaving the input untouched.
    ///
    /// # Errors
    ///
    /// Allocation or collaborator failure.
    pub fn apply_gains(self) -> Result<GainApplied<'p, P>, IcalError> {
        trace!("start apply_gains");
        let mut bvis_gt = self.run.allocate_block()?;
        self.run
            .processor
            .apply_gaintable(&self.run.config, &self.bvis, &self.gaintable, &mut bvis_gt)?;
        info!("gain-applied block visibilities: {}", bvis_gt.qa());
        // last read of the gain table
        drop(self.gaintable);
        Ok(GainApplied {
            run: self.run,
            bvis: self.bvis,
            bvis_gt,
            advice: self.advice,
            shape: self.shape,
            gleam_model: self.gleam_model,
            vis_predicted: self.vis_predicted,
        })
    }
}

/// Gains have been applied.
pub struct GainApplied<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis: BlockVisibility,
    bvis_gt: BlockVisibility,
    advice: WideFieldAdvice,
    shape: ImageShape,
    gleam_model: Image,
    vis_predicted: Visibility,
}

impl<'p, P: Processor + ?Sized> GainApplied<'p, P> {
    /// The block visibilities before gains were applied.
    pub fn block_visibility(&self) -> &BlockVisibility {
        &self.bvis
    }

    /// The block visibilities with gains applied.
    pub fn gain_applied_visibility(&self) -> &BlockVisibility {
        &self.bvis_gt
    }

    /// Make a single channel model image from the block visibilities.
    ///
    /// # Errors
    ///
    /// Allocation or collaborator failure.
    pub fn rebuild_model(self) -> Result<ModelRebuilt<'p, P>, IcalError> {
        trace!("start rebuild_model");
        let Self {
            run,
            bvis,
            bvis_gt,
            advice,
            shape,
            gleam_model,
            vis_predicted,
        } = self;
        let shape = shape.with_channels(1);
        let mut model = run.allocator.allocate_image(shape)?;
        model.set_cellsize(advice.cellsize);
        model.set_phase_centre(bvis.phase_centre());
        run.processor.create_image_from_blockvisibility(
            &run.config,
            &bvis,
            advice.cellsize,
            advice.npixel,
            bvis.phase_centre(),
            &mut model,
        )?;
        // last read of the converted block visibilities
        drop(bvis);
        Ok(ModelRebuilt {
            run,
            bvis_gt,
            advice,
            gleam_model,
            model,
            vis_predicted,
        })
    }
}

/// The single channel model image has been made.
pub struct ModelRebuilt<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis_gt: BlockVisibility,
    advice: WideFieldAdvice,
    gleam_model: Image,
    model: Image,
    vis_predicted: Visibility,
}

impl<'p, P: Processor + ?Sized> ModelRebuilt<'p, P> {
    /// The single channel model image.
    pub fn model(&self) -> &Image {
        &self.model
    }

    /// Make the dirty image of the predicted visibilities.
    ///
    /// # Errors
    ///
    /// Allocation or collaborator failure.
    pub fn invert(self) -> Result<Inverted<'p, P>, IcalError> {
        trace!("start invert");
        let mut dirty = self.run.allocator.allocate_image(self.model.shape())?;
        dirty.set_cellsize(self.model.cellsize());
        dirty.set_phase_centre(self.model.phase_centre());
        self.run.processor.invert(
            &self.run.config,
            &self.vis_predicted,
            &self.model,
            self.advice.vis_slices,
            &mut dirty,
        )?;
        // last read of the predicted flat visibilities
        drop(self.vis_predicted);
        Ok(Inverted {
            run: self.run,
            bvis_gt: self.bvis_gt,
            advice: self.advice,
            gleam_model: self.gleam_model,
            model: self.model,
            dirty,
        })
    }
}

/// The dirty image has been made.
pub struct Inverted<'p, P: ?Sized> {
    run: Run<'p, P>,
    bvis_gt: BlockVisibility,
    advice: WideFieldAdvice,
    gleam_model: Image,
    model: Image,
    dirty: Image,
}

impl<'p, P: Processor + ?Sized> Inverted<'p, P> {
    /// The dirty image.
    pub fn dirty(&self) -> &Image {
        &self.dirty
    }

    /// Self-calibrate and deconvolve the gain-applied visibilities. Called
    /// exactly once, any failure ends the run.
    ///
    /// # Errors
    ///
    /// Allocation or collaborator failure.
    pub fn deconvolve(self) -> Result<Deconvolved<'p, P>, IcalError> {
        trace!("start deconvolve");
        let allocate = || -> Result<Image, AllocationError> {
            let mut image = self.run.allocator.allocate_image(self.model.shape())?;
            image.set_cellsize(self.model.cellsize());
            image.set_phase_centre(self.model.phase_centre());
            Ok(image)
        };
        let mut deconvolved = allocate()?;
        let mut residual = allocate()?;
        let mut restored = allocate()?;
        self.run.processor.ical(
            &self.run.config,
            &self.bvis_gt,
            &self.model,
            self.advice.vis_slices,
            &mut deconvolved,
            &mut residual,
            &mut restored,
        )?;
        // the remaining visibilities and the model image are done with
        drop(self.bvis_gt);
        drop(self.model);
        Ok(Deconvolved {
            run: self.run,
            advice: self.advice,
            gleam_model: self.gleam_model,
            dirty: self.dirty,
            deconvolved,
            residual,
            restored,
        })
    }
}

/// The image products are ready.
pub struct Deconvolved<'p, P: ?Sized> {
    run: Run<'p, P>,
    advice: WideFieldAdvice,
    gleam_model: Image,
    dirty: Image,
    deconvolved: Image,
    residual: Image,
    restored: Image,
}

/// The outcome of exporting one image product.
#[derive(Debug)]
pub struct ExportRecord {
    /// The product name, also the file stem
    pub name: &'static str,
    /// Where it was written
    pub target: ExportTarget,
    /// Whether it was written
    pub result: Result<(), ExportError>,
}

/// The outcome of a completed run.
#[derive(Debug)]
pub struct ExportReport {
    /// The configuration the run used
    pub config: ObservationConfig,
    /// The imaging parameters the run used
    pub advice: WideFieldAdvice,
    /// One record per product, in export order
    pub products: Vec<ExportRecord>,
}

impl ExportReport {
    /// Whether every product was written.
    pub fn is_success(&self) -> bool {
        self.products.iter().all(|p| p.result.is_ok())
    }

    /// The products that couldn't be written.
    pub fn failures(&self) -> impl Iterator<Item = &ExportRecord> {
        self.products.iter().filter(|p| p.result.is_err())
    }
}

impl<'p, P: Processor + ?Sized> Deconvolved<'p, P> {
    /// The products in export order with their names.
    pub fn products(&self) -> [(&'static str, &Image); 5] {
        [
            ("gleam_model", &self.gleam_model),
            ("dirty", &self.dirty),
            ("deconvolved", &self.deconvolved),
            ("residual", &self.residual),
            ("restored", &self.restored),
        ]
    }

    /// Write every product to `<dir>/<name>.fits`, replacing existing files.
    /// A failed export is recorded and the remaining products are still
    /// attempted.
    pub fn export(self, dir: &Path, comment: &str) -> ExportReport {
        trace!("start export({})", dir.display());
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("couldn't create {}: {e}", dir.display());
        }
        let meta = ExportMeta::from_config(&self.run.config, comment);
        let products = self
            .products()
            .into_iter()
            .map(|(name, image)| {
                debug!("{name} {}: {}", image.shape(), image.qa());
                let target = ExportTarget::new(dir.join(format!("{name}.fits")), true);
                let result = self.run.processor.export_image(image, &target, &meta);
                match &result {
                    Ok(()) => info!("exported {name} to {target}"),
                    Err(e) => warn!("failed to export {name} to {target}: {e}"),
                }
                ExportRecord {
                    name,
                    target,
                    result,
                }
            })
            .collect();
        ExportReport {
            config: self.run.config,
            advice: self.advice,
            products,
        }
    }
}

/// Options for an ICAL run.
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct IcalContext {
    /// The array layout name
    #[builder(default = "DEFAULT_LAYOUT.to_string()", setter(into))]
    pub layout: String,
    /// Only antennas within this distance of the array centre are used
    /// \[metres\]
    #[builder(default = "DEFAULT_MAX_RADIUS_M")]
    pub max_radius: f64,
    /// The phase centre
    #[builder(
        default = "RADec::from_degrees(DEFAULT_PHASE_CENTRE_RA_DEG, DEFAULT_PHASE_CENTRE_DEC_DEG)"
    )]
    pub phase_centre: RADec,
    /// The polarisation frame
    #[builder(default)]
    pub pol_frame: PolFrame,

    /// First and last channel frequencies \[Hz\]
    #[builder(default = "(DEFAULT_FREQ_START_HZ, DEFAULT_FREQ_END_HZ)")]
    pub freq_range: (f64, f64),
    /// Number of channels
    #[builder(default = "DEFAULT_NUM_FREQS")]
    pub num_freqs: usize,
    /// First and last hour angles \[radians\]
    #[builder(default = "(-PI / 3.0, PI / 3.0)")]
    pub time_range: (f64, f64),
    /// Number of times
    #[builder(default = "DEFAULT_NUM_TIMES")]
    pub num_times: usize,

    /// Inputs to wide-field advice
    #[builder(default)]
    pub advice: AdviceRequest,

    /// Directory the image products are written into
    #[builder(default = "PathBuf::from(DEFAULT_OUTPUT_DIR)", setter(into))]
    pub output_dir: PathBuf,

    /// Whether to draw progress bars
    #[builder(default = "true")]
    pub draw_progress: bool,
}

impl IcalContextBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.num_freqs == Some(0) {
            return Err("num_freqs must be positive".into());
        }
        if self.num_times == Some(0) {
            return Err("num_times must be positive".into());
        }
        if let Some(radius) = self.max_radius {
            if !(radius.is_finite() && radius > 0.) {
                return Err(format!("max_radius must be positive, received {radius}"));
            }
        }
        Ok(())
    }
}

impl Display for IcalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Will use layout {} within {} m of the array centre.",
            self.layout, self.max_radius
        )?;
        writeln!(
            f,
            "Will phase to RA {:.4}°, Dec {:.4}°.",
            self.phase_centre.ra.to_degrees(),
            self.phase_centre.dec.to_degrees()
        )?;
        writeln!(
            f,
            "Will observe {} channels from {:e} Hz to {:e} Hz.",
            self.num_freqs, self.freq_range.0, self.freq_range.1
        )?;
        writeln!(
            f,
            "Will observe {} times from {:.4} rad to {:.4} rad.",
            self.num_times, self.time_range.0, self.time_range.1
        )?;
        writeln!(f, "Will image in the {} frame.", self.pol_frame)?;
        writeln!(
            f,
            "Will request advice with guard band {}, delA {}, {} w-projection plane(s).",
            self.advice.guard_band_image, self.advice.del_a, self.advice.wprojection_planes
        )?;
        writeln!(f, "Will write products to {}.", self.output_dir.display())?;
        Ok(())
    }
}

impl IcalContext {
    /// A one line description of the run.
    pub fn as_comment(&self) -> String {
        format!(
            "{} r<{}m, {} chans {:.3e}-{:.3e} Hz, {} times, {}",
            self.layout,
            self.max_radius,
            self.num_freqs,
            self.freq_range.0,
            self.freq_range.1,
            self.num_times,
            self.pol_frame
        )
    }

    /// The observation configuration for this run: the layout defaults with
    /// this context's overrides, radius restriction first.
    ///
    /// # Errors
    ///
    /// Will return a [`ConfigError`] for an unknown layout or unusable
    /// override.
    pub fn configure<P: Processor + ?Sized>(
        &self,
        processor: &P,
    ) -> Result<ObservationConfig, ConfigError> {
        let mut config = ObservationConfig::from_layout(processor, &self.layout)?;
        config.restrict_by_radius(processor, self.max_radius)?;
        config.pol_frame = self.pol_frame;
        config.phase_centre = self.phase_centre;
        config.set_frequency_range(self.freq_range.0, self.freq_range.1, self.num_freqs)?;
        config.set_time_range(self.time_range.0, self.time_range.1, self.num_times)?;
        Ok(config)
    }

    /// An estimate of the memory needed for the visibility side of a run
    /// \[bytes\], assuming two receptors per antenna. At most three block
    /// buffers are alive at once.
    ///
    /// # Errors
    ///
    /// Will return [`AllocationError::Overflow`] if a record count can't be
    /// represented.
    pub fn estimate_bytes(&self, config: &ObservationConfig) -> Result<usize, AllocationError> {
        let npol = config.num_pols();
        let num_block_vis = config.num_block_vis()?;
        let num_vis = config.num_vis()?;
        let vis_bytes = |nvis: usize| {
            VIS_BYTES_PER_POL_SAMPLE
                .saturating_mul(npol)
                .saturating_mul(nvis)
                .saturating_add(VIS_HEADER_BYTES)
        };
        let num_gains = config
            .num_times()
            .saturating_mul(config.num_ants())
            .saturating_mul(config.num_chans())
            .saturating_mul(2);
        Ok(vis_bytes(num_block_vis)
            .saturating_mul(3)
            .saturating_add(vis_bytes(num_vis))
            .saturating_add(num_block_vis.saturating_mul(std::mem::size_of::<i64>()))
            .saturating_add(num_gains.saturating_mul(2 * 16 + 8)))
    }

    /// Run the whole pipeline against `processor`.
    ///
    /// # Errors
    ///
    /// Any configuration, allocation or collaborator error ends the run after
    /// releasing every buffer. Export failures don't; they are in the report.
    pub fn run<P: Processor + ?Sized>(&self, processor: &P) -> Result<ExportReport, IcalError> {
        self.run_with_ledger(processor, &BufferLedger::new())
    }

    /// As [`Self::run`], recording every allocation and release in `ledger`.
    ///
    /// # Errors
    ///
    /// As for [`Self::run`].
    pub fn run_with_ledger<P: Processor + ?Sized>(
        &self,
        processor: &P,
        ledger: &BufferLedger,
    ) -> Result<ExportReport, IcalError> {
        trace!("start IcalContext::run");
        debug!("ICAL context:\n{self}");
        processor.initialize()?;

        let config = with_increment_duration!("configure", self.configure(processor)?);
        info!("Nvis = {}", config.num_vis()?);
        let estimate = self.estimate_bytes(&config)?;
        debug!(
            "estimated memory for visibilities: {:.3} GiB",
            estimate as f64 / 1024_f64.powi(3)
        );
        let allocator = BufferAllocator::new(ledger.clone()).with_estimate(estimate);

        let draw_target = if self.draw_progress {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let progress = ProgressBar::with_draw_target(Some(Stage::ALL.len() as u64), draw_target);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:2}/{len:2}")
        {
            progress.set_style(style.progress_chars("=> "));
        }

        let configured = Configured::new(processor, allocator, config);
        let result = self.run_stages(configured, &progress);
        close_progress(&progress, &result);

        trace!("end IcalContext::run");
        result
    }

    fn run_stages<P: Processor + ?Sized>(
        &self,
        configured: Configured<'_, P>,
        progress: &ProgressBar,
    ) -> Result<ExportReport, IcalError> {
        let start = |stage: Stage| progress.set_message(stage.name());

        start(Stage::Synthesize);
        let synthesized = with_increment_duration!("synthesize", configured.synthesize()?);
        progress.inc(1);

        start(Stage::Advise);
        let advised = with_increment_duration!("advise", synthesized.advise(&self.advice)?);
        progress.inc(1);

        start(Stage::BuildModel);
        let model_built = with_increment_duration!("build_model", advised.build_model()?);
        progress.inc(1);

        start(Stage::Predict);
        let predicted = with_increment_duration!("predict", model_built.predict()?);
        progress.inc(1);

        start(Stage::Convert);
        let converted = with_increment_duration!("convert", predicted.convert()?);
        progress.inc(1);

        start(Stage::SolveGains);
        let gain_solved = with_increment_duration!("solve_gains", converted.solve_gains()?);
        progress.inc(1);

        start(Stage::ApplyGains);
        let gain_applied = with_increment_duration!("apply_gains", gain_solved.apply_gains()?);
        progress.inc(1);

        start(Stage::RebuildModel);
        let model_rebuilt = with_increment_duration!("rebuild_model", gain_applied.rebuild_model()?);
        progress.inc(1);

        start(Stage::Invert);
        let inverted = with_increment_duration!("invert", model_rebuilt.invert()?);
        progress.inc(1);

        start(Stage::Deconvolve);
        let deconvolved = with_increment_duration!("deconvolve", inverted.deconvolve()?);
        progress.inc(1);

        start(Stage::Export);
        let comment = self.as_comment();
        let report = with_increment_duration!(
            "export",
            deconvolved.export(&self.output_dir, &comment)
        );
        progress.inc(1);
        Ok(report)
    }
}

/// Finish `progress` after a successful run, otherwise leave it at the stage
/// that failed.
fn close_progress<T, E>(progress: &ProgressBar, result: &Result<T, E>) {
    match result {
        Ok(_) => progress.finish(),
        Err(_) => progress.abandon(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AntennaCounts, test_common::get_config};

    #[test]
    fn test_context_defaults() {
        let context = IcalContextBuilder::default().build().unwrap();
        assert_eq!(context.layout, "LOWBD2-CORE");
        assert_eq!(context.num_freqs, 5);
        assert_eq!(context.num_times, 11);
        assert_eq!(context.pol_frame, PolFrame::StokesI);
        assert_eq!(context.output_dir, PathBuf::from("results"));
        assert!(context.draw_progress);
        assert!((context.max_radius - 300.0).abs() < f64::EPSILON);
        assert!((context.phase_centre.ra.to_degrees() - 30.0).abs() < 1e-9);
        assert!((context.phase_centre.dec.to_degrees() + 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_context_validation() {
        assert!(IcalContextBuilder::default().num_freqs(0).build().is_err());
        assert!(IcalContextBuilder::default().num_times(0).build().is_err());
        assert!(IcalContextBuilder::default().max_radius(-1.0).build().is_err());
        assert!(IcalContextBuilder::default()
            .max_radius(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn test_context_display_and_comment() {
        let context = IcalContextBuilder::default().build().unwrap();
        let display = context.to_string();
        assert!(display.contains("LOWBD2-CORE"));
        assert!(display.contains("5 channels"));
        let comment = context.as_comment();
        assert!(!comment.contains('\n'));
        assert!(comment.starts_with("LOWBD2-CORE r<300m, 5 chans"));
    }

    #[test]
    fn test_estimate_bytes() {
        let context = IcalContextBuilder::default().build().unwrap();
        let config = get_config();
        // three 16 record block buffers of 4 pols, 6 flat records, 16 index
        // entries and 8 receptor gain rows
        let expected = 3 * (80 + 32 * 4 * 16) + (80 + 32 * 4 * 6) + 8 * 16 + 8 * 40;
        assert_eq!(context.estimate_bytes(&config).unwrap(), expected);
    }

    #[test]
    fn test_estimate_bytes_overflow() {
        let context = IcalContextBuilder::default().build().unwrap();
        let config = ObservationConfig::new(
            "TEST",
            AntennaCounts {
                num_ants: usize::MAX / 2,
                num_baselines: 1,
            },
            PolFrame::StokesI,
            vec![1e8],
            vec![1e6],
            vec![0.0],
            RADec::from_degrees(0.0, 0.0),
        )
        .unwrap();
        assert!(matches!(
            context.estimate_bytes(&config),
            Err(AllocationError::Overflow {
                what: "block visibility",
                ..
            })
        ));
    }

    #[test]
    fn test_close_progress() {
        let progress = ProgressBar::with_draw_target(Some(11), ProgressDrawTarget::hidden());
        progress.inc(3);
        close_progress(&progress, &Err::<(), _>("stage failed"));
        assert!(progress.is_finished());
        assert_eq!(progress.position(), 3);

        let progress = ProgressBar::with_draw_target(Some(11), ProgressDrawTarget::hidden());
        progress.inc(11);
        close_progress(&progress, &Ok::<_, ()>(()));
        assert!(progress.is_finished());
        assert_eq!(progress.position(), 11);
    }
}
