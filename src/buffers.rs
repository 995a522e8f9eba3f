//! Allocation, ownership and accounting of the large buffers handed to the
//! numerical collaborator.
//!
//! Every buffer is an exclusive, move-only owner. Creating one registers it
//! with a [`BufferLedger`] and dropping it records the release, so a run can
//! prove afterwards that everything it allocated was freed exactly once.

use std::{
    collections::HashMap,
    fmt::Display,
    mem::size_of,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use thiserror::Error;

use crate::{
    constants::{UNMATCHED_INDEX, VIS_BYTES_PER_POL_SAMPLE, VIS_HEADER_BYTES},
    error::IcalError,
    marlu::{
        ndarray::{Array4, Array5, ShapeError},
        RADec,
    },
    c64,
};

#[derive(Error, Debug)]
/// Errors that can occur while allocating a buffer.
pub enum AllocationError {
    #[error("Cannot allocate a {what} buffer with dimensions {dims:?}, every dimension must be positive")]
    /// A requested dimension was zero.
    NonPositive {
        /// The kind of buffer
        what: &'static str,
        /// The requested dimensions
        dims: Vec<usize>,
    },

    #[error("The size of a {what} buffer with dimensions {dims:?} overflows")]
    /// The size of the buffer can't be represented.
    Overflow {
        /// The kind of buffer
        what: &'static str,
        /// The requested dimensions
        dims: Vec<usize>,
    },

    #[error("Insufficient system memory available; need {need_gib} GiB of memory.\nPlease specify a smaller observation.")]
    /// The system doesn't have enough memory for the run.
    InsufficientMemory {
        /// The amount of memory needed \[GiB\]
        need_gib: usize,
    },

    #[error(transparent)]
    /// The storage couldn't be shaped into an array.
    Shape(#[from] ShapeError),
}

#[derive(Error, Debug)]
/// Errors found when checking the mapping held by an [`IndexBuffer`].
pub enum IndexBufferError {
    #[error("Index buffer entry {position} maps to flat record {value}, but there are only {num_vis} flat records")]
    /// An entry points outside the flat visibilities.
    OutOfRange {
        /// Position of the entry in the index buffer
        position: usize,
        /// The value of the entry
        value: i64,
        /// The number of flat records
        num_vis: usize,
    },

    #[error("Index buffer entry {position} maps to flat record {value}, which is already mapped")]
    /// Two entries point at the same flat record.
    Duplicate {
        /// Position of the entry in the index buffer
        position: usize,
        /// The value of the entry
        value: i64,
    },

    #[error("The index buffer maps {mapped} flat records, expected {num_vis}")]
    /// Some flat records aren't mapped anywhere.
    Unmapped {
        /// The number of mapped flat records
        mapped: usize,
        /// The number of flat records
        num_vis: usize,
    },
}

/// The kinds of buffer tracked by a [`BufferLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferKind {
    /// Flat visibilities
    Visibility,
    /// Block visibilities
    BlockVisibility,
    /// Gain tables
    GainTable,
    /// Flat-to-block index buffers
    IndexBuffer,
    /// Images
    Image,
}

impl BufferKind {
    /// Every kind of buffer.
    pub const ALL: [BufferKind; 5] = [
        BufferKind::Visibility,
        BufferKind::BlockVisibility,
        BufferKind::GainTable,
        BufferKind::IndexBuffer,
        BufferKind::Image,
    ];
}

impl Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                BufferKind::Visibility => "visibility",
                BufferKind::BlockVisibility => "block visibility",
                BufferKind::GainTable => "gain table",
                BufferKind::IndexBuffer => "index buffer",
                BufferKind::Image => "image",
            }
        )
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// A process-wide unique identity for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocation and release counts for one kind of buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    /// Number of buffers allocated
    pub allocated: usize,
    /// Number of buffers released
    pub released: usize,
}

impl KindCounts {
    /// Number of buffers still alive.
    pub fn outstanding(&self) -> usize {
        self.allocated.saturating_sub(self.released)
    }
}

/// Records every allocation and release of a run's buffers.
///
/// Cloning a ledger gives another handle onto the same counts.
#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    counts: Arc<Mutex<HashMap<BufferKind, KindCounts>>>,
}

impl BufferLedger {
    /// A ledger with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, kind: BufferKind, f: impl FnOnce(&mut KindCounts)) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        f(counts.entry(kind).or_default());
    }

    fn register(&self, kind: BufferKind) -> LedgerEntry {
        let id = BufferId::next();
        self.update(kind, |c| c.allocated += 1);
        trace!("allocated {kind} {id}");
        LedgerEntry {
            ledger: self.clone(),
            kind,
            id,
        }
    }

    /// The counts recorded for `kind`.
    pub fn counts(&self, kind: BufferKind) -> KindCounts {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(&kind).copied().unwrap_or_default()
    }

    /// Total number of buffers of any kind still alive.
    pub fn outstanding(&self) -> usize {
        BufferKind::ALL
            .iter()
            .map(|&kind| self.counts(kind).outstanding())
            .sum()
    }

    /// Whether every allocated buffer of every kind has been released exactly
    /// once.
    pub fn is_balanced(&self) -> bool {
        BufferKind::ALL.iter().all(|&kind| {
            let counts = self.counts(kind);
            counts.allocated == counts.released
        })
    }
}

/// Ties a buffer to its ledger. Dropping it records the release.
#[derive(Debug)]
struct LedgerEntry {
    ledger: BufferLedger,
    kind: BufferKind,
    id: BufferId,
}

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        self.ledger.update(self.kind, |c| c.released += 1);
        trace!("released {} {}", self.kind, self.id);
    }
}

/// Byte size of a visibility data region with `npol` polarisations and
/// `nvis` records.
///
/// # Errors
///
/// Will return [`AllocationError::Overflow`] if the size can't be represented.
pub fn visibility_bytes(npol: usize, nvis: usize) -> Result<usize, AllocationError> {
    VIS_BYTES_PER_POL_SAMPLE
        .checked_mul(npol)
        .and_then(|n| n.checked_mul(nvis))
        .and_then(|n| n.checked_add(VIS_HEADER_BYTES))
        .ok_or(AllocationError::Overflow {
            what: "visibility",
            dims: vec![npol, nvis],
        })
}

/// The product of `dims`, which may be zero.
pub(crate) fn checked_count(what: &'static str, dims: &[usize]) -> Result<usize, AllocationError> {
    dims.iter()
        .try_fold(1_usize, |acc, &d| acc.checked_mul(d))
        .ok_or(AllocationError::Overflow {
            what,
            dims: dims.to_vec(),
        })
}

fn checked_product(what: &'static str, dims: &[usize]) -> Result<usize, AllocationError> {
    if dims.iter().any(|&d| d == 0) {
        return Err(AllocationError::NonPositive {
            what,
            dims: dims.to_vec(),
        });
    }
    checked_count(what, dims)
}

/// Creates buffers and registers them with a ledger.
#[derive(Debug, Clone, Default)]
pub struct BufferAllocator {
    ledger: BufferLedger,
    estimate_bytes: Option<usize>,
}

impl BufferAllocator {
    /// An allocator registering with `ledger`.
    pub fn new(ledger: BufferLedger) -> Self {
        Self {
            ledger,
            estimate_bytes: None,
        }
    }

    /// Report `bytes` (the needs of the whole run) instead of the needs of a
    /// single buffer when memory runs out.
    pub fn with_estimate(mut self, bytes: usize) -> Self {
        self.estimate_bytes = Some(bytes);
        self
    }

    /// The ledger this allocator registers with.
    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    fn reserve<T: Clone>(&self, num_elems: usize, fill: T) -> Result<Vec<T>, AllocationError> {
        let mut v = Vec::new();
        if v.try_reserve_exact(num_elems) == Ok(()) {
            // Make the vector's length equal to its new capacity.
            v.resize(num_elems, fill);
            Ok(v)
        } else {
            // Prefer the memory needed by the whole run over that of this
            // one buffer.
            let need_bytes = self
                .estimate_bytes
                .unwrap_or_else(|| num_elems.saturating_mul(size_of::<T>()));
            let need_gib = need_bytes / 1024_usize.pow(3);
            Err(AllocationError::InsufficientMemory { need_gib })
        }
    }

    fn allocate_vis_data(
        &self,
        kind: BufferKind,
        tag: u64,
        npol: usize,
        nvis: usize,
    ) -> Result<VisibilityData, AllocationError> {
        let what = match kind {
            BufferKind::BlockVisibility => "block visibility",
            _ => "visibility",
        };
        if npol == 0 || nvis == 0 {
            return Err(AllocationError::NonPositive {
                what,
                dims: vec![npol, nvis],
            });
        }
        let num_bytes = visibility_bytes(npol, nvis)?;
        let bytes = self.reserve(num_bytes, 0_u8)?;
        let mut data = VisibilityData {
            nvis,
            npol,
            phase_centre: RADec::new(0., 0.),
            bytes,
            entry: self.ledger.register(kind),
        };
        data.write_header_u64(HEADER_SHAPE_TAG, tag);
        data.write_header_u64(HEADER_NVIS, nvis as u64);
        data.write_header_u64(HEADER_NPOL, npol as u64);
        Ok(data)
    }

    /// Allocate a flat visibility buffer of `nvis` records with `npol`
    /// polarisations each.
    ///
    /// # Errors
    ///
    /// [`AllocationError::NonPositive`] if either count is zero, otherwise
    /// [`AllocationError::Overflow`] or
    /// [`AllocationError::InsufficientMemory`].
    pub fn allocate_visibility(&self, npol: usize, nvis: usize) -> Result<Visibility, AllocationError> {
        self.allocate_vis_data(BufferKind::Visibility, SHAPE_TAG_FLAT, npol, nvis)
            .map(Visibility)
    }

    /// Allocate a block visibility buffer holding every ordered antenna pair
    /// for each channel and time.
    ///
    /// # Errors
    ///
    /// As for [`Self::allocate_visibility`].
    pub fn allocate_block_visibility(
        &self,
        nants: usize,
        nchan: usize,
        npol: usize,
        ntimes: usize,
    ) -> Result<BlockVisibility, AllocationError> {
        let nvis = checked_product("block visibility", &[nants, nants, nchan, ntimes])?;
        let mut data = self.allocate_vis_data(
            BufferKind::BlockVisibility,
            SHAPE_TAG_BLOCK,
            npol,
            nvis,
        )?;
        data.write_header_u64(HEADER_NANTS, nants as u64);
        data.write_header_u64(HEADER_NCHAN, nchan as u64);
        data.write_header_u64(HEADER_NTIMES, ntimes as u64);
        Ok(BlockVisibility {
            data,
            nants,
            nchan,
            ntimes,
        })
    }

    /// Allocate a new flat buffer holding the same bytes as `source`.
    ///
    /// # Errors
    ///
    /// As for [`Self::allocate_visibility`].
    pub fn copy_visibility(&self, source: &Visibility) -> Result<Visibility, AllocationError> {
        let mut copy = self.allocate_visibility(source.npol, source.nvis)?;
        copy.copy_from(source);
        Ok(copy)
    }

    /// Allocate a new block buffer holding the same bytes as `source`.
    ///
    /// # Errors
    ///
    /// As for [`Self::allocate_block_visibility`].
    pub fn copy_block_visibility(
        &self,
        source: &BlockVisibility,
    ) -> Result<BlockVisibility, AllocationError> {
        let mut copy =
            self.allocate_block_visibility(source.nants, source.nchan, source.npol, source.ntimes)?;
        copy.copy_from(source);
        Ok(copy)
    }

    /// Allocate a gain table of `nrec × nrec` receptor gains for every time,
    /// antenna and channel. Gains and weights start at zero.
    ///
    /// # Errors
    ///
    /// [`AllocationError::NonPositive`] if any dimension is zero, otherwise
    /// [`AllocationError::Overflow`] or
    /// [`AllocationError::InsufficientMemory`].
    pub fn allocate_gaintable(
        &self,
        nants: usize,
        nchan: usize,
        nrec: usize,
        ntimes: usize,
    ) -> Result<GainTable, AllocationError> {
        let gain_shape = (ntimes, nants, nchan, nrec, nrec);
        let weight_shape = (ntimes, nants, nchan, nrec);
        let num_gains = checked_product("gain table", &[ntimes, nants, nchan, nrec, nrec])?;
        let num_weights = checked_product("gain table", &[ntimes, nants, nchan, nrec])?;
        let gains = Array5::from_shape_vec(gain_shape, self.reserve(num_gains, c64::new(0., 0.))?)?;
        let weights = Array4::from_shape_vec(weight_shape, self.reserve(num_weights, 0_f64)?)?;
        Ok(GainTable {
            gains,
            weights,
            entry: self.ledger.register(BufferKind::GainTable),
        })
    }

    /// Allocate an index buffer with one entry per block record, every entry
    /// set to [`UNMATCHED_INDEX`].
    ///
    /// # Errors
    ///
    /// As for [`Self::allocate_gaintable`].
    pub fn allocate_index_buffer(
        &self,
        ntimes: usize,
        nants: usize,
        nchan: usize,
    ) -> Result<IndexBuffer, AllocationError> {
        let num_elems = checked_product("index buffer", &[ntimes, nants, nants, nchan])?;
        Ok(IndexBuffer {
            indices: self.reserve(num_elems, UNMATCHED_INDEX)?,
            entry: self.ledger.register(BufferKind::IndexBuffer),
        })
    }

    /// Allocate a zeroed image of the given shape.
    ///
    /// # Errors
    ///
    /// As for [`Self::allocate_gaintable`].
    pub fn allocate_image(&self, shape: ImageShape) -> Result<Image, AllocationError> {
        let num_elems = shape.num_elems()?;
        let pixels = Array4::from_shape_vec(shape.0, self.reserve(num_elems, 0_f64)?)?;
        Ok(Image {
            pixels,
            cellsize: 0.,
            phase_centre: RADec::new(0., 0.),
            entry: self.ledger.register(BufferKind::Image),
        })
    }
}

const SHAPE_TAG_FLAT: u64 = 0;
const SHAPE_TAG_BLOCK: u64 = 1;

const HEADER_SHAPE_TAG: usize = 0;
const HEADER_NVIS: usize = 8;
const HEADER_NPOL: usize = 16;
const HEADER_NANTS: usize = 24;
const HEADER_NCHAN: usize = 32;
const HEADER_NTIMES: usize = 40;
const HEADER_NREC: usize = 48;
const HEADER_RA: usize = 56;
const HEADER_DEC: usize = 64;

/// One polarisation of one visibility record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisSample {
    /// The complex visibility
    pub vis: c64,
    /// The visibility weight
    pub weight: f64,
    /// The imaging weight
    pub imaging_weight: f64,
}

impl VisSample {
    fn read(slot: &[u8]) -> Self {
        Self {
            vis: c64::new(
                LittleEndian::read_f64(&slot[0..8]),
                LittleEndian::read_f64(&slot[8..16]),
            ),
            weight: LittleEndian::read_f64(&slot[16..24]),
            imaging_weight: LittleEndian::read_f64(&slot[24..32]),
        }
    }

    fn write(&self, slot: &mut [u8]) {
        LittleEndian::write_f64(&mut slot[0..8], self.vis.re);
        LittleEndian::write_f64(&mut slot[8..16], self.vis.im);
        LittleEndian::write_f64(&mut slot[16..24], self.weight);
        LittleEndian::write_f64(&mut slot[24..32], self.imaging_weight);
    }
}

/// Quality assessment of a visibility buffer's amplitudes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisQa {
    /// Largest visibility amplitude
    pub maxabs: f64,
    /// Smallest visibility amplitude
    pub minabs: f64,
    /// Root mean square of the visibility amplitudes
    pub rms: f64,
    /// Median visibility amplitude
    pub medianabs: f64,
}

impl Display for VisQa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "maxabs={:.6e} minabs={:.6e} rms={:.6e} medianabs={:.6e}",
            self.maxabs, self.minabs, self.rms, self.medianabs
        )
    }
}

/// The storage shared by flat and block visibility buffers: an 80 byte header
/// followed by `npol` 32 byte samples for each of `nvis` records.
#[derive(Debug)]
pub struct VisibilityData {
    nvis: usize,
    npol: usize,
    phase_centre: RADec,
    bytes: Vec<u8>,
    entry: LedgerEntry,
}

impl VisibilityData {
    fn write_header_u64(&mut self, offset: usize, value: u64) {
        LittleEndian::write_u64(&mut self.bytes[offset..offset + 8], value);
    }

    fn write_header_f64(&mut self, offset: usize, value: f64) {
        LittleEndian::write_f64(&mut self.bytes[offset..offset + 8], value);
    }

    fn copy_from(&mut self, source: &VisibilityData) {
        self.bytes.copy_from_slice(&source.bytes);
        self.phase_centre = source.phase_centre;
    }

    /// The identity of this buffer.
    pub fn id(&self) -> BufferId {
        self.entry.id
    }

    /// Number of records.
    pub fn nvis(&self) -> usize {
        self.nvis
    }

    /// Number of polarisations per record.
    pub fn npol(&self) -> usize {
        self.npol
    }

    /// The phase centre of the visibilities.
    pub fn phase_centre(&self) -> RADec {
        self.phase_centre
    }

    /// Set the phase centre, updating the header.
    pub fn set_phase_centre(&mut self, phase_centre: RADec) {
        self.phase_centre = phase_centre;
        self.write_header_f64(HEADER_RA, phase_centre.ra);
        self.write_header_f64(HEADER_DEC, phase_centre.dec);
    }

    /// The receptor count stored in the header, if it has been set.
    pub fn num_receptors(&self) -> Option<usize> {
        match LittleEndian::read_u64(&self.bytes[HEADER_NREC..HEADER_NREC + 8]) {
            0 => None,
            nrec => Some(nrec as usize),
        }
    }

    /// Store the receptor count in the header.
    pub fn set_num_receptors(&mut self, num_receptors: usize) {
        self.write_header_u64(HEADER_NREC, num_receptors as u64);
    }

    /// The whole data region, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The whole data region, header included, for the collaborator to fill.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// A borrowed view of this buffer for comparison.
    pub fn view(&self) -> VisibilityView<'_> {
        VisibilityView::new(self.id(), self.nvis, self.npol, &self.bytes)
    }

    fn slot_offset(&self, record: usize, pol: usize) -> Option<usize> {
        if record >= self.nvis || pol >= self.npol {
            return None;
        }
        Some(VIS_HEADER_BYTES + (record * self.npol + pol) * VIS_BYTES_PER_POL_SAMPLE)
    }

    /// Read polarisation `pol` of record `record`, if it exists.
    pub fn sample(&self, record: usize, pol: usize) -> Option<VisSample> {
        self.slot_offset(record, pol)
            .map(|off| VisSample::read(&self.bytes[off..off + VIS_BYTES_PER_POL_SAMPLE]))
    }

    /// Write polarisation `pol` of record `record`.
    ///
    /// # Errors
    ///
    /// Will return [`IcalError::BadArrayShape`] if the record or polarisation
    /// is out of range.
    pub fn set_sample(&mut self, record: usize, pol: usize, sample: VisSample) -> Result<(), IcalError> {
        let off = self.slot_offset(record, pol).ok_or_else(|| IcalError::BadArrayShape {
            argument: "record, pol",
            function: "VisibilityData::set_sample",
            expected: format!("< ({}, {})", self.nvis, self.npol),
            received: format!("({record}, {pol})"),
        })?;
        sample.write(&mut self.bytes[off..off + VIS_BYTES_PER_POL_SAMPLE]);
        Ok(())
    }

    /// Every sample in record-major, polarisation-minor order.
    pub fn samples(&self) -> impl Iterator<Item = VisSample> + '_ {
        self.bytes[VIS_HEADER_BYTES..]
            .chunks_exact(VIS_BYTES_PER_POL_SAMPLE)
            .map(VisSample::read)
    }

    /// Amplitude statistics over every sample.
    pub fn qa(&self) -> VisQa {
        let mut amps: Vec<f64> = self.samples().map(|s| s.vis.norm()).collect();
        amps.sort_by(f64::total_cmp);
        let n = amps.len();
        let median = match n {
            0 => 0.,
            n if n % 2 == 1 => amps[n / 2],
            n => 0.5 * (amps[n / 2 - 1] + amps[n / 2]),
        };
        let sum_sq: f64 = amps.iter().map(|a| a * a).sum();
        VisQa {
            maxabs: amps.last().copied().unwrap_or(0.),
            minabs: amps.first().copied().unwrap_or(0.),
            rms: if n == 0 { 0. } else { (sum_sq / n as f64).sqrt() },
            medianabs: median,
        }
    }
}

/// Visibilities with one record per baseline, channel and time.
#[derive(Debug)]
pub struct Visibility(VisibilityData);

impl Deref for Visibility {
    type Target = VisibilityData;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Visibility {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Visibilities with one record per time, antenna, antenna and channel,
/// self pairs and both orderings of every pair included.
#[derive(Debug)]
pub struct BlockVisibility {
    data: VisibilityData,
    nants: usize,
    nchan: usize,
    ntimes: usize,
}

impl BlockVisibility {
    /// Number of antennas.
    pub fn nants(&self) -> usize {
        self.nants
    }

    /// Number of channels.
    pub fn nchan(&self) -> usize {
        self.nchan
    }

    /// Number of times.
    pub fn ntimes(&self) -> usize {
        self.ntimes
    }

    /// The record holding `(time, ant1, ant2, chan)`, if all are in range.
    pub fn record_index(&self, time: usize, ant1: usize, ant2: usize, chan: usize) -> Option<usize> {
        (time < self.ntimes && ant1 < self.nants && ant2 < self.nants && chan < self.nchan)
            .then(|| ((time * self.nants + ant1) * self.nants + ant2) * self.nchan + chan)
    }
}

impl Deref for BlockVisibility {
    type Target = VisibilityData;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for BlockVisibility {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// A borrowed view onto a visibility buffer, as compared by
/// [`crate::verify::verify_copy`].
#[derive(Debug, Clone, Copy)]
pub struct VisibilityView<'a> {
    /// Identity of the buffer
    pub id: BufferId,
    /// Number of records
    pub nvis: usize,
    /// Number of polarisations per record
    pub npol: usize,
    /// The data region
    pub bytes: &'a [u8],
}

impl<'a> VisibilityView<'a> {
    /// A view of `bytes` claiming the given identity and shape.
    pub fn new(id: BufferId, nvis: usize, npol: usize, bytes: &'a [u8]) -> Self {
        Self {
            id,
            nvis,
            npol,
            bytes,
        }
    }
}

/// Per-antenna receptor gains for every time and channel.
#[derive(Debug)]
pub struct GainTable {
    gains: Array5<c64>,
    weights: Array4<f64>,
    entry: LedgerEntry,
}

impl GainTable {
    /// The identity of this buffer.
    pub fn id(&self) -> BufferId {
        self.entry.id
    }

    /// Number of times.
    pub fn num_times(&self) -> usize {
        self.gains.dim().0
    }

    /// Number of antennas.
    pub fn num_ants(&self) -> usize {
        self.gains.dim().1
    }

    /// Number of channels.
    pub fn num_chans(&self) -> usize {
        self.gains.dim().2
    }

    /// Number of receptors per antenna.
    pub fn num_receptors(&self) -> usize {
        self.gains.dim().3
    }

    /// Gains with shape `(times, antennas, channels, receptors, receptors)`.
    pub fn gains(&self) -> &Array5<c64> {
        &self.gains
    }

    /// Mutable gains.
    pub fn gains_mut(&mut self) -> &mut Array5<c64> {
        &mut self.gains
    }

    /// Weights with shape `(times, antennas, channels, receptors)`.
    pub fn weights(&self) -> &Array4<f64> {
        &self.weights
    }

    /// Mutable weights.
    pub fn weights_mut(&mut self) -> &mut Array4<f64> {
        &mut self.weights
    }
}

/// For every block record, the flat record it is filled from, or
/// [`UNMATCHED_INDEX`].
#[derive(Debug)]
pub struct IndexBuffer {
    indices: Vec<i64>,
    entry: LedgerEntry,
}

impl IndexBuffer {
    /// The identity of this buffer.
    pub fn id(&self) -> BufferId {
        self.entry.id
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether there are no entries. Never true for an allocated buffer.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The entries.
    pub fn as_slice(&self) -> &[i64] {
        &self.indices
    }

    /// The entries, for the collaborator to fill.
    pub fn as_mut_slice(&mut self) -> &mut [i64] {
        &mut self.indices
    }

    /// Check that every one of `num_vis` flat records is mapped by exactly one
    /// entry, and that nothing else is mapped.
    ///
    /// # Errors
    ///
    /// Will return the first [`IndexBufferError`] found.
    pub fn check_mapping(&self, num_vis: usize) -> Result<(), IndexBufferError> {
        let mut seen = vec![false; num_vis];
        let mut mapped = 0;
        for (position, &value) in self.indices.iter().enumerate() {
            if value == UNMATCHED_INDEX {
                continue;
            }
            let flat = usize::try_from(value)
                .ok()
                .filter(|&v| v < num_vis)
                .ok_or(IndexBufferError::OutOfRange {
                    position,
                    value,
                    num_vis,
                })?;
            if seen[flat] {
                return Err(IndexBufferError::Duplicate { position, value });
            }
            seen[flat] = true;
            mapped += 1;
        }
        if mapped != num_vis {
            return Err(IndexBufferError::Unmapped { mapped, num_vis });
        }
        Ok(())
    }
}

/// The shape of an image: `[nchan, npol, ny, nx]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageShape(pub [usize; 4]);

impl ImageShape {
    /// Number of channels.
    pub fn nchan(&self) -> usize {
        self.0[0]
    }

    /// Number of polarisations.
    pub fn npol(&self) -> usize {
        self.0[1]
    }

    /// Number of pixels along the y axis.
    pub fn ny(&self) -> usize {
        self.0[2]
    }

    /// Number of pixels along the x axis.
    pub fn nx(&self) -> usize {
        self.0[3]
    }

    /// The same shape with the channel dimension replaced.
    #[must_use]
    pub fn with_channels(&self, nchan: usize) -> Self {
        let [_, npol, ny, nx] = self.0;
        Self([nchan, npol, ny, nx])
    }

    /// Number of pixels.
    ///
    /// # Errors
    ///
    /// [`AllocationError::NonPositive`] if any dimension is zero,
    /// [`AllocationError::Overflow`] if the product can't be represented.
    pub fn num_elems(&self) -> Result<usize, AllocationError> {
        checked_product("image", &self.0)
    }
}

impl Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [nchan, npol, ny, nx] = self.0;
        write!(f, "[{nchan}, {npol}, {ny}, {nx}]")
    }
}

/// Pixel statistics of an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageQa {
    /// Largest pixel value
    pub max: f64,
    /// Smallest pixel value
    pub min: f64,
    /// Root mean square of the pixel values
    pub rms: f64,
}

impl Display for ImageQa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max={:.6e} min={:.6e} rms={:.6e}",
            self.max, self.min, self.rms
        )
    }
}

/// A sky image cube.
#[derive(Debug)]
pub struct Image {
    pixels: Array4<f64>,
    cellsize: f64,
    phase_centre: RADec,
    entry: LedgerEntry,
}

impl Image {
    /// The identity of this buffer.
    pub fn id(&self) -> BufferId {
        self.entry.id
    }

    /// The shape of the image.
    pub fn shape(&self) -> ImageShape {
        let (nchan, npol, ny, nx) = self.pixels.dim();
        ImageShape([nchan, npol, ny, nx])
    }

    /// Pixels indexed `[chan, pol, y, x]`.
    pub fn pixels(&self) -> &Array4<f64> {
        &self.pixels
    }

    /// Mutable pixels.
    pub fn pixels_mut(&mut self) -> &mut Array4<f64> {
        &mut self.pixels
    }

    /// Angular size of a pixel \[radians\].
    pub fn cellsize(&self) -> f64 {
        self.cellsize
    }

    /// Set the angular size of a pixel \[radians\].
    pub fn set_cellsize(&mut self, cellsize: f64) {
        self.cellsize = cellsize;
    }

    /// The sky position of the image centre.
    pub fn phase_centre(&self) -> RADec {
        self.phase_centre
    }

    /// Set the sky position of the image centre.
    pub fn set_phase_centre(&mut self, phase_centre: RADec) {
        self.phase_centre = phase_centre;
    }

    /// Pixel statistics.
    pub fn qa(&self) -> ImageQa {
        let n = self.pixels.len();
        let (min, max, sum_sq) = self.pixels.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.),
            |(min, max, sum_sq), &p| (min.min(p), max.max(p), sum_sq + p * p),
        );
        ImageQa {
            max,
            min,
            rms: (sum_sq / n as f64).sqrt(),
        }
    }
}
