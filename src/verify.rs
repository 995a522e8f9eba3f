//! Check that one visibility buffer is a faithful, independent copy of
//! another.

use std::fmt::Display;

use log::debug;
use thiserror::Error;

use crate::{
    buffers::VisibilityView,
    constants::{VIS_BYTES_PER_POL_SAMPLE, VIS_HEADER_BYTES},
};

/// The result of comparing two visibility buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Distinct buffers of the same shape holding the same bytes.
    Identical,
    /// Both views are of the same buffer.
    SameIdentity,
    /// The sample or polarisation counts differ.
    ShapeMismatch,
    /// Distinct buffers sharing one data region.
    AliasedStorage,
    /// Some byte of the data regions differs.
    ContentMismatch,
}

impl CopyOutcome {
    /// The numeric code of this outcome, zero for [`CopyOutcome::Identical`].
    pub fn code(self) -> u8 {
        match self {
            CopyOutcome::Identical => 0,
            CopyOutcome::SameIdentity => 1,
            CopyOutcome::ShapeMismatch => 2,
            CopyOutcome::AliasedStorage => 3,
            CopyOutcome::ContentMismatch => 4,
        }
    }

    /// `Ok` only for [`CopyOutcome::Identical`].
    ///
    /// # Errors
    ///
    /// Any other outcome becomes the matching [`VerificationError`].
    pub fn into_result(self) -> Result<(), VerificationError> {
        match self {
            CopyOutcome::Identical => Ok(()),
            CopyOutcome::SameIdentity => Err(VerificationError::SameIdentity),
            CopyOutcome::ShapeMismatch => Err(VerificationError::ShapeMismatch),
            CopyOutcome::AliasedStorage => Err(VerificationError::AliasedStorage),
            CopyOutcome::ContentMismatch => Err(VerificationError::ContentMismatch),
        }
    }
}

impl Display for CopyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                CopyOutcome::Identical => "identical",
                CopyOutcome::SameIdentity => "same buffer",
                CopyOutcome::ShapeMismatch => "shape mismatch",
                CopyOutcome::AliasedStorage => "aliased storage",
                CopyOutcome::ContentMismatch => "content mismatch",
            }
        )
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Ways a copy can fail verification.
pub enum VerificationError {
    #[error("Both visibility buffers are the same buffer")]
    /// Both views are of the same buffer.
    SameIdentity,
    #[error("The visibility buffers have different sample or polarisation counts")]
    /// The sample or polarisation counts differ.
    ShapeMismatch,
    #[error("The visibility buffers share their data region")]
    /// Distinct buffers sharing one data region.
    AliasedStorage,
    #[error("The visibility buffers hold different data")]
    /// Some byte of the data regions differs.
    ContentMismatch,
}

fn region_len(nvis: usize, npol: usize) -> Option<usize> {
    VIS_BYTES_PER_POL_SAMPLE
        .checked_mul(npol)?
        .checked_mul(nvis)?
        .checked_add(VIS_HEADER_BYTES)
}

/// Compare visibility buffer `b` against `a`.
///
/// The first matching check wins: same identity, differing shape, shared
/// storage, then differing content over the expected region length. A region
/// shorter than its shape implies counts as differing content.
pub fn verify_copy(a: VisibilityView, b: VisibilityView) -> CopyOutcome {
    let outcome = compare(a, b);
    debug!("verify_copy({}, {}) = {outcome}", a.id, b.id);
    outcome
}

fn compare(a: VisibilityView, b: VisibilityView) -> CopyOutcome {
    if a.id == b.id {
        return CopyOutcome::SameIdentity;
    }
    if a.nvis != b.nvis || a.npol != b.npol {
        return CopyOutcome::ShapeMismatch;
    }
    if std::ptr::eq(a.bytes.as_ptr(), b.bytes.as_ptr()) {
        return CopyOutcome::AliasedStorage;
    }
    let len = match region_len(a.nvis, a.npol) {
        Some(len) => len,
        None => return CopyOutcome::ContentMismatch,
    };
    match (a.bytes.get(..len), b.bytes.get(..len)) {
        (Some(a), Some(b)) if a == b => CopyOutcome::Identical,
        _ => CopyOutcome::ContentMismatch,
    }
}
