//! Helpers shared by the unit tests.

use crate::{
    buffers::{BufferAllocator, BufferLedger, VisSample, Visibility},
    c64,
    config::{AntennaCounts, ObservationConfig, PolFrame},
    marlu::RADec,
};

/// An allocator with a ledger of its own.
pub fn get_allocator() -> BufferAllocator {
    BufferAllocator::new(BufferLedger::new())
}

/// A four antenna, single channel, single time configuration.
pub fn get_config() -> ObservationConfig {
    ObservationConfig::new(
        "TEST",
        AntennaCounts::from_num_ants(4).unwrap(),
        PolFrame::Linear,
        vec![1e8],
        vec![1e6],
        vec![0.0],
        RADec::from_degrees(30.0, -60.0),
    )
    .unwrap()
}

/// A flat buffer whose every sample encodes its record and polarisation.
pub fn get_filled_visibility(allocator: &BufferAllocator, npol: usize, nvis: usize) -> Visibility {
    let mut vis = allocator.allocate_visibility(npol, nvis).unwrap();
    for record in 0..nvis {
        for pol in 0..npol {
            vis.set_sample(
                record,
                pol,
                VisSample {
                    vis: c64::new(record as f64, pol as f64),
                    weight: 1.0,
                    imaging_weight: 0.5,
                },
            )
            .unwrap();
        }
    }
    vis
}
