use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ical::{
    c64, verify_copy, BufferAllocator, BufferLedger, ImageShape, VisSample, Visibility,
};

// the default observation restricted to 4 antennas: 5 channels, 11 times
const NUM_POLS: usize = 4;
const NUM_VIS: usize = 6 * 5 * 11;

fn get_filled_visibility(allocator: &BufferAllocator) -> Visibility {
    let mut vis = allocator.allocate_visibility(NUM_POLS, NUM_VIS).unwrap();
    for record in 0..NUM_VIS {
        for pol in 0..NUM_POLS {
            vis.set_sample(
                record,
                pol,
                VisSample {
                    vis: c64::new(record as f64, -(pol as f64)),
                    weight: 1.0,
                    imaging_weight: 1.0,
                },
            )
            .unwrap();
        }
    }
    vis
}

fn bench_verify_copy(crt: &mut Criterion) {
    let allocator = BufferAllocator::new(BufferLedger::new());
    let vis = get_filled_visibility(&allocator);
    let copy = allocator.copy_visibility(&vis).unwrap();
    crt.bench_function("verify_copy - identical", |bch| {
        bch.iter(|| verify_copy(black_box(vis.view()), black_box(copy.view())))
    });
}

fn bench_allocation(crt: &mut Criterion) {
    let allocator = BufferAllocator::new(BufferLedger::new());
    crt.bench_function("allocate_block_visibility - 4 ants", |bch| {
        bch.iter(|| {
            allocator
                .allocate_block_visibility(black_box(4), 5, NUM_POLS, 11)
                .unwrap()
        })
    });
    crt.bench_function("allocate_image - 5 x 256 x 256", |bch| {
        bch.iter(|| {
            allocator
                .allocate_image(black_box(ImageShape([5, 1, 256, 256])))
                .unwrap()
        })
    });
    let vis = get_filled_visibility(&allocator);
    crt.bench_function("copy_visibility", |bch| {
        bch.iter(|| allocator.copy_visibility(black_box(&vis)).unwrap())
    });
}

fn bench_qa(crt: &mut Criterion) {
    let allocator = BufferAllocator::new(BufferLedger::new());
    let vis = get_filled_visibility(&allocator);
    crt.bench_function("visibility qa", |bch| bch.iter(|| black_box(&vis).qa()));
}

criterion_group!(benches, bench_verify_copy, bench_allocation, bench_qa);
criterion_main!(benches);
