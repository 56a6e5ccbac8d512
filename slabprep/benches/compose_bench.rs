//! Benchmarks for transform composition and resampling.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::{Matrix4, Vector3};
use ndarray::Array3;
use slabprep::compose::ComposedTransform;
use slabprep::io::Volume;
use slabprep::resample::{resample_with_field, Interpolation, KernelResampler};
use slabprep::spatial::{DistortionState, ImageGeometry, LinearTransform, ReferenceFrame, TransformPair, WarpField};

fn slab_grid() -> ImageGeometry {
    ImageGeometry::axis_aligned([64, 64, 16], [1.0, 1.0, 1.0], [-32.0, -32.0, -8.0])
}

fn anat_grid() -> ImageGeometry {
    ImageGeometry::axis_aligned([96, 96, 96], [1.0, 1.0, 1.0], [-48.0, -48.0, -48.0])
}

fn shift(source: ReferenceFrame, target: ReferenceFrame, offset: Vector3<f64>) -> TransformPair {
    let matrix = Matrix4::new_translation(&offset);
    TransformPair::from_linear(source, target, LinearTransform::physical(matrix)).unwrap()
}

/// slab (distorted) -> slab (corrected) -> slab reference -> whole volume -> anatomical
fn slab_chain() -> ComposedTransform {
    let run = "task-motor_run-02".to_string();
    let native = |state| ReferenceFrame::NativeSlab { run: run.clone(), state };
    let sdc = TransformPair::from_pull_field(
        native(DistortionState::Distorted),
        native(DistortionState::Corrected),
        WarpField::constant(slab_grid(), Vector3::new(0.0, 0.8, 0.0)).unwrap(),
    )
    .unwrap();
    ComposedTransform::from_pairs(vec![
        sdc,
        shift(
            native(DistortionState::Corrected),
            ReferenceFrame::SlabReference(DistortionState::Corrected),
            Vector3::new(0.5, 0.0, 1.0),
        ),
        shift(
            ReferenceFrame::SlabReference(DistortionState::Corrected),
            ReferenceFrame::WholeVolume(DistortionState::Corrected),
            Vector3::new(-1.0, 0.25, 0.0),
        ),
        shift(
            ReferenceFrame::WholeVolume(DistortionState::Corrected),
            ReferenceFrame::Anatomical,
            Vector3::new(0.0, 0.0, -2.0),
        ),
    ])
    .unwrap()
}

fn compose_benchmark(c: &mut Criterion) {
    let composed = slab_chain();
    let grid = composed.sampling_grid(&slab_grid(), &anat_grid(), true).unwrap();

    c.bench_function("pull_field_regridded", |b| {
        b.iter(|| black_box(composed.pull_field(black_box(&grid)).unwrap()));
    });

    let pull = composed.pull_field(&grid).unwrap();
    #[allow(clippy::cast_precision_loss)]
    let source = Volume {
        geometry: slab_grid(),
        data: Array3::from_shape_fn((64, 64, 16), |(i, j, k)| (i + j + k) as f32),
    };
    c.bench_function("resample_windowed_sinc", |b| {
        b.iter(|| black_box(resample_with_field(&KernelResampler, &source, &pull, Interpolation::WindowedSinc).unwrap()));
    });
}

criterion_group!(benches, compose_benchmark);
criterion_main!(benches);
