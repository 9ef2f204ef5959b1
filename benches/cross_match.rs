use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use too::constants::{CatalogId, DEFAULT_VERSION_ID};
use too::mock::{create_mock_too_batch, MockParams};
use too::pipeline::{PipelineParams, RunContext, TooPipeline};
use too::store::{CatalogEntry, MemoryStore};

/// Catalog of `n` Gaia-like entries spread over a 2° × 2° field.
fn field_catalog(rng: &mut StdRng, n: usize) -> MemoryStore {
    let entries = (1..=n as CatalogId).map(|catalogid| CatalogEntry {
        catalogid,
        ra: rng.random_range(150.0..152.0),
        dec: rng.random_range(1.0..3.0),
        lead: "gaia_dr3_source".into(),
        version_id: DEFAULT_VERSION_ID,
    });
    MemoryStore::with_catalog(entries).unwrap()
}

fn bench_full_run(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let params = MockParams::builder()
        .ra_range(150.0..152.0)
        .dec_range(1.0..3.0)
        .build()
        .unwrap();
    let batch = create_mock_too_batch(2_000, &mut rng, &params);
    let catalog = field_catalog(&mut rng, 50_000);
    let ctx = RunContext::new(DEFAULT_VERSION_ID, 60000.5);

    c.bench_function("pipeline/run_2k_targets_50k_catalog", |b| {
        b.iter_batched(
            || TooPipeline::new(catalog.clone(), PipelineParams::default()),
            |mut pipeline| black_box(pipeline.run(&batch, &ctx).unwrap()),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_full_run);
criterion_main!(benches);
