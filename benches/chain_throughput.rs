use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strand::chain::{Chain, StageOptions};

fn bench_chain_map(c: &mut Criterion) {
    let chain = Chain::<u64, u64>::new().map_opts(|x| x.wrapping_mul(31) ^ 7, StageOptions::width(4));

    c.bench_function("chain_map_1000", |b| {
        b.iter(|| {
            let out = chain.execute_eager(black_box(0..1000u64)).unwrap();
            black_box(out)
        })
    });
}

fn bench_chain_two_stages(c: &mut Criterion) {
    let chain = Chain::<u64, u64>::new()
        .map_opts(|x| x + 1, StageOptions::width(4))
        .filter_opts(|x| x % 3 != 0, StageOptions::width(4));

    c.bench_function("chain_map_filter_1000", |b| {
        b.iter(|| {
            let out = chain.execute_eager(black_box(0..1000u64)).unwrap();
            black_box(out)
        })
    });
}

fn bench_sequential_baseline(c: &mut Criterion) {
    let chain = Chain::<u64, u64>::new().map(|x| x.wrapping_mul(31) ^ 7);

    c.bench_function("chain_map_1000_seq", |b| {
        b.iter(|| {
            let out = chain.collect_seq(black_box(0..1000u64)).unwrap();
            black_box(out)
        })
    });
}

criterion_group!(
    benches,
    bench_chain_map,
    bench_chain_two_stages,
    bench_sequential_baseline
);
criterion_main!(benches);
