use criterion::{criterion_group, criterion_main, Criterion};

fn bench(criterion: &mut Criterion) {
    wyvern::bench::main(criterion);
}

criterion_group!(benches, bench);
criterion_main!(benches);
