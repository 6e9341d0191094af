use bigdecimal::BigDecimal;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use common_money::normalize_scale;
use std::str::FromStr;

fn bench_normalize_scale(c: &mut Criterion) {
    let samples: Vec<BigDecimal> = [
        "1.005",
        "2.675",
        "0.005",
        "-1.005",
        "-2.505",
        "12345",
        "19.90",
        "1000000.555",
        "-999999.995",
        "0.3349",
        "42.4242",
    ]
    .into_iter()
    .map(|s| BigDecimal::from_str(s).unwrap())
    .collect();

    c.bench_function("normalize_scale_fixed_samples", |b| {
        b.iter(|| {
            for v in &samples {
                black_box(normalize_scale(v));
            }
        });
    });
}

fn bench_normalize_scale_sweep(c: &mut Criterion) {
    let samples: Vec<BigDecimal> = (0..500)
        .map(|i| BigDecimal::from_str(&format!("{}.{:03}", i, i % 1000)).unwrap())
        .collect();

    c.bench_function("normalize_scale_sweep_500", |b| {
        b.iter(|| {
            for v in &samples {
                black_box(normalize_scale(v));
            }
        });
    });
}

criterion_group!(rounding, bench_normalize_scale, bench_normalize_scale_sweep);
criterion_main!(rounding);
