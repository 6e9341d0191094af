use bigdecimal::BigDecimal;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use common_money::NormalizedMoney;
use std::str::FromStr;

fn sum_via_normalized(values: &[BigDecimal]) -> BigDecimal {
    values
        .iter()
        .cloned()
        .map(NormalizedMoney::new)
        .fold(BigDecimal::from(0), |acc, m| acc + m.inner().clone())
}

fn generate_values(n: usize) -> Vec<BigDecimal> {
    let patterns = [
        "1.005", "2.675", "0.009", "3.333", "4.444", "5.555", "0.005", "9.999", "12.341", "7.500",
    ];
    (0..n)
        .map(|i| BigDecimal::from_str(patterns[i % patterns.len()]).unwrap())
        .collect()
}

fn bench_accumulation(c: &mut Criterion) {
    let sizes = [100usize, 1_000, 10_000];
    for &n in &sizes {
        let data = generate_values(n);
        c.bench_function(&format!("accumulate_normalized_sum_{n}"), |b| {
            b.iter(|| {
                let total = sum_via_normalized(&data);
                black_box(total);
            })
        });
    }
}

criterion_group!(benches, bench_accumulation);
criterion_main!(benches);
