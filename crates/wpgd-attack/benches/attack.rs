//! Benchmarks for the projection, direction and attack hot paths.
//!
//! Run with: cargo bench -p wpgd-attack
//! Set `RUST_LOG=wpgd_attack=debug` to see per-iteration progress.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array, Array1, Array4};
use tracing_subscriber::EnvFilter;
use wpgd_attack::{AttackConfig, Attacker, DirectionOracle, ExecConfig, LossKind, Mlp, Projector};
use wpgd_core::{Exponent, ThreatModel};
use wpgd_tensor::Batch;

const PAIRS: [(Exponent, Exponent); 4] = [
    (Exponent::One, Exponent::One),
    (Exponent::One, Exponent::Two),
    (Exponent::Two, Exponent::One),
    (Exponent::Two, Exponent::Two),
];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// CIFAR-shaped images with deterministic content.
fn images(n: usize) -> Array4<f32> {
    Array::from_shape_fn((n, 3, 32, 32), |(i, c, h, w)| {
        let k = (i * 3072 + c * 1024 + h * 32 + w) as f32;
        0.5 + 0.4 * (k * 0.013).sin()
    })
}

fn label(q: Exponent, s: Exponent) -> String {
    format!("q{q}_s{s}")
}

fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("Attack/Project");

    for n in [16, 128] {
        let x_ref = images(n);
        let x_cur = &x_ref + &images(n).mapv(|v| 0.1 * (v - 0.5));
        group.throughput(Throughput::Elements(x_ref.len() as u64));

        for (q, s) in PAIRS {
            let projector = Projector::new(ThreatModel::new(q, s, 0.05).unwrap());
            group.bench_with_input(
                BenchmarkId::new(label(q, s), n),
                &(x_cur.clone(), x_ref.clone()),
                |b, (x_cur, x_ref)| {
                    b.iter(|| black_box(projector.project(x_cur.view(), x_ref.view()).unwrap()))
                },
            );
        }
    }
    group.finish();
}

fn bench_direction(c: &mut Criterion) {
    let mut group = c.benchmark_group("Attack/Direction");

    for n in [16, 128] {
        let grad = images(n).mapv(|v| v - 0.5);
        group.throughput(Throughput::Elements(grad.len() as u64));

        for (q, s) in PAIRS {
            let oracle = DirectionOracle::new(q, s).with_parallel(true);
            group.bench_with_input(BenchmarkId::new(label(q, s), n), &grad, |b, grad| {
                b.iter(|| black_box(oracle.direction(black_box(grad)).unwrap()))
            });
        }
    }
    group.finish();
}

fn bench_attack(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("Attack/Run");
    group.sample_size(10);

    let n = 32;
    let batch = Batch::new(images(n), Array1::from_iter((0..n).map(|i| i % 10))).unwrap();
    let mut net = Mlp::seeded([3, 32, 32], &[64], 10, 0).unwrap();

    for (q, s) in PAIRS {
        let threat = ThreatModel::from_pixel_budget(q, s, 8).unwrap();
        let fgsm = Attacker::fgsm(threat, LossKind::CrossEntropy, batch.clone()).unwrap();
        group.bench_function(BenchmarkId::new("fgsm", label(q, s)), |b| {
            b.iter(|| black_box(fgsm.attack(&mut net, false).unwrap().acc_min))
        });

        let mut config = AttackConfig::pgd(threat, LossKind::Dlr).with_exec(ExecConfig::default());
        config.iterations = 10;
        let pgd = Attacker::new(config, batch.clone()).unwrap();
        group.bench_function(BenchmarkId::new("pgd10", label(q, s)), |b| {
            b.iter(|| black_box(pgd.attack(&mut net, false).unwrap().acc_min))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_projection, bench_direction, bench_attack);
criterion_main!(benches);
