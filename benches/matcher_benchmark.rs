use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use jetflow::{
    data::{Jet, Particle},
    jets::process_pairs,
    matcher::Matcher,
    Float, MatchingConfig, PI,
};

const PDGIDS: [(u32, i32); 4] = [(22, 0), (130, 0), (211, 1), (211, -1)];

fn uniform(rng: &mut fastrand::Rng) -> Float {
    rng.f64() as Float
}

fn toy_pair(rng: &mut fastrand::Rng, n: usize) -> (Jet, Jet) {
    let mut truth = Vec::with_capacity(n);
    let mut reco = Vec::with_capacity(n);
    for _ in 0..n {
        let (pdgid, charge) = PDGIDS[rng.usize(..PDGIDS.len())];
        let pt = 1.0 + 30.0 * uniform(rng);
        let eta = 0.4 * (uniform(rng) - 0.5);
        let phi = 0.4 * (uniform(rng) - 0.5) + 0.5 * PI;
        truth.push(Particle::new(pt, eta, phi, pdgid, charge));
        if uniform(rng) < 0.9 {
            reco.push(Particle::new(
                pt * (1.0 + 0.1 * (uniform(rng) - 0.5)),
                eta + 0.01 * (uniform(rng) - 0.5),
                phi + 0.01 * (uniform(rng) - 0.5),
                pdgid,
                charge,
            ));
        }
    }
    (Jet::new(reco), Jet::new(truth))
}

fn matcher_benchmark(c: &mut Criterion) {
    let mut rng = fastrand::Rng::with_seed(0);
    let config = MatchingConfig::default();
    let mut group = c.benchmark_group("matcher_fit");
    for n in [5, 10, 20] {
        let (reco, truth) = toy_pair(&mut rng, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter_batched(
                || (reco.clone(), truth.clone()),
                |(reco, truth)| black_box(Matcher::fit(&reco, &truth, &config)),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn batch_benchmark(c: &mut Criterion) {
    let mut rng = fastrand::Rng::with_seed(1);
    let config = MatchingConfig::default();
    let (reco, truth): (Vec<Jet>, Vec<Jet>) = (0..64).map(|_| toy_pair(&mut rng, 8)).unzip();
    let pairs: Vec<(usize, usize)> = (0..reco.len()).map(|i| (i, i)).collect();
    c.bench_function("process_pairs_64", |b| {
        b.iter(|| black_box(process_pairs(&reco, &truth, &pairs, &config)))
    });
}

criterion_group!(benches, matcher_benchmark, batch_benchmark);
criterion_main!(benches);
