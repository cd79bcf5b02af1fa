//! Distribution sampler checks: exactness for constants, Kolmogorov-Smirnov
//! goodness of fit for the uniform and geometric families.

use fabline::{Distribution, SimRng};

const SAMPLES: usize = 5000;

/// KS critical value at alpha = 0.05 for large n. The discrete CDFs here
/// make the test conservative, so rejections at this threshold are rarer
/// than 5% per seed; we run a handful of seeds and allow one rejection.
fn ks_critical(n: usize) -> f64 {
    1.358 / (n as f64).sqrt()
}

fn draw(dist: Distribution, seed: u64, n: usize) -> Vec<u64> {
    let mut rng = SimRng::new(seed);
    (0..n).map(|_| dist.sample(&mut rng)).collect()
}

/// Supremum distance between the empirical CDF and `cdf`.
fn ks_statistic(samples: &[u64], cdf: impl Fn(u64) -> f64) -> f64 {
    let n = samples.len() as f64;
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let max = *sorted.last().expect("non-empty sample");

    let mut worst: f64 = 0.0;
    let mut seen = 0usize;
    let mut i = 0usize;
    for x in 0..=max {
        while i < sorted.len() && sorted[i] == x {
            seen += 1;
            i += 1;
        }
        let empirical = seen as f64 / n;
        worst = worst.max((empirical - cdf(x)).abs());
    }
    worst
}

#[test]
fn constant_distribution_is_exact() {
    let samples = draw(Distribution::Constant(7), 1, SAMPLES);
    assert!(samples.iter().all(|&x| x == 7));
}

#[test]
fn uniform_samples_pass_kolmogorov_smirnov() {
    let (low, high) = (2u64, 9u64);
    let dist = Distribution::Uniform(low, high);
    let width = (high - low + 1) as f64;
    let cdf = |x: u64| {
        if x < low {
            0.0
        } else if x >= high {
            1.0
        } else {
            (x - low + 1) as f64 / width
        }
    };

    let mut rejections = 0;
    for seed in 0..5 {
        let samples = draw(dist, seed, SAMPLES);
        if ks_statistic(&samples, cdf) > ks_critical(SAMPLES) {
            rejections += 1;
        }
    }
    assert!(rejections <= 1, "{rejections} of 5 seeds rejected");
}

#[test]
fn geometric_samples_pass_kolmogorov_smirnov() {
    let p = 0.3f64;
    let dist = Distribution::Geometric(p);
    let cdf = |x: u64| {
        if x == 0 {
            0.0
        } else {
            1.0 - (1.0 - p).powi(x as i32)
        }
    };

    let mut rejections = 0;
    for seed in 10..15 {
        let samples = draw(dist, seed, SAMPLES);
        if ks_statistic(&samples, cdf) > ks_critical(SAMPLES) {
            rejections += 1;
        }
    }
    assert!(rejections <= 1, "{rejections} of 5 seeds rejected");
}

#[test]
fn uniform_mean_converges() {
    let samples = draw(Distribution::Uniform(1, 5), 3, SAMPLES);
    let mean = samples.iter().sum::<u64>() as f64 / SAMPLES as f64;
    assert!((mean - 3.0).abs() < 0.1, "observed mean {mean}");
}

#[test]
fn geometric_mean_converges() {
    let samples = draw(Distribution::Geometric(0.25), 4, SAMPLES);
    let mean = samples.iter().sum::<u64>() as f64 / SAMPLES as f64;
    assert!((mean - 4.0).abs() < 0.25, "observed mean {mean}");
}
