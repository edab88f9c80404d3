use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Seed used when a config omits one, so reloading a saved architecture
/// reproduces the documented variance profile.
pub const DEFAULT_SEED: u64 = 12;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    FanIn,
    FanOut,
    FanAvg,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceDistribution {
    Uniform,
    TruncatedNormal,
    UntruncatedNormal,
}

/// Weight initialization strategy. `generate` is deterministic for a given
/// seed, so two materializations of the same config produce equal tensors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Initializer {
    Zeros,
    Ones,
    Constant(f64),
    RandomUniform { min: f64, max: f64, seed: u64 },
    RandomNormal { mean: f64, stdev: f64, seed: u64 },
    TruncatedNormal { stdev: f64, seed: u64 },
    GlorotUniform { seed: u64 },
    GlorotNormal { seed: u64 },
    HeUniform { seed: u64 },
    HeNormal { seed: u64 },
    LeCunUniform { seed: u64 },
    LeCunNormal { seed: u64 },
    VarianceScaling {
        scale: f64,
        mode: FanMode,
        distribution: VarianceDistribution,
        seed: u64,
    },
}

impl Initializer {
    pub fn glorot_uniform() -> Self {
        Initializer::GlorotUniform { seed: DEFAULT_SEED }
    }

    pub fn generate(&self, fan_in: usize, fan_out: usize, shape: &[usize]) -> ArrayD<f64> {
        match self {
            Initializer::Zeros => ArrayD::zeros(IxDyn(shape)),
            Initializer::Ones => ArrayD::ones(IxDyn(shape)),
            Initializer::Constant(c) => ArrayD::from_elem(IxDyn(shape), *c),
            Initializer::RandomUniform { min, max, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                ArrayD::random_using(IxDyn(shape), Uniform::new(*min, *max), &mut rng)
            }
            Initializer::RandomNormal { mean, stdev, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                ArrayD::from_shape_simple_fn(IxDyn(shape), || {
                    let z: f64 = rng.sample(StandardNormal);
                    mean + z * stdev
                })
            }
            Initializer::TruncatedNormal { stdev, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                ArrayD::from_shape_simple_fn(IxDyn(shape), || truncated_sample(&mut rng) * stdev)
            }
            Initializer::GlorotUniform { seed } => variance_scaling(
                1.0,
                FanMode::FanAvg,
                VarianceDistribution::Uniform,
                *seed,
                fan_in,
                fan_out,
                shape,
            ),
            Initializer::GlorotNormal { seed } => variance_scaling(
                1.0,
                FanMode::FanAvg,
                VarianceDistribution::TruncatedNormal,
                *seed,
                fan_in,
                fan_out,
                shape,
            ),
            Initializer::HeUniform { seed } => variance_scaling(
                2.0,
                FanMode::FanIn,
                VarianceDistribution::Uniform,
                *seed,
                fan_in,
                fan_out,
                shape,
            ),
            Initializer::HeNormal { seed } => variance_scaling(
                2.0,
                FanMode::FanIn,
                VarianceDistribution::TruncatedNormal,
                *seed,
                fan_in,
                fan_out,
                shape,
            ),
            Initializer::LeCunUniform { seed } => variance_scaling(
                1.0,
                FanMode::FanIn,
                VarianceDistribution::Uniform,
                *seed,
                fan_in,
                fan_out,
                shape,
            ),
            Initializer::LeCunNormal { seed } => variance_scaling(
                1.0,
                FanMode::FanIn,
                VarianceDistribution::TruncatedNormal,
                *seed,
                fan_in,
                fan_out,
                shape,
            ),
            Initializer::VarianceScaling {
                scale,
                mode,
                distribution,
                seed,
            } => variance_scaling(*scale, *mode, *distribution, *seed, fan_in, fan_out, shape),
        }
    }
}

/// Standard normal draw resampled until it falls within two standard
/// deviations.
fn truncated_sample(rng: &mut StdRng) -> f64 {
    loop {
        let z: f64 = rng.sample(StandardNormal);
        if z.abs() <= 2.0 {
            return z;
        }
    }
}

fn variance_scaling(
    scale: f64,
    mode: FanMode,
    distribution: VarianceDistribution,
    seed: u64,
    fan_in: usize,
    fan_out: usize,
    shape: &[usize],
) -> ArrayD<f64> {
    let fan = match mode {
        FanMode::FanIn => fan_in as f64,
        FanMode::FanOut => fan_out as f64,
        FanMode::FanAvg => (fan_in + fan_out) as f64 / 2.0,
    };
    let variance = scale / fan.max(1.0);
    let mut rng = StdRng::seed_from_u64(seed);
    match distribution {
        VarianceDistribution::Uniform => {
            let limit = (3.0 * variance).sqrt();
            ArrayD::random_using(IxDyn(shape), Uniform::new(-limit, limit), &mut rng)
        }
        VarianceDistribution::UntruncatedNormal => {
            let stdev = variance.sqrt();
            ArrayD::from_shape_simple_fn(IxDyn(shape), || {
                let z: f64 = rng.sample(StandardNormal);
                z * stdev
            })
        }
        VarianceDistribution::TruncatedNormal => {
            let stdev = variance.sqrt();
            ArrayD::from_shape_simple_fn(IxDyn(shape), || truncated_sample(&mut rng) * stdev)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_seed() {
        let init = Initializer::GlorotUniform { seed: 42 };
        let a = init.generate(8, 4, &[8, 4]);
        let b = init.generate(8, 4, &[8, 4]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_differ() {
        let a = Initializer::GlorotUniform { seed: 1 }.generate(8, 4, &[8, 4]);
        let b = Initializer::GlorotUniform { seed: 2 }.generate(8, 4, &[8, 4]);
        assert_ne!(a, b);
    }

    #[test]
    fn glorot_uniform_stays_in_bounds() {
        let init = Initializer::glorot_uniform();
        let w = init.generate(100, 50, &[100, 50]);
        let limit = (6.0 / 150.0f64).sqrt();
        assert!(w.iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn truncated_normal_stays_within_two_stdev() {
        let init = Initializer::TruncatedNormal { stdev: 0.5, seed: 7 };
        let w = init.generate(10, 10, &[10, 10]);
        assert!(w.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn constant_fill() {
        let w = Initializer::Constant(0.25).generate(3, 3, &[3, 3]);
        assert!(w.iter().all(|&v| v == 0.25));
        let z = Initializer::Zeros.generate(3, 3, &[2, 2]);
        assert!(z.iter().all(|&v| v == 0.0));
    }
}
