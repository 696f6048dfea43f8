//! Usage sampling policies.
//!
//! A sampler decides, independently per host, whether that host's usage is
//! included in a measurement sample, and provides estimators that recover an
//! unbiased aggregate (or compacted distribution) from the included samples
//! alone.
//!
//! Threshold sampling follows "Learn More, Sample Less: Control of Volume and
//! Variance in Network Measurement" (Duffield et al., IEEE Transactions on
//! Information Theory '05).

use fair_alloc::ValCount;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Picks hosts with a fixed probability, independent of usage.
///
/// The number of samples collected is proportional to the number of hosts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformSampler {
    pub prob: f64,
}

/// Picks hosts with probability proportional to their usage, scaled so the
/// expected sample count at `approval` aggregate usage equals the configured
/// budget. Estimates are Horvitz-Thompson weighted and self-normalizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedSampler {
    approval: f64,
    /// num_samples_at_approval / approval
    z: f64,
}

impl WeightedSampler {
    pub fn new(num_samples_at_approval: f64, approval: f64) -> Self {
        WeightedSampler { approval, z: num_samples_at_approval / approval }
    }

    fn prob_of(&self, usage: f64) -> f64 {
        if self.approval == 0.0 {
            return 1.0;
        }
        let p = (usage * self.z).min(1.0);
        assert!(
            (0.0..=1.0).contains(&p),
            "bad inclusion probability {p} (usage = {usage}, z = {}, approval = {})",
            self.z,
            self.approval
        );
        p
    }
}

/// Deterministic-cutoff variant of [`WeightedSampler`]: hosts at or above the
/// threshold are always included, hosts below it probabilistically, with the
/// same expected aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdSampler {
    /// Usage above which inclusion is certain; 0 means include everything.
    tau: f64,
}

impl ThresholdSampler {
    pub fn new(num_samples_at_approval: f64, approval: f64) -> Self {
        ThresholdSampler { tau: approval / num_samples_at_approval }
    }

    fn prob_of(&self, usage: f64) -> f64 {
        if self.tau == 0.0 {
            return 1.0;
        }
        let p = (usage / self.tau).min(1.0);
        assert!(
            (0.0..=1.0).contains(&p),
            "bad inclusion probability {p} (usage = {usage}, tau = {})",
            self.tau
        );
        p
    }
}

/// A usage sampling policy. The variant set is closed by the evaluation
/// design; all variants share the same capability surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampler {
    Uniform(UniformSampler),
    Weighted(WeightedSampler),
    Threshold(ThresholdSampler),
}

impl Sampler {
    /// Decides whether a host with the given usage joins the sample.
    pub fn should_include(&self, rng: &mut impl Rng, usage: f64) -> bool {
        rng.gen::<f64>() < self.prob_of(usage)
    }

    /// The inclusion probability for a host with the given usage.
    pub fn prob_of(&self, usage: f64) -> f64 {
        match self {
            Sampler::Uniform(s) => s.prob,
            Sampler::Weighted(s) => s.prob_of(usage),
            Sampler::Threshold(s) => s.prob_of(usage),
        }
    }

    /// Expected sample count over the given usages.
    pub fn ideal_num_samples(&self, usages: &[f64]) -> f64 {
        match self {
            Sampler::Uniform(s) => s.prob.min(1.0) * usages.len() as f64,
            _ => usages.iter().map(|&u| self.prob_of(u)).sum(),
        }
    }

    /// A fresh aggregate-usage estimator. One per estimation pass; owned
    /// exclusively by the caller.
    pub fn agg_estimator(&self) -> AggUsageEstimator {
        match self {
            Sampler::Uniform(_) => AggUsageEstimator::Uniform { sum: 0.0, num: 0.0 },
            Sampler::Weighted(s) => AggUsageEstimator::Weighted { sampler: *s, est: 0.0 },
            Sampler::Threshold(s) => AggUsageEstimator::Threshold { sampler: *s, est: 0.0 },
        }
    }

    /// A fresh usage-distribution estimator.
    pub fn dist_estimator(&self) -> UsageDistEstimator {
        UsageDistEstimator { sampler: *self, data: HashMap::new(), num: 0.0 }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Sampler::Uniform(_) => "uniform",
            Sampler::Weighted(_) => "weighted",
            Sampler::Threshold(_) => "threshold",
        }
    }
}

/// Accumulates included samples and estimates the aggregate usage.
#[derive(Debug, Clone)]
pub enum AggUsageEstimator {
    Uniform { sum: f64, num: f64 },
    Weighted { sampler: WeightedSampler, est: f64 },
    Threshold { sampler: ThresholdSampler, est: f64 },
}

impl AggUsageEstimator {
    pub fn record_sample(&mut self, usage: f64) {
        match self {
            AggUsageEstimator::Uniform { sum, num } => {
                *sum += usage;
                *num += 1.0;
            }
            AggUsageEstimator::Weighted { sampler, est } => {
                *est += usage / sampler.prob_of(usage);
            }
            AggUsageEstimator::Threshold { sampler, est } => {
                // Duffield estimator: each included sample contributes
                // max(usage, tau).
                *est += usage.max(sampler.tau);
            }
        }
    }

    /// Estimated aggregate usage across `num_hosts` hosts. The weighted and
    /// threshold estimators are self-normalizing and ignore the host count.
    pub fn est_usage(&self, num_hosts: usize) -> f64 {
        match self {
            AggUsageEstimator::Uniform { sum, num } => num_hosts as f64 * sum / num.max(1.0),
            AggUsageEstimator::Weighted { est, .. } => *est,
            AggUsageEstimator::Threshold { est, .. } => *est,
        }
    }
}

/// Accumulates included samples into an estimated compacted distribution.
#[derive(Debug, Clone)]
pub struct UsageDistEstimator {
    sampler: Sampler,
    // Keyed by the usage value's bit pattern: repeated values collapse.
    data: HashMap<u64, u32>,
    num: f64,
}

impl UsageDistEstimator {
    pub fn record_sample(&mut self, usage: f64) {
        *self.data.entry(usage.to_bits()).or_insert(0) += 1;
        self.num += 1.0;
    }

    pub fn est_dist(&self, num_hosts: usize) -> Vec<ValCount> {
        let mut dist = Vec::with_capacity(self.data.len());
        match self.sampler {
            Sampler::Uniform(_) => {
                let k = num_hosts as f64 / self.num.max(1.0);
                for (&bits, &count) in &self.data {
                    dist.push(ValCount {
                        val: f64::from_bits(bits),
                        expected_count: k * count as f64,
                    });
                }
            }
            _ => {
                for (&bits, &count) in &self.data {
                    let val = f64::from_bits(bits);
                    dist.push(ValCount {
                        val,
                        expected_count: count as f64 / self.sampler.prob_of(val),
                    });
                }
            }
        }
        dist
    }
}

const KIND_UNIFORM: &str = "uniform";
const KIND_WEIGHTED: &str = "weighted";
const KIND_THRESHOLD: &str = "threshold";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Uniform,
    Weighted,
    Threshold,
}

impl SamplerKind {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerKind::Uniform => KIND_UNIFORM,
            SamplerKind::Weighted => KIND_WEIGHTED,
            SamplerKind::Threshold => KIND_THRESHOLD,
        }
    }
}

/// Config-file description of a sampler, instantiated per scenario once the
/// approval and host count are known.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerFactory {
    pub kind: SamplerKind,
    pub num_samples_at_approval: f64,
}

impl SamplerFactory {
    pub fn new_sampler(&self, approval: f64, num_hosts: f64) -> Sampler {
        match self.kind {
            SamplerKind::Uniform => Sampler::Uniform(UniformSampler {
                prob: (self.num_samples_at_approval / num_hosts).min(1.0),
            }),
            SamplerKind::Weighted => {
                Sampler::Weighted(WeightedSampler::new(self.num_samples_at_approval, approval))
            }
            SamplerKind::Threshold => {
                Sampler::Threshold(ThresholdSampler::new(self.num_samples_at_approval, approval))
            }
        }
    }
}
