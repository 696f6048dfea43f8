//! Sweep configuration and its combinatorial expansion into instances.

use demand_dists::{ConfigDistGen, DistError, DistGen};
use feedback_sim::DowngradeFracController;
use flow_selection::Selector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use usage_sampling::{Sampler, SamplerKind, ThresholdSampler, UniformSampler, WeightedSampler};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} is empty")]
    Empty { field: &'static str },
    #[error("{field}[{index}] must be positive (found {value})")]
    NonPositive { field: &'static str, index: usize, value: f64 },
    #[error("{field} must be positive (found {value})")]
    NonPositiveScalar { field: &'static str, value: f64 },
    #[error("{field}[{index}] = {num_hosts} is fewer than the {min_hosts} hosts {dist_field}[{dist_index}] requires")]
    TooFewHosts {
        field: &'static str,
        index: usize,
        num_hosts: usize,
        dist_field: &'static str,
        dist_index: usize,
        min_hosts: usize,
    },
    #[error("{field}[{index}]: {source}")]
    BadDist {
        field: &'static str,
        index: usize,
        source: DistError,
    },
}

fn check_num_hosts(
    field: &'static str,
    num_hosts: &[usize],
    dist_field: &'static str,
    dist_index: usize,
    gen: &DistGen,
) -> Result<(), ConfigError> {
    let min_hosts = gen.min_num_hosts();
    for (index, &n) in num_hosts.iter().enumerate() {
        if n < min_hosts {
            return Err(ConfigError::TooFewHosts {
                field,
                index,
                num_hosts: n,
                dist_field,
                dist_index,
                min_hosts,
            });
        }
    }
    Ok(())
}

fn check_dists(field: &'static str, dists: &[ConfigDistGen]) -> Result<(), ConfigError> {
    if dists.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    for (index, dg) in dists.iter().enumerate() {
        dg.into_gen()
            .map_err(|source| ConfigError::BadDist { field, index, source })?;
    }
    Ok(())
}

fn check_positive_ints(field: &'static str, vals: &[usize]) -> Result<(), ConfigError> {
    if vals.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    for (index, &v) in vals.iter().enumerate() {
        if v == 0 {
            return Err(ConfigError::NonPositive { field, index, value: 0.0 });
        }
    }
    Ok(())
}

fn check_positive_floats(field: &'static str, vals: &[f64]) -> Result<(), ConfigError> {
    if vals.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    for (index, &v) in vals.iter().enumerate() {
        if v <= 0.0 {
            return Err(ConfigError::NonPositive { field, index, value: v });
        }
    }
    Ok(())
}

/// Sweep over sampler and selector performance: every instance is one point
/// in the cross product of the listed axes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub host_usages: Vec<ConfigDistGen>,
    pub num_hosts: Vec<usize>,
    pub approval_over_expected_usage: Vec<f64>,
    pub num_samples_at_approval: Vec<usize>,
    /// Base for deriving per-shard RNG seeds; identical configs and seeds
    /// reproduce identical results.
    #[serde(default)]
    pub base_seed: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_dists("hostUsages", &self.host_usages)?;
        check_positive_ints("numHosts", &self.num_hosts)?;
        check_positive_floats("approvalOverExpectedUsage", &self.approval_over_expected_usage)?;
        check_positive_ints("numSamplesAtApproval", &self.num_samples_at_approval)?;
        Ok(())
    }

    pub fn enumerate(&self) -> Result<Vec<Instance>, ConfigError> {
        self.validate()?;
        let mut instances = Vec::new();
        for (index, dg) in self.host_usages.iter().enumerate() {
            let gen = dg.into_gen().map_err(|source| ConfigError::BadDist {
                field: "hostUsages",
                index,
                source,
            })?;
            check_num_hosts("numHosts", &self.num_hosts, "hostUsages", index, &gen)?;
            for &num_hosts in &self.num_hosts {
                let dist_gen = gen.with_num_hosts(num_hosts);
                for &aoe in &self.approval_over_expected_usage {
                    for &num_samples in &self.num_samples_at_approval {
                        let approval = num_hosts as f64 * dist_gen.dist_mean() * aoe;
                        instances.push(Instance {
                            id: instances.len() as u64,
                            host_usages: dist_gen,
                            approval_over_expected_usage: aoe,
                            num_samples_at_approval: num_samples,
                            sys: Sys::full_matrix(num_samples as f64, num_hosts as f64, approval),
                        });
                    }
                }
            }
        }
        Ok(instances)
    }
}

/// One experiment point for the sampler/selector sweep.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u64,
    pub host_usages: DistGen,
    pub approval_over_expected_usage: f64,
    pub num_samples_at_approval: usize,
    pub sys: Sys,
}

impl Instance {
    pub fn approval(&self) -> f64 {
        self.approval_over_expected_usage
            * self.host_usages.num_hosts() as f64
            * self.host_usages.dist_mean()
    }
}

/// The sampler x selector matrix evaluated for each instance.
#[derive(Debug, Clone)]
pub struct Sys {
    pub samplers: Vec<Sampler>,
    pub host_selectors: Vec<Selector>,
}

impl Sys {
    fn full_matrix(num_samples: f64, num_hosts: f64, approval: f64) -> Self {
        Sys {
            samplers: vec![
                Sampler::Uniform(UniformSampler { prob: (num_samples / num_hosts).min(1.0) }),
                Sampler::Weighted(WeightedSampler::new(num_samples, approval)),
                Sampler::Threshold(ThresholdSampler::new(num_samples, approval)),
            ],
            host_selectors: vec![
                Selector::Hash,
                Selector::Knapsack,
                Selector::Hybrid { num_rr: 50 },
            ],
        }
    }

    pub fn num(&self) -> usize {
        self.samplers.len() * self.host_selectors.len()
    }

    pub fn sys_id(&self, sampler_id: usize, host_selector_id: usize) -> usize {
        sampler_id * self.host_selectors.len() + host_selector_id
    }

    pub fn sampler_id(&self, sys_id: usize) -> usize {
        sys_id / self.host_selectors.len()
    }

    pub fn host_selector_id(&self, sys_id: usize) -> usize {
        sys_id % self.host_selectors.len()
    }
}

/// Per-scenario knobs that are not swept combinatorially.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackScenarioTemplate {
    pub max_host_usage: f64,
    #[serde(rename = "lopriCapOverExpectedDemand")]
    pub lopri_cap_over_expected_demand: f64,
    pub sampler_kind: SamplerKind,
    pub controller: DowngradeFracController,
}

/// Sweep over closed-loop feedback control behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackConfig {
    pub host_demands: Vec<ConfigDistGen>,
    pub num_hosts: Vec<usize>,
    pub approval_over_expected_demand: Vec<f64>,
    pub num_samples_at_approval: Vec<usize>,
    pub num_feedback_iters: usize,
    pub feedback_scenarios: Vec<FeedbackScenarioTemplate>,
    #[serde(default)]
    pub base_seed: u64,
}

impl FeedbackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_dists("hostDemands", &self.host_demands)?;
        check_positive_ints("numHosts", &self.num_hosts)?;
        check_positive_floats(
            "approvalOverExpectedDemand",
            &self.approval_over_expected_demand,
        )?;
        check_positive_ints("numSamplesAtApproval", &self.num_samples_at_approval)?;
        if self.num_feedback_iters == 0 {
            return Err(ConfigError::NonPositiveScalar {
                field: "numFeedbackIters",
                value: 0.0,
            });
        }
        if self.feedback_scenarios.is_empty() {
            return Err(ConfigError::Empty { field: "feedbackScenarios" });
        }
        Ok(())
    }

    pub fn enumerate(&self) -> Result<Vec<FeedbackInstance>, ConfigError> {
        self.validate()?;
        let mut instances = Vec::new();
        for (index, dg) in self.host_demands.iter().enumerate() {
            let gen = dg.into_gen().map_err(|source| ConfigError::BadDist {
                field: "hostDemands",
                index,
                source,
            })?;
            check_num_hosts("numHosts", &self.num_hosts, "hostDemands", index, &gen)?;
            for &num_hosts in &self.num_hosts {
                let dist_gen = gen.with_num_hosts(num_hosts);
                for &aod in &self.approval_over_expected_demand {
                    for &num_samples in &self.num_samples_at_approval {
                        instances.push(FeedbackInstance {
                            id: instances.len() as u64,
                            host_demands: dist_gen,
                            approval_over_expected_demand: aod,
                            num_samples_at_approval: num_samples,
                            num_feedback_iters: self.num_feedback_iters,
                            scenarios: MultiScenario {
                                templates: self.feedback_scenarios.clone(),
                                init_downgrade_fracs: vec![0.0, 1.0],
                                shift_traffics: vec![false, true],
                            },
                        });
                    }
                }
            }
        }
        Ok(instances)
    }
}

/// One experiment point for the feedback-control sweep.
#[derive(Debug, Clone)]
pub struct FeedbackInstance {
    pub id: u64,
    pub host_demands: DistGen,
    pub approval_over_expected_demand: f64,
    pub num_samples_at_approval: usize,
    pub num_feedback_iters: usize,
    pub scenarios: MultiScenario,
}

/// Templates crossed with initial downgrade fractions and shift settings.
#[derive(Debug, Clone)]
pub struct MultiScenario {
    pub templates: Vec<FeedbackScenarioTemplate>,
    pub init_downgrade_fracs: Vec<f64>,
    pub shift_traffics: Vec<bool>,
}

impl MultiScenario {
    pub fn num(&self) -> usize {
        self.templates.len() * self.init_downgrade_fracs.len() * self.shift_traffics.len()
    }

    /// Decomposes a scenario id into its template, initial downgrade
    /// fraction, and shift-traffic setting.
    pub fn get(&self, id: usize) -> (&FeedbackScenarioTemplate, f64, bool) {
        let shift_id = id % self.shift_traffics.len();
        let frac_id = (id / self.shift_traffics.len()) % self.init_downgrade_fracs.len();
        let template_id = (id / self.shift_traffics.len()) / self.init_downgrade_fracs.len();
        (
            &self.templates[template_id],
            self.init_downgrade_fracs[frac_id],
            self.shift_traffics[shift_id],
        )
    }
}
