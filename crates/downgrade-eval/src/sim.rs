//! Open-loop evaluation: how well do sampled estimates drive downgrade and
//! rate-limit decisions compared to exact knowledge?

use fair_alloc::{max_min_fair_waterlevel, max_min_fair_waterlevel_dist, ValCount};
use flow_selection::SampledUsages;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use usage_sampling::Sampler;

use crate::config::Instance;
use crate::runner::{EvalJob, ShardData};
use crate::stats::{Metric, MetricWithAbs, Stats};

/// Headroom multiplier applied to observed usage when treating it as demand.
const ALLOWED_DEMAND_GROWTH: f64 = 1.1;

const SHARD_SIZE: usize = 100;

#[derive(Debug, Clone, Default)]
struct SamplerData {
    usage_norm_error: MetricWithAbs,
    num_samples: Metric,
    want_num_samples: Metric,
    exact_usage_sum: f64,
    approx_usage_sum: f64,
}

#[derive(Debug, Clone, Default)]
struct DowngradeData {
    intended_frac_error: MetricWithAbs,
    realized_frac_error: MetricWithAbs,
}

#[derive(Debug, Clone, Default)]
struct RateLimitData {
    norm_error: MetricWithAbs,
}

/// Accumulated data for one (sampler, selector) pair.
#[derive(Debug, Clone, Default)]
pub struct PerSysData {
    sampler: SamplerData,
    downgrade: DowngradeData,
    rate_limit: RateLimitData,
}

impl ShardData for PerSysData {
    fn merge_from(&mut self, o: &PerSysData) {
        self.sampler.usage_norm_error.merge_from(&o.sampler.usage_norm_error);
        self.sampler.num_samples.merge_from(&o.sampler.num_samples);
        self.sampler.want_num_samples.merge_from(&o.sampler.want_num_samples);
        self.sampler.exact_usage_sum += o.sampler.exact_usage_sum;
        self.sampler.approx_usage_sum += o.sampler.approx_usage_sum;
        self.downgrade.intended_frac_error.merge_from(&o.downgrade.intended_frac_error);
        self.downgrade.realized_frac_error.merge_from(&o.downgrade.realized_frac_error);
        self.rate_limit.norm_error.merge_from(&o.rate_limit.norm_error);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerSummary {
    pub mean_exact_usage: f64,
    pub mean_approx_usage: f64,
    /// Usage norm error = (approximate - exact usage) / exact usage.
    pub usage_norm_error: Stats,
    pub abs_usage_norm_error: Stats,
    pub num_samples: Stats,
    pub want_num_samples: Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeSummary {
    /// Intended frac error = approximate intended frac - exact.
    pub intended_frac_error: Stats,
    pub abs_intended_frac_error: Stats,
    /// Realized frac error = selector-achieved frac at the approximate
    /// intended frac - exact intended frac.
    pub realized_frac_error: Stats,
    pub abs_realized_frac_error: Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSummary {
    /// Norm error = (approximate - exact host limit) / exact host limit.
    pub norm_error: Stats,
    pub abs_norm_error: Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SysResult {
    pub sampler_name: String,
    pub host_selector_name: String,
    pub num_data_points: usize,
    pub sampler_summary: SamplerSummary,
    pub downgrade_summary: DowngradeSummary,
    pub rate_limit_summary: RateLimitSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResult {
    #[serde(rename = "instanceID")]
    pub instance_id: u64,
    pub host_usages_gen: String,
    pub num_hosts: usize,
    pub approval_over_expected_usage: f64,
    pub num_samples_at_approval: usize,
    pub sys: SysResult,
}

impl EvalJob for Instance {
    type ShardData = PerSysData;
    type Output = InstanceResult;

    fn num_sys(&self) -> usize {
        self.sys.num()
    }

    fn shard_size(&self) -> usize {
        SHARD_SIZE
    }

    fn run_shard(&self, shard_runs: usize, seed: u64) -> Vec<PerSysData> {
        let mut rng = StdRng::seed_from_u64(seed);
        let approval = self.approval();
        let mut data = vec![PerSysData::default(); self.sys.num()];
        let mut usages = Vec::new();

        for _ in 0..shard_runs {
            self.host_usages.gen_dist(&mut rng, &mut usages);

            let exact_usage: f64 = usages.iter().sum();
            let exact_downgrade_frac = downgrade_frac(exact_usage, approval);
            let exact_host_limit = exact_fair_host_rate_limit(&usages, approval);

            for (sampler_id, sampler) in self.sys.samplers.iter().enumerate() {
                let mut est = estimate_usage(&mut rng, sampler, &usages);
                let approx_downgrade_frac = downgrade_frac(est.approx_usage, approval);
                let approx_host_limit = fair_host_rate_limit(
                    &mut est.approx_dist,
                    est.approx_usage,
                    approval,
                    usages.len(),
                );

                for (sel_id, sel) in self.sys.host_selectors.iter().enumerate() {
                    let matcher = sel.new_matcher(approx_downgrade_frac, &est.sampled);
                    let (_, matched_usage) = matcher.match_hosts(&usages);
                    let realized_frac =
                        if exact_usage > 0.0 { matched_usage / exact_usage } else { 0.0 };

                    let d = &mut data[self.sys.sys_id(sampler_id, sel_id)];
                    d.sampler
                        .usage_norm_error
                        .record(norm_error(est.approx_usage, exact_usage));
                    d.sampler.num_samples.record(est.num_samples);
                    d.sampler.want_num_samples.record(sampler.ideal_num_samples(&usages));
                    d.sampler.exact_usage_sum += exact_usage;
                    d.sampler.approx_usage_sum += est.approx_usage;
                    d.downgrade
                        .intended_frac_error
                        .record(approx_downgrade_frac - exact_downgrade_frac);
                    d.downgrade
                        .realized_frac_error
                        .record(realized_frac - exact_downgrade_frac);
                    d.rate_limit
                        .norm_error
                        .record(norm_error(approx_host_limit, exact_host_limit));
                }
            }
        }
        data
    }

    fn summarize(&self, num_runs: usize, mut data: Vec<PerSysData>) -> Vec<InstanceResult> {
        let host_usages_gen = self.host_usages.short_name();
        let num_hosts = self.host_usages.num_hosts();
        let mut results = Vec::with_capacity(data.len());
        for (sys_id, d) in data.iter_mut().enumerate() {
            let runs = num_runs.max(1) as f64;
            results.push(InstanceResult {
                instance_id: self.id,
                host_usages_gen: host_usages_gen.clone(),
                num_hosts,
                approval_over_expected_usage: self.approval_over_expected_usage,
                num_samples_at_approval: self.num_samples_at_approval,
                sys: SysResult {
                    sampler_name: self.sys.samplers[self.sys.sampler_id(sys_id)]
                        .name()
                        .to_string(),
                    host_selector_name: self.sys.host_selectors
                        [self.sys.host_selector_id(sys_id)]
                    .name(),
                    num_data_points: num_runs,
                    sampler_summary: SamplerSummary {
                        mean_exact_usage: d.sampler.exact_usage_sum / runs,
                        mean_approx_usage: d.sampler.approx_usage_sum / runs,
                        usage_norm_error: d.sampler.usage_norm_error.raw.stats(false),
                        abs_usage_norm_error: d.sampler.usage_norm_error.abs.stats(false),
                        num_samples: d.sampler.num_samples.stats(false),
                        want_num_samples: d.sampler.want_num_samples.stats(false),
                    },
                    downgrade_summary: DowngradeSummary {
                        intended_frac_error: d.downgrade.intended_frac_error.raw.stats(false),
                        abs_intended_frac_error: d.downgrade.intended_frac_error.abs.stats(false),
                        realized_frac_error: d.downgrade.realized_frac_error.raw.stats(false),
                        abs_realized_frac_error: d.downgrade.realized_frac_error.abs.stats(false),
                    },
                    rate_limit_summary: RateLimitSummary {
                        norm_error: d.rate_limit.norm_error.raw.stats(false),
                        abs_norm_error: d.rate_limit.norm_error.abs.stats(false),
                    },
                },
            });
        }
        results
    }
}

struct Estimate {
    approx_usage: f64,
    approx_dist: Vec<ValCount>,
    num_samples: f64,
    sampled: SampledUsages,
}

/// Applies the sampler to the usage data and estimates the aggregate usage,
/// the compacted usage distribution, and which hosts made it into the sample.
fn estimate_usage(rng: &mut impl Rng, sampler: &Sampler, usages: &[f64]) -> Estimate {
    let mut agg_est = sampler.agg_estimator();
    let mut dist_est = sampler.dist_estimator();
    let mut sampled = SampledUsages::default();
    let mut num_samples = 0.0;
    for (id, &v) in usages.iter().enumerate() {
        if sampler.should_include(rng, v) {
            num_samples += 1.0;
            agg_est.record_sample(v);
            dist_est.record_sample(v);
            sampled.usages.push(v);
            sampled.host_ids.push(id);
        }
    }
    sampled.sort_by_usage();
    Estimate {
        approx_usage: agg_est.est_usage(usages.len()),
        approx_dist: dist_est.est_dist(usages.len()),
        num_samples,
        sampled,
    }
}

/// Fraction of usage to downgrade so HIPRI usage fits in the approval.
pub fn downgrade_frac(agg_usage: f64, approval: f64) -> f64 {
    if agg_usage <= approval {
        return 0.0;
    }
    (agg_usage - approval) / agg_usage
}

/// Relative error; 0 when both sides are equal (including both zero).
fn norm_error(approx: f64, exact: f64) -> f64 {
    if approx == exact {
        return 0.0;
    }
    (approx - exact) / exact
}

/// Max-min fair per-host rate limit for the approval, from exact usages.
/// Leftover approval beyond the grown demands is split evenly.
fn exact_fair_host_rate_limit(usages: &[f64], approval: f64) -> f64 {
    let mut demand_sum = 0.0;
    let demands: Vec<f64> = usages
        .iter()
        .map(|&u| {
            let d = u * ALLOWED_DEMAND_GROWTH;
            demand_sum += d;
            d
        })
        .collect();

    let waterlevel = max_min_fair_waterlevel(approval, &demands);
    let leftover = (approval - demand_sum).max(0.0);
    waterlevel + leftover / usages.len() as f64
}

/// Like [`exact_fair_host_rate_limit`] but over an estimated compacted
/// usage distribution.
fn fair_host_rate_limit(
    host_usage_dist: &mut [ValCount],
    agg_usage: f64,
    approval: f64,
    num_hosts: usize,
) -> f64 {
    for vc in host_usage_dist.iter_mut() {
        vc.val *= ALLOWED_DEMAND_GROWTH;
    }
    let waterlevel = max_min_fair_waterlevel_dist(approval, host_usage_dist);
    let leftover = (approval - ALLOWED_DEMAND_GROWTH * agg_usage).max(0.0);
    waterlevel + leftover / num_hosts as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use usage_sampling::UniformSampler;

    #[test]
    fn downgrade_frac_basics() {
        assert_eq!(downgrade_frac(50.0, 100.0), 0.0);
        assert_eq!(downgrade_frac(100.0, 100.0), 0.0);
        assert_eq!(downgrade_frac(200.0, 100.0), 0.5);
        assert_eq!(downgrade_frac(125.0, 100.0), 0.2);
    }

    #[test]
    fn norm_error_zero_over_zero_is_zero() {
        assert_eq!(norm_error(0.0, 0.0), 0.0);
        assert_eq!(norm_error(5.0, 5.0), 0.0);
        assert_eq!(norm_error(6.0, 5.0), 0.2);
        assert_eq!(norm_error(4.0, 5.0), -0.2);
    }

    #[test]
    fn exact_host_limit_spreads_leftover() {
        // Demands grow to [1.1, 1.1]; approval 10 leaves 7.8 to split.
        let got = exact_fair_host_rate_limit(&[1.0, 1.0], 10.0);
        assert!((got - (1.1 + 3.9)).abs() < 1e-12, "got {got}");
    }

    #[test]
    fn exact_host_limit_throttles_when_tight() {
        // Grown demands [11, 22, 33] against approval 33: level 11.
        let got = exact_fair_host_rate_limit(&[10.0, 20.0, 30.0], 33.0);
        assert!((got - 11.0).abs() < 1e-12, "got {got}");
    }

    #[test]
    fn dist_host_limit_matches_exact_with_full_sample() {
        let usages = [4.0, 8.0, 8.0, 2.0, 6.0];
        let approval = 20.0;
        let sampler = Sampler::Uniform(UniformSampler { prob: 1.0 });
        let mut rng = StdRng::seed_from_u64(5);
        let mut est = estimate_usage(&mut rng, &sampler, &usages);
        assert_eq!(est.num_samples, 5.0);
        assert_eq!(est.approx_usage, usages.iter().sum::<f64>());
        let exact = exact_fair_host_rate_limit(&usages, approval);
        let approx = fair_host_rate_limit(
            &mut est.approx_dist,
            est.approx_usage,
            approval,
            usages.len(),
        );
        assert!((approx - exact).abs() < 1e-9, "approx {approx}, exact {exact}");
    }

    #[test]
    fn estimate_usage_sorts_sample_by_usage() {
        let usages = [3.0, 9.0, 1.0];
        let sampler = Sampler::Uniform(UniformSampler { prob: 1.0 });
        let mut rng = StdRng::seed_from_u64(6);
        let est = estimate_usage(&mut rng, &sampler, &usages);
        assert_eq!(est.sampled.usages, vec![9.0, 3.0, 1.0]);
        assert_eq!(est.sampled.host_ids, vec![1, 0, 2]);
    }
}
