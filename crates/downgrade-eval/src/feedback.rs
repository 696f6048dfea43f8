//! Closed-loop evaluation: run each feedback scenario to (hopeful)
//! convergence many times and summarize overage, shortage, and churn.

use feedback_sim::{ActiveScenario, Scenario};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use usage_sampling::SamplerFactory;

use crate::config::{FeedbackInstance, FeedbackScenarioTemplate};
use crate::runner::{EvalJob, ShardData};
use crate::stats::{Metric, Stats};

/// Feedback shards are far more expensive per run than open-loop shards,
/// so scale the shard size down as hosts go up.
fn shard_size(num_hosts: usize) -> usize {
    (4096 / num_hosts.max(1)).clamp(1, 100)
}

#[derive(Debug, Clone, Default)]
struct DowngradeData {
    intermediate_overage: Metric,
    intermediate_shortage: Metric,
    intermediate_over_or_shortage: Metric,
    realized_overage: Metric,
    realized_shortage: Metric,
    realized_over_or_shortage: Metric,
}

#[derive(Debug, Clone, Default)]
struct FeedbackControlData {
    iters_to_converge: Metric,
    num_downgraded: Metric,
    num_upgraded: Metric,
    num_oscillations: Metric,
    num_qos_changed: Metric,
    num_runs_converged: usize,
}

/// Accumulated data for one (template, init frac, shift traffic) scenario.
#[derive(Debug, Clone, Default)]
pub struct PerScenarioData {
    downgrade: DowngradeData,
    feedback_control: FeedbackControlData,
}

impl ShardData for PerScenarioData {
    fn merge_from(&mut self, o: &PerScenarioData) {
        let d = &mut self.downgrade;
        d.intermediate_overage.merge_from(&o.downgrade.intermediate_overage);
        d.intermediate_shortage.merge_from(&o.downgrade.intermediate_shortage);
        d.intermediate_over_or_shortage
            .merge_from(&o.downgrade.intermediate_over_or_shortage);
        d.realized_overage.merge_from(&o.downgrade.realized_overage);
        d.realized_shortage.merge_from(&o.downgrade.realized_shortage);
        d.realized_over_or_shortage.merge_from(&o.downgrade.realized_over_or_shortage);
        let f = &mut self.feedback_control;
        f.iters_to_converge.merge_from(&o.feedback_control.iters_to_converge);
        f.num_downgraded.merge_from(&o.feedback_control.num_downgraded);
        f.num_upgraded.merge_from(&o.feedback_control.num_upgraded);
        f.num_oscillations.merge_from(&o.feedback_control.num_oscillations);
        f.num_qos_changed.merge_from(&o.feedback_control.num_qos_changed);
        f.num_runs_converged += o.feedback_control.num_runs_converged;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicDowngradeSummary {
    /// Overage and shortage are relative to the approval.
    pub intermediate_overage: Stats,
    pub intermediate_shortage: Stats,
    pub intermediate_over_or_shortage: Stats,
    pub realized_overage: Stats,
    pub realized_shortage: Stats,
    pub realized_over_or_shortage: Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackControlSummary {
    /// -1 marks runs that never converged.
    pub iters_to_converge: Stats,
    pub num_downgraded: Stats,
    pub num_upgraded: Stats,
    pub num_oscillations: Stats,
    #[serde(rename = "numQoSChanged")]
    pub num_qos_changed: Stats,
    pub frac_runs_converged: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub scenario: FeedbackScenarioTemplate,
    pub init_downgrade_frac: f64,
    pub shift_traffic: bool,
    pub num_data_points: usize,
    pub downgrade_summary: BasicDowngradeSummary,
    pub feedback_control_summary: FeedbackControlSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInstanceResult {
    #[serde(rename = "instanceID")]
    pub instance_id: u64,
    pub host_demands_gen: String,
    pub num_hosts: usize,
    pub approval_over_expected_demand: f64,
    pub num_samples_at_approval: usize,
    pub num_feedback_iters: usize,
    pub result: ScenarioResult,
}

impl EvalJob for FeedbackInstance {
    type ShardData = PerScenarioData;
    type Output = FeedbackInstanceResult;

    fn num_sys(&self) -> usize {
        self.scenarios.num()
    }

    fn shard_size(&self) -> usize {
        shard_size(self.host_demands.num_hosts())
    }

    fn run_shard(&self, shard_runs: usize, seed: u64) -> Vec<PerScenarioData> {
        let mut rng = StdRng::seed_from_u64(seed);
        let num_hosts = self.host_demands.num_hosts();
        let expected_demand = num_hosts as f64 * self.host_demands.dist_mean();
        let approval = self.approval_over_expected_demand * expected_demand;
        let mut data = vec![PerScenarioData::default(); self.scenarios.num()];
        let mut demands = Vec::new();

        for _ in 0..shard_runs {
            self.host_demands.gen_dist(&mut rng, &mut demands);

            for (sid, d) in data.iter_mut().enumerate() {
                let (tmpl, init_frac, shift) = self.scenarios.get(sid);
                let scenario = Scenario {
                    true_demands: demands.clone(),
                    approval,
                    max_host_usage: tmpl.max_host_usage,
                    agg_available_lopri: tmpl.lopri_cap_over_expected_demand * expected_demand,
                    init_downgrade_frac: init_frac,
                    shift_traffic: shift,
                    sampler_factory: SamplerFactory {
                        kind: tmpl.sampler_kind,
                        num_samples_at_approval: self.num_samples_at_approval as f64,
                    },
                    controller: tmpl.controller,
                };
                let mut active =
                    ActiveScenario::new(scenario, StdRng::seed_from_u64(rng.gen()));
                let rec = active.run_multi_iter(self.num_feedback_iters);

                for i in 0..rec.intermediate_overage.len() {
                    let o = rec.intermediate_overage[i] / approval;
                    let s = rec.intermediate_shortage[i] / approval;
                    d.downgrade.intermediate_overage.record(o);
                    d.downgrade.intermediate_shortage.record(s);
                    d.downgrade.intermediate_over_or_shortage.record(o + s);
                }
                let o = rec.final_overage / approval;
                let s = rec.final_shortage / approval;
                d.downgrade.realized_overage.record(o);
                d.downgrade.realized_shortage.record(s);
                d.downgrade.realized_over_or_shortage.record(o + s);

                let f = &mut d.feedback_control;
                f.iters_to_converge.record(rec.iters_to_converge as f64);
                f.num_downgraded.record(rec.num_downgraded as f64);
                f.num_upgraded.record(rec.num_upgraded as f64);
                f.num_oscillations.record(rec.num_oscillations as f64);
                f.num_qos_changed.record((rec.num_downgraded + rec.num_upgraded) as f64);
                if rec.converged {
                    f.num_runs_converged += 1;
                }
            }
        }
        data
    }

    fn summarize(
        &self,
        num_runs: usize,
        mut data: Vec<PerScenarioData>,
    ) -> Vec<FeedbackInstanceResult> {
        let host_demands_gen = self.host_demands.short_name();
        let num_hosts = self.host_demands.num_hosts();
        let mut results = Vec::with_capacity(data.len());
        for (sid, d) in data.iter_mut().enumerate() {
            let (tmpl, init_frac, shift) = self.scenarios.get(sid);
            results.push(FeedbackInstanceResult {
                instance_id: self.id,
                host_demands_gen: host_demands_gen.clone(),
                num_hosts,
                approval_over_expected_demand: self.approval_over_expected_demand,
                num_samples_at_approval: self.num_samples_at_approval,
                num_feedback_iters: self.num_feedback_iters,
                result: ScenarioResult {
                    scenario: *tmpl,
                    init_downgrade_frac: init_frac,
                    shift_traffic: shift,
                    num_data_points: num_runs,
                    downgrade_summary: BasicDowngradeSummary {
                        intermediate_overage: d.downgrade.intermediate_overage.stats(false),
                        intermediate_shortage: d.downgrade.intermediate_shortage.stats(false),
                        intermediate_over_or_shortage: d
                            .downgrade
                            .intermediate_over_or_shortage
                            .stats(false),
                        realized_overage: d.downgrade.realized_overage.stats(false),
                        realized_shortage: d.downgrade.realized_shortage.stats(false),
                        realized_over_or_shortage: d
                            .downgrade
                            .realized_over_or_shortage
                            .stats(false),
                    },
                    feedback_control_summary: FeedbackControlSummary {
                        iters_to_converge: d.feedback_control.iters_to_converge.stats(false),
                        num_downgraded: d.feedback_control.num_downgraded.stats(false),
                        num_upgraded: d.feedback_control.num_upgraded.stats(false),
                        num_oscillations: d.feedback_control.num_oscillations.stats(false),
                        num_qos_changed: d.feedback_control.num_qos_changed.stats(false),
                        frac_runs_converged: d.feedback_control.num_runs_converged as f64
                            / num_runs.max(1) as f64,
                    },
                },
            });
        }
        results
    }
}
