//! Empirical generator based on data for five Facebook cluster types from the
//! 2015 SIGCOMM paper "Inside the Social Network's (Datacenter) Network"
//! (<https://conferences.sigcomm.org/sigcomm/2015/pdf/papers/p123.pdf>).
//!
//! The released data has holes, filled as follows:
//! - the number of hosts in a cluster is proportional to the cluster's total
//!   bandwidth (WAN and otherwise)
//! - each cluster's WAN usage is spread evenly across its hosts with up to
//!   5% noise

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fb15Gen {
    pub num: usize,
    /// Per-host demand mean; 0 means "derive from the default total demand".
    #[serde(default)]
    pub mean: f64,
}

const DEFAULT_TOTAL_DEMAND: f64 = (100u64 << 30) as f64;

const NUM_CLUSTERS: usize = 5;

// "Inter-DC" row of Table 3: relative WAN demand per cluster type
// (Hadoop, FE, Svc, Cache, DB).
const CLUSTER_DEMAND_WEIGHTS: [f64; NUM_CLUSTERS] = [2.5, 8.6, 15.9, 16.1, 34.8];

// "Percentage" row of Table 3: share of hosts per cluster type.
const CLUSTER_HOST_WEIGHTS: [f64; NUM_CLUSTERS] = [23.7, 21.5, 18.0, 10.2, 5.2];

impl Fb15Gen {
    pub fn dist_mean(&self) -> f64 {
        if self.mean == 0.0 {
            DEFAULT_TOTAL_DEMAND / self.num as f64
        } else {
            self.mean
        }
    }

    fn cluster_hosts(&self) -> [usize; NUM_CLUSTERS] {
        let total_weight: f64 = CLUSTER_HOST_WEIGHTS.iter().sum();
        let mut hosts = [0usize; NUM_CLUSTERS];
        let mut cum_weight = 0.0;
        let mut prev_cum = 0usize;
        for (i, w) in CLUSTER_HOST_WEIGHTS.iter().enumerate() {
            cum_weight += w;
            let cum = if i == NUM_CLUSTERS - 1 {
                self.num
            } else {
                ((cum_weight / total_weight) * self.num as f64) as usize
            };
            hosts[i] = cum - prev_cum;
            prev_cum = cum;
        }
        hosts
    }

    pub(crate) fn fill(&self, rng: &mut impl Rng, out: &mut Vec<f64>) {
        let total_demand = self.dist_mean() * self.num as f64;
        let demand_weight_total: f64 = CLUSTER_DEMAND_WEIGHTS.iter().sum();
        let hosts = self.cluster_hosts();

        for (cluster, &num_hosts) in hosts.iter().enumerate() {
            if num_hosts == 0 {
                continue;
            }
            let cluster_demand =
                total_demand * CLUSTER_DEMAND_WEIGHTS[cluster] / demand_weight_total;
            let host_mean = cluster_demand / num_hosts as f64;
            let lo = host_mean * 0.95;
            let range = host_mean * 0.1;
            for _ in 0..num_hosts {
                out.push(lo + rng.gen::<f64>() * range);
            }
        }
    }
}
