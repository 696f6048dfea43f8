//! LOPRI flow selection strategies.
//!
//! Given a target LOPRI usage fraction and per-host usage data, a selector
//! decides which hosts are served at low priority. The hash strategy is
//! stable across calls (small fraction changes reclassify few hosts); the
//! knapsack strategy optimizes how closely the realized usage matches the
//! target; the hybrid strategy pre-assigns the heaviest hosts round-robin and
//! hashes the rest.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

mod knapsack;

pub use knapsack::{select_lopri, to_int64_demands};

/// Usage samples with their host ids, as collected by a sampler.
#[derive(Debug, Clone, Default)]
pub struct SampledUsages {
    pub usages: Vec<f64>,
    pub host_ids: Vec<usize>,
}

impl SampledUsages {
    /// Sorts the samples in decreasing order of usage, ties by host id.
    ///
    /// Panics if the usage and id vectors have different lengths.
    pub fn sort_by_usage(&mut self) {
        assert_eq!(self.usages.len(), self.host_ids.len(), "mismatched lengths");
        let mut order: Vec<usize> = (0..self.usages.len()).collect();
        order.sort_by(|&i, &j| {
            self.usages[j]
                .total_cmp(&self.usages[i])
                .then(self.host_ids[i].cmp(&self.host_ids[j]))
        });
        self.usages = order.iter().map(|&i| self.usages[i]).collect();
        self.host_ids = order.iter().map(|&i| self.host_ids[i]).collect();
    }
}

fn hash_id(id: u64) -> u64 {
    let mut h = DefaultHasher::new();
    id.hash(&mut h);
    h.finish()
}

fn hash_threshold(frac: f64) -> u64 {
    (u64::MAX as f64 * frac.clamp(0.0, 1.0)) as u64
}

fn sum_usage(usages: &[f64], ids: &[usize]) -> f64 {
    ids.iter().map(|&id| usages[id]).sum()
}

/// A selection strategy. Closed variant set; all strategies share the
/// "target fraction in, LOPRI host set out" contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Hash,
    Knapsack,
    /// Round-robin over the top `num_rr` hosts by sampled usage, hashing for
    /// the rest.
    Hybrid {
        num_rr: usize,
    },
}

impl Selector {
    pub fn name(&self) -> String {
        match self {
            Selector::Hash => "hash".to_string(),
            Selector::Knapsack => "knapsack".to_string(),
            Selector::Hybrid { num_rr } => format!("hybrid-{num_rr}"),
        }
    }

    /// Builds a matcher for the target LOPRI fraction. `data` must already be
    /// sorted in decreasing order of usage (see [`SampledUsages::sort_by_usage`]).
    pub fn new_matcher(&self, match_frac: f64, data: &SampledUsages) -> Matcher {
        match self {
            Selector::Hash => Matcher::Hash { thresh: hash_threshold(match_frac) },
            Selector::Knapsack => Matcher::Knapsack { frac: match_frac },
            Selector::Hybrid { num_rr } => {
                // Match every Nth of the top hosts, starting by not matching,
                // so the realized usage overshoots the target rather than
                // falling short.
                let lopri_interval = if match_frac <= 0.0 {
                    num_rr + 1
                } else {
                    (1.0 / match_frac).round() as usize
                };

                let mut pre_matched = Vec::new();
                let mut pre = Vec::new();
                for (i, &id) in data.host_ids.iter().take(*num_rr).enumerate() {
                    if lopri_interval > 0 && (i + 1) % lopri_interval == 0 {
                        pre_matched.push(id);
                    }
                    pre.push(id);
                }
                pre.sort_unstable();
                pre_matched.sort_unstable();

                Matcher::Hybrid { pre_matched, pre, thresh: hash_threshold(match_frac) }
            }
        }
    }
}

/// A matcher bound to one target fraction; applies the strategy to the full
/// per-host usage vector.
#[derive(Debug, Clone)]
pub enum Matcher {
    Hash { thresh: u64 },
    Knapsack { frac: f64 },
    Hybrid { pre_matched: Vec<usize>, pre: Vec<usize>, thresh: u64 },
}

impl Matcher {
    /// Returns the LOPRI host ids (ascending for hash, selection order for
    /// the others) and their aggregate usage.
    pub fn match_hosts(&self, usages: &[f64]) -> (Vec<usize>, f64) {
        match self {
            Matcher::Hash { thresh } => {
                let mut matched = Vec::new();
                let mut matched_usage = 0.0;
                for id in 0..usages.len() {
                    if hash_id(id as u64) <= *thresh {
                        matched.push(id);
                        matched_usage += usages[id];
                    }
                }
                (matched, matched_usage)
            }
            Matcher::Knapsack { frac } => {
                let (demands, _) = to_int64_demands(usages, 1.0);
                let (selected, _) = select_lopri(&demands, *frac);
                let matched: Vec<usize> =
                    (0..usages.len()).filter(|&id| selected[id]).collect();
                let matched_usage = sum_usage(usages, &matched);
                (matched, matched_usage)
            }
            Matcher::Hybrid { pre_matched, pre, thresh } => {
                let mut matched = pre_matched.clone();
                let mut matched_usage = sum_usage(usages, pre_matched);
                for id in 0..usages.len() {
                    if hash_id(id as u64) <= *thresh && pre.binary_search(&id).is_err() {
                        matched.push(id);
                        matched_usage += usages[id];
                    }
                }
                (matched, matched_usage)
            }
        }
    }
}

/// Precomputed hash context for a fixed set of flow ids.
///
/// Owns the per-flow hashes so multiple selectors can coexist in one process
/// and tests stay isolated. At fraction `f`, a flow is LOPRI iff its hash
/// falls below `f` of the hash space, so the LOPRI set at a smaller fraction
/// is always a subset of the set at a larger one.
#[derive(Debug, Clone)]
pub struct HashingDowngradeSelector {
    hashes: Vec<u64>,
}

impl HashingDowngradeSelector {
    pub fn new(flow_ids: &[u64]) -> Self {
        HashingDowngradeSelector { hashes: flow_ids.iter().map(|&id| hash_id(id)).collect() }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Reassigns LOPRI membership for the target fraction.
    ///
    /// Panics if `is_lopri` does not match the flow count.
    pub fn pick_lopri(&self, frac: f64, is_lopri: &mut [bool]) {
        assert_eq!(is_lopri.len(), self.hashes.len(), "mismatched lengths");
        let thresh = hash_threshold(frac);
        for (flag, &h) in is_lopri.iter_mut().zip(&self.hashes) {
            *flag = h <= thresh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sample_all(usages: &[f64]) -> SampledUsages {
        let mut su = SampledUsages {
            usages: usages.to_vec(),
            host_ids: (0..usages.len()).collect(),
        };
        su.sort_by_usage();
        su
    }

    fn selectors() -> Vec<Selector> {
        vec![
            Selector::Hash,
            Selector::Knapsack,
            Selector::Hybrid { num_rr: 0 },
            Selector::Hybrid { num_rr: 3 },
            Selector::Hybrid { num_rr: 100 },
        ]
    }

    #[test]
    fn frac_zero_matches_nothing() {
        let usages = [1.0; 9];
        for sel in selectors() {
            let (matched, matched_usage) =
                sel.new_matcher(0.0, &sample_all(&usages)).match_hosts(&usages);
            assert!(matched.is_empty(), "{}: matched {matched:?}", sel.name());
            assert_eq!(matched_usage, 0.0, "{}", sel.name());
        }
    }

    #[test]
    fn frac_one_matches_everything() {
        let usages = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        for sel in selectors() {
            let (matched, matched_usage) =
                sel.new_matcher(1.0, &sample_all(&usages)).match_hosts(&usages);
            assert_eq!(matched.len(), 9, "{}: matched {matched:?}", sel.name());
            assert_eq!(matched_usage, 45.0, "{}", sel.name());
        }
    }

    #[test]
    fn hash_matches_roughly_frac_of_hosts() {
        let mut rng = StdRng::seed_from_u64(7);
        let usages: Vec<f64> = (0..5000).map(|_| rng.gen::<f64>() * 5000.0).collect();
        for test_frac in [0.1, 0.5, 0.9] {
            let (matched, matched_usage) = Selector::Hash
                .new_matcher(test_frac, &sample_all(&usages))
                .match_hosts(&usages);
            let frac = matched.len() as f64 / usages.len() as f64;
            assert!(
                (frac - test_frac).abs() < 0.025,
                "frac {test_frac}: matched fraction {frac}"
            );
            assert_eq!(matched_usage, sum_usage(&usages, &matched));
        }
    }

    #[test]
    fn hash_lopri_set_is_monotone_in_frac() {
        let mut rng = StdRng::seed_from_u64(8);
        let flow_ids: Vec<u64> = (0..2000).map(|_| rng.gen()).collect();
        let sel = HashingDowngradeSelector::new(&flow_ids);
        let mut prev = vec![false; flow_ids.len()];
        let mut cur = vec![false; flow_ids.len()];
        sel.pick_lopri(0.0, &mut prev);
        assert!(prev.iter().all(|&b| !b));
        for step in 1..=20 {
            sel.pick_lopri(step as f64 / 20.0, &mut cur);
            for (i, (&was, &is)) in prev.iter().zip(&cur).enumerate() {
                assert!(!was || is, "flow {i} left LOPRI as the fraction grew");
            }
            std::mem::swap(&mut prev, &mut cur);
        }
        sel.pick_lopri(1.0, &mut cur);
        assert!(cur.iter().all(|&b| b));
    }

    #[test]
    fn knapsack_tracks_target_usage() {
        let mut rng = StdRng::seed_from_u64(9);
        let usages: Vec<f64> = (0..5000).map(|_| (rng.gen::<u32>() % 5000) as f64).collect();
        let total: f64 = usages.iter().sum();
        for test_frac in [0.1, 0.5, 0.9] {
            let (matched, matched_usage) = Selector::Knapsack
                .new_matcher(test_frac, &sample_all(&usages))
                .match_hosts(&usages);
            assert!(!matched.is_empty());
            let want = test_frac * total;
            assert!(
                matched_usage > want * 0.85 && matched_usage < want * 1.03,
                "frac {test_frac}: got {matched_usage}, want about {want}"
            );
        }
    }

    #[test]
    fn hybrid_all_rr_uniform_usages() {
        let usages = [1.0; 9];
        let (matched, matched_usage) = Selector::Hybrid { num_rr: 100 }
            .new_matcher(0.5, &sample_all(&usages))
            .match_hosts(&usages);
        // Interval 2, starting with a skip: hosts ranked 2nd, 4th, ...
        assert_eq!(matched, vec![1, 3, 5, 7]);
        assert_eq!(matched_usage, 4.0);
    }

    #[test]
    fn hybrid_all_rr_ranks_by_usage() {
        let usages = [2.0, 1.0, 4.0, 3.0, 6.0, 5.0, 8.0, 7.0, 9.0];
        let (matched, matched_usage) = Selector::Hybrid { num_rr: 100 }
            .new_matcher(0.5, &sample_all(&usages))
            .match_hosts(&usages);
        // Ranked by usage: ids 8,6,7,4,5,2,3,0,1; every 2nd -> 6,4,2,0.
        assert_eq!(matched, vec![0, 2, 4, 6]);
        assert_eq!(matched_usage, 20.0);
    }

    #[test]
    fn hybrid_hashes_hosts_outside_sample() {
        let usages = [2.0, 1.0, 4.0, 3.0, 6.0, 5.0, 8.0, 7.0, 9.0];
        let mut su = SampledUsages {
            usages: vec![4.0, 5.0, 8.0, 7.0],
            host_ids: vec![2, 5, 6, 7],
        };
        su.sort_by_usage();
        let (matched, _) = Selector::Hybrid { num_rr: 100 }
            .new_matcher(0.5, &su)
            .match_hosts(&usages);
        // Sampled hosts ranked 6,7,5,2; every 2nd pre-matches 7 and 2. The
        // rest go through hashing and must exclude the sampled hosts.
        assert!(matched.contains(&7));
        assert!(matched.contains(&2));
        assert!(!matched.contains(&6));
        assert!(!matched.contains(&5));
    }

    #[test]
    fn sampled_usages_sort_is_stable_on_ties() {
        let mut su = SampledUsages {
            usages: vec![3.0, 5.0, 3.0, 9.0],
            host_ids: vec![7, 3, 2, 9],
        };
        su.sort_by_usage();
        assert_eq!(su.usages, vec![9.0, 5.0, 3.0, 3.0]);
        assert_eq!(su.host_ids, vec![9, 3, 2, 7]);
    }

    #[test]
    #[should_panic(expected = "mismatched lengths")]
    fn sampled_usages_length_mismatch_panics() {
        let mut su = SampledUsages { usages: vec![1.0], host_ids: vec![] };
        su.sort_by_usage();
    }
}
