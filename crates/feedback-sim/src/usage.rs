use fair_alloc::max_min_fair_waterlevel;
use rand::Rng;
use usage_sampling::Sampler;

/// Per-priority-class usage totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassUsage {
    pub hipri: f64,
    pub lopri: f64,
}

/// One iteration's view of the network: exact per-class usage, sampled
/// estimates of the same, and the largest usage value that made it into the
/// sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageInfo {
    pub exact: ClassUsage,
    pub approx: ClassUsage,
    pub max_sampled_task_usage: f64,
}

/// Computes realized usage from true demands and the current LOPRI set.
///
/// LOPRI hosts are throttled to a max-min fair share of the available LOPRI
/// capacity. With `shift_traffic`, demand the LOPRI class cannot carry is
/// absorbed by HIPRI hosts with spare capacity, visited in index order.
#[derive(Debug, Clone)]
pub struct UsageCollector {
    pub max_host_usage: f64,
    pub agg_available_lopri: f64,
    pub true_demands: Vec<f64>,
    pub shift_traffic: bool,

    lopri_demands: Vec<f64>,
}

impl UsageCollector {
    pub fn new(
        max_host_usage: f64,
        agg_available_lopri: f64,
        true_demands: Vec<f64>,
        shift_traffic: bool,
    ) -> Self {
        UsageCollector {
            max_host_usage,
            agg_available_lopri,
            true_demands,
            shift_traffic,
            lopri_demands: Vec::new(),
        }
    }

    /// Collects usage for the given LOPRI assignment. With a sampler, also
    /// fills in the estimated per-class usage from the included samples.
    ///
    /// Panics if any demand exceeds `max_host_usage`.
    pub fn collect_usage_info(
        &mut self,
        rng: &mut impl Rng,
        is_lopri: &[bool],
        sampler: Option<&Sampler>,
    ) -> UsageInfo {
        assert_eq!(is_lopri.len(), self.true_demands.len(), "mismatched lengths");

        let mut usage = UsageInfo::default();
        let mut est_lopri = sampler.map(|s| s.agg_estimator());
        let mut est_hipri = sampler.map(|s| s.agg_estimator());

        self.lopri_demands.clear();
        for (i, &d) in self.true_demands.iter().enumerate() {
            if d > self.max_host_usage {
                panic!("invalid input: found demand {d} > max host usage {}", self.max_host_usage);
            }
            if is_lopri[i] {
                self.lopri_demands.push(d);
            }
        }
        let num_lopri = self.lopri_demands.len();
        let num_hipri = self.true_demands.len() - num_lopri;

        let lopri_waterlevel =
            max_min_fair_waterlevel(self.agg_available_lopri, &self.lopri_demands);
        let mut try_shift_from_lopri = 0.0;
        for &d in &self.lopri_demands {
            try_shift_from_lopri += (d - lopri_waterlevel).max(0.0);
            let u = d.min(lopri_waterlevel);
            if let (Some(sampler), Some(est)) = (sampler, est_lopri.as_mut()) {
                if sampler.should_include(rng, u) {
                    est.record_sample(u);
                    usage.max_sampled_task_usage = u.max(usage.max_sampled_task_usage);
                }
            }
            usage.exact.lopri += u;
        }

        if !self.shift_traffic {
            try_shift_from_lopri = 0.0;
        }

        for (i, &d) in self.true_demands.iter().enumerate() {
            if is_lopri[i] {
                continue;
            }
            let spare_cap = self.max_host_usage - d;
            let extra_taken = spare_cap.min(try_shift_from_lopri);
            try_shift_from_lopri -= extra_taken;
            let u = d + extra_taken;
            usage.exact.hipri += u;
            if let (Some(sampler), Some(est)) = (sampler, est_hipri.as_mut()) {
                if sampler.should_include(rng, u) {
                    est.record_sample(u);
                    usage.max_sampled_task_usage = u.max(usage.max_sampled_task_usage);
                }
            }
        }

        if let (Some(el), Some(eh)) = (est_lopri, est_hipri) {
            usage.approx.lopri = el.est_usage(num_lopri);
            usage.approx.hipri = eh.est_usage(num_hipri);
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use usage_sampling::UniformSampler;

    fn lopri_mask(n: usize, lopri: &[usize]) -> Vec<bool> {
        let mut mask = vec![false; n];
        for &i in lopri {
            mask[i] = true;
        }
        mask
    }

    struct Case {
        name: &'static str,
        col: UsageCollector,
        lopri: &'static [usize],
        exact_hipri: f64,
        exact_lopri: f64,
    }

    #[test]
    fn exact_usage_tables() {
        let cases = [
            Case {
                name: "one host hipri",
                col: UsageCollector::new(10.0, 100.0, vec![9.0], true),
                lopri: &[],
                exact_hipri: 9.0,
                exact_lopri: 0.0,
            },
            Case {
                name: "one host lopri throttled",
                col: UsageCollector::new(10.0, 4.0, vec![9.0], true),
                lopri: &[0],
                exact_hipri: 0.0,
                exact_lopri: 4.0,
            },
            Case {
                name: "three hosts lopri throttled",
                col: UsageCollector::new(10.0, 1.0, vec![9.0, 3.0, 10.0], true),
                lopri: &[2],
                exact_hipri: 20.0,
                exact_lopri: 1.0,
            },
            Case {
                name: "three hosts lopri throttled no shift",
                col: UsageCollector::new(10.0, 1.0, vec![9.0, 3.0, 10.0], false),
                lopri: &[2],
                exact_hipri: 12.0,
                exact_lopri: 1.0,
            },
            Case {
                name: "four hosts lopri unthrottled",
                col: UsageCollector::new(10.0, 21.0, vec![9.0, 3.0, 10.0, 10.0], true),
                lopri: &[2, 3],
                exact_hipri: 12.0,
                exact_lopri: 20.0,
            },
            Case {
                name: "10 hosts lots of spare",
                col: UsageCollector::new(
                    10.0,
                    100.0,
                    vec![5.0, 3.0, 1.0, 2.0, 4.0, 5.0, 4.0, 6.0, 4.0, 1.0],
                    true,
                ),
                lopri: &[2, 3, 6, 7, 8],
                exact_hipri: 5.0 + 3.0 + 4.0 + 5.0 + 1.0,
                exact_lopri: 1.0 + 2.0 + 4.0 + 6.0 + 4.0,
            },
            Case {
                name: "10 hosts no spare",
                col: UsageCollector::new(
                    10.0,
                    0.0,
                    vec![5.0, 3.0, 1.0, 2.0, 4.0, 5.0, 4.0, 6.0, 4.0, 1.0],
                    true,
                ),
                lopri: &[2, 3, 6, 7, 8],
                exact_hipri: 5.0 + 3.0 + 4.0 + 5.0 + 1.0 + 17.0,
                exact_lopri: 0.0,
            },
        ];

        let mut rng = StdRng::seed_from_u64(1);
        let always = Sampler::Uniform(UniformSampler { prob: 1.0 });
        for mut case in cases {
            let mask = lopri_mask(case.col.true_demands.len(), case.lopri);
            let got = case.col.collect_usage_info(&mut rng, &mask, Some(&always));
            assert_eq!(got.exact.hipri, case.exact_hipri, "{}: exact hipri", case.name);
            assert_eq!(got.exact.lopri, case.exact_lopri, "{}: exact lopri", case.name);
            // With inclusion probability 1, the estimates are exact.
            assert_eq!(got.approx.hipri, case.exact_hipri, "{}: approx hipri", case.name);
            assert_eq!(got.approx.lopri, case.exact_lopri, "{}: approx lopri", case.name);
        }
    }

    #[test]
    fn no_sampler_skips_estimates() {
        let mut col = UsageCollector::new(10.0, 4.0, vec![9.0, 2.0], true);
        let mut rng = StdRng::seed_from_u64(2);
        let got = col.collect_usage_info(&mut rng, &[true, false], None);
        assert_eq!(got.exact.lopri, 4.0);
        assert_eq!(got.exact.hipri, 7.0);
        assert_eq!(got.approx, ClassUsage::default());
        assert_eq!(got.max_sampled_task_usage, 0.0);
    }

    #[test]
    fn max_sampled_usage_sees_shifted_traffic() {
        // LOPRI capacity 0 pushes all 6 units onto the first HIPRI host.
        let mut col = UsageCollector::new(10.0, 0.0, vec![2.0, 3.0, 6.0], true);
        let mut rng = StdRng::seed_from_u64(3);
        let always = Sampler::Uniform(UniformSampler { prob: 1.0 });
        let got = col.collect_usage_info(&mut rng, &[false, false, true], Some(&always));
        assert_eq!(got.exact.hipri, 11.0);
        assert_eq!(got.max_sampled_task_usage, 8.0);
    }

    #[test]
    #[should_panic(expected = "max host usage")]
    fn demand_above_host_capacity_panics() {
        let mut col = UsageCollector::new(10.0, 100.0, vec![11.0], true);
        let mut rng = StdRng::seed_from_u64(4);
        col.collect_usage_info(&mut rng, &[false], None);
    }
}
