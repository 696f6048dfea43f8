//! Max-min fair allocation.
//!
//! Computes the water level: the per-flow service rate such that giving each
//! flow `min(demand, level)` consumes at most the available capacity, and no
//! rate-limited flow could receive more while spare capacity remains.

/// Computes the max-min fair water level for `demands` under `capacity`.
///
/// Each flow is served `min(demand, level)`. With `capacity >= sum(demands)`
/// the level is the largest demand; with `capacity == 0` (or no demands) the
/// level is 0.
pub fn max_min_fair_waterlevel(mut capacity: f64, demands: &[f64]) -> f64 {
    let mut unsatisfied = demands.to_vec();
    unsatisfied.sort_by(f64::total_cmp);

    let mut waterlevel = 0.0;
    for (i, &demand) in unsatisfied.iter().enumerate() {
        let delta = demand - waterlevel;
        let num_unsatisfied = (unsatisfied.len() - i) as f64;
        let ask = delta * num_unsatisfied;
        if ask <= capacity {
            waterlevel += delta;
            capacity -= ask;
        } else {
            waterlevel += capacity / num_unsatisfied;
            break;
        }
    }
    waterlevel
}

/// One entry of a compacted demand distribution: a demand value and the
/// expected number of flows at that value. Counts may be fractional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValCount {
    pub val: f64,
    pub expected_count: f64,
}

/// Like [`max_min_fair_waterlevel`] but over a compacted distribution.
///
/// `demands` is sorted in place by value. On any input that decompacts to the
/// same multiset as a per-flow demand list, the result is identical to the
/// per-flow form.
pub fn max_min_fair_waterlevel_dist(mut capacity: f64, demands: &mut [ValCount]) -> f64 {
    demands.sort_by(|a, b| a.val.total_cmp(&b.val));

    // Suffix sums: number of flows at or above each demand value.
    let mut remaining_counts = vec![0.0; demands.len()];
    let mut c = 0.0;
    for i in (0..demands.len()).rev() {
        c += demands[i].expected_count;
        remaining_counts[i] = c;
    }

    let mut waterlevel = 0.0;
    for (i, vc) in demands.iter().enumerate() {
        let delta = vc.val - waterlevel;
        let unsatisfied_count = remaining_counts[i];
        let ask = delta * unsatisfied_count;
        if ask <= capacity {
            waterlevel += delta;
            capacity -= ask;
        } else {
            waterlevel += capacity / unsatisfied_count;
            break;
        }
    }
    waterlevel
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn waterlevel_table() {
        let tests: &[(&str, &[f64], f64, f64)] = &[
            ("empty", &[], 0.0, 0.0),
            ("all_zero", &[0.0, 0.0, 0.0], 0.0, 0.0),
            ("all_satisfied", &[101.0, 202.0, 333.0, 4.0], 640.0, 333.0),
            ("all_very_satisfied", &[101.0, 202.0, 333.0, 4.0], 1000.0, 333.0),
            ("biggest_not_satisfied", &[101.0, 202.0, 333.0, 4.0], 639.0, 332.0),
            ("none_satisfied", &[2.0, 5.0, 7.0], 5.0, 5.0 / 3.0),
            ("half_satisfied", &[7.0, 20.0, 23.0, 99.0, 51.0], 100.0, 25.0),
        ];
        for (name, demands, capacity, want) in tests {
            let got = max_min_fair_waterlevel(*capacity, demands);
            assert_eq!(got, *want, "{name}: got {got}, want {want}");
        }
    }

    fn compact_into_dist(demands: &[f64]) -> Vec<ValCount> {
        let mut saw: HashMap<u64, (f64, f64)> = HashMap::new();
        for &v in demands {
            let e = saw.entry(v.to_bits()).or_insert((v, 0.0));
            e.1 += 1.0;
        }
        saw.into_values()
            .map(|(val, expected_count)| ValCount { val, expected_count })
            .collect()
    }

    #[test]
    fn dist_form_matches_per_flow_form() {
        let tests: &[(&[f64], f64)] = &[
            (&[], 0.0),
            (&[0.0, 0.0, 0.0], 0.0),
            (&[101.0, 202.0, 333.0, 4.0], 640.0),
            (&[101.0, 202.0, 333.0, 4.0], 1000.0),
            (&[101.0, 202.0, 333.0, 4.0], 639.0),
            (
                &[
                    1.0, 1.0, 1.0, 1.0, 1.1, 1.1, 6.0, 100.5, 100.5, 100.5, 159.0, 164.0, 181.0,
                    2.0, 33.0, 4.0,
                ],
                500.0,
            ),
            (
                &[
                    1.0, 1.0, 1.0, 1.0, 1.1, 1.1, 6.0, 100.5, 100.5, 100.5, 159.0, 164.0, 181.0,
                    2.0, 33.0, 4.0,
                ],
                1000.0,
            ),
            (&[2.0, 5.0, 7.0], 5.0),
            (&[7.0, 20.0, 23.0, 99.0, 51.0], 100.0),
        ];
        for (demands, capacity) in tests {
            let want = max_min_fair_waterlevel(*capacity, demands);
            let mut dist = compact_into_dist(demands);
            let got = max_min_fair_waterlevel_dist(*capacity, &mut dist);
            assert_eq!(got, want, "demands {demands:?}, capacity {capacity}");
        }
    }

    #[test]
    fn dist_form_fractional_counts() {
        let tests: &[(&str, &[ValCount], f64, f64)] = &[
            (
                "all_satisfied",
                &[
                    ValCount { val: 10.0, expected_count: 1.5 },
                    ValCount { val: 20.0, expected_count: 1.0 },
                ],
                35.0,
                20.0,
            ),
            (
                "barely_unsatisfied",
                &[
                    ValCount { val: 10.0, expected_count: 1.5 },
                    ValCount { val: 20.0, expected_count: 1.0 },
                ],
                34.0,
                19.0,
            ),
            (
                "all_very_satisfied",
                &[
                    ValCount { val: 10.0, expected_count: 1.5 },
                    ValCount { val: 20.0, expected_count: 1.0 },
                ],
                100.0,
                20.0,
            ),
        ];
        for (name, demands, capacity, want) in tests {
            let mut demands = demands.to_vec();
            let got = max_min_fair_waterlevel_dist(*capacity, &mut demands);
            assert_eq!(got, *want, "{name}");
        }
    }

    #[test]
    fn waterlevel_bounds() {
        let demands = [3.0, 9.0, 27.0, 81.0];
        let sum: f64 = demands.iter().sum();
        for capacity in [0.0, 1.0, 40.0, sum, 2.0 * sum] {
            let level = max_min_fair_waterlevel(capacity, &demands);
            assert!(level >= 0.0);
            assert!(level <= 81.0);
        }
        assert_eq!(max_min_fair_waterlevel(0.0, &demands), 0.0);
        assert_eq!(max_min_fair_waterlevel(sum, &demands), 81.0);
    }
}
