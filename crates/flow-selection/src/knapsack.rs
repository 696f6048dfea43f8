//! Greedy usage-targeted host selection.
//!
//! Picks a subset of hosts whose total demand approaches `want_frac` of the
//! aggregate from below. Demands are visited in decreasing order and taken
//! whenever they still fit; any shortfall is smaller than the smallest
//! unpicked demand.

/// Converts float usages into integer demands, grown by `allowed_growth`.
///
/// Small values are multiplied by 1000 before truncating so sub-unit demands
/// keep three digits of precision. Returns the demands and the scale applied.
pub fn to_int64_demands(usages: &[f64], allowed_growth: f64) -> (Vec<i64>, f64) {
    if usages.is_empty() {
        return (Vec::new(), 1.0);
    }
    let mean = usages.iter().sum::<f64>() / usages.len() as f64;
    let scale = if mean < 1000.0 { 1000.0 } else { 1.0 };
    let demands = usages
        .iter()
        .map(|&u| (allowed_growth * u * scale) as i64)
        .collect();
    (demands, scale)
}

/// Selects hosts totaling at most `want_frac` of the aggregate demand,
/// greedily from the largest demand down. Ties take the lower index first.
/// Returns a per-host selection mask and the selected total.
pub fn select_lopri(demands: &[i64], want_frac: f64) -> (Vec<bool>, i64) {
    let total: i64 = demands.iter().sum();
    let budget = (total as f64 * want_frac.clamp(0.0, 1.0)).round() as i64;

    let mut order: Vec<usize> = (0..demands.len()).collect();
    order.sort_by(|&i, &j| demands[j].cmp(&demands[i]).then(i.cmp(&j)));

    let mut selected = vec![false; demands.len()];
    let mut picked: i64 = 0;
    for &i in &order {
        if picked + demands[i] <= budget {
            selected[i] = true;
            picked += demands[i];
        }
    }
    (selected, picked)
}
