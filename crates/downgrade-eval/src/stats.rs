use serde::{Deserialize, Serialize};

/// Summary statistics over one recorded metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub mean: f64,

    // Percentiles
    pub p0: f64,
    pub p5: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p100: f64,

    // Full distribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Vec<f64>>,
}

/// Records values for a metric and computes statistics for it.
#[derive(Debug, Clone, Default)]
pub struct Metric {
    sum: f64,
    num: f64,
    vals: Vec<f64>,
}

impl Metric {
    pub fn record(&mut self, v: f64) {
        self.sum += v;
        self.num += 1.0;
        self.vals.push(v);
    }

    /// Merges another shard's data in. Commutative and associative up to the
    /// ordering of `vals`, which `stats` sorts anyway.
    pub fn merge_from(&mut self, o: &Metric) {
        self.sum += o.sum;
        self.num += o.num;
        self.vals.extend_from_slice(&o.vals);
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.num
    }

    /// Summarizes the recorded values. With no recorded values everything is
    /// zero; a NaN mean would poison the JSON output.
    pub fn stats(&mut self, collect_dist: bool) -> Stats {
        if self.vals.is_empty() {
            return Stats { dist: collect_dist.then(Vec::new), ..Stats::default() };
        }
        self.vals.sort_by(f64::total_cmp);
        let vals = &self.vals;
        let n = vals.len();
        Stats {
            mean: self.mean(),
            p0: vals[0],
            p5: vals[(n - 1 + 18) / 20],
            p10: vals[(n - 1 + 8) / 10],
            p50: vals[n / 2],
            p90: vals[n - 1 - n / 10],
            p95: vals[n - 1 - n / 20],
            p100: vals[n - 1],
            dist: collect_dist.then(|| vals.clone()),
        }
    }
}

/// A metric recorded twice: as-is and as an absolute value, so summaries can
/// report both bias and magnitude.
#[derive(Debug, Clone, Default)]
pub struct MetricWithAbs {
    pub raw: Metric,
    pub abs: Metric,
}

impl MetricWithAbs {
    pub fn record(&mut self, v: f64) {
        self.raw.record(v);
        self.abs.record(v.abs());
    }

    pub fn merge_from(&mut self, o: &MetricWithAbs) {
        self.raw.merge_from(&o.raw);
        self.abs.merge_from(&o.abs);
    }
}
