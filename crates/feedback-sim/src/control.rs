use serde::{Deserialize, Serialize};

/// Proportional controller that converts observed-vs-setpoint error into a
/// downgrade-fraction increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeFracController {
    /// Maximum (absolute) fraction of traffic downgraded or upgraded in one
    /// control loop.
    pub max_inc: f64,

    /// Downgrade err * prop_gain of the traffic.
    pub prop_gain: f64,

    /// Don't downgrade/upgrade if err < ignore_err_below.
    pub ignore_err_below: f64,

    /// Don't downgrade/upgrade if err < ignore_err_by_count_multiplier
    /// times the largest single flow's share of the total.
    pub ignore_err_by_count_multiplier: f64,
}

impl DowngradeFracController {
    /// Fraction of traffic to downgrade this iteration (negative upgrades).
    ///
    /// Panics if the pre-clamp output exceeds unit magnitude; gains that
    /// produce it would silently destabilize the loop.
    pub fn traffic_frac_to_downgrade(
        &self,
        observed: f64,
        setpoint: f64,
        input_to_output_conversion: f64,
        max_flow_frac: f64,
    ) -> f64 {
        let err = observed - setpoint;
        if 0.0 < err && err < self.ignore_err_below {
            return 0.0;
        }
        if 0.0 < err && err < self.ignore_err_by_count_multiplier * max_flow_frac {
            return 0.0;
        }
        let x = self.prop_gain * err * input_to_output_conversion;
        assert!(
            x.abs() <= 1.0,
            "pre-clamp controller output {x} exceeds unit magnitude \
             (observed = {observed}, setpoint = {setpoint})"
        );
        x.clamp(-self.max_inc, self.max_inc)
    }
}

/// Exponentially weighted moving average.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ewma {
    v: f64,
    ok: bool,
}

impl Ewma {
    pub fn get(&self) -> Option<f64> {
        self.ok.then_some(self.v)
    }

    /// Sets the average to `alpha * v + (1 - alpha) * avg`. The first
    /// recorded value seeds the average directly.
    pub fn record(&mut self, v: f64, alpha: f64) {
        if !self.ok {
            self.ok = true;
            self.v = v;
        } else {
            self.v = alpha * v + (1.0 - alpha) * self.v;
        }
    }
}
