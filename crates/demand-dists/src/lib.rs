//! Host demand distribution generators.
//!
//! Each generator produces per-host demand values with a known distribution
//! mean, so sweep configs can size approvals relative to expected usage.
//! The variant set is closed: sweeps enumerate generators from config, they
//! are not an open plugin surface.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fb15;

pub use fb15::Fb15Gen;

#[derive(Error, Debug, PartialEq)]
pub enum DistError {
    #[error("no distribution kind set (want exactly one of uniform, elephantsMice, exponential, fb15)")]
    NoKind,
    #[error("expected at most one distribution kind, found multiple [{}]", .0.join(" "))]
    MultipleKinds(Vec<&'static str>),
}

pub type Result<T> = std::result::Result<T, DistError>;

/// Uniform demands in `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformGen {
    pub low: f64,
    pub high: f64,
    pub num: usize,
}

impl UniformGen {
    fn fill(&self, rng: &mut impl Rng, out: &mut Vec<f64>) {
        let range = self.high - self.low;
        for _ in 0..self.num {
            out.push(self.low + rng.gen::<f64>() * range);
        }
    }

    fn mean(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

/// A small population of heavy flows (elephants) plus many light ones (mice).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElephantsMiceGen {
    pub elephants: UniformGen,
    pub mice: UniformGen,
}

/// Exponential demands with the given mean, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialGen {
    pub mean: f64,
    pub max: f64,
    pub num: usize,
}

/// A demand generator: one of the closed set of distribution kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistGen {
    Uniform(UniformGen),
    ElephantsMice(ElephantsMiceGen),
    Exponential(ExponentialGen),
    Fb15(Fb15Gen),
}

impl DistGen {
    /// Fills `out` with one demand value per host. The buffer is cleared and
    /// reused across calls; it is owned by the calling shard.
    pub fn gen_dist(&self, rng: &mut impl Rng, out: &mut Vec<f64>) {
        out.clear();
        out.reserve(self.num_hosts());
        match self {
            DistGen::Uniform(g) => g.fill(rng, out),
            DistGen::ElephantsMice(g) => {
                g.elephants.fill(rng, out);
                g.mice.fill(rng, out);
            }
            DistGen::Exponential(g) => {
                for _ in 0..g.num {
                    // Inverse-transform sampling; 1 - U avoids ln(0).
                    let v = -(1.0 - rng.gen::<f64>()).ln() * g.mean;
                    out.push(v.min(g.max));
                }
            }
            DistGen::Fb15(g) => g.fill(rng, out),
        }
    }

    /// The distribution mean (not a sample mean).
    pub fn dist_mean(&self) -> f64 {
        match self {
            DistGen::Uniform(g) => g.mean(),
            DistGen::ElephantsMice(g) => {
                let s = g.elephants.mean() * g.elephants.num as f64
                    + g.mice.mean() * g.mice.num as f64;
                s / (g.elephants.num + g.mice.num) as f64
            }
            DistGen::Exponential(g) => g.mean,
            DistGen::Fb15(g) => g.dist_mean(),
        }
    }

    pub fn num_hosts(&self) -> usize {
        match self {
            DistGen::Uniform(g) => g.num,
            DistGen::ElephantsMice(g) => g.elephants.num + g.mice.num,
            DistGen::Exponential(g) => g.num,
            DistGen::Fb15(g) => g.num,
        }
    }

    /// The smallest host count this generator can be reconfigured for.
    /// Elephants-and-mice cannot shrink below its fixed elephant population.
    pub fn min_num_hosts(&self) -> usize {
        match self {
            DistGen::ElephantsMice(g) => g.elephants.num,
            _ => 1,
        }
    }

    /// Returns a copy reconfigured for `n` hosts (`n >= min_num_hosts()`).
    /// For elephants-and-mice the elephant population is fixed and the mice
    /// absorb the change.
    pub fn with_num_hosts(&self, n: usize) -> DistGen {
        let mut g = *self;
        match &mut g {
            DistGen::Uniform(g) => g.num = n,
            DistGen::ElephantsMice(g) => g.mice.num = n - g.elephants.num,
            DistGen::Exponential(g) => g.num = n,
            DistGen::Fb15(g) => g.num = n,
        }
        g
    }

    pub fn short_name(&self) -> String {
        match self {
            DistGen::Uniform(_) => "uniform".to_string(),
            DistGen::ElephantsMice(g) => format!("elephantsMice-{}", g.elephants.num),
            DistGen::Exponential(_) => "exponential".to_string(),
            DistGen::Fb15(_) => "fb15".to_string(),
        }
    }
}

/// Config-file form of a [`DistGen`]: exactly one kind must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDistGen {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uniform: Option<UniformGen>,
    #[serde(rename = "elephantsMice", skip_serializing_if = "Option::is_none")]
    pub elephants_mice: Option<ElephantsMiceGen>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exponential: Option<ExponentialGen>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fb15: Option<Fb15Gen>,
}

impl ConfigDistGen {
    pub fn into_gen(&self) -> Result<DistGen> {
        let mut found: Vec<(&'static str, DistGen)> = Vec::new();
        if let Some(g) = self.uniform {
            found.push(("uniform", DistGen::Uniform(g)));
        }
        if let Some(g) = self.elephants_mice {
            found.push(("elephantsMice", DistGen::ElephantsMice(g)));
        }
        if let Some(g) = self.exponential {
            found.push(("exponential", DistGen::Exponential(g)));
        }
        if let Some(g) = self.fb15 {
            found.push(("fb15", DistGen::Fb15(g)));
        }
        match (found.pop(), found.is_empty()) {
            (None, _) => Err(DistError::NoKind),
            (Some((_, gen)), true) => Ok(gen),
            (Some((name, _)), false) => {
                let mut names: Vec<&'static str> = found.iter().map(|(n, _)| *n).collect();
                names.push(name);
                Err(DistError::MultipleKinds(names))
            }
        }
    }
}

impl From<DistGen> for ConfigDistGen {
    fn from(gen: DistGen) -> Self {
        let mut c = ConfigDistGen::default();
        match gen {
            DistGen::Uniform(g) => c.uniform = Some(g),
            DistGen::ElephantsMice(g) => c.elephants_mice = Some(g),
            DistGen::Exponential(g) => c.exponential = Some(g),
            DistGen::Fb15(g) => c.fb15 = Some(g),
        }
        c
    }
}
