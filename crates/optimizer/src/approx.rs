//! Calibrated approximation curves for thread-utilization slowdown.
//!
//! The curves are data, not code: the built-in table is the versioned JSON
//! file next to this module, parsed once per process. Another table with the
//! same layout can be loaded with [`ApproxTable::from_path`].

use kernelplan_kernels::{ImplVariant, MemoryTier, PlanError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, OnceLock};

const BUILTIN_TABLE: &str = include_str!("approx_table.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Curve {
    /// `a * x + b`
    Linear,
    /// `a * ln(x) + b`
    Log,
}

/// One calibrated two-parameter curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApproxEntry(pub f32, pub f32, pub Curve);

impl ApproxEntry {
    pub fn eval(&self, x: f32) -> f32 {
        let ApproxEntry(a, b, curve) = *self;
        match curve {
            Curve::Linear => a * x + b,
            Curve::Log => a * x.ln() + b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Read,
    Write,
}

/// Composite lookup key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApproxKey {
    pub slice_util: f32,
    pub is_16bit: bool,
    pub op: MemOp,
    pub variant: ImplVariant,
    pub tier: MemoryTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Section {
    tier: MemoryTier,
    variant: ImplVariant,
    entries: Vec<ApproxEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproxTable {
    version: u32,
    occupancy_breakpoints: Vec<f32>,
    max_thread_util: f32,
    min_thread_util: f32,
    sections: Vec<Section>,
}

impl ApproxTable {
    /// The table shipped with the crate.
    pub fn builtin() -> Arc<ApproxTable> {
        static TABLE: OnceLock<Arc<ApproxTable>> = OnceLock::new();
        TABLE
            .get_or_init(|| {
                Arc::new(
                    ApproxTable::from_json(BUILTIN_TABLE)
                        .expect("built-in approximation table is valid"),
                )
            })
            .clone()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let table: ApproxTable = serde_json::from_str(json)?;
        table.check()?;
        Ok(table)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn check(&self) -> Result<()> {
        let bp = &self.occupancy_breakpoints;
        if bp.is_empty() || bp.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PlanError::InvalidTable(
                "occupancy breakpoints must be non-empty and strictly increasing".into(),
            ));
        }
        if !(self.min_thread_util > 0.0 && self.min_thread_util < self.max_thread_util) {
            return Err(PlanError::InvalidTable(format!(
                "thread utilization range [{}, {}] is empty",
                self.min_thread_util, self.max_thread_util
            )));
        }
        let per_section = 4 * bp.len();
        for s in &self.sections {
            if s.entries.len() != per_section {
                return Err(PlanError::InvalidTable(format!(
                    "section {}/{:?} has {} entries, expected {}",
                    s.tier,
                    s.variant,
                    s.entries.len(),
                    per_section
                )));
            }
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn max_slice_util(&self) -> f32 {
        *self.occupancy_breakpoints.last().unwrap_or(&1.0)
    }

    pub fn max_thread_util(&self) -> f32 {
        self.max_thread_util
    }

    pub fn min_thread_util(&self) -> f32 {
        self.min_thread_util
    }

    /// Index of the first breakpoint `>= value`, or the last bucket.
    pub fn bucket(&self, value: f32) -> usize {
        self.occupancy_breakpoints
            .iter()
            .position(|bp| value <= *bp)
            .unwrap_or(self.occupancy_breakpoints.len() - 1)
    }

    /// Position inside a section: bucket, then dtype class, then operation.
    fn index(&self, key: &ApproxKey) -> usize {
        let buckets = self.occupancy_breakpoints.len();
        let dt = key.is_16bit as usize;
        let op = match key.op {
            MemOp::Read => 0,
            MemOp::Write => 1,
        };
        self.bucket(key.slice_util) + dt * buckets + op * 2 * buckets
    }

    pub fn entry(&self, key: &ApproxKey) -> Result<ApproxEntry> {
        let index = self.index(key);
        self.sections
            .iter()
            .find(|s| s.tier == key.tier && s.variant == key.variant)
            .and_then(|s| s.entries.get(index).copied())
            .ok_or_else(|| PlanError::MissingApproximation {
                index,
                section: format!("{}/{:?}", key.tier, key.variant),
            })
    }

    /// Slowdown at `thread_util` relative to the curve's value at saturation.
    pub fn thread_factor(&self, key: &ApproxKey, thread_util: f32) -> Result<f32> {
        let entry = self.entry(key)?;
        let x = thread_util.clamp(self.min_thread_util, self.max_thread_util);
        let y = entry.eval(x);
        let y_max = entry.eval(self.max_thread_util);
        if y <= 0.0 || y_max <= 0.0 {
            return Err(PlanError::InvalidTable(format!(
                "curve {entry:?} is not positive at utilization {x}"
            )));
        }
        Ok(y_max / y)
    }
}
