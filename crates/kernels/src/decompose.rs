//! Mapping of a workload + candidate onto elementary kernel launches.
//!
//! The sequence and every byte volume are closed-form functions of the
//! [`ShapeClass`] and the [`CandidateConfiguration`]; nothing here consults the
//! hardware or the cost model.

use crate::candidate::CandidateConfiguration;
use crate::config::ShapeClass;
use crate::utils::{div_up, rnd_up};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    DefaultFwd,
    DefaultBwd,
    CalcMean,
    CalcVar,
    CalcMeanVar,
    /// Backward diff statistics.
    CalcStats,
    ReduceStatsFwd,
    ReusableReduceStatsFwd,
    ReduceMeanVar,
    ReduceStatsBwd,
    ReduceAuxInit,
    ReduceAuxFinalize,
}

impl KernelKind {
    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::DefaultFwd => "default_fwd",
            KernelKind::DefaultBwd => "default_bwd",
            KernelKind::CalcMean => "calc_mean",
            KernelKind::CalcVar => "calc_var",
            KernelKind::CalcMeanVar => "calc_mean_var",
            KernelKind::CalcStats => "calc_stat",
            KernelKind::ReduceStatsFwd => "reduce_stats_fwd",
            KernelKind::ReusableReduceStatsFwd => "reusable_reduce_stats_fwd",
            KernelKind::ReduceMeanVar => "reduce_mean_var",
            KernelKind::ReduceStatsBwd => "reduce_stats_bwd",
            KernelKind::ReduceAuxInit => "reduce_aux_init",
            KernelKind::ReduceAuxFinalize => "reduce_aux_finalize",
        }
    }

    /// Kernels that compute per-block partial statistics.
    pub fn is_statistic(&self) -> bool {
        matches!(
            self,
            KernelKind::CalcMean | KernelKind::CalcVar | KernelKind::CalcMeanVar | KernelKind::CalcStats
        )
    }

    /// Second-pass reductions over the partials.
    pub fn is_reduction(&self) -> bool {
        matches!(
            self,
            KernelKind::ReduceStatsFwd
                | KernelKind::ReusableReduceStatsFwd
                | KernelKind::ReduceMeanVar
                | KernelKind::ReduceStatsBwd
        )
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Main memory.
    #[default]
    Slow,
    /// On-chip cache.
    Fast,
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryTier::Slow => "slow",
            MemoryTier::Fast => "fast",
        })
    }
}

/// How much of the device one launch occupies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Occupancy {
    pub work_groups: u64,
    /// Work groups per slice; above 1 means more than one wave of groups.
    pub slice_util: f32,
    /// Generated threads over the thread slots of the slices in use.
    pub thread_util: f32,
}

/// One elementary kernel launch within a planning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub kind: KernelKind,
    pub ncalls: u32,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub input_tier: MemoryTier,
    pub output_tier: MemoryTier,
    pub occupancy: Option<Occupancy>,
    pub time_ns: Option<f32>,
}

impl KernelDescriptor {
    fn new(shape: &ShapeClass, candidate: &CandidateConfiguration, kind: KernelKind) -> Self {
        Self {
            kind,
            ncalls: ncalls(shape, candidate, kind),
            input_bytes: input_bytes(shape, candidate, kind),
            output_bytes: output_bytes(shape, candidate, kind),
            input_tier: MemoryTier::Slow,
            output_tier: MemoryTier::Slow,
            occupancy: None,
            time_ns: None,
        }
    }

    /// Invocations times per-invocation time, if estimated.
    pub fn total_time_ns(&self) -> Option<f32> {
        self.time_ns.map(|t| t * self.ncalls as f32)
    }
}

/// Ordered kernel sequence for one candidate.
pub fn decompose(shape: &ShapeClass, candidate: &CandidateConfiguration) -> Vec<KernelDescriptor> {
    kernel_sequence(shape, candidate)
        .into_iter()
        .map(|kind| KernelDescriptor::new(shape, candidate, kind))
        .collect()
}

/// Which kernels run, in launch order.
pub fn kernel_sequence(shape: &ShapeClass, candidate: &CandidateConfiguration) -> Vec<KernelKind> {
    let atomics = candidate.use_atomics();
    let mut kinds = Vec::with_capacity(5);
    if shape.is_forward() {
        kinds.push(KernelKind::DefaultFwd);
        if !shape.flags.calculate_stats {
            return kinds;
        }
        if shape.flags.use_stats_one_pass {
            kinds.push(KernelKind::CalcMeanVar);
        } else {
            kinds.push(KernelKind::CalcMean);
            kinds.push(KernelKind::CalcVar);
        }
        if atomics {
            kinds.push(KernelKind::ReduceAuxInit);
            kinds.push(KernelKind::ReduceAuxFinalize);
        } else if shape.flags.use_stats_one_pass {
            kinds.push(KernelKind::ReduceMeanVar);
        } else if shape.is_reusable() {
            kinds.push(KernelKind::ReusableReduceStatsFwd);
        } else {
            kinds.push(KernelKind::ReduceStatsFwd);
        }
    } else {
        kinds.push(KernelKind::DefaultBwd);
        kinds.push(KernelKind::CalcStats);
        if atomics {
            kinds.push(KernelKind::ReduceAuxInit);
            kinds.push(KernelKind::ReduceAuxFinalize);
        } else {
            kinds.push(KernelKind::ReduceStatsBwd);
        }
    }
    kinds
}

/// Number of launches of `kind` per operator invocation.
pub fn ncalls(shape: &ShapeClass, candidate: &CandidateConfiguration, kind: KernelKind) -> u32 {
    if !shape.is_forward() {
        return 1;
    }
    let stats = shape.flags.calculate_stats;
    let atomics = candidate.use_atomics();
    match kind {
        KernelKind::DefaultFwd => 1,
        KernelKind::CalcMean | KernelKind::CalcVar | KernelKind::CalcMeanVar => stats as u32,
        // one launch for mean, one for variance
        KernelKind::ReduceStatsFwd | KernelKind::ReusableReduceStatsFwd => {
            if stats && !atomics {
                2
            } else {
                0
            }
        }
        KernelKind::ReduceMeanVar => (stats && !atomics) as u32,
        KernelKind::ReduceAuxInit => (stats && atomics) as u32,
        KernelKind::ReduceAuxFinalize => match (stats && atomics, shape.flags.use_stats_one_pass) {
            (false, _) => 0,
            (true, true) => 1,
            (true, false) => 2,
        },
        KernelKind::DefaultBwd | KernelKind::CalcStats | KernelKind::ReduceStatsBwd => 0,
    }
}

fn num_sp_blocks(shape: &ShapeClass, candidate: &CandidateConfiguration) -> u64 {
    div_up(shape.sp, candidate.stat_sp_block())
}

/// Partial statistics written by the first pass of a two-pass reduction.
fn partials_bytes(shape: &ShapeClass, candidate: &CandidateConfiguration) -> u64 {
    num_sp_blocks(shape, candidate) * rnd_up(shape.ic, shape.sub_group_size as u64) * 4
}

pub fn input_bytes(shape: &ShapeClass, candidate: &CandidateConfiguration, kind: KernelKind) -> u64 {
    let tensor = shape.tensor_bytes();
    let stat = shape.stat_vect_bytes();
    let f = &shape.flags;
    let ws = shape.sp * shape.ic;
    match kind {
        KernelKind::CalcMean | KernelKind::CalcMeanVar => tensor,
        KernelKind::CalcVar => tensor + stat * num_sp_blocks(shape, candidate),
        KernelKind::ReduceStatsFwd | KernelKind::ReusableReduceStatsFwd => {
            partials_bytes(shape, candidate)
        }
        KernelKind::ReduceMeanVar | KernelKind::ReduceStatsBwd => 2 * partials_bytes(shape, candidate),
        KernelKind::DefaultFwd => {
            (f.fuse_norm_add_relu as u64 + 1) * tensor
                + (f.use_scale as u64 + f.use_shift as u64 + 2) * stat
        }
        KernelKind::ReduceAuxInit => 0,
        KernelKind::ReduceAuxFinalize => {
            let vectors = if !shape.is_forward() || f.use_stats_one_pass { 2 } else { 1 };
            stat * vectors
        }
        KernelKind::DefaultBwd => {
            2 * tensor
                + (1 + 3 * f.calculate_diff_stats as u64 + f.use_scale as u64) * stat
                + f.fuse_norm_relu as u64 * ws
        }
        KernelKind::CalcStats => {
            2 * tensor + stat * num_sp_blocks(shape, candidate) + f.fuse_norm_relu as u64 * ws
        }
    }
}

pub fn output_bytes(shape: &ShapeClass, candidate: &CandidateConfiguration, kind: KernelKind) -> u64 {
    let tensor = shape.tensor_bytes();
    let stat = shape.stat_vect_bytes();
    let atomics = candidate.use_atomics();
    // atomics accumulate one stat vector per spatial block
    let partials = if atomics {
        stat * num_sp_blocks(shape, candidate)
    } else {
        partials_bytes(shape, candidate)
    };
    match kind {
        KernelKind::CalcMean | KernelKind::CalcVar => partials,
        KernelKind::CalcMeanVar | KernelKind::CalcStats => 2 * partials,
        KernelKind::ReduceAuxInit | KernelKind::ReduceMeanVar | KernelKind::ReduceStatsBwd => 2 * stat,
        KernelKind::ReduceStatsFwd | KernelKind::ReusableReduceStatsFwd => stat,
        KernelKind::ReduceAuxFinalize => {
            if shape.is_forward() && shape.flags.use_stats_one_pass {
                2 * stat
            } else {
                stat
            }
        }
        KernelKind::DefaultFwd => tensor,
        KernelKind::DefaultBwd => (1 + shape.flags.fuse_norm_add_relu as u64) * tensor,
    }
}
