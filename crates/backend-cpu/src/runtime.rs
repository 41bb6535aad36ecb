//! Reference kernel executor.
//!
//! Launch geometry follows the dispatch layout of the batch-norm kernels:
//! sub-groups along the channel axis in dimension 0, spatial blocks in
//! dimension 1. `execute` replays each kernel's memory traffic on the host
//! with rayon and reports the wall time, scaled up when the traffic was
//! capped.

use kernelplan_kernels::utils::{div_up, rnd_up};
use kernelplan_kernels::{
    CandidateConfiguration, HardwareProfile, KernelDescriptor, KernelExecutor, KernelKind,
    LaunchGeometry, Result, ShapeClass,
};
use rayon::prelude::*;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct ReferenceExecutorOptions {
    pub device_id: String,
    /// Upper bound on the bytes actually moved per operand and launch.
    pub max_buffer_bytes: u64,
}

impl Default for ReferenceExecutorOptions {
    fn default() -> Self {
        Self {
            device_id: "reference-0".into(),
            max_buffer_bytes: 64 << 20,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceExecutor {
    options: ReferenceExecutorOptions,
}

/// Largest multiple of `step` that divides `n` and is at most `limit`.
fn largest_multiple_dividing(n: u64, step: u64, limit: u64) -> u64 {
    let mut best = 0;
    let mut m = step;
    while m <= limit && m <= n {
        if n % m == 0 {
            best = m;
        }
        m += step;
    }
    best
}

/// Pick a local size the way an automatic dispatcher would. A zero extent
/// means no legal work-group shape exists.
pub fn auto_local_size(global: [u64; 3], sub_group_size: u64, max_local: u64) -> [u64; 3] {
    if max_local < sub_group_size || global[0] % sub_group_size != 0 {
        return [0, 1, 1];
    }
    let l0 = largest_multiple_dividing(global[0], sub_group_size, max_local);
    if l0 == 0 {
        return [0, 1, 1];
    }
    let l1 = largest_multiple_dividing(global[1], 1, max_local / l0).max(1);
    [l0, l1, 1]
}

impl ReferenceExecutor {
    pub fn new(options: ReferenceExecutorOptions) -> Self {
        Self { options }
    }

    pub fn global_size(
        kind: KernelKind,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
    ) -> [u64; 3] {
        let sg = shape.sub_group_size as u64;
        let channel_groups = div_up(shape.ic, candidate.ic_block()) * sg;
        match kind {
            KernelKind::CalcMean
            | KernelKind::CalcVar
            | KernelKind::CalcMeanVar
            | KernelKind::CalcStats => {
                [channel_groups, div_up(shape.sp, candidate.stat_sp_block()), 1]
            }
            KernelKind::DefaultFwd | KernelKind::DefaultBwd => {
                [channel_groups, div_up(shape.sp, candidate.update_sp_block()), 1]
            }
            KernelKind::ReduceStatsFwd
            | KernelKind::ReusableReduceStatsFwd
            | KernelKind::ReduceMeanVar
            | KernelKind::ReduceStatsBwd
            | KernelKind::ReduceAuxInit
            | KernelKind::ReduceAuxFinalize => [rnd_up(shape.ic, sg), 1, 1],
        }
    }
}

impl KernelExecutor for ReferenceExecutor {
    fn device_id(&self) -> &str {
        &self.options.device_id
    }

    fn launch_geometry(
        &self,
        kind: KernelKind,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
        hw: &HardwareProfile,
    ) -> LaunchGeometry {
        let global = Self::global_size(kind, shape, candidate);
        let local = auto_local_size(
            global,
            shape.sub_group_size as u64,
            hw.max_local_group_size as u64,
        );
        LaunchGeometry::new(global, local)
    }

    fn execute(
        &self,
        kernel: &KernelDescriptor,
        geometry: &LaunchGeometry,
        _shape: &ShapeClass,
        _candidate: &CandidateConfiguration,
    ) -> Result<Duration> {
        let cap = self.options.max_buffer_bytes.max(4);
        let read_bytes = kernel.input_bytes.min(cap);
        let write_bytes = kernel.output_bytes.min(cap);
        let src = vec![1.0f32; (read_bytes / 4).max(1) as usize];
        let mut dst = vec![0.0f32; (write_bytes / 4).max(1) as usize];
        let chunk = (geometry.local_size().max(1) * 64) as usize;

        let start = Instant::now();
        let sum: f32 = src.par_chunks(chunk).map(|c| c.iter().sum::<f32>()).sum();
        dst.par_chunks_mut(chunk).for_each(|c| c.fill(sum));
        let elapsed = start.elapsed();
        std::hint::black_box(&dst);

        let moved = (read_bytes + write_bytes).max(1) as f64;
        let requested = (kernel.input_bytes + kernel.output_bytes).max(1) as f64;
        let scaled = elapsed.mul_f64((requested / moved).max(1.0));
        trace!(kernel = %kernel.kind, ?scaled, "reference launch");
        Ok(scaled)
    }
}
