//! Per-kernel latency estimation.
//!
//! A kernel's time is its read volume plus its write volume, each divided by
//! the bandwidth of the tier the operand lives in. That base time is then
//! scaled by slice saturation, thread utilization, an atomics penalty on the
//! statistics kernels, and a short-vector penalty.

use crate::approx::{ApproxKey, ApproxTable, MemOp};
use kernelplan_kernels::utils::rnd_up_pow2;
use kernelplan_kernels::{
    CandidateConfiguration, GpuArch, HardwareProfile, ImplVariant, KernelDescriptor, KernelKind,
    MemoryTier, Occupancy, PlanError, Result, ShapeClass,
};

/// Write-time multiplier for statistics kernels accumulating with atomics.
pub const ATOMICS_WRITE_PENALTY: f32 = 64.0;

/// Vector width assumed for the reusable reduction kernels.
pub const REUSABLE_REDUCTION_VECT: u32 = 8;

/// Bytes per nanosecond of `tier`.
pub fn tier_bandwidth(hw: &HardwareProfile, tier: MemoryTier) -> f32 {
    match tier {
        MemoryTier::Slow => hw.slow_tier_bandwidth,
        MemoryTier::Fast => hw.fast_tier_bandwidth,
    }
}

/// Assign memory tiers to the kernel's operands.
pub fn place_operands(shape: &ShapeClass, hw: &HardwareProfile, kernel: &mut KernelDescriptor) {
    kernel.input_tier = MemoryTier::Slow;
    kernel.output_tier = MemoryTier::Slow;
    if !hw.has_fast_tier() {
        return;
    }

    let fits = |bytes: u64| bytes < hw.fast_tier_size;
    let no_stats_default = match kernel.kind {
        KernelKind::DefaultFwd => !shape.flags.calculate_stats,
        KernelKind::DefaultBwd => !shape.flags.calculate_diff_stats,
        _ => false,
    };

    if matches!(kernel.kind, KernelKind::CalcMean | KernelKind::CalcVar) {
        if fits(kernel.input_bytes + kernel.output_bytes) {
            kernel.input_tier = MemoryTier::Fast;
        }
    } else if !no_stats_default && fits(kernel.input_bytes) {
        kernel.input_tier = MemoryTier::Fast;
    }
    if fits(kernel.output_bytes) {
        kernel.output_tier = MemoryTier::Fast;
    }
}

/// Slowdown from work groups not covering every slice.
pub fn slice_utilization_factor(slice_util: f32, dtype_16bit: bool, variant: ImplVariant) -> f32 {
    let util = slice_util.clamp(1e-3, 1.0);
    match variant {
        ImplVariant::Reusable => {
            let (a, b) = if dtype_16bit { (2.0, -0.8) } else { (5.3, -0.7) };
            a * util.powf(b)
        }
        ImplVariant::Optimized => 1.0 / util,
    }
}

/// Point on the two-segment line through `(x0, y0)`, `(x1, y1)`, `(x2, y2)`.
fn two_piece_linear(x: f32, p0: (f32, f32), p1: (f32, f32), p2: (f32, f32)) -> f32 {
    let (a, b) = if x < p1.0 { (p0, p1) } else { (p1, p2) };
    (b.1 - a.1) / (b.0 - a.0) * (x - a.0) + a.1
}

/// Closed-form thread-utilization slowdown for workload-specialised kernels.
fn closed_form_thread_factor(
    slice_util: f32,
    thread_util: f32,
    tier: MemoryTier,
    arch: GpuArch,
    min_thread_util: f32,
) -> Result<f32> {
    let y = match tier {
        MemoryTier::Fast => {
            let slice = slice_util.min(1.0);
            let thr = thread_util.clamp(min_thread_util, 1.0);
            two_piece_linear(thr, (0.0, 0.0), (0.25, 1.0 - slice / 2.0), (1.0, 1.0))
        }
        MemoryTier::Slow if arch == GpuArch::XeHpg => {
            let slices = (slice_util.round() as u64).clamp(1, 256);
            let x_br = rnd_up_pow2(slices) as f32 / 16.0;
            let y_br = if slice_util > 4.0 { 0.9 } else { 0.5 };
            let thr = thread_util.max(min_thread_util);
            two_piece_linear(thr, (0.0, 0.0), (x_br, y_br), (32.0, 1.0))
        }
        MemoryTier::Slow if arch >= GpuArch::XeHpc => {
            let y_br = if slice_util.min(1.0) < 0.25 { 0.9 } else { 0.7 };
            let thr = thread_util.clamp(min_thread_util, 1.0);
            two_piece_linear(thr, (0.0, 0.0), (0.125, y_br), (1.0, 1.0))
        }
        MemoryTier::Slow => return Err(PlanError::UnsupportedArchitecture(arch)),
    };
    Ok(1.0 / y)
}

/// Short-vector penalty.
pub fn vectorization_factor(vect_size: u32, dtype_16bit: bool, variant: ImplVariant) -> f32 {
    match (variant, dtype_16bit, vect_size) {
        (ImplVariant::Reusable, _, 1) => 2.5,
        (ImplVariant::Reusable, true, 2) => 1.8,
        (ImplVariant::Reusable, true, 4) => 1.2,
        (ImplVariant::Reusable, false, 2) => 1.5,
        (ImplVariant::Optimized, _, 1) => 4.0,
        (ImplVariant::Optimized, true, 2) => 1.5,
        (ImplVariant::Optimized, true, 4) => 1.3,
        (ImplVariant::Optimized, false, 2) => 1.3,
        _ => 1.0,
    }
}

/// Read and write time of one kernel launch, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelTime {
    pub read_ns: f32,
    pub write_ns: f32,
}

impl KernelTime {
    pub fn total(&self) -> f32 {
        self.read_ns + self.write_ns
    }
}

/// Analytical estimator bound to one device and one approximation table.
#[derive(Debug, Clone, Copy)]
pub struct Estimator<'a> {
    hw: &'a HardwareProfile,
    table: &'a ApproxTable,
}

impl<'a> Estimator<'a> {
    pub fn new(hw: &'a HardwareProfile, table: &'a ApproxTable) -> Self {
        Self { hw, table }
    }

    /// Base time with no utilization or vectorization adjustments.
    pub fn base_time(&self, kernel: &KernelDescriptor) -> KernelTime {
        KernelTime {
            read_ns: kernel.input_bytes as f32 / tier_bandwidth(self.hw, kernel.input_tier),
            write_ns: kernel.output_bytes as f32 / tier_bandwidth(self.hw, kernel.output_tier),
        }
    }

    fn thread_factor(
        &self,
        shape: &ShapeClass,
        occupancy: &Occupancy,
        tier: MemoryTier,
        op: MemOp,
    ) -> Result<f32> {
        match shape.variant {
            ImplVariant::Reusable => {
                let key = ApproxKey {
                    slice_util: occupancy.slice_util.min(self.table.max_slice_util()),
                    is_16bit: shape.dtype.is_16bit(),
                    op,
                    variant: shape.variant,
                    tier,
                };
                self.table.thread_factor(&key, occupancy.thread_util)
            }
            ImplVariant::Optimized => closed_form_thread_factor(
                occupancy.slice_util,
                occupancy.thread_util,
                tier,
                self.hw.arch,
                self.table.min_thread_util(),
            ),
        }
    }

    /// Full estimate for one launch of `kernel` with the given occupancy.
    pub fn kernel_time(
        &self,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
        kernel: &KernelDescriptor,
        occupancy: &Occupancy,
    ) -> Result<KernelTime> {
        let is_16bit = shape.dtype.is_16bit();
        let mut t = self.base_time(kernel);

        let ss = slice_utilization_factor(occupancy.slice_util, is_16bit, shape.variant);
        t.read_ns *= ss;
        t.write_ns *= ss;

        t.read_ns *= self.thread_factor(shape, occupancy, kernel.input_tier, MemOp::Read)?;
        t.write_ns *= self.thread_factor(shape, occupancy, kernel.output_tier, MemOp::Write)?;

        if candidate.use_atomics() && kernel.kind.is_statistic() {
            t.write_ns *= ATOMICS_WRITE_PENALTY;
        }

        let vect = if kernel.kind.is_reduction() && shape.is_reusable() {
            REUSABLE_REDUCTION_VECT
        } else {
            candidate.vect_size()
        };
        let v = vectorization_factor(vect, is_16bit, shape.variant);
        t.read_ns *= v;
        t.write_ns *= v;

        if !(t.read_ns >= 0.0 && t.write_ns >= 0.0 && t.total().is_finite()) {
            return Err(PlanError::InvalidTable(format!(
                "estimate for {} is not a finite non-negative time ({:?})",
                kernel.kind, t
            )));
        }
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelplan_kernels::{
        decompose, CandidateBuilder, DataType, DeviceInfo, ReductionStrategy,
    };

    fn hw(arch: GpuArch) -> HardwareProfile {
        HardwareProfile::new(DeviceInfo {
            name: "test".into(),
            arch,
            eu_count: 448,
            threads_per_eu: 8,
            max_wg_size: 1024,
            eus_per_subslice: 8,
        })
        .unwrap()
    }

    fn candidate(reduction: ReductionStrategy, vect: u32) -> CandidateConfiguration {
        CandidateBuilder::new(reduction, 32)
            .stat_sp_block(64)
            .vect_size(vect)
            .build()
            .unwrap()
    }

    fn occupancy(slice_util: f32, thread_util: f32) -> Occupancy {
        Occupancy {
            work_groups: 56,
            slice_util,
            thread_util,
        }
    }

    fn kernel(shape: &ShapeClass, c: &CandidateConfiguration, kind: KernelKind) -> KernelDescriptor {
        decompose(shape, c)
            .into_iter()
            .find(|k| k.kind == kind)
            .unwrap()
    }

    #[test]
    fn xe_hpg_keeps_everything_in_slow_tier() {
        let hw = hw(GpuArch::XeHpg);
        let shape = ShapeClass::forward(64, 64, DataType::F32);
        let c = candidate(ReductionStrategy::TwoPass, 2);
        let mut k = kernel(&shape, &c, KernelKind::CalcMeanVar);
        place_operands(&shape, &hw, &mut k);
        assert_eq!((k.input_tier, k.output_tier), (MemoryTier::Slow, MemoryTier::Slow));
    }

    #[test]
    fn small_operands_go_to_fast_tier() {
        let hw = hw(GpuArch::XeHpc);
        let shape = ShapeClass::forward(1024, 64, DataType::F32);
        let c = candidate(ReductionStrategy::TwoPass, 2);
        let mut k = kernel(&shape, &c, KernelKind::CalcMeanVar);
        place_operands(&shape, &hw, &mut k);
        assert_eq!((k.input_tier, k.output_tier), (MemoryTier::Fast, MemoryTier::Fast));
    }

    #[test]
    fn large_tensor_stays_in_slow_tier() {
        let hw = hw(GpuArch::XeHpc);
        // 64M elements * 4 bytes = 256 MiB, larger than the 192 MiB cache
        let shape = ShapeClass::forward(1 << 20, 64, DataType::F32);
        let c = candidate(ReductionStrategy::TwoPass, 2);
        let mut k = kernel(&shape, &c, KernelKind::CalcMeanVar);
        place_operands(&shape, &hw, &mut k);
        assert_eq!(k.input_tier, MemoryTier::Slow);
        assert_eq!(k.output_tier, MemoryTier::Fast);
    }

    #[test]
    fn mean_and_var_inputs_need_room_for_both_operands() {
        let hw = hw(GpuArch::XeHpc);
        let mut shape = ShapeClass::forward(1024, 64, DataType::F32);
        shape.flags.use_stats_one_pass = false;
        let c = candidate(ReductionStrategy::TwoPass, 2);
        let output_bytes = 4096;

        for kind in [KernelKind::CalcMean, KernelKind::CalcVar] {
            let mut k = kernel(&shape, &c, kind);
            k.output_bytes = output_bytes;

            k.input_bytes = hw.fast_tier_size - output_bytes;
            place_operands(&shape, &hw, &mut k);
            assert_eq!(k.input_tier, MemoryTier::Slow, "{kind:?} at the boundary");

            k.input_bytes = hw.fast_tier_size - output_bytes - 1;
            place_operands(&shape, &hw, &mut k);
            assert_eq!(k.input_tier, MemoryTier::Fast, "{kind:?} below the boundary");
        }

        // other statistics kernels only look at the input
        let mut k = kernel(&shape, &c, KernelKind::CalcMean);
        k.kind = KernelKind::CalcMeanVar;
        k.output_bytes = output_bytes;
        k.input_bytes = hw.fast_tier_size - output_bytes;
        place_operands(&shape, &hw, &mut k);
        assert_eq!(k.input_tier, MemoryTier::Fast);
    }

    #[test]
    fn default_kernel_without_stats_reads_slow_tier() {
        let hw = hw(GpuArch::XeHpc);
        let mut shape = ShapeClass::forward(1024, 64, DataType::F32);
        shape.flags.calculate_stats = false;
        let c = candidate(ReductionStrategy::TwoPass, 2);
        let mut k = kernel(&shape, &c, KernelKind::DefaultFwd);
        place_operands(&shape, &hw, &mut k);
        assert_eq!((k.input_tier, k.output_tier), (MemoryTier::Slow, MemoryTier::Fast));
    }

    #[test]
    fn vectorization_lookup() {
        assert_eq!(vectorization_factor(1, true, ImplVariant::Optimized), 4.0);
        assert_eq!(vectorization_factor(4, false, ImplVariant::Optimized), 1.0);
        assert_eq!(vectorization_factor(4, true, ImplVariant::Reusable), 1.2);
        assert_eq!(vectorization_factor(16, true, ImplVariant::Reusable), 1.0);
    }

    #[test]
    fn atomics_penalise_statistics_writes() {
        let hw = hw(GpuArch::XeHpc);
        let table = ApproxTable::builtin();
        let est = Estimator::new(&hw, &table);
        let shape = ShapeClass::forward(8192, 256, DataType::F32);
        let occ = occupancy(1.0, 1.0);

        let two_pass = candidate(ReductionStrategy::TwoPass, 2);
        let atomics = candidate(ReductionStrategy::Atomics, 2);
        let k2 = kernel(&shape, &two_pass, KernelKind::CalcMeanVar);
        let ka = kernel(&shape, &atomics, KernelKind::CalcMeanVar);
        let t2 = est.kernel_time(&shape, &two_pass, &k2, &occ).unwrap();
        let ta = est.kernel_time(&shape, &atomics, &ka, &occ).unwrap();
        assert_eq!(t2.read_ns, ta.read_ns);
        let base2 = est.base_time(&k2).write_ns;
        let basea = est.base_time(&ka).write_ns;
        assert!((ta.write_ns / basea) / (t2.write_ns / base2) > 63.0);
    }

    #[test]
    fn estimates_are_non_negative_across_occupancies() {
        let table = ApproxTable::builtin();
        for arch in [GpuArch::XeHpg, GpuArch::XeHpc, GpuArch::Xe2] {
            let hw = hw(arch);
            let est = Estimator::new(&hw, &table);
            for variant in [ImplVariant::Optimized, ImplVariant::Reusable] {
                for dtype in [DataType::F32, DataType::BF16] {
                    let mut shape = ShapeClass::forward(4096, 128, dtype);
                    shape.variant = variant;
                    let c = candidate(ReductionStrategy::TwoPass, 4);
                    for mut k in decompose(&shape, &c) {
                        place_operands(&shape, &hw, &mut k);
                        for slice in [0.01f32, 0.2, 1.0, 3.0, 20.0] {
                            for thr in [0.0f32, 0.1, 0.5, 1.0, 40.0] {
                                let t = est.kernel_time(&shape, &c, &k, &occupancy(slice, thr)).unwrap();
                                assert!(t.read_ns >= 0.0 && t.write_ns >= 0.0, "{k:?} {slice} {thr}");
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn more_bytes_means_more_time() {
        let table = ApproxTable::builtin();
        for arch in [GpuArch::XeHpg, GpuArch::XeHpc] {
            let hw = hw(arch);
            let est = Estimator::new(&hw, &table);
            for variant in [ImplVariant::Optimized, ImplVariant::Reusable] {
                let mut shape = ShapeClass::forward(4096, 128, DataType::F16);
                shape.variant = variant;
                let c = candidate(ReductionStrategy::TwoPass, 2);
                let mut k = kernel(&shape, &c, KernelKind::DefaultFwd);
                let occ = occupancy(0.5, 0.3);
                let before = est.kernel_time(&shape, &c, &k, &occ).unwrap().total();
                k.input_bytes += 4096;
                let after = est.kernel_time(&shape, &c, &k, &occ).unwrap().total();
                assert!(after > before);
                k.output_bytes += 4096;
                assert!(est.kernel_time(&shape, &c, &k, &occ).unwrap().total() > after);
            }
        }
    }

    #[test]
    fn closed_form_is_one_at_full_utilization() {
        for tier in [MemoryTier::Slow, MemoryTier::Fast] {
            let f = closed_form_thread_factor(1.0, 1.0, tier, GpuArch::XeHpc, 1.0 / 32.0).unwrap();
            assert!((f - 1.0).abs() < 1e-6);
        }
        let f = closed_form_thread_factor(8.0, 32.0, MemoryTier::Slow, GpuArch::XeHpg, 1.0 / 32.0)
            .unwrap();
        assert!((f - 1.0).abs() < 1e-6);
    }
}
