//! Candidate search-space generation.

use kernelplan_kernels::utils::{div_up, rnd_dn_pow2, rnd_up};
use kernelplan_kernels::{
    CandidateBuilder, CandidateConfiguration, HardwareProfile, PlanError, ReductionStrategy,
    Result, WorkloadDescriptor,
};
use tracing::debug;

/// Upper bound of the thread-count multiplier swept by the spatial search.
const MAX_THREAD_MULTIPLIER: u64 = 32;

/// Largest power of two `v <= max_vect_size` with `ic / (v * simd) > 0`.
pub fn vector_width(ic: u64, max_vect_size: u32, simd: u32) -> u32 {
    let simd = simd.max(1) as u64;
    let mut v = rnd_dn_pow2(max_vect_size as u64).max(1);
    while v > 1 && ic / (v * simd) == 0 {
        v /= 2;
    }
    v as u32
}

/// Lanes along the channel axis used by the statistics kernels.
pub fn calc_stat_ic(ic: u64, ic_block: u64, simd: u32) -> u64 {
    div_up(ic, ic_block) * simd as u64
}

/// Spatial block that maximises thread-wave efficiency.
///
/// Sweeps the generated thread count over `1..=32` multiples of the compute
/// unit count. A block that also fills every compute unit exactly wins over
/// one that merely has the best thread-level efficiency.
pub fn spatial_block_size(
    sp: u64,
    ic_dim: u64,
    compute_units: u32,
    threads_per_unit: u32,
    simd: u32,
) -> u64 {
    let units = compute_units.max(1) as u64;
    let slots = units * threads_per_unit.max(1) as u64;
    let ic_nsg = (ic_dim / simd.max(1) as u64).max(1);

    let mut best_thr = (0.0f64, 1u64);
    let mut best_saturated: Option<(f64, u64)> = None;

    for mul in 1..=MAX_THREAD_MULTIPLIER {
        let nthr = mul * units;
        let block = div_up(sp * ic_nsg, nthr).max(1);
        let nblock = div_up(sp, block);
        let generated = nblock * ic_nsg;

        let efficiency_thr = generated as f64 / rnd_up(generated, slots) as f64;
        let saturates_units = generated % units == 0;

        if efficiency_thr > best_thr.0 {
            best_thr = (efficiency_thr, block);
        }
        if saturates_units && best_saturated.map_or(true, |(eff, _)| efficiency_thr > eff) {
            best_saturated = Some((efficiency_thr, block));
        }
    }

    best_saturated.map_or(best_thr.1, |(_, block)| block)
}

/// All channel blocks worth considering: multiples of the sub-group size
/// that divide the channel count, capped for reusable kernels.
fn channel_blocks(workload: &WorkloadDescriptor) -> Vec<u64> {
    let shape = &workload.shape;
    if let Some(block) = workload.ic_block.pin_value() {
        return vec![block];
    }
    let sg = shape.sub_group_size as u64;
    let cap = if shape.is_reusable() {
        shape.max_ic_block.min(shape.ic)
    } else {
        shape.ic
    };
    (1..)
        .map(|i| i * sg)
        .take_while(|block| *block <= cap)
        .filter(|block| shape.ic % block == 0)
        .collect()
}

fn reduction_strategies(workload: &WorkloadDescriptor, hw: &HardwareProfile) -> Vec<ReductionStrategy> {
    let atomics_allowed =
        hw.arch.supports_atomics_reduction() && !workload.shape.flags.deterministic;
    match workload.use_fused_atomics_reduction.pin_value() {
        Some(true) if atomics_allowed => vec![ReductionStrategy::Atomics],
        Some(true) => Vec::new(),
        Some(false) => vec![ReductionStrategy::TwoPass],
        None if atomics_allowed => vec![ReductionStrategy::TwoPass, ReductionStrategy::Atomics],
        None => vec![ReductionStrategy::TwoPass],
    }
}

/// Ordered candidate set for `workload` on `hw`, honouring pinned fields.
///
/// Ordering is by channel block, two-pass before atomics. An empty set is a
/// planning failure.
pub fn generate_candidates(
    workload: &WorkloadDescriptor,
    hw: &HardwareProfile,
) -> Result<Vec<CandidateConfiguration>> {
    workload.validate()?;
    let shape = &workload.shape;
    let strategies = reduction_strategies(workload, hw);
    let unroll = workload.update_sp_unroll.get();
    let mut candidates = Vec::new();

    for ic_block in channel_blocks(workload) {
        let stat_ic = calc_stat_ic(shape.ic, ic_block, shape.sub_group_size);
        let stat_sp_block = workload.stat_sp_block.pin_value().unwrap_or_else(|| {
            spatial_block_size(
                shape.sp,
                stat_ic,
                hw.compute_unit_count,
                hw.threads_per_unit,
                shape.sub_group_size,
            )
        });
        let update_sp_block = workload.update_sp_block.pin_value().unwrap_or(stat_sp_block);
        let vect = vector_width(ic_block, shape.max_vect_size, shape.sub_group_size);

        for &reduction in &strategies {
            let candidate = CandidateBuilder::new(reduction, ic_block)
                .stat_sp_block(stat_sp_block)
                .update_sp_block(update_sp_block)
                .vect_size(vect)
                .unroll(if workload.update_sp_unroll.is_pinned() { unroll } else { 1 })
                .build()?;
            if workload.update_sp_unroll.is_pinned() && !candidate.is_unroll_legal(shape.sp) {
                debug!(%candidate, "pinned unroll is illegal for candidate; excluded");
                continue;
            }
            candidates.push(candidate);
        }
    }

    debug!(workload = %workload, count = candidates.len(), "generated candidates");
    if candidates.is_empty() {
        return Err(PlanError::EmptySearchSpace {
            workload: workload.to_string(),
        });
    }
    Ok(candidates)
}

/// Adds unroll variants for every candidate when the unroll is not pinned.
/// Only legal factors are emitted.
pub fn with_unroll_variants(
    workload: &WorkloadDescriptor,
    candidates: Vec<CandidateConfiguration>,
    factors: &[u64],
) -> Result<Vec<CandidateConfiguration>> {
    if workload.update_sp_unroll.is_pinned() {
        return Ok(candidates);
    }
    let mut out = Vec::with_capacity(candidates.len() * factors.len().max(1));
    for candidate in candidates {
        out.push(candidate);
        for &factor in factors.iter().filter(|f| **f > 1) {
            let variant = candidate.with_unroll(factor)?;
            if variant.is_unroll_legal(workload.shape.sp) {
                out.push(variant);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelplan_kernels::{DataType, DeviceInfo, GpuArch, ShapeClass};

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

    #[test]
    fn vector_width_examples() {
        assert_eq!(vector_width(256, 8, 16), 8);
        assert_eq!(vector_width(48, 8, 16), 2);
        assert_eq!(vector_width(16, 8, 16), 1);
        // non power-of-two cap rounds down
        assert_eq!(vector_width(1024, 6, 16), 4);
    }

    #[test]
    fn vector_width_is_largest_valid_power_of_two() {
        for ic in (16..=1024).step_by(16) {
            for max in [1u32, 2, 4, 8, 16] {
                let v = vector_width(ic, max, 16) as u64;
                assert!(v.is_power_of_two() && v <= max as u64);
                assert!(ic / (v * 16) > 0);
                if v < max as u64 {
                    assert_eq!(ic / (2 * v * 16), 0, "ic={ic} max={max} v={v}");
                }
            }
        }
    }

    #[test]
    fn spatial_block_prefers_saturated_units() {
        // 448 units, one sub-group along ic: a block of 1 generates 448 threads
        // which fills every unit exactly.
        assert_eq!(spatial_block_size(448, 16, 448, 8, 16), 1);
        let block = spatial_block_size(100_000, 64, 448, 8, 16);
        assert!(block >= 1);
        assert_eq!(block, spatial_block_size(100_000, 64, 448, 8, 16));
    }

    #[test]
    fn candidates_cover_blocks_and_strategies() {
        let w = WorkloadDescriptor::new(ShapeClass::forward(8192, 64, DataType::F32));
        let c = generate_candidates(&w, &hw(GpuArch::XeHpc)).unwrap();
        let blocks: Vec<_> = c.iter().map(|c| (c.ic_block(), c.use_atomics())).collect();
        assert_eq!(
            blocks,
            vec![(16, false), (16, true), (32, false), (32, true), (64, false), (64, true)]
        );
    }

    #[test]
    fn atomics_excluded_for_determinism_and_old_arch() {
        let mut shape = ShapeClass::forward(8192, 64, DataType::F32);
        shape.flags.deterministic = true;
        let c = generate_candidates(&WorkloadDescriptor::new(shape), &hw(GpuArch::XeHpc)).unwrap();
        assert!(c.iter().all(|c| !c.use_atomics()));

        let w = WorkloadDescriptor::new(ShapeClass::forward(8192, 64, DataType::F32));
        let c = generate_candidates(&w, &hw(GpuArch::XeHpg)).unwrap();
        assert!(c.iter().all(|c| !c.use_atomics()));
    }

    #[test]
    fn pinned_atomics_on_old_arch_is_empty() {
        let mut w = WorkloadDescriptor::new(ShapeClass::forward(8192, 64, DataType::F32));
        w.use_fused_atomics_reduction.pin(true);
        let err = generate_candidates(&w, &hw(GpuArch::XeHpg)).unwrap_err();
        assert!(matches!(err, PlanError::EmptySearchSpace { .. }));
    }

    #[test]
    fn reusable_caps_channel_block() {
        let mut shape = ShapeClass::forward(8192, 512, DataType::F32);
        shape.variant = kernelplan_kernels::ImplVariant::Reusable;
        shape.max_ic_block = 64;
        let c = generate_candidates(&WorkloadDescriptor::new(shape), &hw(GpuArch::XeHpg)).unwrap();
        // 16, 32 and 64 divide 512; 48 does not
        assert_eq!(c.iter().map(|c| c.ic_block()).collect::<Vec<_>>(), vec![16, 32, 64]);
    }

    #[test]
    fn pinned_fields_flow_into_candidates() {
        let mut w = WorkloadDescriptor::new(ShapeClass::forward(8192, 128, DataType::F32));
        w.ic_block.pin(32);
        w.stat_sp_block.pin(64);
        w.update_sp_unroll.pin(4);
        let c = generate_candidates(&w, &hw(GpuArch::XeHpc)).unwrap();
        assert!(c
            .iter()
            .all(|c| c.ic_block() == 32 && c.stat_sp_block() == 64 && c.unroll() == 4));
    }

    #[test]
    fn illegal_pinned_unroll_empties_space() {
        let mut w = WorkloadDescriptor::new(ShapeClass::forward(8192, 128, DataType::F32));
        w.stat_sp_block.pin(6);
        w.update_sp_unroll.pin(4);
        assert!(generate_candidates(&w, &hw(GpuArch::XeHpc)).is_err());
    }

    #[test]
    fn unroll_variants_are_legal() {
        let mut w = WorkloadDescriptor::new(ShapeClass::forward(8192, 64, DataType::F32));
        w.stat_sp_block.pin(64);
        let base = generate_candidates(&w, &hw(GpuArch::XeHpg)).unwrap();
        let expanded = with_unroll_variants(&w, base.clone(), &[1, 2, 4, 8]).unwrap();
        assert_eq!(expanded.len(), base.len() * 4);
        assert!(expanded.iter().all(|c| c.is_unroll_legal(8192)));
    }
}
