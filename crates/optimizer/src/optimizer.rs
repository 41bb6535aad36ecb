//! Cost models and the configuration selector.

use crate::approx::ApproxTable;
use crate::estimator::{place_operands, tier_bandwidth, Estimator, ATOMICS_WRITE_PENALTY};
use crate::generator::{calc_stat_ic, generate_candidates, vector_width};
use crate::plan::{Plan, PlanSource};
use kernelplan_kernels::{
    decompose, CandidateConfiguration, HardwareProfile, KernelDescriptor, KernelExecutor,
    Occupancy, PlanError, Result, ShapeClass, WorkloadDescriptor,
};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Names accepted by [`cost_model_by_name`].
pub const COST_MODELS: [&str; 2] = ["analytical", "bandwidth"];

/// Predicts the latency of one kernel launch.
///
/// Operands have already been placed and the launch occupancy is known.
pub trait CostModel: Send + Sync {
    fn name(&self) -> &str;

    fn estimate(
        &self,
        hw: &HardwareProfile,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
        kernel: &KernelDescriptor,
        occupancy: &Occupancy,
    ) -> Result<f32>;
}

/// The full calibrated model.
#[derive(Debug, Clone)]
pub struct AnalyticalModel {
    table: Arc<ApproxTable>,
}

impl AnalyticalModel {
    pub fn new(table: Arc<ApproxTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ApproxTable {
        &self.table
    }
}

impl Default for AnalyticalModel {
    fn default() -> Self {
        Self::new(ApproxTable::builtin())
    }
}

impl CostModel for AnalyticalModel {
    fn name(&self) -> &str {
        "analytical"
    }

    fn estimate(
        &self,
        hw: &HardwareProfile,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
        kernel: &KernelDescriptor,
        occupancy: &Occupancy,
    ) -> Result<f32> {
        Estimator::new(hw, &self.table)
            .kernel_time(shape, candidate, kernel, occupancy)
            .map(|t| t.total())
    }
}

/// Tier bandwidth only, plus the atomics write penalty. Ignores occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BandwidthModel;

impl CostModel for BandwidthModel {
    fn name(&self) -> &str {
        "bandwidth"
    }

    fn estimate(
        &self,
        hw: &HardwareProfile,
        _shape: &ShapeClass,
        candidate: &CandidateConfiguration,
        kernel: &KernelDescriptor,
        _occupancy: &Occupancy,
    ) -> Result<f32> {
        let read = kernel.input_bytes as f32 / tier_bandwidth(hw, kernel.input_tier);
        let mut write = kernel.output_bytes as f32 / tier_bandwidth(hw, kernel.output_tier);
        if candidate.use_atomics() && kernel.kind.is_statistic() {
            write *= ATOMICS_WRITE_PENALTY;
        }
        Ok(read + write)
    }
}

/// Look a cost model up by its command-line name.
pub fn cost_model_by_name(name: &str, table: Arc<ApproxTable>) -> Result<Arc<dyn CostModel>> {
    match name {
        "analytical" => Ok(Arc::new(AnalyticalModel::new(table))),
        "bandwidth" => Ok(Arc::new(BandwidthModel)),
        other => Err(PlanError::UnknownCostModel(other.to_string())),
    }
}

/// One candidate with its per-kernel breakdown.
#[derive(Debug, Clone)]
pub struct CandidateEstimate {
    pub candidate: CandidateConfiguration,
    pub kernels: Vec<KernelDescriptor>,
    pub total_ns: f32,
}

/// Write the chosen configuration into every unpinned tunable, recompute the
/// derived fields and apply the unroll guard. Returns diagnostics.
pub fn apply_candidate(
    workload: &mut WorkloadDescriptor,
    candidate: &CandidateConfiguration,
) -> Result<Vec<String>> {
    let mut diagnostics = Vec::new();
    let sg = workload.shape.sub_group_size;

    workload
        .use_fused_atomics_reduction
        .set_if_free(candidate.use_atomics());
    workload.ic_block.set_if_free(candidate.ic_block());
    workload.stat_sp_block.set_if_free(candidate.stat_sp_block());
    workload.update_sp_block.set_if_free(candidate.update_sp_block());
    workload.update_sp_unroll.set_if_free(candidate.unroll());

    let ic_block = workload.ic_block.get();
    workload.calc_stat_ic = calc_stat_ic(workload.shape.ic, ic_block, sg);
    workload.vect_size = vector_width(ic_block, workload.shape.max_vect_size, sg);

    let update = workload.update_sp_block.get();
    let unroll = workload.update_sp_unroll.get();
    let legal =
        unroll > 0 && update > 0 && update % unroll == 0 && (workload.shape.sp % update) % unroll == 0;
    if !legal {
        if workload.update_sp_unroll.is_pinned() {
            return Err(PlanError::InvalidPin {
                field: "unroll",
                reason: format!(
                    "{unroll} does not divide update block {update} and its tail for sp={}",
                    workload.shape.sp
                ),
            });
        }
        warn!(unroll, update_sp_block = update, "illegal unroll factor, falling back to 1");
        diagnostics.push(format!(
            "unroll {unroll} is illegal for update_sp_block={update}; reset to 1"
        ));
        workload.update_sp_unroll.set_if_free(1);
    }
    Ok(diagnostics)
}

/// Picks the candidate with the lowest predicted latency.
pub struct ConfigurationSelector<'a> {
    hw: &'a HardwareProfile,
    model: &'a dyn CostModel,
    executor: &'a dyn KernelExecutor,
}

impl<'a> ConfigurationSelector<'a> {
    pub fn new(
        hw: &'a HardwareProfile,
        model: &'a dyn CostModel,
        executor: &'a dyn KernelExecutor,
    ) -> Self {
        Self {
            hw,
            model,
            executor,
        }
    }

    /// Estimate one candidate. `None` when any of its kernels cannot be
    /// launched on this device.
    pub fn evaluate(
        &self,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
    ) -> Result<Option<CandidateEstimate>> {
        let mut kernels = decompose(shape, candidate);
        let mut total_ns = 0.0f32;
        for kernel in &mut kernels {
            let geometry = self
                .executor
                .launch_geometry(kernel.kind, shape, candidate, self.hw);
            let Some(occupancy) = geometry.occupancy(self.hw, shape.sub_group_size) else {
                debug!(%candidate, kernel = %kernel.kind, ?geometry, "zero local size, candidate excluded");
                return Ok(None);
            };
            place_operands(shape, self.hw, kernel);
            let time_ns = self
                .model
                .estimate(self.hw, shape, candidate, kernel, &occupancy)?;
            kernel.occupancy = Some(occupancy);
            kernel.time_ns = Some(time_ns);
            total_ns += kernel.ncalls as f32 * (time_ns + self.hw.launch_overhead_ns);
            debug!(
                kernel = %kernel.kind,
                ncalls = kernel.ncalls,
                input_bytes = kernel.input_bytes,
                output_bytes = kernel.output_bytes,
                thr_util = occupancy.thread_util,
                ss_util = occupancy.slice_util,
                time_ns,
                "kernel estimate"
            );
        }
        let mut candidate = *candidate;
        candidate.record_time(total_ns);
        debug!(%candidate, total_ns, "candidate estimate");
        Ok(Some(CandidateEstimate {
            candidate,
            kernels,
            total_ns,
        }))
    }

    /// Arg-min over `candidates`; ties go to the earlier candidate.
    pub fn select(
        &self,
        workload: &WorkloadDescriptor,
        candidates: &[CandidateConfiguration],
    ) -> Result<CandidateEstimate> {
        let shape = &workload.shape;
        let estimates = candidates
            .par_iter()
            .map(|c| self.evaluate(shape, c))
            .collect::<Result<Vec<_>>>()?;

        estimates
            .into_iter()
            .flatten()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| a.total_ns.total_cmp(&b.total_ns).then(ia.cmp(ib)))
            .map(|(_, best)| best)
            .ok_or_else(|| PlanError::EmptySearchSpace {
                workload: workload.to_string(),
            })
    }

    /// Full model-mode planning: generate, estimate, select, write back.
    pub fn plan(&self, workload: &WorkloadDescriptor) -> Result<Plan> {
        let candidates = generate_candidates(workload, self.hw)?;
        let best = self.select(workload, &candidates)?;

        let mut planned = workload.clone();
        let diagnostics = apply_candidate(&mut planned, &best.candidate)?;
        planned.expected_time_ms = Some(best.total_ns * 1e-6);

        info!(
            workload = %planned,
            candidate = %best.candidate,
            expected_ns = best.total_ns,
            model = self.model.name(),
            "selected configuration"
        );
        Ok(Plan {
            workload: planned,
            candidate: best.candidate,
            kernels: best.kernels,
            expected_time_ns: best.total_ns,
            source: PlanSource::Model,
            model: self.model.name().to_string(),
            hw_fingerprint: self.hw.fingerprint(),
            diagnostics,
        })
    }
}
