//! Planner session orchestration.

use crate::config::PlannerConfig;
use anyhow::{anyhow, Context, Result};
use kernelplan_autotune::{
    default_corpus, Autotuner, DeviceLocks, PlanRegistry, PlanRegistryEntry, RebuildReport,
    SearchOutcome,
};
use kernelplan_backend::ReferenceExecutor;
use kernelplan_kernels::{
    decompose, CandidateBuilder, CandidateConfiguration, DeviceQuery, HardwareProfile,
    KernelExecutor, ReductionStrategy, WorkloadDescriptor,
};
use kernelplan_optimizer::{
    apply_candidate, cost_model_by_name, ApproxTable, ConfigurationSelector, CostModel, Plan,
    PlanSource,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything one planning context needs: hardware, cost model, executor
/// and registry. Nothing is process-global.
pub struct PlannerSession {
    config: PlannerConfig,
    hw: HardwareProfile,
    registry: PlanRegistry,
    registry_error: Option<String>,
    model: Arc<dyn CostModel>,
    executor: Arc<dyn KernelExecutor>,
    locks: Arc<DeviceLocks>,
}

impl PlannerSession {
    pub fn new(config: PlannerConfig, device: &dyn DeviceQuery) -> Result<Self> {
        let hw = HardwareProfile::from_query(device).context("failed to build hardware profile")?;

        let table = match &config.table_path {
            Some(path) => Arc::new(
                ApproxTable::from_path(path)
                    .with_context(|| format!("failed to load table {}", path.display()))?,
            ),
            None => ApproxTable::builtin(),
        };
        let model = cost_model_by_name(&config.model, table)?;

        let (registry, registry_error) = match &config.registry_path {
            Some(path) => match PlanRegistry::open(path) {
                Ok(registry) => (registry, None),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "plan registry unavailable, planning from the model only");
                    (PlanRegistry::in_memory(), Some(e.to_string()))
                }
            },
            None => (PlanRegistry::in_memory(), None),
        };

        info!(
            device = %hw.device_name,
            fingerprint = %hw.fingerprint(),
            model = model.name(),
            registry = ?config.registry_path,
            "planner session ready"
        );
        Ok(Self {
            config,
            hw,
            registry,
            registry_error,
            model,
            executor: Arc::new(ReferenceExecutor::default()),
            locks: Arc::new(DeviceLocks::new()),
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn KernelExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Share measurement locks with other sessions on the same devices.
    pub fn with_device_locks(mut self, locks: Arc<DeviceLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn hardware(&self) -> &HardwareProfile {
        &self.hw
    }

    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }

    pub fn model(&self) -> &dyn CostModel {
        self.model.as_ref()
    }

    /// Trace mode: registry first, then the cost model. Never writes the
    /// registry.
    pub fn plan(&self, workload: &WorkloadDescriptor) -> Result<Plan> {
        workload.validate()?;
        if let Some(plan) = self.plan_from_registry(workload) {
            return Ok(plan);
        }
        let selector =
            ConfigurationSelector::new(&self.hw, self.model.as_ref(), self.executor.as_ref());
        Ok(selector.plan(workload)?)
    }

    fn plan_from_registry(&self, workload: &WorkloadDescriptor) -> Option<Plan> {
        let fingerprint = self.hw.fingerprint();
        let entry = self.registry.lookup(&workload.shape, &fingerprint)?;
        if let Err(e) = CandidateBuilder::from(entry.candidate).build() {
            warn!(workload = %workload, error = %e, "invalid registry entry, planning from the model");
            return None;
        }
        if !agrees_with_pins(workload, &entry.candidate) {
            info!(workload = %workload, "registry entry conflicts with pinned fields, ignored");
            return None;
        }
        let mut planned = workload.clone();
        let diagnostics = match apply_candidate(&mut planned, &entry.candidate) {
            Ok(d) => d,
            Err(e) => {
                warn!(workload = %workload, error = %e, "registry entry not applicable");
                return None;
            }
        };
        planned.expected_time_ms = Some(entry.time_ns * 1e-6);
        info!(workload = %planned, candidate = %entry.candidate, "plan taken from registry");
        Some(Plan {
            workload: planned,
            candidate: entry.candidate,
            kernels: Vec::new(),
            expected_time_ns: entry.time_ns,
            source: PlanSource::Registry,
            model: if entry.measured {
                "measured".into()
            } else {
                self.model.name().to_string()
            },
            hw_fingerprint: fingerprint,
            diagnostics,
        })
    }

    /// Plan, then measure the planned configuration once and record it when
    /// it beats the registry.
    pub fn benchmark(&self, workload: &WorkloadDescriptor) -> Result<Plan> {
        self.ensure_registry_writable()?;
        let mut plan = self.plan(workload)?;
        let candidate = candidate_of(&plan.workload)?;

        let tuner = self.tuner();
        let measurement = tuner.benchmark(&workload.shape, &candidate)?;

        let mut kernels = decompose(&workload.shape, &candidate);
        for (kernel, (_, time_ns)) in kernels.iter_mut().zip(&measurement.kernels) {
            kernel.time_ns = Some(*time_ns);
        }
        let entry = PlanRegistryEntry::new(
            workload.shape,
            self.hw.fingerprint(),
            measurement.candidate,
            measurement.time_ns,
            true,
        );
        if self.registry.upsert_if_better(entry) {
            self.registry.save()?;
        }

        plan.candidate = measurement.candidate;
        plan.kernels = kernels;
        plan.expected_time_ns = measurement.time_ns;
        plan.workload.expected_time_ms = Some(measurement.time_ns * 1e-6);
        plan.source = PlanSource::Measured;
        plan.model = self.executor.device_id().to_string();
        Ok(plan)
    }

    /// Incremental search over every unpinned field.
    pub fn search(&self, workload: &WorkloadDescriptor) -> Result<SearchOutcome> {
        self.ensure_registry_writable()?;
        workload.validate()?;
        Ok(self.tuner().search(workload)?)
    }

    /// Rebuild every entry of this device plus the default corpus.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        self.ensure_registry_writable()?;
        Ok(self.tuner().rebuild(&default_corpus())?)
    }

    fn ensure_registry_writable(&self) -> Result<()> {
        match &self.registry_error {
            Some(e) => Err(anyhow!("plan registry cannot be used for tuning: {e}")),
            None => Ok(()),
        }
    }

    fn tuner(&self) -> Autotuner<'_> {
        Autotuner::new(&self.hw, self.executor.as_ref(), &self.registry)
            .with_runs(self.config.warmup_runs, self.config.runs)
            .with_budget(self.config.budget)
            .with_unroll_factors(self.config.unroll_factors.clone())
            .with_device_locks(Arc::clone(&self.locks))
    }
}

/// A stored configuration is usable only if it matches every pinned field.
fn agrees_with_pins(workload: &WorkloadDescriptor, c: &CandidateConfiguration) -> bool {
    let agrees = |pin: Option<u64>, value: u64| pin.map_or(true, |p| p == value);
    workload
        .use_fused_atomics_reduction
        .pin_value()
        .map_or(true, |p| p == c.use_atomics())
        && agrees(workload.ic_block.pin_value(), c.ic_block())
        && agrees(workload.stat_sp_block.pin_value(), c.stat_sp_block())
        && agrees(workload.update_sp_block.pin_value(), c.update_sp_block())
        && agrees(workload.update_sp_unroll.pin_value(), c.unroll())
}

fn candidate_of(workload: &WorkloadDescriptor) -> Result<CandidateConfiguration> {
    let candidate = CandidateBuilder::new(
        ReductionStrategy::from_atomics(workload.use_fused_atomics_reduction.get()),
        workload.ic_block.get(),
    )
    .stat_sp_block(workload.stat_sp_block.get())
    .update_sp_block(workload.update_sp_block.get())
    .vect_size(workload.vect_size)
    .unroll(workload.update_sp_unroll.get())
    .build()?;
    Ok(candidate)
}
