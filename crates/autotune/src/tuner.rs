//! Live measurement: single benchmark, incremental search and rebuild.

use crate::cache::{PlanRegistry, PlanRegistryEntry};
use kernelplan_kernels::{
    decompose, CandidateConfiguration, DataType, HardwareProfile, KernelExecutor, KernelKind,
    PlanError, Result, ShapeClass, WorkloadDescriptor,
};
use kernelplan_optimizer::{generate_candidates, with_unroll_variants};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Unroll factors tried by the search when the caller left unroll free.
pub const DEFAULT_UNROLL_FACTORS: [u64; 4] = [1, 2, 4, 8];

/// One mutex per physical device. Measurements holding the same device's
/// lock never overlap.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(device_id.to_string()).or_default())
    }
}

/// Measured time of one configuration.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub candidate: CandidateConfiguration,
    /// Average wall time of the whole kernel sequence, in nanoseconds.
    pub time_ns: f32,
    pub kernels: Vec<(KernelKind, f32)>,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: Measurement,
    pub evaluated: usize,
    /// Registry entry was created or replaced.
    pub improved: bool,
    /// The wall-clock budget ran out before every candidate was measured.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub rebuilt: Vec<String>,
    pub skipped: Vec<(String, String)>,
    pub interrupted: bool,
}

/// Shape classes rebuilt even when the registry has nothing for the device.
pub fn default_corpus() -> Vec<ShapeClass> {
    let mut corpus = Vec::new();
    for (sp, ic) in [(56 * 56 * 4, 64u64), (28 * 28 * 4, 256), (7 * 7 * 16, 1024)] {
        for dtype in [DataType::F32, DataType::BF16] {
            corpus.push(ShapeClass::forward(sp, ic, dtype));
        }
        corpus.push(ShapeClass::backward(sp, ic, DataType::F32));
    }
    corpus
}

pub struct Autotuner<'a> {
    hw: &'a HardwareProfile,
    executor: &'a dyn KernelExecutor,
    registry: &'a PlanRegistry,
    locks: Arc<DeviceLocks>,
    runs: usize,
    warmup_runs: usize,
    budget: Option<Duration>,
    unroll_factors: Vec<u64>,
}

impl<'a> Autotuner<'a> {
    pub fn new(
        hw: &'a HardwareProfile,
        executor: &'a dyn KernelExecutor,
        registry: &'a PlanRegistry,
    ) -> Self {
        Self {
            hw,
            executor,
            registry,
            locks: Arc::new(DeviceLocks::new()),
            runs: 5,
            warmup_runs: 1,
            budget: None,
            unroll_factors: DEFAULT_UNROLL_FACTORS.to_vec(),
        }
    }

    pub fn with_runs(mut self, warmup_runs: usize, runs: usize) -> Self {
        self.warmup_runs = warmup_runs;
        self.runs = runs.max(1);
        self
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_unroll_factors(mut self, factors: Vec<u64>) -> Self {
        self.unroll_factors = factors;
        self
    }

    /// Share measurement locks with other tuners driving the same devices.
    pub fn with_device_locks(mut self, locks: Arc<DeviceLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn registry(&self) -> &PlanRegistry {
        self.registry
    }

    fn deadline(&self) -> Option<Instant> {
        self.budget.map(|b| Instant::now() + b)
    }

    fn lock_device(handle: &Mutex<()>) -> MutexGuard<'_, ()> {
        handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Measure one configuration with warmup and averaged runs.
    pub fn benchmark(
        &self,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
    ) -> Result<Measurement> {
        let kernels = decompose(shape, candidate);
        let mut launches = Vec::with_capacity(kernels.len());
        for kernel in kernels {
            let geometry = self
                .executor
                .launch_geometry(kernel.kind, shape, candidate, self.hw);
            if !geometry.is_launchable() {
                return Err(PlanError::Measurement(format!(
                    "{} cannot be launched with {candidate}",
                    kernel.kind
                )));
            }
            launches.push((kernel, geometry));
        }

        let handle = self.locks.handle(self.executor.device_id());
        let _guard = Self::lock_device(&handle);

        for _ in 0..self.warmup_runs {
            for (kernel, geometry) in &launches {
                for _ in 0..kernel.ncalls {
                    self.executor.execute(kernel, geometry, shape, candidate)?;
                }
            }
        }

        let mut per_kernel = vec![Duration::ZERO; launches.len()];
        for _ in 0..self.runs {
            for ((kernel, geometry), total) in launches.iter().zip(per_kernel.iter_mut()) {
                for _ in 0..kernel.ncalls {
                    *total += self.executor.execute(kernel, geometry, shape, candidate)?;
                }
            }
        }

        let runs = self.runs as f64;
        let kernels: Vec<(KernelKind, f32)> = launches
            .iter()
            .zip(&per_kernel)
            .map(|((k, _), d)| (k.kind, (d.as_nanos() as f64 / runs) as f32))
            .collect();
        let time_ns = kernels.iter().map(|(_, t)| t).sum();
        let mut candidate = *candidate;
        candidate.record_time(time_ns);
        debug!(%candidate, time_ns, "measured candidate");
        Ok(Measurement {
            candidate,
            time_ns,
            kernels,
        })
    }

    /// Measure every candidate for `workload` and keep the fastest in the
    /// registry when it beats the existing entry.
    pub fn search(&self, workload: &WorkloadDescriptor) -> Result<SearchOutcome> {
        self.search_until(workload, self.deadline(), false)
    }

    fn search_until(
        &self,
        workload: &WorkloadDescriptor,
        deadline: Option<Instant>,
        replace: bool,
    ) -> Result<SearchOutcome> {
        let base = generate_candidates(workload, self.hw)?;
        let candidates = with_unroll_variants(workload, base, &self.unroll_factors)?;

        let mut best: Option<Measurement> = None;
        let mut evaluated = 0;
        let mut interrupted = false;
        for candidate in &candidates {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                interrupted = true;
                break;
            }
            let m = match self.benchmark(&workload.shape, candidate) {
                Ok(m) => m,
                Err(PlanError::Measurement(reason)) => {
                    debug!(%candidate, %reason, "candidate skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            evaluated += 1;
            if best.as_ref().map_or(true, |b| m.time_ns < b.time_ns) {
                best = Some(m);
            }
        }

        let best = best.ok_or_else(|| PlanError::EmptySearchSpace {
            workload: workload.to_string(),
        })?;
        let entry = PlanRegistryEntry::new(
            workload.shape,
            self.hw.fingerprint(),
            best.candidate,
            best.time_ns,
            true,
        );
        // A partial search only replaces an entry it actually beats.
        let improved = if replace && !interrupted {
            self.registry.upsert(entry);
            true
        } else {
            self.registry.upsert_if_better(entry)
        };
        if improved {
            self.registry.save()?;
        }
        info!(
            workload = %workload,
            candidate = %best.candidate,
            time_ns = best.time_ns,
            evaluated,
            improved,
            interrupted,
            "search finished"
        );
        Ok(SearchOutcome {
            best,
            evaluated,
            improved,
            interrupted,
        })
    }

    /// Re-search every shape registered for this device plus `corpus`,
    /// replacing entries one at a time. Entries for other devices are left
    /// alone. An interrupted rebuild leaves unvisited entries unchanged, and
    /// the shape it was measuring when the budget ran out keeps its entry
    /// unless the partial result is faster.
    pub fn rebuild(&self, corpus: &[ShapeClass]) -> Result<RebuildReport> {
        let fingerprint = self.hw.fingerprint();
        let mut shapes: BTreeMap<String, ShapeClass> = self
            .registry
            .entries_for(&fingerprint)
            .into_iter()
            .map(|e| (e.shape.key(), e.shape))
            .collect();
        for shape in corpus {
            shapes.entry(shape.key()).or_insert(*shape);
        }

        let deadline = self.deadline();
        let mut report = RebuildReport::default();
        for (key, shape) in shapes {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.interrupted = true;
                break;
            }
            match self.search_until(&WorkloadDescriptor::new(shape), deadline, true) {
                Ok(outcome) => {
                    report.interrupted |= outcome.interrupted;
                    if outcome.improved || !outcome.interrupted {
                        report.rebuilt.push(key);
                    }
                }
                Err(e @ (PlanError::Io(_) | PlanError::Serialization(_))) => return Err(e),
                Err(e) => {
                    warn!(shape = %key, error = %e, "shape skipped during rebuild");
                    report.skipped.push((key, e.to_string()));
                }
            }
        }
        info!(
            rebuilt = report.rebuilt.len(),
            skipped = report.skipped.len(),
            interrupted = report.interrupted,
            "registry rebuild finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelplan_kernels::{DeviceInfo, GpuArch, KernelDescriptor, LaunchGeometry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hw() -> HardwareProfile {
        HardwareProfile::new(DeviceInfo {
            name: "test".into(),
            arch: GpuArch::XeHpg,
            eu_count: 512,
            threads_per_eu: 8,
            max_wg_size: 1024,
            eus_per_subslice: 16,
        })
        .unwrap()
    }

    /// Time falls with smaller channel blocks and larger unroll factors.
    #[derive(Default)]
    struct FakeExecutor {
        calls: AtomicUsize,
        reject_ic_block: Option<u64>,
        delay: Duration,
    }

    impl KernelExecutor for FakeExecutor {
        fn device_id(&self) -> &str {
            "fake-0"
        }

        fn launch_geometry(
            &self,
            _kind: KernelKind,
            shape: &ShapeClass,
            candidate: &CandidateConfiguration,
            _hw: &HardwareProfile,
        ) -> LaunchGeometry {
            let local = if Some(candidate.ic_block()) == self.reject_ic_block {
                0
            } else {
                16
            };
            LaunchGeometry::new([shape.ic, 1, 1], [local, 1, 1])
        }

        fn execute(
            &self,
            _kernel: &KernelDescriptor,
            _geometry: &LaunchGeometry,
            _shape: &ShapeClass,
            candidate: &CandidateConfiguration,
        ) -> Result<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(Duration::from_nanos(candidate.ic_block() * 1000 / candidate.unroll()))
        }
    }

    fn workload() -> WorkloadDescriptor {
        let mut w = WorkloadDescriptor::new(ShapeClass::forward(4096, 64, DataType::F32));
        w.stat_sp_block.pin(64);
        w
    }

    #[test]
    fn benchmark_runs_warmup_and_measured_iterations() {
        let hw = hw();
        let exec = FakeExecutor::default();
        let registry = PlanRegistry::in_memory();
        let tuner = Autotuner::new(&hw, &exec, &registry).with_runs(2, 3);
        let w = workload();
        let c = generate_candidates(&w, &hw).unwrap()[0];
        let m = tuner.benchmark(&w.shape, &c).unwrap();
        // default_fwd + calc_mean_var + reduce_mean_var, one call each
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3 * (2 + 3));
        assert_eq!(m.kernels.len(), 3);
        assert!((m.time_ns - 3.0 * 16_000.0).abs() < 1.0);
    }

    #[test]
    fn search_picks_fastest_and_records_it() {
        let hw = hw();
        let exec = FakeExecutor::default();
        let registry = PlanRegistry::in_memory();
        let tuner = Autotuner::new(&hw, &exec, &registry).with_runs(0, 1);
        let outcome = tuner.search(&workload()).unwrap();
        assert!(outcome.improved);
        assert_eq!(outcome.best.candidate.ic_block(), 16);
        assert_eq!(outcome.best.candidate.unroll(), 8);
        // 3 channel blocks x 4 unroll factors
        assert_eq!(outcome.evaluated, 12);

        let entry = registry.lookup(&workload().shape, &hw.fingerprint()).unwrap();
        assert_eq!(entry.candidate, outcome.best.candidate);
        assert!(entry.measured);

        // same result again does not count as an improvement
        assert!(!tuner.search(&workload()).unwrap().improved);
    }

    #[test]
    fn unlaunchable_candidates_are_skipped() {
        let hw = hw();
        let exec = FakeExecutor {
            reject_ic_block: Some(16),
            ..Default::default()
        };
        let registry = PlanRegistry::in_memory();
        let tuner = Autotuner::new(&hw, &exec, &registry).with_runs(0, 1);
        let outcome = tuner.search(&workload()).unwrap();
        assert_eq!(outcome.best.candidate.ic_block(), 32);
        assert_eq!(outcome.evaluated, 8);
    }

    #[test]
    fn exhausted_budget_interrupts_rebuild_without_touching_entries() {
        let hw = hw();
        let exec = FakeExecutor::default();
        let registry = PlanRegistry::in_memory();
        let stale = PlanRegistryEntry::new(
            ShapeClass::forward(1024, 32, DataType::F32),
            hw.fingerprint(),
            generate_candidates(&WorkloadDescriptor::new(ShapeClass::forward(1024, 32, DataType::F32)), &hw)
                .unwrap()[0],
            123.0,
            false,
        );
        registry.upsert(stale.clone());
        let tuner = Autotuner::new(&hw, &exec, &registry).with_budget(Some(Duration::ZERO));
        let report = tuner.rebuild(&default_corpus()).unwrap();
        assert!(report.interrupted);
        assert!(report.rebuilt.is_empty());
        assert_eq!(registry.lookup(&stale.shape, &hw.fingerprint()), Some(stale));
    }

    #[test]
    fn budget_running_out_mid_search_keeps_faster_entry() {
        let hw = hw();
        let exec = FakeExecutor {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let registry = PlanRegistry::in_memory();
        let shape = ShapeClass::forward(4096, 64, DataType::F32);
        let candidate = generate_candidates(&WorkloadDescriptor::new(shape), &hw).unwrap()[0];
        let good = PlanRegistryEntry::new(shape, hw.fingerprint(), candidate, 1.0, true);
        registry.upsert(good.clone());

        let tuner = Autotuner::new(&hw, &exec, &registry)
            .with_runs(0, 1)
            .with_unroll_factors(vec![1])
            .with_budget(Some(Duration::from_millis(30)));
        let report = tuner.rebuild(&[]).unwrap();
        assert!(report.interrupted);
        assert!(report.rebuilt.is_empty());
        assert_eq!(registry.lookup(&shape, &hw.fingerprint()), Some(good));
    }

    #[test]
    fn rebuild_refreshes_device_entries_and_keeps_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let hw = hw();
        let exec = FakeExecutor::default();
        let registry = PlanRegistry::open(&path).unwrap();

        let shape = ShapeClass::forward(2048, 32, DataType::F32);
        let candidate =
            generate_candidates(&WorkloadDescriptor::new(shape), &hw).unwrap()[0];
        registry.upsert(PlanRegistryEntry::new(shape, hw.fingerprint(), candidate, 1.0, false));
        let foreign = PlanRegistryEntry::new(shape, "other-device", candidate, 5.0, true);
        registry.upsert(foreign.clone());

        let tuner = Autotuner::new(&hw, &exec, &registry)
            .with_runs(0, 1)
            .with_unroll_factors(vec![1]);
        let corpus = [ShapeClass::backward(1024, 64, DataType::F32)];
        let report = tuner.rebuild(&corpus).unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.rebuilt.len(), 2);

        let refreshed = registry.lookup(&shape, &hw.fingerprint()).unwrap();
        assert!(refreshed.measured);
        assert!(registry.lookup(&corpus[0], &hw.fingerprint()).is_some());
        assert_eq!(registry.lookup(&shape, "other-device"), Some(foreign));

        let reopened = PlanRegistry::open(&path).unwrap();
        assert_eq!(reopened.len(), 3);
    }

    #[test]
    fn measurements_on_one_device_do_not_overlap() {
        struct Exclusive {
            active: AtomicUsize,
            overlapped: AtomicUsize,
        }
        impl KernelExecutor for Exclusive {
            fn device_id(&self) -> &str {
                "shared"
            }
            fn launch_geometry(
                &self,
                _kind: KernelKind,
                _shape: &ShapeClass,
                _candidate: &CandidateConfiguration,
                _hw: &HardwareProfile,
            ) -> LaunchGeometry {
                LaunchGeometry::new([64, 1, 1], [16, 1, 1])
            }
            fn execute(
                &self,
                _kernel: &KernelDescriptor,
                _geometry: &LaunchGeometry,
                _shape: &ShapeClass,
                _candidate: &CandidateConfiguration,
            ) -> Result<Duration> {
                if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                    self.overlapped.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_micros(200));
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(Duration::from_micros(1))
            }
        }

        let hw = hw();
        let exec = Exclusive {
            active: AtomicUsize::new(0),
            overlapped: AtomicUsize::new(0),
        };
        let registry = PlanRegistry::in_memory();
        let locks = Arc::new(DeviceLocks::new());
        let w = workload();
        let c = generate_candidates(&w, &hw).unwrap()[0];
        std::thread::scope(|s| {
            for _ in 0..4 {
                let locks = Arc::clone(&locks);
                let (hw, exec, registry, w) = (&hw, &exec, &registry, &w);
                s.spawn(move || {
                    let tuner = Autotuner::new(hw, exec, registry)
                        .with_runs(1, 2)
                        .with_device_locks(locks);
                    tuner.benchmark(&w.shape, &c).unwrap();
                });
            }
        });
        assert_eq!(exec.overlapped.load(Ordering::SeqCst), 0);
    }
}
