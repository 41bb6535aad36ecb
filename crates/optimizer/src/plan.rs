//! Planning result: the filled-in workload plus how it was obtained.

use kernelplan_kernels::{CandidateConfiguration, KernelDescriptor, WorkloadDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the chosen configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Model,
    Registry,
    Measured,
}

impl fmt::Display for PlanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanSource::Model => "model",
            PlanSource::Registry => "registry",
            PlanSource::Measured => "measured",
        })
    }
}

/// Complete plan for one workload on one device.
///
/// `workload` has every unpinned tunable filled; pinned tunables are the
/// caller's values, untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub workload: WorkloadDescriptor,
    pub candidate: CandidateConfiguration,
    /// Per-kernel breakdown; empty for registry hits.
    pub kernels: Vec<KernelDescriptor>,
    pub expected_time_ns: f32,
    pub source: PlanSource,
    /// Cost model that produced the estimate.
    pub model: String,
    pub hw_fingerprint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl Plan {
    pub fn expected_time_ms(&self) -> f32 {
        self.expected_time_ns * 1e-6
    }

    pub fn from_registry(&self) -> bool {
        self.source == PlanSource::Registry
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let w = &self.workload;
        writeln!(f, "Plan: {}", w)?;
        writeln!(f, "  device: {}", self.hw_fingerprint)?;
        writeln!(
            f,
            "  atomics={} ic_block={} stat_sp_block={} update_sp_block={} unroll={} vect={} calc_stat_ic={}",
            w.use_fused_atomics_reduction.get() as u8,
            w.ic_block.get(),
            w.stat_sp_block.get(),
            w.update_sp_block.get(),
            w.update_sp_unroll.get(),
            w.vect_size,
            w.calc_stat_ic
        )?;
        writeln!(
            f,
            "  expected: {:.4} ms ({:.1} ns), source: {} ({})",
            self.expected_time_ms(),
            self.expected_time_ns,
            self.source,
            self.model
        )?;

        let pinned = w.pinned_fields();
        if pinned.is_empty() {
            writeln!(f, "Reqs: none")?;
        } else {
            let reqs: Vec<String> = pinned.iter().map(|(k, v)| format!("{k}={v}")).collect();
            writeln!(f, "Reqs: {}", reqs.join(" "))?;
        }

        if !self.kernels.is_empty() {
            writeln!(f, "Model:")?;
            for k in &self.kernels {
                write!(
                    f,
                    "  {:<26} x{} in={}B ({}) out={}B ({})",
                    k.kind.name(),
                    k.ncalls,
                    k.input_bytes,
                    k.input_tier,
                    k.output_bytes,
                    k.output_tier
                )?;
                if let Some(occ) = &k.occupancy {
                    write!(
                        f,
                        " wgs={} ss_util={:.3} thr_util={:.3}",
                        occ.work_groups, occ.slice_util, occ.thread_util
                    )?;
                }
                match k.time_ns {
                    Some(t) => writeln!(f, " {:.1} ns", t)?,
                    None => writeln!(f)?,
                }
            }
        }
        for d in &self.diagnostics {
            writeln!(f, "  note: {d}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelplan_kernels::{CandidateBuilder, DataType, ReductionStrategy, ShapeClass};

    fn plan() -> Plan {
        let mut workload = WorkloadDescriptor::new(ShapeClass::forward(1024, 64, DataType::F32));
        workload.ic_block.pin(32);
        let candidate = CandidateBuilder::new(ReductionStrategy::TwoPass, 32)
            .stat_sp_block(16)
            .vect_size(2)
            .build()
            .unwrap();
        Plan {
            workload,
            candidate,
            kernels: Vec::new(),
            expected_time_ns: 25_000.0,
            source: PlanSource::Registry,
            model: "analytical".into(),
            hw_fingerprint: "xe_hpc-eu448-t8-wg1024".into(),
            diagnostics: vec!["unroll reset".into()],
        }
    }

    #[test]
    fn text_lists_requirements_and_source() {
        let text = plan().to_string();
        assert!(text.contains("Reqs: ic_block=32"));
        assert!(text.contains("source: registry"));
        assert!(text.contains("0.0250 ms"));
        assert!(text.contains("note: unroll reset"));
    }

    #[test]
    fn json_round_trip_keeps_source() {
        let p = plan();
        let back: Plan = serde_json::from_str(&p.to_json().unwrap()).unwrap();
        assert!(back.from_registry());
        assert_eq!(back.workload, p.workload);
    }
}
