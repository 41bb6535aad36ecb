//! Planner driver modes and their reports.

use crate::session::PlannerSession;
use anyhow::{bail, Result};
use kernelplan_kernels::WorkloadDescriptor;
use kernelplan_optimizer::Plan;
use serde_json::json;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlannerMode {
    /// Plan from the registry or the cost model; no measurement.
    #[default]
    Trace,
    /// Plan, then measure the planned configuration.
    Bench,
    /// Measure every configuration of one workload.
    Search,
    /// Rebuild the registry for the current device.
    AutoSearch,
}

impl PlannerMode {
    pub fn needs_descriptor(&self) -> bool {
        !matches!(self, PlannerMode::AutoSearch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn render_plan(plan: &Plan, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text => plan.to_string(),
        OutputFormat::Json => plan.to_json()?,
    })
}

/// Run one mode and render its report.
pub fn run_mode(
    session: &PlannerSession,
    mode: PlannerMode,
    workload: Option<&WorkloadDescriptor>,
    format: OutputFormat,
) -> Result<String> {
    let mut out = String::new();
    if mode == PlannerMode::AutoSearch {
        let report = session.rebuild()?;
        if format == OutputFormat::Json {
            let skipped: Vec<_> = report
                .skipped
                .iter()
                .map(|(key, reason)| json!({ "shape": key, "reason": reason }))
                .collect();
            return Ok(serde_json::to_string_pretty(&json!({
                "hw_fingerprint": session.hardware().fingerprint(),
                "rebuilt": report.rebuilt,
                "skipped": skipped,
                "interrupted": report.interrupted,
            }))?);
        }
        writeln!(out, "Rebuild: {}", session.hardware().fingerprint())?;
        writeln!(out, "  rebuilt: {}", report.rebuilt.len())?;
        for key in &report.rebuilt {
            writeln!(out, "    {key}")?;
        }
        writeln!(out, "  skipped: {}", report.skipped.len())?;
        for (key, reason) in &report.skipped {
            writeln!(out, "    {key}: {reason}")?;
        }
        if report.interrupted {
            writeln!(out, "  interrupted: budget exhausted")?;
        }
        return Ok(out);
    }

    let Some(w) = workload else {
        bail!("a kernel descriptor is required in {mode:?} mode");
    };
    match mode {
        PlannerMode::Trace => out.push_str(&render_plan(&session.plan(w)?, format)?),
        PlannerMode::Bench => out.push_str(&render_plan(&session.benchmark(w)?, format)?),
        PlannerMode::Search => {
            let outcome = session.search(w)?;
            let plan = session.plan(w)?;
            if format == OutputFormat::Json {
                return Ok(serde_json::to_string_pretty(&json!({
                    "evaluated": outcome.evaluated,
                    "improved": outcome.improved,
                    "interrupted": outcome.interrupted,
                    "best_time_ns": outcome.best.time_ns,
                    "plan": plan,
                }))?);
            }
            writeln!(out, "Search: {w}")?;
            writeln!(
                out,
                "  evaluated: {}{}",
                outcome.evaluated,
                if outcome.interrupted { " (budget exhausted)" } else { "" }
            )?;
            writeln!(out, "  best: {} {:.1} ns", outcome.best.candidate, outcome.best.time_ns)?;
            writeln!(
                out,
                "  registry: {}",
                if outcome.improved { "updated" } else { "unchanged" }
            )?;
            write!(out, "{plan}")?;
        }
        PlannerMode::AutoSearch => {}
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::descriptor::parse_descriptor;
    use kernelplan_backend::PresetDevice;
    use kernelplan_optimizer::PlanSource;

    fn session() -> PlannerSession {
        let config = PlannerConfig {
            warmup_runs: 0,
            runs: 1,
            unroll_factors: vec![1],
            ..PlannerConfig::default()
        };
        PlannerSession::new(config, &PresetDevice::XeHpg).unwrap()
    }

    #[test]
    fn trace_requires_descriptor() {
        assert!(run_mode(&session(), PlannerMode::Trace, None, OutputFormat::Text).is_err());
    }

    #[test]
    fn trace_renders_plan() {
        let w = parse_descriptor(&["dt=f16", "sp=12544", "ic=128", "update_sp_block=49"]).unwrap();
        let text = run_mode(&session(), PlannerMode::Trace, Some(&w), OutputFormat::Text).unwrap();
        assert!(text.starts_with("Plan: fwd:opt:f16:sp12544:ic128"));
        assert!(text.contains("update_sp_block=49"));
        assert!(text.contains("Reqs: update_sp_block=49"));
    }

    #[test]
    fn trace_renders_json_plan() {
        let w = parse_descriptor(&["sp=3136", "ic=64", "ic_block=32"]).unwrap();
        let text = run_mode(&session(), PlannerMode::Trace, Some(&w), OutputFormat::Json).unwrap();
        let plan: Plan = serde_json::from_str(&text).unwrap();
        assert_eq!(plan.source, PlanSource::Model);
        assert_eq!(plan.workload.ic_block.pin_value(), Some(32));
        assert!(!plan.kernels.is_empty());
    }

    #[test]
    fn search_reports_and_replans_from_registry() {
        let w = parse_descriptor(&["sp=4096", "ic=64"]).unwrap();
        let text = run_mode(&session(), PlannerMode::Search, Some(&w), OutputFormat::Text).unwrap();
        assert!(text.contains("registry: updated"));
        assert!(text.contains("source: registry"));
    }
}
