//! Performance-model-driven configuration selection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │  Generator      │────▶│  Cost model      │────▶│  Selector       │
//! │  (candidates)   │     │  (per kernel)    │     │  (arg-min)      │
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`generator::generate_candidates`]: search space under hardware and pin constraints
//! - [`approx::ApproxTable`]: calibrated thread-utilization curves, loaded as data
//! - [`estimator::Estimator`]: memory-tier placement and per-kernel latency
//! - [`optimizer::CostModel`]: pluggable latency model (`analytical`, `bandwidth`)
//! - [`optimizer::ConfigurationSelector`]: picks the fastest candidate and writes it back
//! - [`plan::Plan`]: the filled workload plus its breakdown

pub mod approx;
pub mod estimator;
pub mod generator;
pub mod optimizer;
pub mod plan;

pub use approx::{ApproxEntry, ApproxKey, ApproxTable, Curve, MemOp};
pub use estimator::{Estimator, KernelTime};
pub use generator::{generate_candidates, spatial_block_size, vector_width, with_unroll_variants};
pub use optimizer::{
    apply_candidate, cost_model_by_name, AnalyticalModel, BandwidthModel, CandidateEstimate,
    ConfigurationSelector, CostModel, COST_MODELS,
};
pub use plan::{Plan, PlanSource};
