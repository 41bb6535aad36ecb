//! Candidate execution configurations.
//!
//! A [`CandidateConfiguration`] is a value type produced in one step by
//! [`CandidateBuilder`]; apart from the predicted/measured time recorded by
//! the selector it is read-only.

use crate::error::{PlanError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How per-block partial statistics are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionStrategy {
    /// Partials are written out and reduced by a separate kernel.
    TwoPass,
    /// Partials are accumulated with atomics in a single pass.
    Atomics,
}

impl ReductionStrategy {
    pub fn from_atomics(use_atomics: bool) -> Self {
        if use_atomics {
            ReductionStrategy::Atomics
        } else {
            ReductionStrategy::TwoPass
        }
    }

    pub fn is_atomics(&self) -> bool {
        matches!(self, ReductionStrategy::Atomics)
    }
}

/// Deserialization goes through [`CandidateBuilder`], so stored
/// configurations obey the same invariants as generated ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredCandidate")]
pub struct CandidateConfiguration {
    reduction: ReductionStrategy,
    ic_block: u64,
    stat_sp_block: u64,
    update_sp_block: u64,
    vect_size: u32,
    unroll: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_time_ns: Option<f32>,
}

impl CandidateConfiguration {
    pub fn reduction(&self) -> ReductionStrategy {
        self.reduction
    }

    pub fn use_atomics(&self) -> bool {
        self.reduction.is_atomics()
    }

    pub fn ic_block(&self) -> u64 {
        self.ic_block
    }

    pub fn stat_sp_block(&self) -> u64 {
        self.stat_sp_block
    }

    pub fn update_sp_block(&self) -> u64 {
        self.update_sp_block
    }

    pub fn vect_size(&self) -> u32 {
        self.vect_size
    }

    pub fn unroll(&self) -> u64 {
        self.unroll
    }

    pub fn total_time_ns(&self) -> Option<f32> {
        self.total_time_ns
    }

    /// Record the summed predicted or measured time for this candidate.
    pub fn record_time(&mut self, total_ns: f32) {
        self.total_time_ns = Some(total_ns);
    }

    /// The unroll factor must evenly divide both the update block and the
    /// spatial tail left over after full blocks.
    pub fn is_unroll_legal(&self, sp: u64) -> bool {
        self.update_sp_block % self.unroll == 0 && (sp % self.update_sp_block) % self.unroll == 0
    }

    /// Same configuration with a different unroll factor.
    pub fn with_unroll(&self, unroll: u64) -> Result<Self> {
        CandidateBuilder::from(*self).unroll(unroll).build()
    }
}

impl fmt::Display for CandidateConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "atomics={} ic_block={} stat_sp_block={} update_sp_block={} vect={} unroll={}",
            self.use_atomics() as u8,
            self.ic_block,
            self.stat_sp_block,
            self.update_sp_block,
            self.vect_size,
            self.unroll
        )
    }
}

/// Unvalidated on-disk form of [`CandidateConfiguration`].
#[derive(Deserialize)]
struct StoredCandidate {
    reduction: ReductionStrategy,
    ic_block: u64,
    stat_sp_block: u64,
    update_sp_block: u64,
    vect_size: u32,
    unroll: u64,
    #[serde(default)]
    total_time_ns: Option<f32>,
}

impl TryFrom<StoredCandidate> for CandidateConfiguration {
    type Error = PlanError;

    fn try_from(raw: StoredCandidate) -> Result<Self> {
        let mut candidate = CandidateBuilder::new(raw.reduction, raw.ic_block)
            .stat_sp_block(raw.stat_sp_block)
            .update_sp_block(raw.update_sp_block)
            .vect_size(raw.vect_size)
            .unroll(raw.unroll)
            .build()?;
        candidate.total_time_ns = raw.total_time_ns;
        Ok(candidate)
    }
}

/// Builder that validates once and yields a fully formed configuration.
#[derive(Debug, Clone, Copy)]
pub struct CandidateBuilder {
    reduction: ReductionStrategy,
    ic_block: u64,
    stat_sp_block: u64,
    update_sp_block: Option<u64>,
    vect_size: u32,
    unroll: u64,
}

impl CandidateBuilder {
    pub fn new(reduction: ReductionStrategy, ic_block: u64) -> Self {
        Self {
            reduction,
            ic_block,
            stat_sp_block: 1,
            update_sp_block: None,
            vect_size: 1,
            unroll: 1,
        }
    }

    pub fn stat_sp_block(mut self, block: u64) -> Self {
        self.stat_sp_block = block;
        self
    }

    /// Defaults to the statistics block when not set.
    pub fn update_sp_block(mut self, block: u64) -> Self {
        self.update_sp_block = Some(block);
        self
    }

    pub fn vect_size(mut self, vect_size: u32) -> Self {
        self.vect_size = vect_size;
        self
    }

    pub fn unroll(mut self, unroll: u64) -> Self {
        self.unroll = unroll;
        self
    }

    pub fn build(self) -> Result<CandidateConfiguration> {
        let update_sp_block = self.update_sp_block.unwrap_or(self.stat_sp_block);
        let checks = [
            ("ic_block", self.ic_block),
            ("stat_sp_block", self.stat_sp_block),
            ("update_sp_block", update_sp_block),
            ("unroll", self.unroll),
            ("vect_size", self.vect_size as u64),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(PlanError::InvalidWorkload(format!(
                    "candidate {field} must be > 0"
                )));
            }
        }
        if !self.vect_size.is_power_of_two() {
            return Err(PlanError::InvalidWorkload(format!(
                "vector width {} is not a power of two",
                self.vect_size
            )));
        }
        Ok(CandidateConfiguration {
            reduction: self.reduction,
            ic_block: self.ic_block,
            stat_sp_block: self.stat_sp_block,
            update_sp_block,
            vect_size: self.vect_size,
            unroll: self.unroll,
            total_time_ns: None,
        })
    }
}

impl From<CandidateConfiguration> for CandidateBuilder {
    fn from(c: CandidateConfiguration) -> Self {
        Self {
            reduction: c.reduction,
            ic_block: c.ic_block,
            stat_sp_block: c.stat_sp_block,
            update_sp_block: Some(c.update_sp_block),
            vect_size: c.vect_size,
            unroll: c.unroll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_update_block_to_stat_block() {
        let c = CandidateBuilder::new(ReductionStrategy::TwoPass, 32)
            .stat_sp_block(96)
            .vect_size(2)
            .build()
            .unwrap();
        assert_eq!(c.update_sp_block(), 96);
        assert_eq!(c.unroll(), 1);
        assert_eq!(c.total_time_ns(), None);
    }

    #[test]
    fn builder_rejects_zero_and_odd_vector() {
        assert!(CandidateBuilder::new(ReductionStrategy::Atomics, 0).build().is_err());
        assert!(CandidateBuilder::new(ReductionStrategy::Atomics, 16)
            .vect_size(3)
            .build()
            .is_err());
    }

    #[test]
    fn stored_candidates_are_validated() {
        let c = CandidateBuilder::new(ReductionStrategy::Atomics, 32)
            .stat_sp_block(64)
            .unroll(2)
            .build()
            .unwrap();
        let json = serde_json::to_string(&c).unwrap();
        let back: CandidateConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);

        for field in ["unroll", "update_sp_block", "ic_block", "stat_sp_block"] {
            let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
            value[field] = 0.into();
            let parsed = serde_json::from_value::<CandidateConfiguration>(value);
            assert!(parsed.is_err(), "{field}=0 accepted");
        }
    }

    #[test]
    fn unroll_legality() {
        let c = CandidateBuilder::new(ReductionStrategy::TwoPass, 16)
            .stat_sp_block(8)
            .unroll(4)
            .build()
            .unwrap();
        // 100 % 8 == 4, divisible by 4
        assert!(c.is_unroll_legal(100));
        // 102 % 8 == 6, not divisible by 4
        assert!(!c.is_unroll_legal(102));
        let c = c.with_unroll(3).unwrap();
        assert!(!c.is_unroll_legal(96));
    }
}
