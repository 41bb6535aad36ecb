//! Workload configuration structures.

use crate::error::{PlanError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest data tensor the planner accepts (256 TiB).
pub const MAX_TENSOR_BYTES: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_size_bytes(&self) -> u64 {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }

    /// 16-bit types get their own calibration curves.
    pub fn is_16bit(&self) -> bool {
        matches!(self, DataType::F16 | DataType::BF16)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Which kernel family implements the operator.
///
/// `Reusable` kernels are compiled once per shape class and rely on the
/// calibrated approximation table; `Optimized` kernels are specialised per
/// workload and use the closed-form utilization curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImplVariant {
    Optimized,
    Reusable,
}

/// A tunable value plus whether the caller fixed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tunable<T> {
    value: T,
    pinned: bool,
}

impl<T: Copy> Tunable<T> {
    pub fn free(value: T) -> Self {
        Self {
            value,
            pinned: false,
        }
    }

    pub fn pinned(value: T) -> Self {
        Self {
            value,
            pinned: true,
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// The pinned value, if any.
    pub fn pin_value(&self) -> Option<T> {
        self.pinned.then_some(self.value)
    }

    /// Overwrite the value unless the caller pinned it. Returns whether the
    /// value was written.
    pub fn set_if_free(&mut self, value: T) -> bool {
        if self.pinned {
            return false;
        }
        self.value = value;
        true
    }

    pub fn pin(&mut self, value: T) {
        self.value = value;
        self.pinned = true;
    }
}

/// Boolean mode flags of a normalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadFlags {
    /// Forward: compute mean/variance instead of consuming given statistics.
    pub calculate_stats: bool,
    /// Compute mean and variance in one combined pass.
    pub use_stats_one_pass: bool,
    pub use_scale: bool,
    pub use_shift: bool,
    pub fuse_norm_relu: bool,
    pub fuse_norm_add_relu: bool,
    /// Backward: compute diff statistics.
    pub calculate_diff_stats: bool,
    /// Results must be bit-reproducible across runs.
    pub deterministic: bool,
}

/// Hardware-independent identity of a workload: everything except the
/// tunables. Two workloads with the same shape class share registry entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeClass {
    pub direction: Direction,
    pub variant: ImplVariant,
    pub dtype: DataType,
    /// Spatial extent including the minibatch (N*D*H*W).
    pub sp: u64,
    /// Channel count.
    pub ic: u64,
    pub sub_group_size: u32,
    pub max_vect_size: u32,
    /// Upper bound on the channel block, applied to reusable kernels.
    pub max_ic_block: u64,
    pub flags: WorkloadFlags,
}

impl ShapeClass {
    pub fn forward(sp: u64, ic: u64, dtype: DataType) -> Self {
        Self {
            direction: Direction::Forward,
            variant: ImplVariant::Optimized,
            dtype,
            sp,
            ic,
            sub_group_size: 16,
            max_vect_size: 8,
            max_ic_block: 128,
            flags: WorkloadFlags {
                calculate_stats: true,
                use_stats_one_pass: true,
                use_scale: true,
                use_shift: true,
                ..WorkloadFlags::default()
            },
        }
    }

    pub fn backward(sp: u64, ic: u64, dtype: DataType) -> Self {
        Self {
            direction: Direction::Backward,
            flags: WorkloadFlags {
                calculate_diff_stats: true,
                use_scale: true,
                ..WorkloadFlags::default()
            },
            ..Self::forward(sp, ic, dtype)
        }
    }

    pub fn is_forward(&self) -> bool {
        self.direction == Direction::Forward
    }

    pub fn is_reusable(&self) -> bool {
        self.variant == ImplVariant::Reusable
    }

    /// Saturates instead of overflowing; validated shapes stay below
    /// [`MAX_TENSOR_BYTES`].
    pub fn tensor_bytes(&self) -> u64 {
        self.checked_tensor_bytes().unwrap_or(u64::MAX)
    }

    fn checked_tensor_bytes(&self) -> Option<u64> {
        self.sp
            .checked_mul(self.ic)?
            .checked_mul(self.dtype.element_size_bytes())
    }

    /// One f32 per channel.
    pub fn stat_vect_bytes(&self) -> u64 {
        self.ic * std::mem::size_of::<f32>() as u64
    }

    /// Registry key component.
    pub fn key(&self) -> String {
        let f = &self.flags;
        let bits: String = [
            f.calculate_stats,
            f.use_stats_one_pass,
            f.use_scale,
            f.use_shift,
            f.fuse_norm_relu,
            f.fuse_norm_add_relu,
            f.calculate_diff_stats,
            f.deterministic,
        ]
        .iter()
        .map(|b| if *b { '1' } else { '0' })
        .collect();
        format!(
            "{}:{}:{}:sp{}:ic{}:sg{}:v{}:icb{}:{}",
            match self.direction {
                Direction::Forward => "fwd",
                Direction::Backward => "bwd",
            },
            match self.variant {
                ImplVariant::Optimized => "opt",
                ImplVariant::Reusable => "reusable",
            },
            self.dtype.name(),
            self.sp,
            self.ic,
            self.sub_group_size,
            self.max_vect_size,
            self.max_ic_block,
            bits
        )
    }
}

/// Normalized description of one operator instance plus its tunables.
///
/// Planning fills the unpinned tunables and the derived outputs; pinned
/// tunables are never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub shape: ShapeClass,
    pub use_fused_atomics_reduction: Tunable<bool>,
    pub ic_block: Tunable<u64>,
    pub stat_sp_block: Tunable<u64>,
    pub update_sp_block: Tunable<u64>,
    pub update_sp_unroll: Tunable<u64>,
    /// Derived: vector width used by the update kernels.
    pub vect_size: u32,
    /// Derived: lanes along the channel axis of the statistics kernels.
    pub calc_stat_ic: u64,
    pub expected_time_ms: Option<f32>,
}

impl WorkloadDescriptor {
    pub fn new(shape: ShapeClass) -> Self {
        Self {
            use_fused_atomics_reduction: Tunable::free(false),
            ic_block: Tunable::free(shape.sub_group_size as u64),
            stat_sp_block: Tunable::free(1),
            update_sp_block: Tunable::free(1),
            update_sp_unroll: Tunable::free(1),
            vect_size: 1,
            calc_stat_ic: shape.sub_group_size as u64,
            expected_time_ms: None,
            shape,
        }
    }

    /// Names and values of every pinned tunable, in declaration order.
    pub fn pinned_fields(&self) -> Vec<(&'static str, u64)> {
        let mut out = Vec::new();
        if let Some(v) = self.use_fused_atomics_reduction.pin_value() {
            out.push(("atomics", v as u64));
        }
        let numeric = [
            ("ic_block", &self.ic_block),
            ("stat_sp_block", &self.stat_sp_block),
            ("update_sp_block", &self.update_sp_block),
            ("unroll", &self.update_sp_unroll),
        ];
        for (name, t) in numeric {
            if let Some(v) = t.pin_value() {
                out.push((name, v));
            }
        }
        out
    }

    /// Reject shapes the planner cannot reason about and pinned values that
    /// are invalid on their own.
    pub fn validate(&self) -> Result<()> {
        let s = &self.shape;
        if s.sp == 0 || s.ic == 0 {
            return Err(PlanError::InvalidWorkload(format!(
                "empty tensor (sp={}, ic={})",
                s.sp, s.ic
            )));
        }
        match s.checked_tensor_bytes() {
            Some(bytes) if bytes <= MAX_TENSOR_BYTES => {}
            _ => {
                return Err(PlanError::InvalidWorkload(format!(
                    "tensor of sp={} ic={} exceeds {} bytes",
                    s.sp, s.ic, MAX_TENSOR_BYTES
                )));
            }
        }
        if s.sub_group_size == 0 || !s.sub_group_size.is_power_of_two() {
            return Err(PlanError::InvalidWorkload(format!(
                "sub-group size {} must be a power of two",
                s.sub_group_size
            )));
        }
        let sg = s.sub_group_size as u64;
        if s.ic % sg != 0 {
            return Err(PlanError::InvalidWorkload(format!(
                "channel count {} is not a multiple of sub-group size {}",
                s.ic, sg
            )));
        }
        if s.max_vect_size == 0 {
            return Err(PlanError::InvalidWorkload("max vector size must be > 0".into()));
        }
        if s.is_reusable() && s.max_ic_block < sg {
            return Err(PlanError::InvalidWorkload(format!(
                "max channel block {} is below sub-group size {}",
                s.max_ic_block, sg
            )));
        }

        if let Some(block) = self.ic_block.pin_value() {
            if block == 0 || s.ic % block != 0 || block % sg != 0 {
                return Err(PlanError::InvalidPin {
                    field: "ic_block",
                    reason: format!(
                        "{} must divide {} and be a multiple of {}",
                        block, s.ic, sg
                    ),
                });
            }
        }
        if self.use_fused_atomics_reduction.pin_value() == Some(true) && s.flags.deterministic {
            return Err(PlanError::InvalidPin {
                field: "atomics",
                reason: "atomics reduction cannot be deterministic".into(),
            });
        }
        let positive = [
            ("stat_sp_block", &self.stat_sp_block),
            ("update_sp_block", &self.update_sp_block),
            ("unroll", &self.update_sp_unroll),
        ];
        for (field, t) in positive {
            if t.pin_value() == Some(0) {
                return Err(PlanError::InvalidPin {
                    field,
                    reason: "must be > 0".into(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for WorkloadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shape.key())
    }
}
