//! Target device description.
//!
//! A [`HardwareProfile`] is built once per session from the raw [`DeviceInfo`]
//! reported by a [`DeviceQuery`] and is never mutated afterwards. Memory-tier
//! constants come from microbenchmarks and are selected by architecture
//! family; unsupported families are rejected here rather than at planning time.

use crate::error::{PlanError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Architecture generation, ordered from oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuArch {
    Gen9,
    XeLp,
    XeHpg,
    XeHpc,
    Xe2,
    Xe3,
}

impl GpuArch {
    /// First generation with fast atomics-based reductions.
    pub const ATOMICS_THRESHOLD: GpuArch = GpuArch::XeHpc;

    pub fn supports_atomics_reduction(&self) -> bool {
        *self >= Self::ATOMICS_THRESHOLD
    }

    pub fn name(&self) -> &'static str {
        match self {
            GpuArch::Gen9 => "gen9",
            GpuArch::XeLp => "xe_lp",
            GpuArch::XeHpg => "xe_hpg",
            GpuArch::XeHpc => "xe_hpc",
            GpuArch::Xe2 => "xe2",
            GpuArch::Xe3 => "xe3",
        }
    }
}

impl fmt::Display for GpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw device facts as reported by the device-query collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub arch: GpuArch,
    pub eu_count: u32,
    pub threads_per_eu: u32,
    pub max_wg_size: u32,
    pub eus_per_subslice: u32,
}

/// Source of [`DeviceInfo`] for the current session.
pub trait DeviceQuery {
    fn query(&self) -> Result<DeviceInfo>;
}

/// Immutable per-session hardware description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub device_name: String,
    pub arch: GpuArch,
    pub compute_unit_count: u32,
    pub threads_per_unit: u32,
    pub max_local_group_size: u32,
    pub units_per_slice: u32,
    pub slice_count: u32,
    /// Fast (cache) tier capacity in bytes.
    pub fast_tier_size: u64,
    /// GB/s, which is also bytes per nanosecond.
    pub fast_tier_bandwidth: f32,
    pub slow_tier_bandwidth: f32,
    pub launch_overhead_ns: f32,
}

struct TierConstants {
    slow_bw: f32,
    fast_size: u64,
    fast_bw: f32,
    overhead_ns: f32,
}

const MIB: u64 = 1 << 20;

fn tier_constants(arch: GpuArch) -> Result<TierConstants> {
    match arch {
        GpuArch::XeHpg => Ok(TierConstants {
            slow_bw: 400.0,
            fast_size: 16 * MIB,
            fast_bw: 2000.0,
            overhead_ns: 8000.0,
        }),
        GpuArch::XeHpc | GpuArch::Xe2 | GpuArch::Xe3 => Ok(TierConstants {
            slow_bw: 1000.0,
            fast_size: 192 * MIB,
            fast_bw: 3000.0,
            overhead_ns: 6000.0,
        }),
        GpuArch::Gen9 | GpuArch::XeLp => Err(PlanError::UnsupportedArchitecture(arch)),
    }
}

impl HardwareProfile {
    pub fn new(info: DeviceInfo) -> Result<Self> {
        let tiers = tier_constants(info.arch)?;
        if info.eu_count == 0 || info.threads_per_eu == 0 || info.eus_per_subslice == 0 {
            return Err(PlanError::InvalidWorkload(format!(
                "device `{}` reports an empty compute topology",
                info.name
            )));
        }
        Ok(Self {
            slice_count: info.eu_count.div_ceil(info.eus_per_subslice),
            device_name: info.name,
            arch: info.arch,
            compute_unit_count: info.eu_count,
            threads_per_unit: info.threads_per_eu,
            max_local_group_size: info.max_wg_size,
            units_per_slice: info.eus_per_subslice,
            fast_tier_size: tiers.fast_size,
            fast_tier_bandwidth: tiers.fast_bw,
            slow_tier_bandwidth: tiers.slow_bw,
            launch_overhead_ns: tiers.overhead_ns,
        })
    }

    pub fn from_query(query: &dyn DeviceQuery) -> Result<Self> {
        Self::new(query.query()?)
    }

    /// Total hardware thread slots on the device.
    pub fn thread_slots(&self) -> u64 {
        self.compute_unit_count as u64 * self.threads_per_unit as u64
    }

    /// Fast-tier placement is only modelled on XeHpc and newer.
    pub fn has_fast_tier(&self) -> bool {
        self.arch >= GpuArch::XeHpc
    }

    /// Stable identity used to key registry entries.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}-eu{}-t{}-wg{}",
            self.arch, self.compute_unit_count, self.threads_per_unit, self.max_local_group_size
        )
    }
}
