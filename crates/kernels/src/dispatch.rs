//! Boundary with the code-generation / dispatch collaborator.

use crate::candidate::CandidateConfiguration;
use crate::config::ShapeClass;
use crate::decompose::{KernelDescriptor, KernelKind, Occupancy};
use crate::error::Result;
use crate::hardware::HardwareProfile;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global and local work extents of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub global: [u64; 3],
    pub local: [u64; 3],
}

impl LaunchGeometry {
    pub fn new(global: [u64; 3], local: [u64; 3]) -> Self {
        Self { global, local }
    }

    pub fn global_size(&self) -> u64 {
        self.global.iter().product()
    }

    pub fn local_size(&self) -> u64 {
        self.local.iter().product()
    }

    /// A zero local extent marks a configuration the device cannot launch.
    pub fn is_launchable(&self) -> bool {
        self.local_size() > 0 && self.global_size() > 0
    }

    /// Occupancy figures for this launch, or `None` if it is not launchable.
    pub fn occupancy(&self, hw: &HardwareProfile, sub_group_size: u32) -> Option<Occupancy> {
        if !self.is_launchable() {
            return None;
        }
        let gws = self.global_size();
        let work_groups = gws / self.local_size();
        let threads = gws / sub_group_size.max(1) as u64;
        let slots_in_use = (work_groups
            * hw.units_per_slice as u64
            * hw.threads_per_unit as u64)
            .min(hw.thread_slots());
        Some(Occupancy {
            work_groups,
            slice_util: work_groups as f32 / hw.slice_count as f32,
            thread_util: threads as f32 / slots_in_use.max(1) as f32,
        })
    }
}

/// Collaborator that turns (kernel, configuration) into launches.
///
/// Implementations must be shareable across the threads that evaluate
/// candidates; `execute` is only ever called by one measuring thread per
/// device at a time.
pub trait KernelExecutor: Send + Sync {
    /// Identifies the physical device; measurements are serialized per id.
    fn device_id(&self) -> &str;

    fn launch_geometry(
        &self,
        kind: KernelKind,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
        hw: &HardwareProfile,
    ) -> LaunchGeometry;

    /// Launch `kernel` once and return the observed wall time.
    fn execute(
        &self,
        kernel: &KernelDescriptor,
        geometry: &LaunchGeometry,
        shape: &ShapeClass,
        candidate: &CandidateConfiguration,
    ) -> Result<Duration>;
}
