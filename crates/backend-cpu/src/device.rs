//! Device-query sources: built-in presets and JSON device files.

use kernelplan_kernels::{DeviceInfo, DeviceQuery, GpuArch, PlanError, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Known devices, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetDevice {
    XeHpg,
    XeHpc,
}

impl PresetDevice {
    pub const NAMES: [&'static str; 2] = ["xe-hpg", "xe-hpc"];

    pub fn name(&self) -> &'static str {
        match self {
            PresetDevice::XeHpg => "xe-hpg",
            PresetDevice::XeHpc => "xe-hpc",
        }
    }

    pub fn info(&self) -> DeviceInfo {
        match self {
            PresetDevice::XeHpg => DeviceInfo {
                name: "xe-hpg-512eu".into(),
                arch: GpuArch::XeHpg,
                eu_count: 512,
                threads_per_eu: 8,
                max_wg_size: 1024,
                eus_per_subslice: 16,
            },
            PresetDevice::XeHpc => DeviceInfo {
                name: "xe-hpc-1024eu".into(),
                arch: GpuArch::XeHpc,
                eu_count: 1024,
                threads_per_eu: 8,
                max_wg_size: 1024,
                eus_per_subslice: 8,
            },
        }
    }
}

impl fmt::Display for PresetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PresetDevice {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "xe-hpg" => Ok(PresetDevice::XeHpg),
            "xe-hpc" => Ok(PresetDevice::XeHpc),
            other => Err(PlanError::Descriptor(format!(
                "unknown device `{other}` (expected one of {})",
                Self::NAMES.join(", ")
            ))),
        }
    }
}

impl DeviceQuery for PresetDevice {
    fn query(&self) -> Result<DeviceInfo> {
        Ok(self.info())
    }
}

/// A serialized [`DeviceInfo`] on disk.
#[derive(Debug, Clone)]
pub struct DeviceFile {
    path: PathBuf,
}

impl DeviceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceQuery for DeviceFile {
    fn query(&self) -> Result<DeviceInfo> {
        let data = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelplan_kernels::HardwareProfile;

    #[test]
    fn presets_parse_by_name() {
        assert_eq!("xe-hpc".parse::<PresetDevice>().unwrap(), PresetDevice::XeHpc);
        assert_eq!("XE_HPG".parse::<PresetDevice>().unwrap(), PresetDevice::XeHpg);
        assert!("gen9".parse::<PresetDevice>().is_err());
    }

    #[test]
    fn presets_build_profiles() {
        for preset in [PresetDevice::XeHpg, PresetDevice::XeHpc] {
            let hw = HardwareProfile::from_query(&preset).unwrap();
            assert!(hw.slice_count > 0);
        }
    }

    #[test]
    fn device_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        let info = PresetDevice::XeHpc.info();
        fs::write(&path, serde_json::to_vec(&info).unwrap()).unwrap();
        assert_eq!(DeviceFile::new(&path).query().unwrap(), info);
    }

    #[test]
    fn unsupported_family_in_file_fails_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        let info = DeviceInfo {
            arch: GpuArch::Gen9,
            ..PresetDevice::XeHpg.info()
        };
        fs::write(&path, serde_json::to_vec(&info).unwrap()).unwrap();
        let err = HardwareProfile::from_query(&DeviceFile::new(&path)).unwrap_err();
        assert!(!err.is_recoverable());
    }
}
