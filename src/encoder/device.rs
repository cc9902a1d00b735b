//! Accelerator discovery and static work assignment.

use std::fmt;
use std::path::Path;

use tracing::{info, warn};

use crate::error::EncoderError;

/// A compute device an encoder or fold worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host CPU, only used in testing mode.
    Cpu,
    /// Accelerator by ordinal.
    Accelerator(usize),
}

impl Device {
    /// Ordinal used to pick per-device resources such as endpoints.
    pub fn ordinal(&self) -> usize {
        match self {
            Device::Cpu => 0,
            Device::Accelerator(i) => *i,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(i) => write!(f, "cuda:{}", i),
        }
    }
}

/// The devices chosen for a run. Fixed once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePool {
    devices: Vec<Device>,
}

impl DevicePool {
    /// Detects accelerators and resolves the pool in one step.
    pub fn detect(requested: Option<usize>, testing_mode: bool) -> Result<Self, EncoderError> {
        Self::resolve(requested, detect_accelerators(), testing_mode)
    }

    /// Resolves the devices to use from a requested and a detected count.
    ///
    /// A request above the detected count is clamped. With zero accelerators
    /// the CPU is used in testing mode; otherwise this fails.
    pub fn resolve(
        requested: Option<usize>,
        detected: usize,
        testing_mode: bool,
    ) -> Result<Self, EncoderError> {
        let count = match requested {
            Some(n) if n > detected => {
                warn!(
                    requested = n,
                    detected, "Requested more accelerators than available, clamping"
                );
                detected
            }
            Some(n) => n,
            None => detected,
        };

        if count == 0 {
            if !testing_mode {
                return Err(EncoderError::NoAcceleratorAvailable);
            }
            warn!("No accelerator in use, falling back to CPU (testing mode)");
            return Ok(Self {
                devices: vec![Device::Cpu],
            });
        }

        info!(count, "Using accelerators");
        Ok(Self {
            devices: (0..count).map(Device::Accelerator).collect(),
        })
    }

    /// Devices in ordinal order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Always false for a resolved pool.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Returns true if the pool is the CPU fallback.
    pub fn is_cpu_only(&self) -> bool {
        self.devices == [Device::Cpu]
    }

    /// Deals items round-robin: item `i` goes to device `i % len`.
    ///
    /// Devices that receive nothing are left out.
    pub fn assign<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<(Device, Vec<T>)> {
        let mut buckets: Vec<(Device, Vec<T>)> =
            self.devices.iter().map(|d| (*d, Vec::new())).collect();
        if buckets.is_empty() {
            return buckets;
        }
        let len = buckets.len();
        for (i, item) in items.into_iter().enumerate() {
            buckets[i % len].1.push(item);
        }
        buckets.retain(|(_, items)| !items.is_empty());
        buckets
    }
}

/// Number of accelerators visible to this process.
///
/// Honors `CUDA_VISIBLE_DEVICES` when set, otherwise counts `/dev/nvidiaN`.
pub fn detect_accelerators() -> usize {
    if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
        return count_visible_devices(&visible);
    }
    count_device_nodes(Path::new("/dev"))
}

/// Parses a `CUDA_VISIBLE_DEVICES` value. Entries after the first invalid
/// (negative) one are ignored.
pub(crate) fn count_visible_devices(value: &str) -> usize {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .take_while(|entry| !entry.starts_with('-'))
        .count()
}

fn count_device_nodes(dev: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("nvidia"))
                .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_uses_detected_by_default() {
        let pool = DevicePool::resolve(None, 3, false).unwrap();
        assert_eq!(
            pool.devices(),
            &[
                Device::Accelerator(0),
                Device::Accelerator(1),
                Device::Accelerator(2)
            ]
        );
    }

    #[test]
    fn test_resolve_clamps_request() {
        let pool = DevicePool::resolve(Some(8), 2, false).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_zero_devices_requires_testing_mode() {
        assert!(matches!(
            DevicePool::resolve(Some(0), 4, false),
            Err(EncoderError::NoAcceleratorAvailable)
        ));
        assert!(matches!(
            DevicePool::resolve(None, 0, false),
            Err(EncoderError::NoAcceleratorAvailable)
        ));

        let pool = DevicePool::resolve(Some(0), 4, true).unwrap();
        assert!(pool.is_cpu_only());
        assert_eq!(pool.devices()[0].to_string(), "cpu");
    }

    #[test]
    fn test_assign_round_robin() {
        let pool = DevicePool::resolve(Some(2), 2, false).unwrap();
        let assigned = pool.assign(0..5);
        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0], (Device::Accelerator(0), vec![0, 2, 4]));
        assert_eq!(assigned[1], (Device::Accelerator(1), vec![1, 3]));

        let assigned = pool.assign(0..1);
        assert_eq!(assigned, vec![(Device::Accelerator(0), vec![0])]);
    }

    #[test]
    fn test_visible_devices_parsing() {
        assert_eq!(count_visible_devices("0,1,2"), 3);
        assert_eq!(count_visible_devices(""), 0);
        assert_eq!(count_visible_devices("-1"), 0);
        assert_eq!(count_visible_devices("0, 1,-1,2"), 2);
    }

    #[test]
    fn test_device_node_counting() {
        let dir = TempDir::new().unwrap();
        for name in ["nvidia0", "nvidia1", "nvidiactl", "nvidia-uvm", "null"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(count_device_nodes(dir.path()), 2);
        assert_eq!(count_device_nodes(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Accelerator(3).to_string(), "cuda:3");
        assert_eq!(Device::Accelerator(3).ordinal(), 3);
    }
}
