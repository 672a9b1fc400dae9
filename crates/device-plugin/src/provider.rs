//! Contract with the library that enumerates GPUs and delivers critical
//! device events (NVML in production). Everything the plugin knows about the
//! hardware arrives through [`DeviceProvider`]; replica suffixes never cross
//! this boundary.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

/// A critical event reported by the device library. XIDs that denote
/// application faults are filtered out downstream; the identifiers locate
/// the affected device (or, when absent, implicate every device).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CriticalEvent {
    pub xid: u64,
    pub uuid: Option<String>,
    pub gpu_instance_id: Option<u32>,
    pub compute_instance_id: Option<u32>,
}

/// Stream of critical events. Poll timeouts are absorbed by the provider;
/// the stream only ends when event delivery is no longer possible.
pub type EventStream = Pin<Box<dyn Stream<Item = CriticalEvent> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// A whole discrete GPU.
    FullGpu,
    /// A MIG slice of a discrete GPU.
    MigSlice,
    /// An integrated (Tegra) GPU.
    Integrated,
}

/// Geometry of a MIG slice. Two slices with equal profiles are
/// interchangeable for scheduling purposes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MigProfile {
    pub gpu_slices: u32,
    pub compute_slices: u32,
    pub memory_mib: u64,
}

impl MigProfile {
    /// Canonical profile name: `<g>g.<mem>gb`, or `<c>c.<g>g.<mem>gb` when
    /// the compute slice count differs from the GPU slice count. Memory is
    /// rounded up from MiB to GiB, matching the names users already see in
    /// existing deployments.
    pub fn name(&self) -> String {
        let gb = (self.memory_mib + 1024 - 1) / 1024;
        if self.compute_slices == self.gpu_slices {
            format!("{}g.{}gb", self.gpu_slices, gb)
        } else {
            format!("{}c.{}g.{}gb", self.compute_slices, self.gpu_slices, gb)
        }
    }
}

/// One enumerable compute unit as reported by the device library.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    /// Stable identifier, e.g. `GPU-<uuid>` or `MIG-<uuid>`.
    pub uuid: String,
    /// Human readable enumeration index, e.g. `0` or `0:1`.
    pub index: String,
    /// Host device nodes a container needs in order to use the device.
    pub paths: Vec<PathBuf>,
    /// NUMA node affinity, when the library exposes one.
    pub numa_node: Option<i64>,
    pub kind: DeviceKind,
    /// For full GPUs: whether MIG mode is currently enabled.
    pub mig_enabled: bool,
    /// For MIG slices: the slice geometry.
    pub profile: Option<MigProfile>,
}

/// A device identifier resolved to its parent GPU and MIG instance
/// coordinates. Non-MIG devices carry `None` for both instance fields,
/// meaning "the whole GPU".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub gpu: String,
    pub gpu_instance: Option<u32>,
    pub compute_instance: Option<u32>,
}

#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Enumerates every device attached to the node.
    async fn enumerate(&self) -> anyhow::Result<Vec<DeviceDescriptor>>;

    /// Subscribes to the library's critical-event stream.
    async fn critical_events(&self) -> anyhow::Result<EventStream>;

    /// Resolves a device identifier to its parent GPU and instance
    /// coordinates.
    fn parse_device_uuid(&self, uuid: &str) -> anyhow::Result<DeviceIdentity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_names() {
        let profile = MigProfile {
            gpu_slices: 1,
            compute_slices: 1,
            memory_mib: 9728,
        };
        assert_eq!(profile.name(), "1g.10gb");

        let profile = MigProfile {
            gpu_slices: 3,
            compute_slices: 3,
            memory_mib: 40192,
        };
        assert_eq!(profile.name(), "3g.40gb");

        let profile = MigProfile {
            gpu_slices: 3,
            compute_slices: 1,
            memory_mib: 40192,
        };
        assert_eq!(profile.name(), "1c.3g.40gb");
    }

    #[test]
    fn test_memory_rounds_up() {
        let profile = MigProfile {
            gpu_slices: 2,
            compute_slices: 2,
            memory_mib: 20096,
        };
        // 20096 MiB is 19.625 GiB and must round up
        assert_eq!(profile.name(), "2g.20gb");
    }
}
