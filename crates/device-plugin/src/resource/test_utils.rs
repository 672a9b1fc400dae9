//! Shared fixtures for resource manager and plugin server tests.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::provider::{
    CriticalEvent, DeviceDescriptor, DeviceIdentity, DeviceKind, DeviceProvider, EventStream,
    MigProfile,
};

pub(crate) fn gpu(uuid: &str, index: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        uuid: uuid.to_string(),
        index: index.to_string(),
        paths: vec![PathBuf::from(format!("/dev/nvidia{}", index))],
        numa_node: None,
        kind: DeviceKind::FullGpu,
        mig_enabled: false,
        profile: None,
    }
}

pub(crate) fn integrated(uuid: &str, index: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        uuid: uuid.to_string(),
        index: index.to_string(),
        paths: vec![PathBuf::from("/dev/nvgpu"), PathBuf::from("/dev/nvmap")],
        numa_node: None,
        kind: DeviceKind::Integrated,
        mig_enabled: false,
        profile: None,
    }
}

pub(crate) fn mig_slice(
    uuid: &str,
    gpu_slices: u32,
    compute_slices: u32,
    memory_mib: u64,
) -> DeviceDescriptor {
    DeviceDescriptor {
        uuid: uuid.to_string(),
        index: "0".to_string(),
        paths: vec![PathBuf::from(format!("/dev/nvidia-caps/{}", uuid))],
        numa_node: None,
        kind: DeviceKind::MigSlice,
        mig_enabled: false,
        profile: Some(MigProfile {
            gpu_slices,
            compute_slices,
            memory_mib,
        }),
    }
}

/// Resolves the fixture uuid conventions: `MIG-<gpu>/<gi>/<ci>` for MIG
/// slices, anything else names a whole device.
pub(crate) fn parse_mock_uuid(uuid: &str) -> DeviceIdentity {
    if let Some(rest) = uuid.strip_prefix("MIG-") {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() == 3 {
            if let (Ok(gi), Ok(ci)) = (parts[1].parse(), parts[2].parse()) {
                return DeviceIdentity {
                    gpu: parts[0].to_string(),
                    gpu_instance: Some(gi),
                    compute_instance: Some(ci),
                };
            }
        }
    }
    DeviceIdentity {
        gpu: uuid.to_string(),
        gpu_instance: None,
        compute_instance: None,
    }
}

pub(crate) struct MockProvider {
    descriptors: Vec<DeviceDescriptor>,
    events: Mutex<Option<mpsc::Receiver<CriticalEvent>>>,
    // Keeps the event stream open for providers constructed without an
    // external event sender
    _keepalive: Mutex<Option<mpsc::Sender<CriticalEvent>>>,
}

impl MockProvider {
    pub(crate) fn new(descriptors: Vec<DeviceDescriptor>) -> Self {
        let (tx, rx) = mpsc::channel(8);
        MockProvider {
            descriptors,
            events: Mutex::new(Some(rx)),
            _keepalive: Mutex::new(Some(tx)),
        }
    }

    /// A provider whose event stream is driven by the returned sender.
    /// Dropping the sender ends the stream.
    pub(crate) fn with_events(
        descriptors: Vec<DeviceDescriptor>,
    ) -> (Self, mpsc::Sender<CriticalEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let provider = MockProvider {
            descriptors,
            events: Mutex::new(Some(rx)),
            _keepalive: Mutex::new(None),
        };
        (provider, tx)
    }
}

#[async_trait]
impl DeviceProvider for MockProvider {
    async fn enumerate(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        Ok(self.descriptors.clone())
    }

    async fn critical_events(&self) -> anyhow::Result<EventStream> {
        let receiver = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("event stream already taken"))?;
        Ok(tokio_stream::wrappers::ReceiverStream::new(receiver).boxed())
    }

    fn parse_device_uuid(&self, uuid: &str) -> anyhow::Result<DeviceIdentity> {
        Ok(parse_mock_uuid(uuid))
    }
}
