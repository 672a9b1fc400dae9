//! NVML-backed [`DeviceProvider`]. Enumerates the discrete GPUs on the node
//! and bridges NVML's blocking XID event delivery onto the async event
//! stream the health loops consume.
//!
//! MIG slice enumeration is not wired through this provider; MIG-enabled
//! GPUs surface as such and the `single`/`mixed` strategies take the
//! configuration error path until a MIG-aware provider backs them.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use device_plugin::provider::{
    CriticalEvent, DeviceDescriptor, DeviceIdentity, DeviceKind, DeviceProvider, EventStream,
};

/// How long each NVML event poll blocks before checking whether anyone is
/// still listening.
const EVENT_WAIT_MS: u32 = 5000;

pub struct NvmlProvider;

impl NvmlProvider {
    pub fn new() -> Self {
        NvmlProvider
    }
}

#[async_trait]
impl DeviceProvider for NvmlProvider {
    async fn enumerate(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        // NVML is blocking throughout
        tokio::task::spawn_blocking(enumerate_blocking).await?
    }

    async fn critical_events(&self) -> anyhow::Result<EventStream> {
        let (tx, rx) = mpsc::channel(32);
        std::thread::Builder::new()
            .name("nvml-events".to_string())
            .spawn(move || {
                if let Err(e) = event_loop(tx) {
                    warn!(error = %e, "NVML event delivery ended");
                }
            })
            .context("unable to spawn the NVML event thread")?;
        Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed())
    }

    fn parse_device_uuid(&self, uuid: &str) -> anyhow::Result<DeviceIdentity> {
        // Legacy MIG identifiers look like MIG-GPU-<uuid>/<gi>/<ci>;
        // anything else identifies a whole GPU
        if let Some(rest) = uuid.strip_prefix("MIG-GPU-") {
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() == 3 {
                let gpu_instance = parts[1]
                    .parse()
                    .with_context(|| format!("invalid GPU instance in {}", uuid))?;
                let compute_instance = parts[2]
                    .parse()
                    .with_context(|| format!("invalid compute instance in {}", uuid))?;
                return Ok(DeviceIdentity {
                    gpu: format!("GPU-{}", parts[0]),
                    gpu_instance: Some(gpu_instance),
                    compute_instance: Some(compute_instance),
                });
            }
        }
        Ok(DeviceIdentity {
            gpu: uuid.to_string(),
            gpu_instance: None,
            compute_instance: None,
        })
    }
}

fn enumerate_blocking() -> anyhow::Result<Vec<DeviceDescriptor>> {
    let nvml = Nvml::init().context("unable to initialize NVML")?;
    let count = nvml.device_count()?;
    let mut descriptors = Vec::with_capacity(count as usize);
    for index in 0..count {
        let device = nvml.device_by_index(index)?;
        let uuid = device.uuid()?;
        let minor = device.minor_number()?;
        let numa_node = match numa_node_for_bus_id(&device.pci_info()?.bus_id) {
            Ok(node) => node,
            Err(e) => {
                debug!(error = %e, uuid = %uuid, "no NUMA affinity for device");
                None
            }
        };
        descriptors.push(DeviceDescriptor {
            uuid,
            index: index.to_string(),
            paths: vec![PathBuf::from(format!("/dev/nvidia{}", minor))],
            numa_node,
            kind: DeviceKind::FullGpu,
            mig_enabled: false,
            profile: None,
        });
    }
    Ok(descriptors)
}

/// Resolves NUMA affinity through sysfs. NVML reports an extended PCI bus
/// id (8 hex digit domain); sysfs wants 4.
fn numa_node_for_bus_id(bus_id: &str) -> anyhow::Result<Option<i64>> {
    let lower = bus_id.to_lowercase();
    let id = match lower.split_once(':') {
        Some((domain, rest)) if domain.len() == 8 => format!("{}:{}", &domain[4..], rest),
        _ => lower.clone(),
    };
    let path = format!("/sys/bus/pci/devices/{}/numa_node", id);
    let contents = std::fs::read_to_string(path)?;
    let node: i64 = contents.trim().parse()?;
    // Negative means the platform is not NUMA-aware
    Ok((node >= 0).then(|| node))
}

fn event_loop(tx: mpsc::Sender<CriticalEvent>) -> anyhow::Result<()> {
    use nvml_wrapper::bitmasks::event::EventTypes;

    let nvml = Nvml::init().context("unable to initialize NVML")?;
    let mut set = nvml.create_event_set()?;
    for index in 0..nvml.device_count()? {
        let device = nvml.device_by_index(index)?;
        set = device
            .register_events(EventTypes::CRITICAL_XID_ERROR, set)
            .map_err(|e| anyhow::anyhow!("unable to register for XID events: {}", e))?;
    }

    loop {
        if tx.is_closed() {
            return Ok(());
        }
        match set.wait(EVENT_WAIT_MS) {
            Ok(data) => {
                let event = CriticalEvent {
                    xid: match data.event_data {
                        Some(nvml_wrapper::enums::event::XidError::Value(value)) => value,
                        Some(nvml_wrapper::enums::event::XidError::Unknown) | None => 0,
                    },
                    uuid: data.device.uuid().ok(),
                    gpu_instance_id: None,
                    compute_instance_id: None,
                };
                debug!(xid = event.xid, uuid = ?event.uuid, "received critical event");
                if tx.blocking_send(event).is_err() {
                    return Ok(());
                }
            }
            // A poll timeout just means nothing happened
            Err(NvmlError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
