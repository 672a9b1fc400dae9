//! Turns the provider's device snapshot into the set of resource managers
//! the supervisor runs, applying the MIG strategy and any time-slicing
//! replication from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::config::{Config, MigStrategy};
use crate::error::PluginError;
use crate::provider::{DeviceDescriptor, DeviceKind, DeviceProvider};
use crate::resource::device::{Device, DeviceId, Health, ResourceName};
use crate::resource::ResourceManager;

/// Enumerates devices and builds one resource manager per advertised
/// resource. Managers are returned in resource-name order; a manager with
/// zero devices is a valid outcome (its plugin server is simply never
/// started).
pub async fn build_resource_managers(
    provider: Arc<dyn DeviceProvider>,
    config: Arc<Config>,
) -> Result<Vec<ResourceManager>, PluginError> {
    let descriptors = provider
        .enumerate()
        .await
        .map_err(PluginError::Discovery)?;
    managers_for_descriptors(descriptors, provider, config)
}

fn managers_for_descriptors(
    descriptors: Vec<DeviceDescriptor>,
    provider: Arc<dyn DeviceProvider>,
    config: Arc<Config>,
) -> Result<Vec<ResourceManager>, PluginError> {
    let mut sets: BTreeMap<ResourceName, Vec<Device>> = BTreeMap::new();

    match config.mig_strategy {
        MigStrategy::None => {
            let devices = descriptors
                .iter()
                .filter(|d| d.kind != DeviceKind::MigSlice)
                .map(|d| device_from_descriptor(d, provider.as_ref()))
                .collect::<Result<Vec<_>, _>>()?;
            sets.insert(ResourceName::gpu(), devices);
        }
        MigStrategy::Single => {
            sets.insert(ResourceName::gpu(), single_strategy_devices(&descriptors, provider.as_ref())?);
        }
        MigStrategy::Mixed => {
            let mut gpus = Vec::new();
            for descriptor in &descriptors {
                match descriptor.kind {
                    DeviceKind::Integrated => {
                        return Err(PluginError::Config(
                            "migStrategy=mixed is not supported on integrated devices".to_string(),
                        ))
                    }
                    DeviceKind::FullGpu => {
                        if !descriptor.mig_enabled {
                            gpus.push(device_from_descriptor(descriptor, provider.as_ref())?);
                        }
                    }
                    DeviceKind::MigSlice => {
                        let profile = descriptor.profile.as_ref().ok_or_else(|| {
                            PluginError::Config(format!(
                                "MIG device {} reported no profile",
                                descriptor.uuid
                            ))
                        })?;
                        sets.entry(ResourceName::mig(&profile.name()))
                            .or_insert_with(Vec::new)
                            .push(device_from_descriptor(descriptor, provider.as_ref())?);
                    }
                }
            }
            // The whole-GPU resource is always advertised under mixed, even
            // when every GPU on the node is MIG-enabled
            sets.insert(ResourceName::gpu(), gpus);
        }
    }

    for replicated in &config.sharing.time_slicing.resources {
        if !sets.keys().any(|name| name.as_str() == replicated.name) {
            warn!(
                resource = %replicated.name,
                "time-slicing configured for a resource this node does not advertise"
            );
        }
    }

    let mut managers = Vec::new();
    for (name, devices) in sets {
        managers.push(apply_sharing(name, devices, &config, &provider));
    }

    Ok(managers)
}

/// Under `single` every GPU must be MIG-enabled and sliced with identical
/// geometry; the slices replace the GPUs under the whole-GPU resource.
fn single_strategy_devices(
    descriptors: &[DeviceDescriptor],
    provider: &dyn DeviceProvider,
) -> Result<Vec<Device>, PluginError> {
    let mut slices = Vec::new();
    let mut profile = None;
    for descriptor in descriptors {
        match descriptor.kind {
            DeviceKind::Integrated => {
                return Err(PluginError::Config(
                    "migStrategy=single is not supported on integrated devices".to_string(),
                ))
            }
            DeviceKind::FullGpu => {
                if !descriptor.mig_enabled {
                    return Err(PluginError::Config(format!(
                        "migStrategy=single requires MIG to be enabled on all GPUs, but it is disabled on {}",
                        descriptor.uuid
                    )));
                }
            }
            DeviceKind::MigSlice => {
                let this = descriptor.profile.as_ref().ok_or_else(|| {
                    PluginError::Config(format!(
                        "MIG device {} reported no profile",
                        descriptor.uuid
                    ))
                })?;
                match &profile {
                    None => profile = Some(this.clone()),
                    Some(existing) if existing == this => {}
                    Some(existing) => {
                        return Err(PluginError::Config(format!(
                            "migStrategy=single requires all MIG devices to share one profile, found both {} and {}",
                            existing.name(),
                            this.name()
                        )))
                    }
                }
                slices.push(device_from_descriptor(descriptor, provider)?);
            }
        }
    }
    if slices.is_empty() && descriptors.iter().any(|d| d.kind == DeviceKind::FullGpu) {
        return Err(PluginError::Config(
            "migStrategy=single requires MIG devices, but none were found".to_string(),
        ));
    }
    Ok(slices)
}

fn device_from_descriptor(
    descriptor: &DeviceDescriptor,
    provider: &dyn DeviceProvider,
) -> Result<Device, PluginError> {
    let identity = provider
        .parse_device_uuid(&descriptor.uuid)
        .map_err(PluginError::Discovery)?;
    Ok(Device {
        id: DeviceId::Real(descriptor.uuid.clone()),
        index: descriptor.index.clone(),
        paths: descriptor.paths.clone(),
        health: Health::Healthy,
        numa_node: descriptor.numa_node,
        kind: descriptor.kind,
        identity,
    })
}

fn shared_name(name: &ResourceName) -> String {
    format!("{}.shared", name.as_str())
}

/// Applies any matching time-slicing entry: the visible device multiset
/// becomes the cartesian product of the backing devices and the replica
/// indices, and the resource may be renamed.
fn apply_sharing(
    name: ResourceName,
    devices: Vec<Device>,
    config: &Arc<Config>,
    provider: &Arc<dyn DeviceProvider>,
) -> ResourceManager {
    let time_slicing = &config.sharing.time_slicing;
    let entry = time_slicing
        .resources
        .iter()
        .find(|r| r.name == name.as_str());

    let (name, devices, replicated) = match entry {
        None => (name, devices, false),
        Some(entry) => {
            let advertised = match &entry.rename {
                Some(rename) => ResourceName::new(rename.clone()),
                None if time_slicing.rename_by_default => ResourceName::new(shared_name(&name)),
                None => name,
            };
            let replicas = devices
                .iter()
                .flat_map(|device| {
                    (0..entry.replicas).map(move |k| Device {
                        id: DeviceId::replica(device.id.parent(), k),
                        ..device.clone()
                    })
                })
                .collect();
            (advertised, replicas, true)
        }
    };

    ResourceManager::new(
        name,
        devices,
        replicated && time_slicing.fail_requests_greater_than_one,
        config.clone(),
        provider.clone(),
    )
}
