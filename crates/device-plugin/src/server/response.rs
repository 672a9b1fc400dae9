//! Builds the per-container allocate response from the configured device
//! list strategies. Replica ids are collapsed onto their backing devices
//! before anything is resolved.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::api::v1beta1::{CdiDevice, ContainerAllocateResponse, DeviceSpec, Mount};
use crate::cdi::{self, CdiHandler, CLASS_GDS, CLASS_GPU, CLASS_MOFED};
use crate::config::{Config, DeviceIdStrategy, DeviceListStrategy};
use crate::resource::{RequestError, ResourceManager};

/// Environment variable the NVIDIA container runtime reads the device list
/// from.
pub(crate) const VISIBLE_DEVICES_ENVVAR: &str = "NVIDIA_VISIBLE_DEVICES";
pub(crate) const GDS_ENVVAR: &str = "NVIDIA_GDS";
pub(crate) const MOFED_ENVVAR: &str = "NVIDIA_MOFED";

/// Sentinel assigned to the env var under the volume-mounts strategy; the
/// runtime then infers the device set from the mounts below this root.
pub(crate) const DEVICE_LIST_AS_VOLUME_MOUNTS_ROOT: &str = "/var/run/nvidia-container-devices";

/// Control device nodes every GPU container needs, on top of the
/// per-device nodes. Skipped individually when absent on the host.
const CONTROL_DEVICE_NODES: &[&str] = &[
    "/dev/nvidiactl",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-modeset",
];

pub(crate) fn build_container_response(
    rm: &ResourceManager,
    cdi: &dyn CdiHandler,
    config: &Config,
    requested_ids: &[String],
) -> Result<ContainerAllocateResponse, RequestError> {
    let requested = rm.validate_request(requested_ids)?;
    let backing = rm.backing_devices(&requested);
    let identifiers: Vec<String> = backing
        .iter()
        .map(|device| match config.device_id_strategy {
            DeviceIdStrategy::Uuid => device.id.parent().to_string(),
            DeviceIdStrategy::Index => device.index.clone(),
        })
        .collect();

    let strategies = config.device_list_strategies();
    let mut response = ContainerAllocateResponse::default();

    if strategies.contains(&DeviceListStrategy::Envvar) {
        response
            .envs
            .insert(VISIBLE_DEVICES_ENVVAR.to_string(), identifiers.join(","));
        insert_capability_envs(&mut response, config);
    }

    if strategies.contains(&DeviceListStrategy::VolumeMounts) {
        response.envs.insert(
            VISIBLE_DEVICES_ENVVAR.to_string(),
            DEVICE_LIST_AS_VOLUME_MOUNTS_ROOT.to_string(),
        );
        insert_capability_envs(&mut response, config);
        for id in &identifiers {
            response.mounts.push(Mount {
                container_path: format!("{}/{}", DEVICE_LIST_AS_VOLUME_MOUNTS_ROOT, id),
                host_path: "/dev/null".to_string(),
                read_only: false,
            });
        }
    }

    if strategies.iter().any(|s| s.is_cdi()) {
        let mut qualified: Vec<String> = identifiers
            .iter()
            .map(|id| cdi.qualified_name(CLASS_GPU, id))
            .collect();
        if config.gds_enabled {
            qualified.push(cdi.qualified_name(CLASS_GDS, "all"));
        }
        if config.mofed_enabled {
            qualified.push(cdi.qualified_name(CLASS_MOFED, "all"));
        }
        if strategies.contains(&DeviceListStrategy::CdiAnnotations) {
            let key = cdi::annotation_key(&config.cdi_annotation_prefix, &Uuid::new_v4());
            response
                .annotations
                .insert(key, cdi::annotation_value(&qualified));
        }
        if strategies.contains(&DeviceListStrategy::CdiCri) {
            response.cdi_devices = qualified
                .into_iter()
                .map(|name| CdiDevice { name })
                .collect();
        }
    }

    if config.pass_device_specs {
        response.devices = device_specs(rm, &requested, &config.nvidia_dev_root);
    }

    Ok(response)
}

fn insert_capability_envs(response: &mut ContainerAllocateResponse, config: &Config) {
    if config.gds_enabled {
        response
            .envs
            .insert(GDS_ENVVAR.to_string(), "enabled".to_string());
    }
    if config.mofed_enabled {
        response
            .envs
            .insert(MOFED_ENVVAR.to_string(), "enabled".to_string());
    }
}

/// The per-device nodes plus the control nodes, all `rw`, host paths
/// prefixed with the configured device root.
fn device_specs(
    rm: &ResourceManager,
    requested: &[crate::resource::DeviceId],
    dev_root: &Path,
) -> Vec<DeviceSpec> {
    let mut specs = Vec::new();
    for path in rm.device_paths(requested) {
        let container_path = path.to_string_lossy().to_string();
        specs.push(DeviceSpec {
            host_path: host_path(dev_root, &path).to_string_lossy().to_string(),
            container_path,
            permissions: "rw".to_string(),
        });
    }
    for control in CONTROL_DEVICE_NODES {
        let host = host_path(dev_root, Path::new(control));
        if host.exists() {
            specs.push(DeviceSpec {
                container_path: control.to_string(),
                host_path: host.to_string_lossy().to_string(),
                permissions: "rw".to_string(),
            });
        }
    }
    specs
}

fn host_path(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}
