//! The configuration surface of the plugin. The daemon reads this from a
//! YAML file (field names are camelCase, matching what operators already
//! deploy for the upstream plugin) and the supervisor re-reads it from disk
//! on every soft restart, so strategy, sharing, and MIG changes take effect
//! without restarting the process.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::PluginError;

/// Directory in which the kubelet looks for plugin sockets, and in which it
/// hosts its own registration socket.
pub const DEFAULT_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Name of the kubelet's registration socket inside the plugin directory.
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Annotation namespace consumed by CDI-aware runtimes.
pub const DEFAULT_CDI_ANNOTATION_PREFIX: &str = "cdi.k8s.io/";

/// XID codes that denote application-level faults rather than device
/// failures. These never mark a device unhealthy:
///   13 - graphics engine exception
///   31 - GPU memory page fault
///   43 - GPU stopped processing
///   45 - preemptive cleanup, due to previous errors
///   68 - video processor exception
pub const DEFAULT_IGNORED_XIDS: &[u64] = &[13, 31, 43, 45, 68];

/// How MIG-capable GPUs are modelled as resources.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    /// MIG is ignored; every physical GPU is advertised whole.
    None,
    /// All GPUs must be MIG-enabled with identical slice geometry; the
    /// slices replace the full GPUs under the `gpu` resource.
    Single,
    /// MIG slices are advertised under per-profile resources; non-MIG GPUs
    /// stay under the `gpu` resource.
    Mixed,
}

/// Mechanisms used to convey the allocated device set to the runtime. More
/// than one may be selected.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceListStrategy {
    #[serde(rename = "envvar")]
    Envvar,
    #[serde(rename = "volume-mounts")]
    VolumeMounts,
    #[serde(rename = "cdi-annotations")]
    CdiAnnotations,
    #[serde(rename = "cdi-cri")]
    CdiCri,
}

impl DeviceListStrategy {
    pub fn is_cdi(&self) -> bool {
        matches!(self, DeviceListStrategy::CdiAnnotations | DeviceListStrategy::CdiCri)
    }
}

/// The form of device identifier inserted into env vars, mounts, and CDI
/// names.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIdStrategy {
    Uuid,
    Index,
}

/// A single resource subject to time-slicing replication.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedResource {
    /// Resource name to replicate, e.g. `nvidia.com/gpu`.
    pub name: String,
    /// Explicit advertised name for the replicated resource. Overrides
    /// `renameByDefault`.
    #[serde(default)]
    pub rename: Option<String>,
    /// Number of replicas each backing device fans out into.
    pub replicas: u32,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSlicing {
    /// Advertise replicated resources as `<name>.shared` unless a resource
    /// entry carries its own rename.
    pub rename_by_default: bool,
    /// Reject requests for more than one device of a replicated resource.
    pub fail_requests_greater_than_one: bool,
    pub resources: Vec<ReplicatedResource>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Sharing {
    pub time_slicing: TimeSlicing,
}

/// Effective health-check filter derived from `disableHealthChecks`.
#[derive(Clone, Debug, PartialEq)]
pub enum HealthChecks {
    /// The sentinel string disabled health checking entirely.
    Disabled,
    /// Health checking is on; these XIDs are ignored on top of
    /// [`DEFAULT_IGNORED_XIDS`].
    ExtraIgnoredXids(Vec<u64>),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub mig_strategy: MigStrategy,
    pub fail_on_init_error: bool,
    pub device_list_strategy: Vec<DeviceListStrategy>,
    #[serde(rename = "deviceIDStrategy")]
    pub device_id_strategy: DeviceIdStrategy,
    pub pass_device_specs: bool,
    pub gds_enabled: bool,
    pub mofed_enabled: bool,
    /// Root under which the NVIDIA driver is installed on the host.
    pub nvidia_driver_root: PathBuf,
    /// Root under which the device nodes live on the host; prefixes every
    /// DeviceSpec host path.
    pub nvidia_dev_root: PathBuf,
    /// Root under which the driver is visible to the container runtime.
    pub container_driver_root: PathBuf,
    pub cdi_annotation_prefix: String,
    /// `"all"` or `"xids"` disables health checking; otherwise a
    /// comma-separated list of additional XID codes to ignore.
    pub disable_health_checks: String,
    pub sharing: Sharing,
    /// Directory holding the kubelet registration socket and the per-plugin
    /// sockets.
    pub plugin_directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mig_strategy: MigStrategy::None,
            fail_on_init_error: true,
            device_list_strategy: vec![DeviceListStrategy::Envvar],
            device_id_strategy: DeviceIdStrategy::Uuid,
            pass_device_specs: false,
            gds_enabled: false,
            mofed_enabled: false,
            nvidia_driver_root: PathBuf::from("/"),
            nvidia_dev_root: PathBuf::from("/"),
            container_driver_root: PathBuf::from("/driver-root"),
            cdi_annotation_prefix: DEFAULT_CDI_ANNOTATION_PREFIX.to_string(),
            disable_health_checks: String::new(),
            sharing: Sharing::default(),
            plugin_directory: PathBuf::from(DEFAULT_PLUGIN_PATH),
        }
    }
}

impl Config {
    /// Loads and validates a config file. The file may be YAML or JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PluginError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PluginError::Config(format!(
                "unable to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| PluginError::Config(format!("unable to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.device_list_strategy.is_empty() {
            return Err(PluginError::Config(
                "at least one device list strategy must be selected".to_string(),
            ));
        }
        let strategies = self.device_list_strategies();
        if strategies.contains(&DeviceListStrategy::Envvar)
            && strategies.contains(&DeviceListStrategy::VolumeMounts)
        {
            return Err(PluginError::Config(
                "the envvar and volume-mounts device list strategies are mutually exclusive"
                    .to_string(),
            ));
        }
        for resource in &self.sharing.time_slicing.resources {
            if resource.replicas < 1 {
                return Err(PluginError::Config(format!(
                    "time-slicing replicas for resource {} must be a positive integer",
                    resource.name
                )));
            }
        }
        Ok(())
    }

    /// The selected strategies as a set.
    pub fn device_list_strategies(&self) -> BTreeSet<DeviceListStrategy> {
        self.device_list_strategy.iter().copied().collect()
    }

    pub fn any_strategy_is_cdi(&self) -> bool {
        self.device_list_strategy.iter().any(|s| s.is_cdi())
    }

    /// Path of the kubelet registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.plugin_directory.join(KUBELET_SOCKET_NAME)
    }

    /// Parses `disableHealthChecks`. Invalid XID entries are skipped with a
    /// warning rather than failing the whole config.
    pub fn health_checks(&self) -> HealthChecks {
        match self.disable_health_checks.trim() {
            "all" | "xids" => HealthChecks::Disabled,
            "" => HealthChecks::ExtraIgnoredXids(Vec::new()),
            list => {
                let mut xids = Vec::new();
                for entry in list.split(',') {
                    let entry = entry.trim();
                    if entry.is_empty() {
                        continue;
                    }
                    match entry.parse::<u64>() {
                        Ok(xid) => xids.push(xid),
                        Err(_) => {
                            warn!(entry, "skipping invalid XID in disableHealthChecks")
                        }
                    }
                }
                HealthChecks::ExtraIgnoredXids(xids)
            }
        }
    }
}
