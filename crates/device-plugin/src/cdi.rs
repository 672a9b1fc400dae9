//! Contract with the CDI spec generator, plus the annotation encoding used
//! when the `cdi-annotations` strategy is selected.

use uuid::Uuid;

/// Identifier this plugin uses inside CDI annotation keys.
pub const PLUGIN_ID: &str = "nvidia-device-plugin";

/// CDI device class for GPUs and MIG slices.
pub const CLASS_GPU: &str = "gpu";

/// CDI device classes for the auxiliary GDS and MOFED devices.
pub const CLASS_GDS: &str = "gds";
pub const CLASS_MOFED: &str = "mofed";

pub trait CdiHandler: Send + Sync {
    /// Maps a device identity to a fully-qualified CDI device name, e.g.
    /// `nvidia.com/gpu=GPU-aaa`.
    fn qualified_name(&self, class: &str, id: &str) -> String;

    /// Generates and persists the CDI spec consumed by the runtime. Called
    /// once at plugin-fleet start.
    fn create_spec_file(&self) -> anyhow::Result<()>;
}

/// Produces qualified names without materialising a spec on disk.
/// Deployments that enable CDI strategies wire in a real generator; this
/// one backs everything else, including tests.
pub struct StaticCdiHandler {
    vendor: String,
}

impl StaticCdiHandler {
    pub fn new(vendor: impl Into<String>) -> Self {
        StaticCdiHandler {
            vendor: vendor.into(),
        }
    }
}

impl Default for StaticCdiHandler {
    fn default() -> Self {
        StaticCdiHandler::new("nvidia.com")
    }
}

impl CdiHandler for StaticCdiHandler {
    fn qualified_name(&self, class: &str, id: &str) -> String {
        format!("{}/{}={}", self.vendor, class, id)
    }

    fn create_spec_file(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Annotation key for one allocation response. The response id keeps keys
/// unique when a pod requests devices in more than one container.
pub fn annotation_key(prefix: &str, response_id: &Uuid) -> String {
    format!("{}{}_{}", prefix, PLUGIN_ID, response_id)
}

/// Annotation value: the comma-joined qualified device names.
pub fn annotation_value(names: &[String]) -> String {
    names.join(",")
}
