//! Generated bindings for the kubelet device plugin protocol.

#[allow(clippy::all)]
pub mod v1beta1 {
    /// Version of the device plugin API this plugin was built against.
    pub const API_VERSION: &str = "v1beta1";

    /// Devices the kubelet may schedule. A device is allocatable while its
    /// health field carries this value.
    pub const HEALTHY: &str = "Healthy";

    /// Devices the kubelet must withdraw from the schedulable pool.
    pub const UNHEALTHY: &str = "Unhealthy";

    tonic::include_proto!("v1beta1");
}
