use thiserror::Error;

/// Failure classes surfaced by plugin start-up and supervision. The
/// supervisor keys its recovery behavior off the variant: configuration and
/// discovery errors are fatal unless masked by `failOnInitError=false`,
/// registration errors arm the 30 second restart timer, and everything else
/// aborts the start attempt that produced it.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("device discovery failed: {0}")]
    Discovery(anyhow::Error),

    #[error("failed to register with the kubelet: {0}")]
    Registration(anyhow::Error),

    #[error("gRPC serving failed: {0}")]
    Serving(anyhow::Error),

    #[error("could not remove stale socket: {0}")]
    StaleSocket(std::io::Error),
}
