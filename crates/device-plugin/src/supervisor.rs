//! The top-level controller. Builds the plugin fleet from configuration,
//! starts a plugin server per resource that has devices, and supervises the
//! whole thing: kubelet restarts, SIGHUP, and failed starts all funnel into
//! a soft restart (stop everything, reload config from disk, rebuild,
//! start again) without exiting the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cdi::CdiHandler;
use crate::config::Config;
use crate::error::PluginError;
use crate::fs_watch::KubeletSocketWatcher;
use crate::provider::DeviceProvider;
use crate::resource::build_resource_managers;
use crate::server::PluginServer;

/// Delay before retrying a fleet start that failed (typically because the
/// kubelet was not ready to accept registrations).
const RESTART_DELAY: Duration = Duration::from_secs(30);

pub struct Supervisor {
    provider: Arc<dyn DeviceProvider>,
    cdi: Arc<dyn CdiHandler>,
    config: Arc<Config>,
    /// Config file re-read on every soft restart. `None` keeps the initial
    /// config for the lifetime of the process.
    config_file: Option<PathBuf>,
    plugins: Vec<PluginServer>,
}

impl Supervisor {
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        cdi: Arc<dyn CdiHandler>,
        config: Config,
        config_file: Option<PathBuf>,
    ) -> Self {
        Supervisor {
            provider,
            cdi,
            config: Arc::new(config),
            config_file,
            plugins: Vec::new(),
        }
    }

    /// Runs until the process receives SIGINT, SIGTERM, or SIGQUIT.
    /// Returns an error only for fatal initialization failures.
    pub async fn run(mut self) -> Result<(), PluginError> {
        tokio::fs::create_dir_all(&self.config.plugin_directory)
            .await
            .map_err(|e| PluginError::Serving(e.into()))?;
        let mut watcher = KubeletSocketWatcher::new(self.config.kubelet_socket())
            .map_err(PluginError::Serving)?;

        let mut hangup = signal(SignalKind::hangup()).map_err(|e| PluginError::Serving(e.into()))?;
        let mut interrupt =
            signal(SignalKind::interrupt()).map_err(|e| PluginError::Serving(e.into()))?;
        let mut terminate =
            signal(SignalKind::terminate()).map_err(|e| PluginError::Serving(e.into()))?;
        let mut quit = signal(SignalKind::quit()).map_err(|e| PluginError::Serving(e.into()))?;

        let mut restart_at = match self.start_plugins().await? {
            true => Some(Instant::now() + RESTART_DELAY),
            false => None,
        };

        loop {
            let restart_timer = async {
                match restart_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                _ = restart_timer => {
                    info!("restart timer fired, restarting plugins");
                    restart_at = self.soft_restart().await?;
                }
                created = watcher.socket_created() => {
                    match created {
                        Ok(()) => {
                            info!("inotify: kubelet socket created, restarting plugins");
                            restart_at = self.soft_restart().await?;
                        }
                        Err(e) => {
                            error!(error = %e, "filesystem watcher stopped unexpectedly");
                            return Err(PluginError::Serving(e));
                        }
                    }
                }
                _ = hangup.recv() => {
                    info!("received SIGHUP, restarting plugins");
                    restart_at = self.soft_restart().await?;
                }
                _ = interrupt.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = terminate.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = quit.recv() => {
                    info!("received SIGQUIT, shutting down");
                    break;
                }
            }
        }

        self.stop_plugins().await;
        Ok(())
    }

    /// Stops everything, reloads configuration from disk, and starts the
    /// rebuilt fleet. Returns the new restart deadline when the start
    /// failed and needs to be retried.
    async fn soft_restart(&mut self) -> Result<Option<Instant>, PluginError> {
        self.stop_plugins().await;
        self.reload_config();
        Ok(match self.start_plugins().await? {
            true => Some(Instant::now() + RESTART_DELAY),
            false => None,
        })
    }

    fn reload_config(&mut self) {
        let path = match &self.config_file {
            Some(path) => path.clone(),
            None => return,
        };
        match Config::from_file(&path) {
            Ok(config) => self.config = Arc::new(config),
            // Keep running with the previous config rather than taking the
            // whole fleet down over an edit in progress
            Err(e) => error!(error = %e, file = %path.display(), "could not reload config"),
        }
    }

    /// Builds the resource managers and starts a plugin server for every
    /// manager with at least one device. Returns true when the fleet needs
    /// a delayed retry; propagates an error only when the failure is fatal
    /// under the `failOnInitError` policy.
    async fn start_plugins(&mut self) -> Result<bool, PluginError> {
        let managers =
            match build_resource_managers(self.provider.clone(), self.config.clone()).await {
                Ok(managers) => managers,
                Err(e) if self.config.fail_on_init_error => return Err(e),
                Err(e) => {
                    warn!(
                        error = %e,
                        "failed to build resource managers; running with no plugins (failOnInitError is false)"
                    );
                    Vec::new()
                }
            };

        if self.config.any_strategy_is_cdi() && managers.iter().any(|m| m.has_devices()) {
            if let Err(e) = self.cdi.create_spec_file() {
                let e = PluginError::Serving(e);
                if self.config.fail_on_init_error {
                    return Err(e);
                }
                warn!(error = %e, "could not create CDI spec file");
            }
        }

        let kubelet_socket = self.config.kubelet_socket();
        self.plugins = managers
            .into_iter()
            .map(|rm| {
                PluginServer::new(
                    Arc::new(rm),
                    self.cdi.clone(),
                    self.config.clone(),
                    Some(kubelet_socket.clone()),
                )
            })
            .collect();

        if self.plugins.iter().all(|p| !p.has_devices()) {
            warn!("no devices found on this node; waiting for a restart signal");
            return Ok(false);
        }

        for plugin in &self.plugins {
            if !plugin.has_devices() {
                continue;
            }
            if let Err(e) = plugin.start().await {
                error!(
                    error = %e,
                    resource = %plugin.resource_manager().resource(),
                    "failed to start plugin; retrying in {}s",
                    RESTART_DELAY.as_secs()
                );
                self.stop_plugins().await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn stop_plugins(&mut self) {
        for plugin in self.plugins.drain(..) {
            plugin.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::StaticCdiHandler;
    use crate::config::MigStrategy;
    use crate::resource::test_utils::{gpu, mig_slice, MockProvider};
    use async_trait::async_trait;
    use std::path::Path;

    struct FailingProvider;

    #[async_trait]
    impl DeviceProvider for FailingProvider {
        async fn enumerate(&self) -> anyhow::Result<Vec<crate::provider::DeviceDescriptor>> {
            anyhow::bail!("could not load NVML")
        }

        async fn critical_events(&self) -> anyhow::Result<crate::provider::EventStream> {
            anyhow::bail!("could not load NVML")
        }

        fn parse_device_uuid(&self, _uuid: &str) -> anyhow::Result<crate::provider::DeviceIdentity> {
            anyhow::bail!("could not load NVML")
        }
    }

    fn supervisor(
        provider: Arc<dyn DeviceProvider>,
        mut config: Config,
        plugin_dir: &Path,
    ) -> Supervisor {
        config.plugin_directory = plugin_dir.to_path_buf();
        Supervisor::new(provider, Arc::new(StaticCdiHandler::default()), config, None)
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(Arc::new(FailingProvider), Config::default(), dir.path());
        let err = sup.start_plugins().await.unwrap_err();
        assert!(matches!(err, PluginError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_masked_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.fail_on_init_error = false;
        let mut sup = supervisor(Arc::new(FailingProvider), config, dir.path());
        assert!(!sup.start_plugins().await.unwrap());
        assert!(sup.plugins.is_empty());
    }

    #[tokio::test]
    async fn test_zero_devices_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(
            Arc::new(MockProvider::new(vec![])),
            Config::default(),
            dir.path(),
        );
        assert!(!sup.start_plugins().await.unwrap());
        // The gpu manager exists but its server was never started
        assert_eq!(sup.plugins.len(), 1);
        assert!(!sup.plugins[0].socket_path().exists());
        sup.stop_plugins().await;
    }

    #[tokio::test]
    async fn test_mixed_strategy_starts_only_populated_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let mut parent = gpu("GPU-aaa", "0");
        parent.mig_enabled = true;
        let provider = Arc::new(MockProvider::new(vec![
            parent,
            mig_slice("MIG-GPU-aaa/1/0", 1, 1, 9728),
            mig_slice("MIG-GPU-aaa/2/0", 1, 1, 9728),
            mig_slice("MIG-GPU-aaa/3/0", 3, 3, 40192),
        ]));
        let mut config = Config::default();
        config.mig_strategy = MigStrategy::Mixed;
        let mut sup = supervisor(provider, config, dir.path());

        // Registration is configured against a kubelet socket that does not
        // exist, so starting the populated plugins fails and the supervisor
        // asks for a retry. What matters here is the fleet shape and that
        // the empty gpu plugin was never started.
        let needs_retry = sup.start_plugins().await.unwrap();
        assert!(needs_retry);
        assert!(sup.plugins.is_empty(), "failed start must stop the fleet");
    }

    #[tokio::test]
    async fn test_fleet_starts_without_registration() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new(vec![gpu("GPU-aaa", "0")]));
        let mut config = Config::default();
        config.plugin_directory = dir.path().to_path_buf();
        let mut sup = Supervisor::new(
            provider,
            Arc::new(StaticCdiHandler::default()),
            config,
            None,
        );
        // Bypass registration the way the integration tests drive servers
        let managers = build_resource_managers(sup.provider.clone(), sup.config.clone())
            .await
            .unwrap();
        sup.plugins = managers
            .into_iter()
            .map(|rm| {
                PluginServer::new(Arc::new(rm), sup.cdi.clone(), sup.config.clone(), None)
            })
            .collect();
        for plugin in &sup.plugins {
            plugin.start().await.unwrap();
            assert!(plugin.socket_path().exists());
        }
        sup.stop_plugins().await;
    }
}
