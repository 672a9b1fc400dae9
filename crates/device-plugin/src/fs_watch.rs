//! Detection of kubelet restarts. When the kubelet comes back up it
//! re-creates its registration socket, which invalidates every plugin
//! registration made against the previous instance; the supervisor awaits
//! [`KubeletSocketWatcher::socket_created`] and soft-restarts the fleet
//! each time it resolves.

use std::path::PathBuf;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Result as NotifyResult, Watcher};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{error, warn};

/// Watches the device-plugin directory for re-creation of the kubelet's
/// registration socket.
pub struct KubeletSocketWatcher {
    socket_path: PathBuf,
    events: UnboundedReceiver<NotifyResult<Event>>,
    // The watcher stops reporting if dropped, so it lives as long as the
    // receiving half
    _watcher: RecommendedWatcher,
}

impl KubeletSocketWatcher {
    /// Watches the directory containing `socket_path`. The directory (not
    /// the socket) is the watch target: the socket itself does not exist
    /// while the kubelet is down, which is exactly when we need to be
    /// watching.
    pub fn new(socket_path: PathBuf) -> anyhow::Result<Self> {
        let directory = socket_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("kubelet socket path has no parent directory"))?
            .to_owned();

        let (events_tx, events) = unbounded_channel::<NotifyResult<Event>>();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |event| {
            if events_tx.send(event).is_err() {
                error!("supervisor dropped its filesystem event stream");
            }
        })?;
        watcher.configure(Config::PreciseEvents(true))?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        Ok(KubeletSocketWatcher {
            socket_path,
            events,
            _watcher: watcher,
        })
    }

    /// Resolves the next time the kubelet socket is created. Watcher errors
    /// are logged and skipped; other filesystem traffic in the directory
    /// (plugin sockets coming and going) is ignored. Cancel-safe, so it can
    /// sit in the supervisor's select loop.
    pub async fn socket_created(&mut self) -> anyhow::Result<()> {
        while let Some(event) = self.events.recv().await {
            match event {
                Ok(event) => {
                    if event.kind.is_create()
                        && event.paths.iter().any(|path| path == &self.socket_path)
                    {
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            }
        }
        anyhow::bail!("filesystem event stream ended")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reports_kubelet_socket_creation() {
        let temp = tempfile::tempdir().expect("unable to set up temporary directory");
        let socket = temp.path().join("kubelet.sock");
        let mut watcher = KubeletSocketWatcher::new(socket.clone()).expect("unable to watch");

        // Unrelated traffic in the directory must not resolve the wait
        tokio::fs::write(temp.path().join("nvidia-gpu.sock"), "")
            .await
            .expect("unable to write test file");
        tokio::fs::write(&socket, "")
            .await
            .expect("unable to write test socket");

        tokio::time::timeout(Duration::from_secs(5), watcher.socket_created())
            .await
            .expect("timed out waiting for the kubelet socket")
            .expect("watcher stream ended prematurely");
    }

    #[tokio::test]
    async fn test_ignores_other_sockets() {
        let temp = tempfile::tempdir().expect("unable to set up temporary directory");
        let socket = temp.path().join("kubelet.sock");
        let mut watcher = KubeletSocketWatcher::new(socket).expect("unable to watch");

        tokio::fs::write(temp.path().join("nvidia-gpu.sock"), "")
            .await
            .expect("unable to write test file");

        assert!(
            tokio::time::timeout(Duration::from_secs(1), watcher.socket_created())
                .await
                .is_err(),
            "unrelated files should not look like a kubelet restart"
        );
    }
}
