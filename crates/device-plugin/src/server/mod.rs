//! The kubelet-facing gRPC server. One instance per resource manager, each
//! owning a deterministic UNIX socket under the kubelet's device-plugin
//! directory, registering itself with the kubelet, and streaming device
//! health over ListAndWatch.

pub(crate) mod response;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::api::v1beta1::{
    device_plugin_server::{DevicePlugin, DevicePluginServer},
    registration_client::RegistrationClient,
    AllocateRequest, AllocateResponse, ContainerPreferredAllocationResponse, DevicePluginOptions,
    Empty, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse, RegisterRequest, API_VERSION,
};
use crate::cdi::CdiHandler;
use crate::config::Config;
use crate::error::PluginError;
use crate::grpc_sock;
use crate::resource::{Device, DeviceId, ResourceManager};

/// Dial timeout for the plugin's own socket and the kubelet's socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// More consecutive serve crashes than this within [`CRASH_WINDOW`] are
/// unrecoverable: the socket state is suspect and the process terminates.
const MAX_SERVE_CRASHES: u32 = 5;
const CRASH_WINDOW: Duration = Duration::from_secs(3600);

/// Health transitions buffered per subscriber before it falls back to a
/// fresh snapshot.
const HEALTH_CHANNEL_CAPACITY: usize = 16;

/// In-flight ListAndWatch responses buffered per stream.
const LIST_AND_WATCH_BUFFER: usize = 4;

/// Channels owned by one start/stop cycle. Created in the constructor so
/// the struct never exists without them, torn down in `stop` (cancel, then
/// close the health channel), and re-created at the top of every `start` (a
/// cancelled stop channel is not reusable).
struct State {
    stop: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    health: Option<broadcast::Sender<DeviceId>>,
    tasks: Vec<JoinHandle<()>>,
}

impl State {
    fn fresh() -> State {
        let (stop, stop_rx) = watch::channel(false);
        let (health, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        State {
            stop,
            stop_rx,
            health: Some(health),
            tasks: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct PluginServer {
    rm: Arc<ResourceManager>,
    cdi: Arc<dyn CdiHandler>,
    config: Arc<Config>,
    socket_path: PathBuf,
    kubelet_socket: Option<PathBuf>,
    state: Arc<Mutex<State>>,
}

impl PluginServer {
    /// `kubelet_socket` is the kubelet's registration socket; `None` skips
    /// registration (useful when another component registers on our
    /// behalf, and in tests).
    pub fn new(
        rm: Arc<ResourceManager>,
        cdi: Arc<dyn CdiHandler>,
        config: Arc<Config>,
        kubelet_socket: Option<PathBuf>,
    ) -> Self {
        let socket_path = config.plugin_directory.join(rm.resource().socket_name());
        PluginServer {
            rm,
            cdi,
            config,
            socket_path,
            kubelet_socket,
            state: Arc::new(Mutex::new(State::fresh())),
        }
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.rm
    }

    pub fn has_devices(&self) -> bool {
        self.rm.has_devices()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Starts serving and registers with the kubelet. Safe to call again
    /// after `stop`.
    pub async fn start(&self) -> Result<(), PluginError> {
        let (stop_rx, health_tx) = {
            let (stop, stop_rx) = watch::channel(false);
            let (health, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
            let mut state = self.state.lock().unwrap();
            *state = State {
                stop,
                stop_rx: stop_rx.clone(),
                health: Some(health.clone()),
                tasks: Vec::new(),
            };
            (stop_rx, health)
        };

        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(_) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(PluginError::StaleSocket(e)),
        }
        let listener = grpc_sock::server::Listener::bind(&self.socket_path)
            .map_err(|e| PluginError::Serving(e.into()))?;

        let serve_plugin = self.clone();
        let serve_stop = stop_rx.clone();
        let serve_task = tokio::spawn(async move { serve_plugin.serve(listener, serve_stop).await });
        self.state.lock().unwrap().tasks.push(serve_task);

        // Confirm the server is reachable before telling the kubelet about it
        let probe = tokio::time::timeout(
            CONNECT_TIMEOUT,
            grpc_sock::client::socket_channel(&self.socket_path),
        )
        .await
        .map_err(|_| PluginError::Serving(anyhow::anyhow!("timed out dialing our own socket")))?
        .map_err(|e| PluginError::Serving(e.into()))?;
        drop(probe);

        if let Some(kubelet_socket) = self.kubelet_socket.clone() {
            self.register(&kubelet_socket)
                .await
                .map_err(PluginError::Registration)?;
        }

        let health_rm = self.rm.clone();
        let health_stop = stop_rx;
        let resource = self.rm.resource().clone();
        let health_task = tokio::spawn(async move {
            if let Err(e) = health_rm.check_health(health_stop, health_tx).await {
                // Health setup failures leave the plugin serving; devices
                // simply stay healthy from the kubelet's point of view
                error!(error = %e, resource = %resource, "unable to run health checks");
            }
        });
        self.state.lock().unwrap().tasks.push(health_task);

        info!(
            resource = %self.rm.resource(),
            socket = %self.socket_path.display(),
            "device plugin started"
        );
        Ok(())
    }

    /// Stops serving, closes the health channel, joins the server's tasks,
    /// and removes the socket. Idempotent, and safe on a partially started
    /// server.
    pub async fn stop(&self) {
        let tasks = {
            let mut state = self.state.lock().unwrap();
            // Cancel first so the health loop quits before its channel
            // disappears underneath it, then drop the sender so readers
            // observe end-of-stream
            let _ = state.stop.send(true);
            state.health = None;
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            let _ = task.await;
        }
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(_) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => warn!(
                error = %e,
                socket = %self.socket_path.display(),
                "unable to remove plugin socket"
            ),
        }
        info!(resource = %self.rm.resource(), "device plugin stopped");
    }

    /// The serve loop. Re-serves on the same listener after a crash;
    /// repeated crashes in a short window terminate the process because the
    /// supervisor cannot recover a suspect socket.
    async fn serve(&self, listener: grpc_sock::server::Listener, stop: watch::Receiver<bool>) {
        let mut crashes: u32 = 0;
        let mut last_crash = Instant::now();
        loop {
            let mut shutdown_rx = stop.clone();
            let shutdown = async move {
                // The stop signal may predate this future; changed() only
                // observes sends after the clone
                if !*shutdown_rx.borrow() {
                    let _ = shutdown_rx.changed().await;
                }
            };
            let result = Server::builder()
                .add_service(DevicePluginServer::new(self.clone()))
                .serve_with_incoming_shutdown(listener.incoming(), shutdown)
                .await;
            match result {
                Ok(()) => return,
                Err(e) => {
                    if last_crash.elapsed() > CRASH_WINDOW {
                        crashes = 0;
                    }
                    crashes += 1;
                    last_crash = Instant::now();
                    error!(
                        error = %e,
                        resource = %self.rm.resource(),
                        crashes,
                        "gRPC server crashed, restarting it"
                    );
                    if crashes > MAX_SERVE_CRASHES {
                        error!(
                            resource = %self.rm.resource(),
                            "gRPC server has repeatedly crashed recently, giving up"
                        );
                        std::process::exit(1);
                    }
                }
            }
            if *stop.borrow() {
                return;
            }
        }
    }

    async fn register(&self, kubelet_socket: &Path) -> anyhow::Result<()> {
        let channel = tokio::time::timeout(
            CONNECT_TIMEOUT,
            grpc_sock::client::socket_channel(kubelet_socket),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out dialing the kubelet socket"))??;
        let mut client = RegistrationClient::new(channel);
        let endpoint = self
            .socket_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint,
            resource_name: self.rm.resource().to_string(),
            options: Some(device_plugin_options()),
        };
        client.register(Request::new(request)).await?;
        info!(resource = %self.rm.resource(), "registered with the kubelet");
        Ok(())
    }
}

fn device_plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: true,
    }
}

fn snapshot(rm: &ResourceManager) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: rm.devices().iter().map(Device::to_api).collect(),
    }
}

#[async_trait::async_trait]
impl DevicePlugin for PluginServer {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(device_plugin_options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + Sync + 'static>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let (mut stop_rx, mut health_rx) = {
            let state = self.state.lock().unwrap();
            let health = state
                .health
                .as_ref()
                .ok_or_else(|| Status::unavailable("plugin server is stopped"))?;
            (state.stop_rx.clone(), health.subscribe())
        };
        debug!(resource = %self.rm.resource(), "starting ListAndWatch stream");

        let (tx, rx) = mpsc::channel(LIST_AND_WATCH_BUFFER);
        let rm = self.rm.clone();
        tokio::spawn(async move {
            // The initial snapshot always precedes health transitions
            if tx.send(Ok(snapshot(&rm))).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    received = health_rx.recv() => match received {
                        Ok(id) => {
                            debug!(device = %id, "sending updated device list");
                            if tx.send(Ok(snapshot(&rm))).await.is_err() {
                                break;
                            }
                        }
                        // The sender was dropped by stop: end of stream,
                        // not a zero-valued device
                        Err(broadcast::error::RecvError::Closed) => break,
                        // Missed notifications are compensated by the
                        // snapshot itself
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            if tx.send(Ok(snapshot(&rm))).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(resource = %rm.resource(), "ListAndWatch stream done");
        });

        Ok(Response::new(Box::pin(
            tokio_stream::wrappers::ReceiverStream::new(rx),
        )))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let request = request.into_inner();
        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container in request.container_requests {
            let device_i_ds = self
                .rm
                .get_preferred_allocation(
                    &container.available_device_i_ds,
                    &container.must_include_device_i_ds,
                    container.allocation_size as usize,
                )
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            container_responses.push(ContainerPreferredAllocationResponse { device_i_ds });
        }
        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container in request.container_requests {
            debug!(
                resource = %self.rm.resource(),
                devices = ?container.devices_i_ds,
                "allocate called"
            );
            let response = response::build_container_response(
                &self.rm,
                self.cdi.as_ref(),
                &self.config,
                &container.devices_i_ds,
            )
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
            container_responses.push(response);
        }
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
