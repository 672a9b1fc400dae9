//! End-to-end tests that drive a plugin server the way the kubelet does:
//! over its UNIX socket, with real tonic clients.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

use device_plugin::api::v1beta1::{
    device_plugin_client::DevicePluginClient,
    registration_server::{Registration, RegistrationServer},
    AllocateRequest, ContainerAllocateRequest, ContainerPreferredAllocationRequest, Empty,
    PreferredAllocationRequest, RegisterRequest, API_VERSION,
};
use device_plugin::cdi::StaticCdiHandler;
use device_plugin::config::{Config, DeviceListStrategy, ReplicatedResource};
use device_plugin::grpc_sock;
use device_plugin::provider::{
    CriticalEvent, DeviceDescriptor, DeviceIdentity, DeviceKind, DeviceProvider, EventStream,
};
use device_plugin::resource::build_resource_managers;
use device_plugin::server::PluginServer;

/// Provider fixture backed by a fixed descriptor list and an injectable
/// event stream.
struct MockProvider {
    descriptors: Vec<DeviceDescriptor>,
    events: Mutex<Option<mpsc::Receiver<CriticalEvent>>>,
}

impl MockProvider {
    fn new(descriptors: Vec<DeviceDescriptor>) -> (Arc<Self>, mpsc::Sender<CriticalEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Arc::new(MockProvider {
                descriptors,
                events: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

#[async_trait]
impl DeviceProvider for MockProvider {
    async fn enumerate(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        Ok(self.descriptors.clone())
    }

    async fn critical_events(&self) -> anyhow::Result<EventStream> {
        let receiver = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("event stream already taken"))?;
        Ok(tokio_stream::wrappers::ReceiverStream::new(receiver).boxed())
    }

    fn parse_device_uuid(&self, uuid: &str) -> anyhow::Result<DeviceIdentity> {
        Ok(DeviceIdentity {
            gpu: uuid.to_string(),
            gpu_instance: None,
            compute_instance: None,
        })
    }
}

fn gpu(uuid: &str, index: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        uuid: uuid.to_string(),
        index: index.to_string(),
        paths: vec![PathBuf::from(format!("/dev/nvidia{}", index))],
        numa_node: None,
        kind: DeviceKind::FullGpu,
        mig_enabled: false,
        profile: None,
    }
}

async fn start_plugin(
    descriptors: Vec<DeviceDescriptor>,
    mut config: Config,
    plugin_dir: &std::path::Path,
) -> (PluginServer, mpsc::Sender<CriticalEvent>) {
    config.plugin_directory = plugin_dir.to_path_buf();
    let config = Arc::new(config);
    let (provider, events) = MockProvider::new(descriptors);
    let managers = build_resource_managers(provider, config.clone())
        .await
        .expect("building resource managers should succeed");
    let rm = Arc::new(managers.into_iter().next().unwrap());
    let server = PluginServer::new(rm, Arc::new(StaticCdiHandler::default()), config, None);
    server.start().await.expect("plugin server should start");
    (server, events)
}

async fn plugin_client(server: &PluginServer) -> DevicePluginClient<tonic::transport::Channel> {
    let channel = grpc_sock::client::socket_channel(server.socket_path())
        .await
        .expect("should be able to dial the plugin socket");
    DevicePluginClient::new(channel)
}

#[tokio::test]
async fn test_two_gpu_node_with_envvar_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _events) = start_plugin(
        vec![gpu("GPU-aaa", "0"), gpu("GPU-bbb", "1")],
        Config::default(),
        dir.path(),
    )
    .await;
    let mut client = plugin_client(&server).await;

    let options = client
        .get_device_plugin_options(Request::new(Empty {}))
        .await
        .unwrap()
        .into_inner();
    assert!(options.get_preferred_allocation_available);
    assert!(!options.pre_start_required);

    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .unwrap()
        .into_inner();
    let initial = stream.message().await.unwrap().unwrap();
    let mut ids: Vec<_> = initial.devices.iter().map(|d| d.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["GPU-aaa".to_string(), "GPU-bbb".to_string()]);

    let response = client
        .allocate(Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_i_ds: vec!["GPU-aaa".to_string()],
            }],
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    assert_eq!(
        container.envs.get("NVIDIA_VISIBLE_DEVICES"),
        Some(&"GPU-aaa".to_string())
    );
    assert!(container.mounts.is_empty());
    assert!(container.annotations.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_time_sliced_gpu_advertises_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.sharing.time_slicing.resources = vec![ReplicatedResource {
        name: "nvidia.com/gpu".to_string(),
        rename: None,
        replicas: 4,
    }];
    let (server, _events) = start_plugin(vec![gpu("GPU-aaa", "0")], config, dir.path()).await;
    let mut client = plugin_client(&server).await;

    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .unwrap()
        .into_inner();
    let initial = stream.message().await.unwrap().unwrap();
    let mut ids: Vec<_> = initial.devices.iter().map(|d| d.id.clone()).collect();
    ids.sort();
    assert_eq!(
        ids,
        vec!["GPU-aaa::0", "GPU-aaa::1", "GPU-aaa::2", "GPU-aaa::3"]
    );

    let response = client
        .allocate(Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_i_ds: vec!["GPU-aaa::2".to_string()],
            }],
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.container_responses[0].envs.get("NVIDIA_VISIBLE_DEVICES"),
        Some(&"GPU-aaa".to_string())
    );

    server.stop().await;
}

#[tokio::test]
async fn test_oversize_replicated_request_is_a_grpc_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.sharing.time_slicing.fail_requests_greater_than_one = true;
    config.sharing.time_slicing.resources = vec![ReplicatedResource {
        name: "nvidia.com/gpu".to_string(),
        rename: None,
        replicas: 4,
    }];
    let (server, _events) = start_plugin(vec![gpu("GPU-aaa", "0")], config, dir.path()).await;
    let mut client = plugin_client(&server).await;

    let status = client
        .allocate(Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_i_ds: vec!["GPU-aaa::0".to_string(), "GPU-aaa::1".to_string()],
            }],
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(status.message().contains("request too large"));

    server.stop().await;
}

#[tokio::test]
async fn test_cdi_annotations_without_env_list() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.device_list_strategy = vec![DeviceListStrategy::CdiAnnotations];
    config.cdi_annotation_prefix = "custom.cdi.k8s.io/".to_string();
    let (server, _events) = start_plugin(
        vec![gpu("GPU-aaa", "0"), gpu("GPU-bbb", "1")],
        config,
        dir.path(),
    )
    .await;
    let mut client = plugin_client(&server).await;

    let response = client
        .allocate(Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_i_ds: vec!["GPU-aaa".to_string(), "GPU-bbb".to_string()],
            }],
        }))
        .await
        .unwrap()
        .into_inner();
    let container = &response.container_responses[0];
    assert!(container.envs.get("NVIDIA_VISIBLE_DEVICES").is_none());
    assert_eq!(container.annotations.len(), 1);
    let (key, value) = container.annotations.iter().next().unwrap();
    assert!(key.starts_with("custom.cdi.k8s.io/nvidia-device-plugin_"));
    assert_eq!(value, "nvidia.com/gpu=GPU-aaa,nvidia.com/gpu=GPU-bbb");

    server.stop().await;
}

#[tokio::test]
async fn test_preferred_allocation_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _events) = start_plugin(
        vec![gpu("GPU-aaa", "0"), gpu("GPU-bbb", "1"), gpu("GPU-ccc", "2")],
        Config::default(),
        dir.path(),
    )
    .await;
    let mut client = plugin_client(&server).await;

    let response = client
        .get_preferred_allocation(Request::new(PreferredAllocationRequest {
            container_requests: vec![ContainerPreferredAllocationRequest {
                available_device_i_ds: vec![
                    "GPU-ccc".to_string(),
                    "GPU-bbb".to_string(),
                    "GPU-aaa".to_string(),
                ],
                must_include_device_i_ds: vec![],
                allocation_size: 2,
            }],
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.container_responses[0].device_i_ds,
        vec!["GPU-aaa".to_string(), "GPU-bbb".to_string()]
    );

    server.stop().await;
}

#[tokio::test]
async fn test_xid_events_drive_list_and_watch() {
    let dir = tempfile::tempdir().unwrap();
    let (server, events) = start_plugin(
        vec![gpu("GPU-aaa", "0"), gpu("GPU-bbb", "1")],
        Config::default(),
        dir.path(),
    )
    .await;
    let mut client = plugin_client(&server).await;

    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .unwrap()
        .into_inner();
    let initial = stream.message().await.unwrap().unwrap();
    assert!(initial.devices.iter().all(|d| d.health == "Healthy"));

    // XID 68 is an application-level error: the stream must stay quiet
    events
        .send(CriticalEvent {
            xid: 68,
            uuid: Some("GPU-aaa".to_string()),
            gpu_instance_id: None,
            compute_instance_id: None,
        })
        .await
        .unwrap();
    // XID 79 (fallen off the bus) must produce exactly one update
    events
        .send(CriticalEvent {
            xid: 79,
            uuid: Some("GPU-aaa".to_string()),
            gpu_instance_id: None,
            compute_instance_id: None,
        })
        .await
        .unwrap();

    let update = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("timed out waiting for a ListAndWatch update")
        .unwrap()
        .unwrap();
    let unhealthy: Vec<_> = update
        .devices
        .iter()
        .filter(|d| d.health == "Unhealthy")
        .map(|d| d.id.clone())
        .collect();
    assert_eq!(unhealthy, vec!["GPU-aaa".to_string()]);

    server.stop().await;

    // After stop the stream ends rather than delivering zero-valued devices
    let end = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("timed out waiting for the stream to end");
    match end {
        Ok(None) | Err(_) => (),
        Ok(Some(response)) => panic!("unexpected trailing response: {:?}", response),
    }
}

/// Mock of the kubelet's Registration service, recording register calls.
struct MockKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[async_trait]
impl Registration for MockKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

#[tokio::test]
async fn test_plugin_registers_with_the_kubelet() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet_socket = dir.path().join("kubelet.sock");
    let requests = Arc::new(Mutex::new(Vec::new()));

    let socket = grpc_sock::server::Listener::bind(&kubelet_socket).unwrap();
    let mock = MockKubelet {
        requests: requests.clone(),
    };
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(mock))
            .serve_with_incoming(socket.incoming())
            .await
            .expect("unable to serve mock kubelet");
    });

    let mut config = Config::default();
    config.plugin_directory = dir.path().to_path_buf();
    let config = Arc::new(config);
    let (provider, _events) = MockProvider::new(vec![gpu("GPU-aaa", "0")]);
    let managers = build_resource_managers(provider, config.clone())
        .await
        .unwrap();
    let rm = Arc::new(managers.into_iter().next().unwrap());
    let server = PluginServer::new(
        rm,
        Arc::new(StaticCdiHandler::default()),
        config,
        Some(kubelet_socket),
    );
    server.start().await.expect("start with registration");

    let recorded = requests.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].version, API_VERSION);
    assert_eq!(recorded[0].resource_name, "nvidia.com/gpu");
    assert_eq!(recorded[0].endpoint, "nvidia-gpu.sock");
    assert!(recorded[0]
        .options
        .as_ref()
        .map(|o| o.get_preferred_allocation_available)
        .unwrap_or(false));

    server.stop().await;
}
