//! Core of the NVIDIA Kubernetes device plugin.
//!
//! The pieces fit together like this: the [`supervisor`] builds one
//! [`resource::ResourceManager`] per advertised resource from what the
//! [`provider::DeviceProvider`] enumerates, and runs a [`server::PluginServer`]
//! per manager. Each server owns a UNIX socket under the kubelet's
//! device-plugin directory, registers itself with the kubelet, answers the
//! device plugin RPCs, and streams health transitions produced by its
//! manager's health loop. The supervisor restarts the whole fleet when the
//! kubelet restarts, on SIGHUP, and after failed starts.

pub mod api;
pub mod cdi;
pub mod config;
mod error;
pub mod fs_watch;
pub mod grpc_sock;
pub mod provider;
pub mod resource;
pub mod server;
pub mod supervisor;

pub use error::PluginError;
