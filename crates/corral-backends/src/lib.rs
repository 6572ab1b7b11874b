//! # corral-backends
//!
//! Implementations of [`ExecutionBackend`]:
//!
//! - [`LocalBackend`]: the agent runs as a child process of this one
//! - [`DockerBackend`]: one worker container per workspace
//! - [`CloudBackend`]: one provisioned cloud app per workspace
//!
//! The two remote variants share [`RemoteBackend`] and differ only in their
//! [`Provisioner`].

#![deny(unsafe_code)]

pub mod address;
pub mod cloud;
pub mod docker;
pub mod local;
pub mod remote;
pub mod worker;

pub mod mock;

use std::sync::Arc;

use corral_core::backend::{BackendKind, ExecutionBackend};
use corral_core::errors::BackendError;
use corral_settings::CorralSettings;
use corral_stream::WireProtocol;

pub use address::{parse_container_address, AddressParseError};
pub use cloud::{CloudBackend, CloudProvisioner, HttpControlPlane};
pub use docker::{DockerBackend, DockerCli, DockerProvisioner};
pub use local::{AgentInvocation, AgentRuntime, ClaudeCliRuntime, LocalBackend};
pub use mock::{MockBackend, MockTurn};
pub use remote::{ExecutionUnit, Provisioner, RemoteBackend};
pub use worker::WorkerClient;

/// Build the backend selected by `settings.backend.kind`.
pub fn backend_from_settings(settings: &CorralSettings) -> Result<Arc<dyn ExecutionBackend>, BackendError> {
    let backend: Arc<dyn ExecutionBackend> = match settings.backend.kind {
        BackendKind::Local => Arc::new(LocalBackend::from_settings(&settings.local)),
        BackendKind::Docker => {
            let client = WorkerClient::new(WireProtocol::Native);
            let runtime = Arc::new(DockerCli::new(settings.docker.runtime_binary.clone()));
            let provisioner = DockerProvisioner::new(runtime, client.clone(), settings.docker.clone());
            Arc::new(DockerBackend::new(Arc::new(provisioner), client))
        }
        BackendKind::Cloud => {
            let protocol = match settings.cloud.protocol.as_str() {
                "a2a" => WireProtocol::A2a,
                _ => WireProtocol::Native,
            };
            let client = WorkerClient::new(protocol);
            let control = Arc::new(HttpControlPlane::from_settings(&settings.cloud)?);
            let provisioner = CloudProvisioner::new(control, client.clone(), settings.cloud.clone());
            Arc::new(CloudBackend::new(Arc::new(provisioner), client))
        }
    };
    tracing::info!(backend = %backend.kind(), "execution backend ready");
    Ok(backend)
}
