//! Shared hub runtime state.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use {
    trellis_bridge::NotifyBridge,
    trellis_config::HubConfig,
    trellis_protocol::{Address, EntityKind, STORE_TIMEOUT_MS},
    trellis_store::{AuthStore, EndpointConfig, EndpointStore, LogStore},
};

use crate::registry::Registry;

/// Requests handed from the dispatcher back to the lifecycle loop.
#[derive(Debug)]
pub enum HubControl {
    /// Drain finished; reload everything, upsert the staged endpoints, and
    /// start listening again.
    Restart {
        staged_endpoints: Vec<EndpointConfig>,
    },
    /// Terminate the process-level serve loop.
    Shutdown,
}

/// Everything a connection task needs, behind one `Arc`. Rebuilt from scratch
/// on every lifecycle cycle, so the registry is always empty on restart and
/// the config needs no interior mutability.
pub struct HubState {
    pub config: HubConfig,
    pub registry: Registry,
    pub auth: Arc<dyn AuthStore>,
    pub endpoints: Arc<dyn EndpointStore>,
    pub log: Arc<dyn LogStore>,
    pub bridge: Arc<dyn NotifyBridge>,
    control: mpsc::Sender<HubControl>,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        auth: Arc<dyn AuthStore>,
        endpoints: Arc<dyn EndpointStore>,
        log: Arc<dyn LogStore>,
        bridge: Arc<dyn NotifyBridge>,
        control: mpsc::Sender<HubControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            auth,
            endpoints,
            log,
            bridge,
            control,
        })
    }

    /// The server's own fully-specified address.
    pub fn server_address(&self) -> &Address {
        &self.config.address
    }

    /// The tenancy domain every admitted client must share.
    pub fn domain(&self) -> &str {
        &self.config.address.domain
    }

    /// The identity attached to events originating from the notify bridge.
    pub fn bridge_address(&self) -> Address {
        Address {
            domain: self.domain().to_string(),
            kind: EntityKind::Telegram,
            ..Address::default()
        }
    }

    pub async fn request_control(&self, control: HubControl) {
        // The lifecycle loop owns the receiver; a full queue means a restart
        // is already in flight and this request is redundant.
        let _ = self.control.send(control).await;
    }
}

/// Bound a persistent-store future by the ambient store deadline. The outer
/// `Err` is the timeout.
pub async fn store_call<T>(
    fut: impl Future<Output = T> + Send,
) -> Result<T, tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_millis(STORE_TIMEOUT_MS), fut).await
}
