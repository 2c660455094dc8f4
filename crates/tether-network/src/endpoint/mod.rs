//! Endpoint clients and the attach/detach lifecycle.
//!
//! An [`EndpointClient`] wires one container interface to the host. Attach
//! runs five steps in a fixed order:
//!
//! 1. [`EndpointClient::add_endpoints`] creates the veth pair
//! 2. [`EndpointClient::add_endpoint_rules`] programs host filters and neighbors
//! 3. [`EndpointClient::move_endpoints_to_container_ns`]
//! 4. [`EndpointClient::setup_container_interfaces`] renames and raises the interface
//! 5. [`EndpointClient::configure_container_interfaces_and_routes`]
//!
//! Detach is driven by the [`EndpointRecord`] attach produced: rules are
//! removed best-effort, then the host link is deleted.

mod bridge;
mod snat;

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tether_common::{EngineConfig, MacAddr, OperatingMode, TetherError, TetherResult};

use crate::ebtables::EbtablesInterface;
use crate::exec::ExecClient;
use crate::iptables::IptablesInterface;
use crate::netlink::NetlinkInterface;
use crate::types::{EndpointInfo, EndpointRecord, ExternalInterface};

pub use bridge::{BridgeEndpointClient, BridgeMode, Bridged, Tunneled};
pub use snat::SnatClient;

/// The host capabilities an endpoint client programs through.
#[derive(Clone)]
pub struct HostServices {
    /// Link, address, route and neighbor configuration.
    pub netlink: Arc<dyn NetlinkInterface>,
    /// Bridging-layer filter.
    pub ebtables: Arc<dyn EbtablesInterface>,
    /// Routing-layer filter.
    pub iptables: Arc<dyn IptablesInterface>,
    /// Command runner for sysctl knobs.
    pub exec: Arc<dyn ExecClient>,
}

impl HostServices {
    /// Services backed by the real host tools.
    #[must_use]
    pub fn system() -> Self {
        let exec: Arc<dyn ExecClient> = Arc::new(crate::exec::CommandExecutor::new());
        Self {
            netlink: Arc::new(crate::netlink::IpRoute2::new(Arc::clone(&exec))),
            ebtables: Arc::new(crate::ebtables::Ebtables::new(Arc::clone(&exec))),
            iptables: Arc::new(crate::iptables::Iptables::new(Arc::clone(&exec))),
            exec,
        }
    }
}

/// One container endpoint's host-side wiring.
#[async_trait]
pub trait EndpointClient: Send + Sync {
    /// Operating mode this client implements.
    fn mode(&self) -> OperatingMode;

    /// Host-side veth name.
    fn host_if_name(&self) -> &str;

    /// Current container-side interface name; the final name after step 4.
    fn container_if_name(&self) -> &str;

    /// Container-side MAC, known once [`Self::add_endpoints`] has run.
    fn container_mac(&self) -> Option<MacAddr>;

    /// Create the veth pair and read back the container MAC.
    async fn add_endpoints(&mut self, info: &EndpointInfo) -> TetherResult<()>;

    /// Attach the host side and install filter rules and neighbor entries.
    async fn add_endpoint_rules(&mut self, info: &EndpointInfo) -> TetherResult<()>;

    /// Move the container side into `info.netns`.
    async fn move_endpoints_to_container_ns(&mut self, info: &EndpointInfo) -> TetherResult<()>;

    /// Rename the container side to its final name and bring it up.
    async fn setup_container_interfaces(&mut self, info: &EndpointInfo) -> TetherResult<()>;

    /// Assign addresses and install routes inside the container.
    async fn configure_container_interfaces_and_routes(
        &mut self,
        info: &EndpointInfo,
    ) -> TetherResult<()>;

    /// Remove the rules and neighbor entries installed for `record`. Never fails.
    async fn delete_endpoint_rules(&self, record: &EndpointRecord);

    /// Delete the host side of `record`; the kernel removes the peer.
    async fn delete_endpoints(&self, record: &EndpointRecord) -> TetherResult<()>;
}

/// Build the client for `config.mode`.
///
/// Veth names come from the endpoint ID. In SNAT mode the endpoint's first
/// IPv4 address is the container's local address on the SNAT bridge, and
/// the uplink MAC becomes the bridge MAC.
///
/// # Errors
///
/// Returns [`TetherError::Config`] when SNAT mode is selected and the bridge
/// address or the endpoint's IPv4 address is missing.
pub fn new_endpoint_client(
    config: &EngineConfig,
    services: HostServices,
    external: &ExternalInterface,
    info: &EndpointInfo,
) -> TetherResult<Box<dyn EndpointClient>> {
    let (host_veth, container_veth) = info.id.veth_names();
    tracing::debug!(mode = ?config.mode, id = %info.id, %host_veth, %container_veth, "Creating endpoint client");

    Ok(match config.mode {
        OperatingMode::Bridge => Box::new(BridgeEndpointClient::<Bridged>::new(
            services,
            external,
            config.addresses.clone(),
            host_veth,
            container_veth,
        )),
        OperatingMode::Tunnel => Box::new(BridgeEndpointClient::<Tunneled>::new(
            services,
            external,
            config.addresses.clone(),
            host_veth,
            container_veth,
        )),
        OperatingMode::Snat => {
            let local_ip: IpNet = info.ipv4_addresses().next().copied().ok_or_else(|| {
                TetherError::Config {
                    message: format!("endpoint {} has no IPv4 address for SNAT", info.id),
                }
            })?;
            Box::new(SnatClient::new(
                services,
                config,
                host_veth,
                container_veth,
                local_ip,
                external.mac,
            )?)
        }
    })
}

/// Run the attach steps in order and return the record detach needs.
///
/// Stops at the first fatal step. Best-effort steps that fail are logged and
/// skipped.
///
/// # Errors
///
/// Returns the failing step's [`TetherError::Step`].
pub async fn attach(
    client: &mut dyn EndpointClient,
    info: &EndpointInfo,
) -> TetherResult<EndpointRecord> {
    tracing::info!(id = %info.id, mode = ?client.mode(), "Attaching endpoint");

    client.add_endpoints(info).await?;
    client.add_endpoint_rules(info).await?;
    client.move_endpoints_to_container_ns(info).await?;
    client.setup_container_interfaces(info).await?;
    client
        .configure_container_interfaces_and_routes(info)
        .await?;

    let mac = client.container_mac().ok_or_else(|| TetherError::LinkMutation {
        name: client.container_if_name().to_string(),
        message: "container MAC unknown after attach".to_string(),
    })?;

    let record = EndpointRecord {
        id: info.id.clone(),
        host_if_name: client.host_if_name().to_string(),
        if_name: client.container_if_name().to_string(),
        ip_addresses: info.ip_addresses.clone(),
        mac,
        netns: info.netns.clone(),
    };
    tracing::info!(id = %record.id, host_if = %record.host_if_name, %mac, "Endpoint attached");
    Ok(record)
}

/// Remove everything [`attach`] installed for `record`.
///
/// Rule removal never fails; the host link deletion can.
///
/// # Errors
///
/// Returns the link deletion failure.
pub async fn detach(client: &dyn EndpointClient, record: &EndpointRecord) -> TetherResult<()> {
    tracing::info!(id = %record.id, host_if = %record.host_if_name, "Detaching endpoint");

    client.delete_endpoint_rules(record).await;
    client.delete_endpoints(record).await
}
