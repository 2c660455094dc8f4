//! Bridge and tunnel endpoint clients.
//!
//! Both modes attach the host veth to the uplink bridge and answer ARP for
//! the container's addresses with ebtables. They differ only in which MAC
//! those replies carry and whether the host keeps static neighbor entries
//! for container IPs; [`BridgeMode`] carries that difference.

use std::marker::PhantomData;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tether_common::{MacAddr, OperatingMode, TetherError, TetherResult, WellKnownAddresses};
use tracing::{debug, info};

use super::{EndpointClient, HostServices};
use crate::ebtables::{self, EbRule, EbtablesInterface, RuleAction};
use crate::netlink::NetlinkInterface;
use crate::netutils::NetworkUtils;
use crate::policy::{Operation, check, cleanup, enforce};
use crate::routes;
use crate::types::{EndpointInfo, EndpointRecord, ExternalInterface, NeighborOp, NeighborState};

/// Mode-specific behavior of a [`BridgeEndpointClient`].
pub trait BridgeMode: Send + Sync + 'static {
    /// Mode reported by the client.
    const MODE: OperatingMode;

    /// Whether the host pins a permanent neighbor entry per container IPv4 address.
    const INSTALLS_STATIC_NEIGHBORS: bool;

    /// MAC that ARP replies for the container's addresses resolve to.
    fn arp_reply_mac(container_mac: MacAddr, addrs: &WellKnownAddresses) -> MacAddr;
}

/// Plain bridging: ARP resolves to the container itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bridged;

impl BridgeMode for Bridged {
    const MODE: OperatingMode = OperatingMode::Bridge;
    const INSTALLS_STATIC_NEIGHBORS: bool = true;

    fn arp_reply_mac(container_mac: MacAddr, _addrs: &WellKnownAddresses) -> MacAddr {
        container_mac
    }
}

/// Overlay mode: ARP resolves to the virtual MAC so the host hairpins
/// traffic, and the overlay handles next-hop resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tunneled;

impl BridgeMode for Tunneled {
    const MODE: OperatingMode = OperatingMode::Tunnel;
    const INSTALLS_STATIC_NEIGHBORS: bool = false;

    fn arp_reply_mac(_container_mac: MacAddr, addrs: &WellKnownAddresses) -> MacAddr {
        addrs.virtual_mac
    }
}

/// Endpoint client attaching containers behind the uplink bridge.
pub struct BridgeEndpointClient<M: BridgeMode> {
    bridge_name: String,
    host_primary_if_name: String,
    host_ip_addresses: Vec<IpNet>,
    host_veth_name: String,
    container_veth_name: String,
    container_mac: Option<MacAddr>,
    addresses: WellKnownAddresses,
    netlink: Arc<dyn NetlinkInterface>,
    ebtables: Arc<dyn EbtablesInterface>,
    utils: NetworkUtils,
    _mode: PhantomData<M>,
}

impl<M: BridgeMode> BridgeEndpointClient<M> {
    /// Create a client for one endpoint behind `external`.
    pub fn new(
        services: HostServices,
        external: &ExternalInterface,
        addresses: WellKnownAddresses,
        host_veth_name: impl Into<String>,
        container_veth_name: impl Into<String>,
    ) -> Self {
        Self {
            bridge_name: external.bridge_name.clone(),
            host_primary_if_name: external.name.clone(),
            host_ip_addresses: external.ip_addresses.clone(),
            host_veth_name: host_veth_name.into(),
            container_veth_name: container_veth_name.into(),
            container_mac: None,
            addresses,
            utils: NetworkUtils::new(Arc::clone(&services.netlink), services.exec),
            netlink: services.netlink,
            ebtables: services.ebtables,
            _mode: PhantomData,
        }
    }

    fn require_container_mac(&self) -> TetherResult<MacAddr> {
        self.container_mac.ok_or_else(|| TetherError::LinkMutation {
            name: self.container_veth_name.clone(),
            message: "container MAC not known; create the endpoint first".to_string(),
        })
    }

    async fn add_route_via_host_rules(&self, info: &EndpointInfo) -> TetherResult<()> {
        for ip in &info.ips_to_route_via_host {
            debug!(%ip, "Adding route-via-host redirect");
            let rule = EbRule::broute_redirect(*ip);
            let added = ebtables::append_if_absent(&*self.ebtables, &rule).await;
            check(Operation::AddRouteViaHost, added.map(drop))?;
        }
        Ok(())
    }

    async fn add_ipv6_config(
        &self,
        link: &dyn NetlinkInterface,
        info: &EndpointInfo,
    ) -> TetherResult<()> {
        debug!(if_name = %self.container_veth_name, "Adding IPv6 routes");

        let composed = routes::ipv6_routes(info, &self.host_ip_addresses, &self.addresses);
        if let Some(ipv6_routes) = enforce(Operation::AddIpv6Routes, composed)? {
            let installed =
                NetworkUtils::add_routes(link, &self.container_veth_name, &ipv6_routes).await;
            check(Operation::AddIpv6Routes, installed)?;
        }

        let gateway = routes::ipv6_gateway_neighbor(&self.container_veth_name, &self.addresses);
        check(
            Operation::AddIpv6Neighbor,
            link.set_or_remove_neighbor(&gateway, NeighborOp::Add, NeighborState::Permanent)
                .await,
        )
    }
}

#[async_trait]
impl<M: BridgeMode> EndpointClient for BridgeEndpointClient<M> {
    fn mode(&self) -> OperatingMode {
        M::MODE
    }

    fn host_if_name(&self) -> &str {
        &self.host_veth_name
    }

    fn container_if_name(&self) -> &str {
        &self.container_veth_name
    }

    fn container_mac(&self) -> Option<MacAddr> {
        self.container_mac
    }

    async fn add_endpoints(&mut self, _info: &EndpointInfo) -> TetherResult<()> {
        check(
            Operation::CreateVeth,
            self.utils
                .create_endpoint(&self.host_veth_name, &self.container_veth_name, None)
                .await,
        )?;

        let mac = self.netlink.hardware_address(&self.container_veth_name).await;
        if let Some(mac) = enforce(Operation::ReadContainerMac, mac)? {
            self.container_mac = Some(mac);
        }
        Ok(())
    }

    async fn add_endpoint_rules(&mut self, info: &EndpointInfo) -> TetherResult<()> {
        let container_mac = self.require_container_mac()?;
        let arp_mac = M::arp_reply_mac(container_mac, &self.addresses);

        debug!(host_veth = %self.host_veth_name, bridge = %self.bridge_name, "Setting link master");
        check(
            Operation::SetLinkMaster,
            self.netlink
                .set_link_master(&self.host_veth_name, &self.bridge_name)
                .await,
        )?;

        for addr in &info.ip_addresses {
            let ip = addr.addr();

            if let IpAddr::V4(v4) = ip {
                debug!(%ip, mac = %arp_mac, "Adding ARP reply");
                let rule = EbRule::arp_reply(v4, arp_mac);
                check(
                    Operation::AddArpReply,
                    self.ebtables.apply(&rule, RuleAction::Append).await,
                )?;
            }

            debug!(%ip, mac = %container_mac, "Adding MAC DNAT");
            let rule = EbRule::dnat_for_ip(&self.host_primary_if_name, ip, container_mac);
            check(
                Operation::AddDnat,
                self.ebtables.apply(&rule, RuleAction::Append).await,
            )?;

            if M::INSTALLS_STATIC_NEIGHBORS && ip.is_ipv4() {
                debug!(%ip, bridge = %self.bridge_name, "Adding static neighbor");
                let neighbor = routes::bridge_neighbor(&self.bridge_name, ip, Some(container_mac));
                check(
                    Operation::AddStaticNeighbor,
                    self.netlink
                        .set_or_remove_neighbor(&neighbor, NeighborOp::Add, NeighborState::Permanent)
                        .await,
                )?;
            }
        }

        self.add_route_via_host_rules(info).await?;

        debug!(host_veth = %self.host_veth_name, "Enabling hairpin");
        check(
            Operation::SetHairpin,
            self.netlink.set_link_hairpin(&self.host_veth_name, true).await,
        )
    }

    async fn move_endpoints_to_container_ns(&mut self, info: &EndpointInfo) -> TetherResult<()> {
        debug!(container_veth = %self.container_veth_name, netns = %info.netns, "Moving endpoint to namespace");
        check(
            Operation::MoveToNamespace,
            self.netlink
                .set_link_netns(&self.container_veth_name, &info.netns)
                .await,
        )
    }

    async fn setup_container_interfaces(&mut self, info: &EndpointInfo) -> TetherResult<()> {
        let link = self.netlink.in_namespace(&info.netns);
        check(
            Operation::RenameInterface,
            NetworkUtils::setup_container_interface(&*link, &self.container_veth_name, &info.if_name)
                .await,
        )?;
        self.container_veth_name = info.if_name.clone();
        Ok(())
    }

    async fn configure_container_interfaces_and_routes(
        &mut self,
        info: &EndpointInfo,
    ) -> TetherResult<()> {
        let link = self.netlink.in_namespace(&info.netns);

        check(
            Operation::AssignAddress,
            NetworkUtils::assign_ip_to_interface(&*link, &self.container_veth_name, &info.ip_addresses)
                .await,
        )?;
        check(
            Operation::AddRoute,
            NetworkUtils::add_routes(&*link, &self.container_veth_name, &info.routes).await,
        )?;

        if info.ipv6_enabled() {
            self.add_ipv6_config(&*link, info).await?;
        }

        info!(if_name = %self.container_veth_name, netns = %info.netns, "Container interface configured");
        Ok(())
    }

    async fn delete_endpoint_rules(&self, record: &EndpointRecord) {
        let arp_mac = M::arp_reply_mac(record.mac, &self.addresses);

        for addr in &record.ip_addresses {
            let ip = addr.addr();

            if let IpAddr::V4(v4) = ip {
                debug!(%ip, "Removing ARP reply");
                let rule = EbRule::arp_reply(v4, arp_mac);
                cleanup(
                    Operation::DeleteArpReply,
                    self.ebtables.apply(&rule, RuleAction::Delete).await,
                );
            }

            debug!(%ip, "Removing MAC DNAT");
            let rule = EbRule::dnat_for_ip(&self.host_primary_if_name, ip, record.mac);
            cleanup(
                Operation::DeleteDnat,
                self.ebtables.apply(&rule, RuleAction::Delete).await,
            );

            if M::INSTALLS_STATIC_NEIGHBORS && ip.is_ipv4() {
                debug!(%ip, bridge = %self.bridge_name, "Removing static neighbor");
                let neighbor = routes::bridge_neighbor(&self.bridge_name, ip, None);
                cleanup(
                    Operation::DeleteStaticNeighbor,
                    self.netlink
                        .set_or_remove_neighbor(&neighbor, NeighborOp::Remove, NeighborState::Incomplete)
                        .await,
                );
            }
        }
    }

    async fn delete_endpoints(&self, record: &EndpointRecord) -> TetherResult<()> {
        debug!(host_if = %record.host_if_name, "Deleting host veth");
        check(
            Operation::DeleteLink,
            self.netlink.delete_link(&record.host_if_name).await,
        )
    }
}
