//! SNAT bridge endpoint client.
//!
//! The SNAT bridge is a host-wide singleton giving containers outbound
//! access through masquerade while keeping them off the rest of the virtual
//! network. Every endpoint client provisions it on demand; it is never
//! deleted by an endpoint teardown.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use once_cell::sync::Lazy;
use tether_common::{EngineConfig, MacAddr, OperatingMode, SnatConfig, TetherError, TetherResult};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{EndpointClient, HostServices};
use crate::ebtables::{self, EbRule, EbtablesInterface, RuleAction};
use crate::iptables::{
    self, ACCEPT, ESTABLISHED, FILTER, INPUT, IpVersion, IptRule, IptablesInterface, MASQUERADE,
    NAT, OUTPUT, POSTROUTING, RELATED, TETHER_INPUT, TETHER_OUTPUT,
};
use crate::netlink::NetlinkInterface;
use crate::netutils::{self, NetworkUtils};
use crate::policy::{Operation, check, cleanup, enforce};
use crate::routes;
use crate::types::{EndpointInfo, EndpointRecord, LinkInfo, NeighborOp, NeighborState, NetnsHandle};

/// Serializes SNAT bridge provisioning and shared-rule mutation on this host.
static SNAT_BRIDGE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Endpoint client for the SNAT bridge.
pub struct SnatClient {
    config: SnatConfig,
    imds_ip: IpNet,
    bridge_ip: IpNet,
    local_ip: IpNet,
    host_primary_mac: MacAddr,
    host_snat_veth_name: String,
    container_snat_veth_name: String,
    container_mac: Option<MacAddr>,
    netlink: Arc<dyn NetlinkInterface>,
    ebtables: Arc<dyn EbtablesInterface>,
    iptables: Arc<dyn IptablesInterface>,
    utils: NetworkUtils,
}

impl SnatClient {
    /// Create a client placing `local_ip` on the SNAT bridge.
    ///
    /// `host_primary_mac` becomes the bridge's hardware address.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] if no bridge address is configured.
    pub fn new(
        services: HostServices,
        config: &EngineConfig,
        host_snat_veth_name: impl Into<String>,
        container_snat_veth_name: impl Into<String>,
        local_ip: IpNet,
        host_primary_mac: MacAddr,
    ) -> TetherResult<Self> {
        let bridge_ip = config.snat.bridge_ip.ok_or_else(|| TetherError::Config {
            message: "snat.bridge_ip is required for the SNAT bridge".to_string(),
        })?;

        Ok(Self {
            config: config.snat.clone(),
            imds_ip: IpNet::V4(config.addresses.imds_ip),
            bridge_ip,
            local_ip,
            host_primary_mac,
            host_snat_veth_name: host_snat_veth_name.into(),
            container_snat_veth_name: container_snat_veth_name.into(),
            container_mac: None,
            utils: NetworkUtils::new(Arc::clone(&services.netlink), services.exec),
            netlink: services.netlink,
            ebtables: services.ebtables,
            iptables: services.iptables,
        })
    }

    fn bridge(&self) -> &str {
        &self.config.bridge_name
    }

    /// Provision the bridge and its shared rules, then create and enslave the SNAT veth pair.
    pub async fn create_snat_endpoint(&mut self) -> TetherResult<()> {
        {
            let _guard = SNAT_BRIDGE_LOCK.lock().await;

            check(Operation::ProvisionSnatBridge, self.create_snat_bridge().await)?;

            if self.config.enable_proxy_arp {
                check(
                    Operation::EnableProxyArp,
                    self.utils.set_proxy_arp(self.bridge()).await,
                )?;
            }

            let masquerade = self.masquerade_rule();
            check(
                Operation::AddMasquerade,
                iptables::ensure_inserted(&*self.iptables, &masquerade)
                    .await
                    .map(drop),
            )?;

            let vlan_drop = EbRule::vlan_drop();
            check(
                Operation::AddVlanDrop,
                ebtables::append_if_absent(&*self.ebtables, &vlan_drop)
                    .await
                    .map(drop),
            )?;
        }

        check(
            Operation::CreateVeth,
            self.utils
                .create_endpoint(&self.host_snat_veth_name, &self.container_snat_veth_name, None)
                .await,
        )?;

        let mac = self
            .netlink
            .hardware_address(&self.container_snat_veth_name)
            .await;
        if let Some(mac) = enforce(Operation::ReadContainerMac, mac)? {
            self.container_mac = Some(mac);
        }

        debug!(host_veth = %self.host_snat_veth_name, bridge = %self.bridge(), "Setting link master");
        check(
            Operation::SetLinkMaster,
            self.netlink
                .set_link_master(&self.host_snat_veth_name, self.bridge())
                .await,
        )
    }

    async fn create_snat_bridge(&self) -> TetherResult<()> {
        let bridge = self.bridge();

        if self.netlink.link_exists(bridge).await? {
            debug!(bridge, "SNAT bridge already exists");
        } else {
            info!(bridge, "Creating SNAT bridge");
            match self.netlink.add_link(&LinkInfo::bridge(bridge)).await {
                Err(e) if e.is_already_exists() => debug!(bridge, "SNAT bridge created concurrently"),
                other => other?,
            }
        }

        self.netlink
            .set_link_address(bridge, self.host_primary_mac)
            .await?;
        self.utils.disable_ra_for_interface(bridge).await?;

        debug!(bridge, addr = %self.bridge_ip, "Assigning SNAT bridge address");
        match self.netlink.add_ip_address(bridge, self.bridge_ip).await {
            Err(e) if e.is_already_exists() => debug!(bridge, "SNAT bridge address already present"),
            other => other?,
        }

        self.netlink.set_link_state(bridge, true).await
    }

    fn masquerade_rule(&self) -> IptRule {
        IptRule::v4(
            NAT,
            POSTROUTING,
            format!("-s {}", self.bridge_ip.trunc()),
            MASQUERADE,
        )
    }

    /// Keep the skip-list and the metadata address reachable through the bridge.
    pub async fn allow_ip_addresses_on_snat_bridge(&self) -> TetherResult<()> {
        let mut allowed = self.config.skip_addresses_from_block.clone();
        if !allowed.contains(&self.imds_ip) {
            allowed.push(self.imds_ip);
        }

        let _guard = SNAT_BRIDGE_LOCK.lock().await;
        check(
            Operation::SetAddressFilter,
            netutils::allow_ip_addresses(&*self.iptables, self.bridge(), &allowed).await,
        )
    }

    /// Drop private-range traffic crossing the bridge.
    pub async fn block_ip_addresses_on_snat_bridge(&self) -> TetherResult<()> {
        let _guard = SNAT_BRIDGE_LOCK.lock().await;
        check(
            Operation::SetAddressFilter,
            netutils::block_ip_addresses(&*self.iptables, self.bridge()).await,
        )
    }

    /// Move the container side of the SNAT veth into `netns`.
    pub async fn move_snat_endpoint_to_container_ns(&self, netns: &NetnsHandle) -> TetherResult<()> {
        debug!(container_veth = %self.container_snat_veth_name, %netns, "Moving SNAT endpoint to namespace");
        check(
            Operation::MoveToNamespace,
            self.netlink
                .set_link_netns(&self.container_snat_veth_name, netns)
                .await,
        )
    }

    /// Rename the container side to the configured SNAT interface name.
    pub async fn setup_snat_container_interface(&mut self, netns: &NetnsHandle) -> TetherResult<()> {
        let link = self.netlink.in_namespace(netns);
        check(
            Operation::RenameInterface,
            NetworkUtils::setup_container_interface(
                &*link,
                &self.container_snat_veth_name,
                &self.config.container_if_name,
            )
            .await,
        )?;
        self.container_snat_veth_name = self.config.container_if_name.clone();
        Ok(())
    }

    /// Assign the local SNAT address inside the container.
    pub async fn configure_snat_container_interface(&self, netns: &NetnsHandle) -> TetherResult<()> {
        let link = self.netlink.in_namespace(netns);
        check(
            Operation::AssignAddress,
            NetworkUtils::assign_ip_to_interface(
                &*link,
                &self.container_snat_veth_name,
                &[self.local_ip],
            )
            .await,
        )
    }

    async fn ensure_chain_jump(&self, builtin: &str, chain: &str) -> TetherResult<()> {
        check(
            Operation::CreateChain,
            self.iptables.create_chain(IpVersion::V4, FILTER, chain).await,
        )?;
        let jump = IptRule::v4(FILTER, builtin, "", chain);
        check(
            Operation::CreateChain,
            iptables::ensure_inserted(&*self.iptables, &jump)
                .await
                .map(drop),
        )
    }

    async fn insert_directional_rule(&self, rule: IptRule) -> TetherResult<()> {
        debug!(%rule, "Adding directional rule");
        check(
            Operation::AddDirectionalRule,
            iptables::ensure_inserted(&*self.iptables, &rule)
                .await
                .map(drop),
        )
    }

    fn host_to_nc_rule(&self, local_ip: IpAddr) -> IptRule {
        IptRule::v4(
            FILTER,
            TETHER_OUTPUT,
            format!("-s {} -d {local_ip}", self.bridge_ip.addr()),
            ACCEPT,
        )
    }

    fn nc_to_host_rule(&self, local_ip: IpAddr) -> IptRule {
        IptRule::v4(
            FILTER,
            TETHER_INPUT,
            format!("-s {local_ip} -d {}", self.bridge_ip.addr()),
            ACCEPT,
        )
    }

    fn established_rule(&self, chain: &str, direction: &str) -> IptRule {
        IptRule::v4(
            FILTER,
            chain,
            format!(
                "{direction} {} -m state --state {ESTABLISHED},{RELATED}",
                self.bridge()
            ),
            ACCEPT,
        )
    }

    fn container_neighbor(&self, local_ip: IpAddr, mac: Option<MacAddr>) -> LinkInfo {
        routes::bridge_neighbor(self.bridge(), local_ip, mac)
    }

    /// SNAT address recorded for an endpoint, falling back to this client's.
    fn recorded_local_ip(&self, record: &EndpointRecord) -> IpAddr {
        record
            .ip_addresses
            .iter()
            .map(IpNet::addr)
            .find(IpAddr::is_ipv4)
            .unwrap_or_else(|| self.local_ip.addr())
    }

    async fn add_container_neighbor(&self) -> TetherResult<()> {
        let mac = match self.container_mac {
            Some(mac) => Some(mac),
            None => {
                let read = self
                    .netlink
                    .hardware_address(&self.container_snat_veth_name)
                    .await;
                enforce(Operation::AddStaticNeighbor, read)?
            }
        };
        let Some(mac) = mac else {
            return Ok(());
        };

        debug!(ip = %self.local_ip.addr(), %mac, bridge = %self.bridge(), "Adding SNAT neighbor");
        check(
            Operation::AddStaticNeighbor,
            self.netlink
                .set_or_remove_neighbor(
                    &self.container_neighbor(self.local_ip.addr(), Some(mac)),
                    NeighborOp::Add,
                    NeighborState::Permanent,
                )
                .await,
        )
    }

    async fn remove_container_neighbor(&self, local_ip: IpAddr) {
        cleanup(
            Operation::DeleteStaticNeighbor,
            self.netlink
                .set_or_remove_neighbor(
                    &self.container_neighbor(local_ip, None),
                    NeighborOp::Remove,
                    NeighborState::Incomplete,
                )
                .await,
        );
    }

    /// Let the host open connections to the container; only replies flow back.
    pub async fn allow_inbound_from_host_to_nc(&self) -> TetherResult<()> {
        {
            let _guard = SNAT_BRIDGE_LOCK.lock().await;
            self.ensure_chain_jump(OUTPUT, TETHER_OUTPUT).await?;
            self.insert_directional_rule(self.host_to_nc_rule(self.local_ip.addr()))
                .await?;
            self.ensure_chain_jump(INPUT, TETHER_INPUT).await?;
            self.insert_directional_rule(self.established_rule(TETHER_INPUT, "-i"))
                .await?;
        }
        self.add_container_neighbor().await
    }

    /// Let the container open connections to the host; only replies flow back.
    pub async fn allow_inbound_from_nc_to_host(&self) -> TetherResult<()> {
        {
            let _guard = SNAT_BRIDGE_LOCK.lock().await;
            self.ensure_chain_jump(INPUT, TETHER_INPUT).await?;
            self.insert_directional_rule(self.nc_to_host_rule(self.local_ip.addr()))
                .await?;
            self.ensure_chain_jump(OUTPUT, TETHER_OUTPUT).await?;
            self.insert_directional_rule(self.established_rule(TETHER_OUTPUT, "-o"))
                .await?;
        }
        self.add_container_neighbor().await
    }

    /// Remove the host-to-container allow rule and the neighbor entry for `local_ip`.
    pub async fn delete_inbound_from_host_to_nc(&self, local_ip: IpAddr) {
        let rule = self.host_to_nc_rule(local_ip);
        debug!(%rule, "Removing directional rule");
        cleanup(
            Operation::DeleteDirectionalRule,
            iptables::delete_if_present(&*self.iptables, &rule)
                .await
                .map(drop),
        );
        self.remove_container_neighbor(local_ip).await;
    }

    /// Remove the container-to-host allow rule and the neighbor entry for `local_ip`.
    pub async fn delete_inbound_from_nc_to_host(&self, local_ip: IpAddr) {
        let rule = self.nc_to_host_rule(local_ip);
        debug!(%rule, "Removing directional rule");
        cleanup(
            Operation::DeleteDirectionalRule,
            iptables::delete_if_present(&*self.iptables, &rule)
                .await
                .map(drop),
        );
        self.remove_container_neighbor(local_ip).await;
    }

    /// Drop ARP for the bridge's link-local range arriving on the SNAT veth.
    pub async fn drop_arp_for_snat_bridge_apipa_range(&self) -> TetherResult<()> {
        let rule = EbRule::arp_drop_for_cidr(self.bridge_ip, &self.host_snat_veth_name);
        check(
            Operation::AddArpDrop,
            ebtables::append_if_absent(&*self.ebtables, &rule)
                .await
                .map(drop),
        )
    }

    /// Remove the ARP drop installed for `host_veth`.
    pub async fn delete_arp_drop_for_snat_bridge_apipa_range(&self, host_veth: &str) {
        let rule = EbRule::arp_drop_for_cidr(self.bridge_ip, host_veth);
        debug!(%rule, "Removing ARP drop");
        cleanup(
            Operation::DeleteArpDrop,
            self.ebtables.apply(&rule, RuleAction::Delete).await,
        );
    }

    /// Delete the host side of the SNAT veth. The bridge stays.
    pub async fn delete_snat_endpoint(&self) -> TetherResult<()> {
        debug!(host_veth = %self.host_snat_veth_name, "Deleting SNAT veth");
        check(
            Operation::DeleteLink,
            self.netlink.delete_link(&self.host_snat_veth_name).await,
        )
    }
}

#[async_trait]
impl EndpointClient for SnatClient {
    fn mode(&self) -> OperatingMode {
        OperatingMode::Snat
    }

    fn host_if_name(&self) -> &str {
        &self.host_snat_veth_name
    }

    fn container_if_name(&self) -> &str {
        &self.container_snat_veth_name
    }

    fn container_mac(&self) -> Option<MacAddr> {
        self.container_mac
    }

    async fn add_endpoints(&mut self, _info: &EndpointInfo) -> TetherResult<()> {
        self.create_snat_endpoint().await
    }

    async fn add_endpoint_rules(&mut self, _info: &EndpointInfo) -> TetherResult<()> {
        self.block_ip_addresses_on_snat_bridge().await?;
        self.allow_ip_addresses_on_snat_bridge().await?;
        self.drop_arp_for_snat_bridge_apipa_range().await?;

        if self.config.allow_inbound_from_host_to_nc {
            self.allow_inbound_from_host_to_nc().await?;
        }
        if self.config.allow_inbound_from_nc_to_host {
            self.allow_inbound_from_nc_to_host().await?;
        }
        Ok(())
    }

    async fn move_endpoints_to_container_ns(&mut self, info: &EndpointInfo) -> TetherResult<()> {
        self.move_snat_endpoint_to_container_ns(&info.netns).await
    }

    async fn setup_container_interfaces(&mut self, info: &EndpointInfo) -> TetherResult<()> {
        self.setup_snat_container_interface(&info.netns).await
    }

    async fn configure_container_interfaces_and_routes(
        &mut self,
        info: &EndpointInfo,
    ) -> TetherResult<()> {
        self.configure_snat_container_interface(&info.netns).await?;
        info!(if_name = %self.container_snat_veth_name, ip = %self.local_ip, "SNAT interface configured");
        Ok(())
    }

    async fn delete_endpoint_rules(&self, record: &EndpointRecord) {
        let local_ip = self.recorded_local_ip(record);
        if self.config.allow_inbound_from_host_to_nc {
            self.delete_inbound_from_host_to_nc(local_ip).await;
        }
        if self.config.allow_inbound_from_nc_to_host {
            self.delete_inbound_from_nc_to_host(local_ip).await;
        }
        self.delete_arp_drop_for_snat_bridge_apipa_range(&record.host_if_name)
            .await;
    }

    async fn delete_endpoints(&self, record: &EndpointRecord) -> TetherResult<()> {
        debug!(host_if = %record.host_if_name, "Deleting SNAT veth");
        check(
            Operation::DeleteLink,
            self.netlink.delete_link(&record.host_if_name).await,
        )
    }
}
