//! Low-level interface procedures shared by every endpoint client.

use std::sync::Arc;

use ipnet::IpNet;
use tether_common::{MacAddr, TetherResult};

use crate::exec::{ExecClient, args};
use crate::iptables::{self, ACCEPT, DROP, FILTER, FORWARD, INPUT, IptRule, IptablesInterface, OUTPUT};
use crate::netlink::NetlinkInterface;
use crate::types::{LinkInfo, RouteInfo};

/// RFC 1918 ranges blocked on the SNAT bridge.
pub const PRIVATE_IP_SPACE: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// Stateless helpers over the injected link interface and command executor.
#[derive(Clone)]
pub struct NetworkUtils {
    netlink: Arc<dyn NetlinkInterface>,
    exec: Arc<dyn ExecClient>,
}

impl NetworkUtils {
    /// Create helpers bound to `netlink` and `exec`.
    pub fn new(netlink: Arc<dyn NetlinkInterface>, exec: Arc<dyn ExecClient>) -> Self {
        Self { netlink, exec }
    }

    /// Create a veth pair, bring the host end up and stop it accepting router advertisements.
    pub async fn create_endpoint(
        &self,
        host_veth: &str,
        container_veth: &str,
        mac: Option<MacAddr>,
    ) -> TetherResult<()> {
        tracing::debug!(host_veth, container_veth, "Creating veth pair");

        self.netlink
            .add_link(&LinkInfo::veth(host_veth, container_veth, mac))
            .await?;
        self.netlink.set_link_state(host_veth, true).await?;
        self.disable_ra_for_interface(host_veth).await
    }

    /// Rename `current` to `target` and bring it up, through `netlink`.
    ///
    /// `netlink` is normally a namespaced view obtained from
    /// [`NetlinkInterface::in_namespace`].
    pub async fn setup_container_interface(
        netlink: &dyn NetlinkInterface,
        current: &str,
        target: &str,
    ) -> TetherResult<()> {
        tracing::debug!(current, target, "Renaming container interface");

        netlink.set_link_state(current, false).await?;
        netlink.set_link_name(current, target).await?;
        netlink.set_link_state(target, true).await
    }

    /// Assign each address to `name`. An address already present is skipped.
    pub async fn assign_ip_to_interface(
        netlink: &dyn NetlinkInterface,
        name: &str,
        addresses: &[IpNet],
    ) -> TetherResult<()> {
        for addr in addresses {
            tracing::debug!(name, %addr, "Assigning address");
            match netlink.add_ip_address(name, *addr).await {
                Err(e) if e.is_already_exists() => {
                    tracing::debug!(name, %addr, "Address already assigned");
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Install each route out of `name`. A route already present is skipped.
    pub async fn add_routes(
        netlink: &dyn NetlinkInterface,
        name: &str,
        routes: &[RouteInfo],
    ) -> TetherResult<()> {
        for route in routes {
            tracing::debug!(name, dst = %route.dst, gw = ?route.gw, "Adding route");
            match netlink.add_route(name, route).await {
                Err(e) if e.is_already_exists() => {
                    tracing::debug!(name, dst = %route.dst, "Route already present");
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Answer ARP on behalf of hosts behind `name`.
    pub async fn set_proxy_arp(&self, name: &str) -> TetherResult<()> {
        tracing::debug!(name, "Enabling proxy ARP");
        self.sysctl(&format!("net.ipv4.conf.{name}.proxy_arp=1")).await
    }

    /// Stop `name` from accepting IPv6 router advertisements.
    pub async fn disable_ra_for_interface(&self, name: &str) -> TetherResult<()> {
        tracing::debug!(name, "Disabling router advertisements");
        self.sysctl(&format!("net.ipv6.conf.{name}.accept_ra=0")).await
    }

    async fn sysctl(&self, setting: &str) -> TetherResult<()> {
        self.exec
            .execute("sysctl", &args(["-w", setting]))
            .await
            .map(drop)
    }
}

fn address_filter_rules(bridge: &str, addr: &str, target: &str) -> [IptRule; 3] {
    [
        IptRule::v4(FILTER, FORWARD, format!("-o {bridge} -d {addr}"), target),
        IptRule::v4(FILTER, OUTPUT, format!("-o {bridge} -d {addr}"), target),
        IptRule::v4(FILTER, INPUT, format!("-i {bridge} -s {addr}"), target),
    ]
}

/// Insert ACCEPT rules so `addresses` stay reachable through `bridge`.
pub async fn allow_ip_addresses(
    ipt: &dyn IptablesInterface,
    bridge: &str,
    addresses: &[IpNet],
) -> TetherResult<()> {
    for addr in addresses {
        tracing::debug!(bridge, %addr, "Allowing address on bridge");
        for rule in address_filter_rules(bridge, &addr.to_string(), ACCEPT) {
            iptables::ensure_inserted(ipt, &rule).await?;
        }
    }
    Ok(())
}

/// Append DROP rules for the private address space on `bridge`.
pub async fn block_ip_addresses(ipt: &dyn IptablesInterface, bridge: &str) -> TetherResult<()> {
    for range in PRIVATE_IP_SPACE {
        tracing::debug!(bridge, range, "Blocking range on bridge");
        for rule in address_filter_rules(bridge, range, DROP) {
            iptables::ensure_appended(ipt, &rule).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeExec, FakeIptables, FakeNetlink};

    #[tokio::test]
    async fn create_endpoint_brings_host_up() {
        let netlink = FakeNetlink::new();
        let exec = Arc::new(FakeExec::new());
        let nu = NetworkUtils::new(Arc::new(netlink.clone()), exec.clone());

        nu.create_endpoint("vth1", "vtc1", None).await.unwrap();

        assert!(netlink.link_is_up("vth1"));
        assert!(netlink.has_link("vtc1"));
        assert_eq!(
            exec.commands(),
            vec!["sysctl -w net.ipv6.conf.vth1.accept_ra=0"]
        );
    }

    #[tokio::test]
    async fn setup_container_interface_renames_once() {
        let netlink = FakeNetlink::new();
        netlink.seed_link("vtc1");

        NetworkUtils::setup_container_interface(&netlink, "vtc1", "eth0")
            .await
            .unwrap();

        assert!(!netlink.has_link("vtc1"));
        assert!(netlink.link_is_up("eth0"));
    }

    #[tokio::test]
    async fn reassigning_addresses_is_harmless() {
        let netlink = FakeNetlink::new();
        netlink.seed_link("eth0");
        let addrs: Vec<IpNet> = vec!["10.0.0.5/24".parse().unwrap(), "fd00::5/64".parse().unwrap()];

        NetworkUtils::assign_ip_to_interface(&netlink, "eth0", &addrs[..1])
            .await
            .unwrap();
        NetworkUtils::assign_ip_to_interface(&netlink, "eth0", &addrs)
            .await
            .unwrap();

        assert_eq!(netlink.addresses("eth0"), addrs);
    }

    #[tokio::test]
    async fn proxy_arp_sysctl() {
        let exec = Arc::new(FakeExec::new());
        let nu = NetworkUtils::new(Arc::new(FakeNetlink::new()), exec.clone());

        nu.set_proxy_arp("snatbr0").await.unwrap();
        assert_eq!(
            exec.commands(),
            vec!["sysctl -w net.ipv4.conf.snatbr0.proxy_arp=1"]
        );
    }

    #[tokio::test]
    async fn block_then_allow_filters() {
        let ipt = FakeIptables::new();

        block_ip_addresses(&ipt, "snatbr0").await.unwrap();
        allow_ip_addresses(&ipt, "snatbr0", &["10.1.0.4/32".parse().unwrap()])
            .await
            .unwrap();
        // Re-running adds nothing.
        block_ip_addresses(&ipt, "snatbr0").await.unwrap();

        let forward = ipt.chain_rules(FILTER, FORWARD);
        assert_eq!(forward.len(), 4);
        assert_eq!(forward[0], "-o snatbr0 -d 10.1.0.4/32 -j ACCEPT");
        assert_eq!(forward[1], "-o snatbr0 -d 10.0.0.0/8 -j DROP");
    }
}
