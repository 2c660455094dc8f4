//! Endpoint intent, kernel descriptors and the durable endpoint record.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tether_common::{EndpointId, MacAddr};

/// A network namespace the container side of an endpoint is moved into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetnsHandle {
    /// Namespace file, e.g. `/var/run/netns/ns1` or `/proc/42/ns/net`.
    Path(PathBuf),
    /// Namespace of a running process.
    Pid(u32),
}

impl NetnsHandle {
    /// Namespace referenced by a bind-mounted or procfs path.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Argument accepted by `ip link set ... netns`.
    #[must_use]
    pub fn as_ip_arg(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Pid(pid) => pid.to_string(),
        }
    }
}

impl fmt::Display for NetnsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Pid(pid) => write!(f, "pid:{pid}"),
        }
    }
}

/// A route to install on an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Destination prefix.
    pub dst: IpNet,
    /// Next hop, if any.
    #[serde(default)]
    pub gw: Option<IpAddr>,
    /// Route metric.
    #[serde(default)]
    pub priority: Option<u32>,
}

impl RouteInfo {
    /// An on-link route with no gateway.
    #[must_use]
    pub fn direct(dst: IpNet) -> Self {
        Self {
            dst,
            gw: None,
            priority: None,
        }
    }

    /// A route through `gw`.
    #[must_use]
    pub fn via(dst: IpNet, gw: IpAddr) -> Self {
        Self {
            dst,
            gw: Some(gw),
            priority: None,
        }
    }

    /// Set the route metric.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Kind of kernel link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkType {
    /// Type not relevant (neighbor mutations).
    #[default]
    Unspecified,
    /// Linux bridge.
    Bridge,
    /// Veth pair; `peer` is the name of the other end.
    Veth {
        /// Name of the peer interface.
        peer: String,
    },
}

/// Kernel link descriptor, used for link creation and neighbor mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkInfo {
    /// Interface name.
    pub name: String,
    /// Link kind.
    pub link_type: LinkType,
    /// Neighbor IP (neighbor mutation only).
    pub ip_addr: Option<IpAddr>,
    /// Hardware address: link MAC on creation, neighbor MAC on mutation.
    pub mac: Option<MacAddr>,
}

impl LinkInfo {
    /// A bridge link.
    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link_type: LinkType::Bridge,
            ..Self::default()
        }
    }

    /// A veth pair.
    pub fn veth(name: impl Into<String>, peer: impl Into<String>, mac: Option<MacAddr>) -> Self {
        Self {
            name: name.into(),
            link_type: LinkType::Veth { peer: peer.into() },
            ip_addr: None,
            mac,
        }
    }

    /// A neighbor entry on `name` binding `ip` to `mac`.
    pub fn neighbor(name: impl Into<String>, ip: IpAddr, mac: Option<MacAddr>) -> Self {
        Self {
            name: name.into(),
            link_type: LinkType::Unspecified,
            ip_addr: Some(ip),
            mac,
        }
    }
}

/// Whether a neighbor entry is added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborOp {
    /// Add or replace the entry.
    Add,
    /// Remove the entry.
    Remove,
}

/// Reachability state written with a neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    /// Static entry that never expires.
    Permanent,
    /// Resolution pending; used when removing.
    Incomplete,
}

impl NeighborState {
    /// Name used by `ip neigh`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Incomplete => "incomplete",
        }
    }
}

/// The host uplink a bridge-mode endpoint is attached behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInterface {
    /// Uplink interface name; MAC-DNAT rules match ingress on it.
    pub name: String,
    /// Bridge the host veth ends are enslaved to.
    pub bridge_name: String,
    /// Uplink hardware address.
    pub mac: MacAddr,
    /// Host addresses; the IPv6 one becomes the container's host-local route.
    pub ip_addresses: Vec<IpNet>,
}

/// Desired state for one container endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint identifier.
    pub id: EndpointId,
    /// Final interface name inside the container.
    pub if_name: String,
    /// Assigned addresses with prefixes.
    pub ip_addresses: Vec<IpNet>,
    /// Caller-supplied routes.
    pub routes: Vec<RouteInfo>,
    /// Destinations redirected to the host stack instead of bridged.
    pub ips_to_route_via_host: Vec<IpAddr>,
    /// IPv6 mode; any non-empty value enables it.
    pub ipv6_mode: Option<String>,
    /// VNET CIDR override for the IPv6 route set.
    pub vnet_cidrs: Option<String>,
    /// Target namespace.
    pub netns: NetnsHandle,
}

impl EndpointInfo {
    /// Minimal intent: one interface in one namespace, nothing assigned yet.
    pub fn new(id: EndpointId, if_name: impl Into<String>, netns: NetnsHandle) -> Self {
        Self {
            id,
            if_name: if_name.into(),
            ip_addresses: Vec::new(),
            routes: Vec::new(),
            ips_to_route_via_host: Vec::new(),
            ipv6_mode: None,
            vnet_cidrs: None,
            netns,
        }
    }

    /// Add an assigned address.
    #[must_use]
    pub fn with_address(mut self, addr: IpNet) -> Self {
        self.ip_addresses.push(addr);
        self
    }

    /// Add a caller route.
    #[must_use]
    pub fn with_route(mut self, route: RouteInfo) -> Self {
        self.routes.push(route);
        self
    }

    /// Enable IPv6 mode.
    #[must_use]
    pub fn with_ipv6_mode(mut self, mode: impl Into<String>) -> Self {
        self.ipv6_mode = Some(mode.into());
        self
    }

    /// Returns true when IPv6 mode is set to a non-empty value.
    #[must_use]
    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6_mode.as_deref().is_some_and(|m| !m.is_empty())
    }

    /// Iterate over the IPv4 addresses only.
    pub fn ipv4_addresses(&self) -> impl Iterator<Item = &IpNet> {
        self.ip_addresses.iter().filter(|a| a.addr().is_ipv4())
    }
}

/// Durable record of an attached endpoint; the only input to deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Endpoint identifier.
    pub id: EndpointId,
    /// Host-side veth name.
    pub host_if_name: String,
    /// Container-side interface name after rename.
    pub if_name: String,
    /// Assigned addresses.
    pub ip_addresses: Vec<IpNet>,
    /// Container interface hardware address.
    pub mac: MacAddr,
    /// Namespace the container side lives in.
    pub netns: NetnsHandle,
}

impl EndpointRecord {
    /// Serialize for persistence.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> tether_common::TetherResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load a persisted record.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the text is not a record.
    pub fn from_json(text: &str) -> tether_common::TetherResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> EndpointId {
        EndpointId::new("abc-eth0").unwrap()
    }

    #[test]
    fn ipv6_mode_requires_non_empty_value() {
        let info = EndpointInfo::new(id(), "eth0", NetnsHandle::Pid(1));
        assert!(!info.ipv6_enabled());
        assert!(!info.clone().with_ipv6_mode("").ipv6_enabled());
        assert!(info.with_ipv6_mode("ipv6nat").ipv6_enabled());
    }

    #[test]
    fn ipv4_filter() {
        let info = EndpointInfo::new(id(), "eth0", NetnsHandle::Pid(1))
            .with_address("10.0.0.5/24".parse().unwrap())
            .with_address("fd00::5/64".parse().unwrap());
        let v4: Vec<_> = info.ipv4_addresses().collect();
        assert_eq!(v4.len(), 1);
        assert_eq!(v4[0].to_string(), "10.0.0.5/24");
    }

    #[test]
    fn netns_ip_arg() {
        assert_eq!(NetnsHandle::Pid(42).as_ip_arg(), "42");
        assert_eq!(
            NetnsHandle::path("/var/run/netns/ns1").as_ip_arg(),
            "/var/run/netns/ns1"
        );
    }

    #[test]
    fn record_survives_persistence() {
        let record = EndpointRecord {
            id: id(),
            host_if_name: "vth0123456789a".to_string(),
            if_name: "eth0".to_string(),
            ip_addresses: vec!["10.0.0.5/24".parse().unwrap()],
            mac: "02:00:0a:00:00:05".parse().unwrap(),
            netns: NetnsHandle::path("/var/run/netns/ns1"),
        };
        let json = record.to_json().unwrap();
        assert!(json.contains("\"02:00:0a:00:00:05\""));
        assert_eq!(EndpointRecord::from_json(&json).unwrap(), record);
    }
}
