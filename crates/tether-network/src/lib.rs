//! # tether-network
//!
//! Endpoint attachment engine for Tether.
//!
//! Given a container's desired network identity, the endpoint clients in
//! [`endpoint`] create the veth pair, program the host's bridging and
//! routing filters and neighbor table, move the container side into its
//! namespace and configure it there. Three operating modes share one
//! lifecycle: plain bridge, tunnel, and the host-SNAT bridge.
//!
//! Kernel and filter access goes through the capability traits
//! [`NetlinkInterface`], [`EbtablesInterface`], [`IptablesInterface`] and
//! [`ExecClient`]. The command-backed implementations drive `ip`,
//! `bridge`, `ebtables` and `iptables`; the `test-util` feature adds
//! in-memory ones in `fake`.

#![warn(missing_docs)]

pub mod ebtables;
pub mod endpoint;
pub mod exec;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod iptables;
pub mod netlink;
pub mod netutils;
pub mod policy;
pub mod routes;
pub mod types;

pub use ebtables::{EbRule, EbTable, Ebtables, EbtablesInterface, RuleAction};
pub use endpoint::{
    BridgeEndpointClient, BridgeMode, Bridged, EndpointClient, HostServices, SnatClient, Tunneled,
    attach, detach, new_endpoint_client,
};
pub use exec::{CommandExecutor, ExecClient};
pub use iptables::{IpVersion, IptRule, Iptables, IptablesInterface};
pub use netlink::{IpRoute2, NetlinkInterface};
pub use netutils::NetworkUtils;
pub use policy::Operation;
pub use types::{
    EndpointInfo, EndpointRecord, ExternalInterface, LinkInfo, LinkType, NeighborOp,
    NeighborState, NetnsHandle, RouteInfo,
};
