//! Route and neighbor-entry composition for an endpoint.

use std::net::{IpAddr, Ipv6Addr};

use ipnet::{IpNet, Ipv6Net};
use tether_common::{MacAddr, TetherError, TetherResult, WellKnownAddresses};

use crate::types::{EndpointInfo, LinkInfo, RouteInfo};

/// Metric of the VNET route through the host gateway.
pub const VNET_ROUTE_PRIORITY: u32 = 101;
/// Metric of the on-link route to the host's own IPv6 address.
pub const HOST_ROUTE_PRIORITY: u32 = 100;

/// VNET CIDR for `info`: its override, else the configured default.
///
/// # Errors
///
/// Returns [`TetherError::AddressParse`] if the override is not an IPv6 CIDR.
pub fn vnet_cidr(info: &EndpointInfo, addrs: &WellKnownAddresses) -> TetherResult<Ipv6Net> {
    match info.vnet_cidrs.as_deref().map(str::trim) {
        None | Some("") => Ok(addrs.default_vnet_cidr),
        Some(cidr) => cidr.parse().map_err(|e| TetherError::address(cidr, e)),
    }
}

/// IPv6 routes installed in the container when IPv6 mode is on.
///
/// In order: the VNET CIDR via the host gateway, an on-link /128 route to
/// the host's IPv6 address (omitted if the host has none), and `::/0` via
/// the host gateway. Returns an empty set when IPv6 mode is off.
///
/// # Errors
///
/// Returns [`TetherError::AddressParse`] for a malformed VNET override.
pub fn ipv6_routes(
    info: &EndpointInfo,
    host_addresses: &[IpNet],
    addrs: &WellKnownAddresses,
) -> TetherResult<Vec<RouteInfo>> {
    if !info.ipv6_enabled() {
        return Ok(Vec::new());
    }

    let gateway = IpAddr::V6(addrs.ipv6_host_gateway);
    let mut routes = vec![
        RouteInfo::via(IpNet::V6(vnet_cidr(info, addrs)?), gateway)
            .with_priority(VNET_ROUTE_PRIORITY),
    ];

    if let Some(IpAddr::V6(host)) = host_addresses
        .iter()
        .rev()
        .map(IpNet::addr)
        .find(IpAddr::is_ipv6)
    {
        routes.push(
            RouteInfo::direct(IpNet::V6(Ipv6Net::from(host))).with_priority(HOST_ROUTE_PRIORITY),
        );
    }

    routes.push(RouteInfo::via(
        IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 0)),
        gateway,
    ));

    Ok(routes)
}

/// Neighbor entry binding the IPv6 host gateway to its fixed MAC on `if_name`.
#[must_use]
pub fn ipv6_gateway_neighbor(if_name: &str, addrs: &WellKnownAddresses) -> LinkInfo {
    LinkInfo::neighbor(
        if_name,
        IpAddr::V6(addrs.ipv6_host_gateway),
        Some(addrs.host_gateway_mac),
    )
}

/// Static neighbor entry for a container address on a bridge.
#[must_use]
pub fn bridge_neighbor(bridge: &str, ip: IpAddr, mac: Option<MacAddr>) -> LinkInfo {
    LinkInfo::neighbor(bridge, ip, mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetnsHandle;
    use tether_common::EndpointId;

    fn info() -> EndpointInfo {
        EndpointInfo::new(
            EndpointId::new("abc-eth0").unwrap(),
            "eth0",
            NetnsHandle::Pid(1),
        )
    }

    fn host() -> Vec<IpNet> {
        vec![
            "10.240.0.4/16".parse().unwrap(),
            "fd00:10::4/128".parse().unwrap(),
        ]
    }

    #[test]
    fn no_routes_without_ipv6_mode() {
        let routes = ipv6_routes(&info(), &host(), &WellKnownAddresses::default()).unwrap();
        assert!(routes.is_empty());
    }

    #[test]
    fn default_ipv6_route_set() {
        let addrs = WellKnownAddresses::default();
        let routes = ipv6_routes(&info().with_ipv6_mode("ipv6nat"), &host(), &addrs).unwrap();
        let gw: IpAddr = "fe80::1234:5678:9abc".parse().unwrap();

        assert_eq!(routes.len(), 3);

        assert_eq!(routes[0].dst.to_string(), "2001:1234:5678:9abc::/64");
        assert_eq!(routes[0].gw, Some(gw));
        assert_eq!(routes[0].priority, Some(101));

        assert_eq!(routes[1].dst.to_string(), "fd00:10::4/128");
        assert_eq!(routes[1].gw, None);
        assert_eq!(routes[1].priority, Some(100));

        assert_eq!(routes[2].dst.to_string(), "::/0");
        assert_eq!(routes[2].gw, Some(gw));
        assert_eq!(routes[2].priority, None);
    }

    #[test]
    fn host_route_is_a_single_address() {
        let routes = ipv6_routes(
            &info().with_ipv6_mode("ipv6nat"),
            &["10.240.0.4/16".parse().unwrap(), "fd00:10::4/64".parse().unwrap()],
            &WellKnownAddresses::default(),
        )
        .unwrap();
        assert_eq!(routes[1].dst.to_string(), "fd00:10::4/128");
        assert_eq!(routes[1].priority, Some(HOST_ROUTE_PRIORITY));
    }

    #[test]
    fn vnet_override() {
        let mut endpoint = info().with_ipv6_mode("ipv6nat");
        endpoint.vnet_cidrs = Some("fd00:aaaa::/48".to_string());
        let routes = ipv6_routes(&endpoint, &host(), &WellKnownAddresses::default()).unwrap();
        assert_eq!(routes[0].dst.to_string(), "fd00:aaaa::/48");
    }

    #[test]
    fn malformed_vnet_override() {
        let mut endpoint = info().with_ipv6_mode("ipv6nat");
        endpoint.vnet_cidrs = Some("10.0.0.0/8".to_string());
        let err = ipv6_routes(&endpoint, &host(), &WellKnownAddresses::default()).unwrap_err();
        assert!(matches!(err, TetherError::AddressParse { .. }));
    }

    #[test]
    fn host_route_skipped_without_host_ipv6() {
        let routes = ipv6_routes(
            &info().with_ipv6_mode("ipv6nat"),
            &["10.240.0.4/16".parse().unwrap()],
            &WellKnownAddresses::default(),
        )
        .unwrap();
        assert_eq!(routes.len(), 2);
    }

    proptest::proptest! {
        #[test]
        fn route_set_is_bracketed_by_gateway_routes(
            v4 in proptest::collection::vec(proptest::prelude::any::<u32>(), 0..3),
            v6 in proptest::collection::vec(proptest::prelude::any::<u128>(), 0..3),
        ) {
            let host: Vec<IpNet> = v4
                .iter()
                .map(|a| IpNet::from(IpAddr::from(std::net::Ipv4Addr::from(*a))))
                .chain(v6.iter().map(|a| IpNet::from(IpAddr::from(Ipv6Addr::from(*a)))))
                .collect();
            let routes = ipv6_routes(
                &info().with_ipv6_mode("ipv6nat"),
                &host,
                &WellKnownAddresses::default(),
            )
            .unwrap();

            let expected = if v6.is_empty() { 2 } else { 3 };
            proptest::prop_assert_eq!(routes.len(), expected);
            proptest::prop_assert_eq!(routes[0].priority, Some(VNET_ROUTE_PRIORITY));
            proptest::prop_assert_eq!(routes[routes.len() - 1].dst.prefix_len(), 0);
        }
    }

    #[test]
    fn gateway_neighbor() {
        let link = ipv6_gateway_neighbor("eth0", &WellKnownAddresses::default());
        assert_eq!(link.name, "eth0");
        assert_eq!(link.ip_addr.unwrap().to_string(), "fe80::1234:5678:9abc");
        assert_eq!(link.mac.unwrap().to_string(), "12:34:56:78:9a:bc");
    }
}
