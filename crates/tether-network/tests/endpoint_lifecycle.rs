//! Attach/detach lifecycle of bridge and tunnel endpoints against in-memory host state.

use std::sync::Arc;

use tether_common::{EndpointId, EngineConfig, OperatingMode, Severity, TetherError};
use tether_network::fake::{FakeEbtables, FakeExec, FakeIptables, FakeNetlink};
use tether_network::{
    EbTable, EndpointInfo, EndpointRecord, ExternalInterface, HostServices, NetnsHandle,
    RuleAction, attach, detach, new_endpoint_client,
};

const BRIDGE: &str = "azure0";

struct Host {
    netlink: FakeNetlink,
    ebtables: FakeEbtables,
    services: HostServices,
    external: ExternalInterface,
}

impl Host {
    fn new() -> Self {
        let netlink = FakeNetlink::new();
        netlink.seed_bridge(BRIDGE);
        let ebtables = FakeEbtables::new();
        let services = HostServices {
            netlink: Arc::new(netlink.clone()),
            ebtables: Arc::new(ebtables.clone()),
            iptables: Arc::new(FakeIptables::new()),
            exec: Arc::new(FakeExec::new()),
        };
        let external = ExternalInterface {
            name: "eth0".to_string(),
            bridge_name: BRIDGE.to_string(),
            mac: "00:0d:3a:f0:00:01".parse().unwrap(),
            ip_addresses: vec![
                "10.240.0.4/16".parse().unwrap(),
                "fd00:10::4/128".parse().unwrap(),
            ],
        };
        Self {
            netlink,
            ebtables,
            services,
            external,
        }
    }

    fn config(mode: OperatingMode) -> EngineConfig {
        EngineConfig {
            mode,
            ..EngineConfig::default()
        }
    }

    async fn attach(&self, mode: OperatingMode, info: &EndpointInfo) -> EndpointRecord {
        let mut client = new_endpoint_client(
            &Self::config(mode),
            self.services.clone(),
            &self.external,
            info,
        )
        .unwrap();
        attach(client.as_mut(), info).await.unwrap()
    }

    async fn detach(&self, mode: OperatingMode, info: &EndpointInfo, record: &EndpointRecord) {
        let client = new_endpoint_client(
            &Self::config(mode),
            self.services.clone(),
            &self.external,
            info,
        )
        .unwrap();
        detach(client.as_ref(), record).await.unwrap();
    }

    fn nat_rules(&self) -> Vec<String> {
        self.ebtables.rules(EbTable::Nat, "PREROUTING")
    }
}

fn endpoint(id: &str, addresses: &[&str]) -> EndpointInfo {
    let mut info = EndpointInfo::new(
        EndpointId::new(id).unwrap(),
        "eth0",
        NetnsHandle::path(format!("/var/run/netns/{id}")),
    );
    for addr in addresses {
        info = info.with_address(addr.parse().unwrap());
    }
    info
}

#[test_log::test(tokio::test)]
async fn bridge_endpoint_end_to_end() {
    let host = Host::new();
    let info = endpoint("4f1c2a-eth0", &["10.0.0.5/24"]);
    let (host_veth, _) = info.id.veth_names();

    let record = host.attach(OperatingMode::Bridge, &info).await;
    let mac = record.mac.to_string();

    assert_eq!(record.if_name, "eth0");
    assert_eq!(record.host_if_name, host_veth);
    assert_eq!(
        host.nat_rules(),
        vec![
            format!("-p ARP --arp-op Request --arp-ip-dst 10.0.0.5 -j arpreply --arpreply-mac {mac}"),
            format!("-i eth0 -p IPv4 --ip-dst 10.0.0.5 -j dnat --to-dst {mac} --dnat-target ACCEPT"),
        ]
    );

    let neighbors = host.netlink.neighbors();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].dev, BRIDGE);
    assert_eq!(neighbors[0].ip.to_string(), "10.0.0.5");
    assert_eq!(neighbors[0].mac, Some(record.mac));

    let host_link = host.netlink.link(&host_veth).unwrap();
    assert!(host_link.hairpin);
    assert!(host_link.up);
    assert_eq!(host_link.master.as_deref(), Some(BRIDGE));

    let ns = host.netlink.namespace(&info.netns);
    assert!(ns.link_is_up("eth0"));
    assert_eq!(ns.addresses("eth0"), info.ip_addresses);

    host.detach(OperatingMode::Bridge, &info, &record).await;

    assert!(host.nat_rules().is_empty());
    assert!(host.netlink.neighbors().is_empty());
    assert!(!host.netlink.has_link(&host_veth));
    assert!(!ns.has_link("eth0"));
    assert_eq!(host.netlink.link_count(), 1);
}

#[test_log::test(tokio::test)]
async fn attach_then_detach_restores_rule_tables() {
    let host = Host::new();
    let info = endpoint("9a77-eth0", &["10.0.0.5/24", "10.0.0.6/24", "10.0.0.7/24"]);

    let record = host.attach(OperatingMode::Bridge, &info).await;

    let rules = host.nat_rules();
    assert_eq!(rules.iter().filter(|r| r.contains("-j arpreply")).count(), 3);
    assert_eq!(rules.iter().filter(|r| r.contains("-j dnat")).count(), 3);

    host.detach(OperatingMode::Bridge, &info, &record).await;
    assert_eq!(host.ebtables.rule_count(), 0);
    assert!(host.netlink.neighbors().is_empty());
}

#[test_log::test(tokio::test)]
async fn arp_target_depends_on_mode() {
    let host = Host::new();
    let tunnel = endpoint("aa01-eth0", &["10.1.0.5/24", "10.1.0.6/24"]);
    let bridge = endpoint("bb02-eth0", &["10.2.0.5/24"]);
    let virtual_mac = EngineConfig::default().addresses.virtual_mac;

    let tunnel_record = host.attach(OperatingMode::Tunnel, &tunnel).await;
    let bridge_record = host.attach(OperatingMode::Bridge, &bridge).await;

    let replies: Vec<String> = host
        .nat_rules()
        .into_iter()
        .filter(|r| r.contains("-j arpreply"))
        .collect();
    assert_eq!(replies.len(), 3);
    for reply in &replies {
        if reply.contains("10.1.0.") {
            assert!(reply.ends_with(&format!("--arpreply-mac {virtual_mac}")));
            assert!(!reply.contains(&tunnel_record.mac.to_string()));
        } else {
            assert!(reply.ends_with(&format!("--arpreply-mac {}", bridge_record.mac)));
        }
    }

    // Only the bridge-mode endpoint pins a neighbor entry.
    let neighbors = host.netlink.neighbors();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].ip.to_string(), "10.2.0.5");

    host.detach(OperatingMode::Tunnel, &tunnel, &tunnel_record).await;
    let remaining = host.nat_rules();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|r| r.contains("10.2.0.5")));
}

#[test_log::test(tokio::test)]
async fn delete_continues_past_failed_neighbor_removal() {
    let host = Host::new();
    let info = endpoint("cc03-eth0", &["10.0.0.5/24", "10.0.0.6/24"]);
    let record = host.attach(OperatingMode::Bridge, &info).await;

    host.netlink.fail_on("set_or_remove_neighbor", "10.0.0.5");
    host.detach(OperatingMode::Bridge, &info, &record).await;

    assert_eq!(
        host.ebtables
            .applied(RuleAction::Delete, "--ip-dst 10.0.0.6 -j dnat"),
        1
    );
    assert!(host.nat_rules().is_empty());

    let left: Vec<String> = host
        .netlink
        .neighbors()
        .iter()
        .map(|n| n.ip.to_string())
        .collect();
    assert_eq!(left, vec!["10.0.0.5"]);
    assert!(!host.netlink.has_link(&record.host_if_name));
}

#[test_log::test(tokio::test)]
async fn detach_works_from_persisted_record() {
    let host = Host::new();
    let info = endpoint("dd04-eth0", &["10.0.0.9/24"]);
    let record = host.attach(OperatingMode::Bridge, &info).await;

    let stored = record.to_json().unwrap();
    let restored = EndpointRecord::from_json(&stored).unwrap();

    // A fresh client knows nothing about the attach; the record drives deletion.
    host.detach(OperatingMode::Bridge, &info, &restored).await;

    assert_eq!(host.ebtables.rule_count(), 0);
    assert_eq!(host.netlink.link_count(), 1);
}

#[test_log::test(tokio::test)]
async fn detach_tolerates_missing_state() {
    let host = Host::new();
    let info = endpoint("ee05-eth0", &["10.0.0.9/24"]);
    let (host_veth, _) = info.id.veth_names();
    let record = EndpointRecord {
        id: info.id.clone(),
        host_if_name: host_veth,
        if_name: "eth0".to_string(),
        ip_addresses: info.ip_addresses.clone(),
        mac: "02:00:0a:00:00:09".parse().unwrap(),
        netns: info.netns.clone(),
    };

    host.detach(OperatingMode::Bridge, &info, &record).await;
    assert_eq!(host.netlink.link_count(), 1);
}

#[test_log::test(tokio::test)]
async fn failed_namespace_move_is_fatal() {
    let host = Host::new();
    let info = endpoint("ff06-eth0", &["10.0.0.5/24"]);
    let (_, container_veth) = info.id.veth_names();
    host.netlink.fail_on("set_link_netns", &container_veth);

    let mut client = new_endpoint_client(
        &Host::config(OperatingMode::Bridge),
        host.services.clone(),
        &host.external,
        &info,
    )
    .unwrap();
    let err = attach(client.as_mut(), &info).await.unwrap_err();

    assert_eq!(err.severity(), Severity::Fatal);
    assert!(matches!(err, TetherError::Step { operation: "move to namespace", .. }));
    assert!(host.netlink.has_link(&container_veth));
}

#[test_log::test(tokio::test)]
async fn ipv6_endpoint_gets_gateway_routes() {
    let host = Host::new();
    let info = endpoint("ab07-eth0", &["10.0.0.5/24", "fd00:1234::5/64"]).with_ipv6_mode("ipv6nat");

    let record = host.attach(OperatingMode::Bridge, &info).await;

    let ns = host.netlink.namespace(&info.netns);
    let routes = ns.routes("eth0");
    let summary: Vec<(String, Option<String>, Option<u32>)> = routes
        .iter()
        .map(|r| (r.dst.to_string(), r.gw.map(|g| g.to_string()), r.priority))
        .collect();
    assert_eq!(
        summary,
        vec![
            (
                "2001:1234:5678:9abc::/64".to_string(),
                Some("fe80::1234:5678:9abc".to_string()),
                Some(101)
            ),
            ("fd00:10::4/128".to_string(), None, Some(100)),
            (
                "::/0".to_string(),
                Some("fe80::1234:5678:9abc".to_string()),
                None
            ),
        ]
    );

    let gateway = ns.neighbors();
    assert_eq!(gateway.len(), 1);
    assert_eq!(gateway[0].ip.to_string(), "fe80::1234:5678:9abc");
    assert_eq!(gateway[0].mac.unwrap().to_string(), "12:34:56:78:9a:bc");

    // IPv6 addresses get a DNAT rule but no ARP reply or bridge neighbor.
    let rules = host.nat_rules();
    assert!(rules.iter().any(|r| r.contains("-p IPv6 --ip6-dst fd00:1234::5")));
    assert_eq!(rules.iter().filter(|r| r.contains("-j arpreply")).count(), 1);
    assert_eq!(host.netlink.neighbors().len(), 1);

    host.detach(OperatingMode::Bridge, &info, &record).await;
    assert!(host.nat_rules().is_empty());
}
