//! In-memory collaborators.
//!
//! These model just enough kernel and filter state to drive the endpoint
//! clients without privileges: a command recorder, a link table with
//! namespaces, and ebtables/iptables rule lists. Each type is cheap to
//! clone and clones share state, so a test can hand one copy to a client
//! and inspect another.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use tether_common::{MacAddr, TetherError, TetherResult};

use crate::ebtables::{EbRule, EbTable, EbtablesInterface, RuleAction};
use crate::exec::{ExecClient, command_line};
use crate::iptables::{IpVersion, IptRule, IptablesInterface};
use crate::netlink::NetlinkInterface;
use crate::types::{LinkInfo, LinkType, NeighborOp, NeighborState, NetnsHandle, RouteInfo};

const HOST_SCOPE: &str = "host";

fn injected(what: &str) -> String {
    format!("injected failure: {what}")
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ExecState {
    commands: Vec<String>,
    failures: Vec<(String, Option<i32>, String)>,
    responses: Vec<(String, String)>,
}

/// [`ExecClient`] that records command lines and answers from canned rules.
///
/// A command succeeds with empty output unless a failure or response rule
/// matches a substring of its rendered command line.
#[derive(Clone, Default)]
pub struct FakeExec {
    state: Arc<Mutex<ExecState>>,
}

impl FakeExec {
    /// Executor where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered command lines, oldest first.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Fail commands containing `pattern` with exit status 2.
    pub fn fail_matching(&self, pattern: &str, stderr: &str) {
        self.fail_with_code(pattern, 2, stderr);
    }

    /// Fail commands containing `pattern` with exit status `code`.
    pub fn fail_with_code(&self, pattern: &str, code: i32, stderr: &str) {
        self.state
            .lock()
            .failures
            .push((pattern.to_string(), Some(code), stderr.to_string()));
    }

    /// Answer commands containing `pattern` with `stdout`.
    pub fn respond_matching(&self, pattern: &str, stdout: &str) {
        self.state
            .lock()
            .responses
            .push((pattern.to_string(), stdout.to_string()));
    }
}

#[async_trait]
impl ExecClient for FakeExec {
    async fn execute(&self, program: &str, args: &[String]) -> TetherResult<String> {
        let command = command_line(program, args);
        let mut state = self.state.lock();
        state.commands.push(command.clone());

        if let Some((_, code, stderr)) = state
            .failures
            .iter()
            .find(|(pattern, _, _)| command.contains(pattern.as_str()))
        {
            return Err(TetherError::Command {
                command,
                code: *code,
                stderr: stderr.clone(),
            });
        }

        Ok(state
            .responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Netlink
// ---------------------------------------------------------------------------

/// A link as seen by [`FakeNetlink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    /// Administrative state.
    pub up: bool,
    /// Hardware address.
    pub mac: MacAddr,
    /// Bridge this link is enslaved to.
    pub master: Option<String>,
    /// Hairpin mode.
    pub hairpin: bool,
    /// Assigned addresses in assignment order.
    pub addresses: Vec<IpNet>,
    /// Routes out of this link in installation order.
    pub routes: Vec<RouteInfo>,
    /// Veth peer name.
    pub peer: Option<String>,
    /// Whether the link is a bridge.
    pub is_bridge: bool,
}

/// A neighbor entry held by [`FakeNetlink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeNeighbor {
    /// `host` or the namespace the entry was written in.
    pub scope: String,
    /// Device the entry is bound to.
    pub dev: String,
    /// Neighbor IP.
    pub ip: IpAddr,
    /// Neighbor MAC.
    pub mac: Option<MacAddr>,
}

#[derive(Default)]
struct NetState {
    links: BTreeMap<(String, String), FakeLink>,
    neighbors: Vec<FakeNeighbor>,
    failures: Vec<(String, String)>,
    calls: Vec<String>,
    next_mac: u32,
}

impl NetState {
    fn allocate_mac(&mut self) -> MacAddr {
        self.next_mac += 1;
        let [_, a, b, c] = self.next_mac.to_be_bytes();
        MacAddr([0x02, 0x00, 0x00, a, b, c])
    }

    fn check(&self, op: &str, key: &str) -> TetherResult<()> {
        if self
            .failures
            .iter()
            .any(|(fail_op, fail_key)| fail_op == op && (fail_key.is_empty() || fail_key == key))
        {
            return Err(TetherError::LinkMutation {
                name: key.to_string(),
                message: injected(op),
            });
        }
        Ok(())
    }

    fn link_mut(&mut self, scope: &str, name: &str) -> TetherResult<&mut FakeLink> {
        self.links
            .get_mut(&(scope.to_string(), name.to_string()))
            .ok_or_else(|| TetherError::LinkMutation {
                name: name.to_string(),
                message: format!("Cannot find device \"{name}\""),
            })
    }
}

/// [`NetlinkInterface`] over an in-memory link table.
///
/// Links are keyed by namespace; [`NetlinkInterface::in_namespace`] returns a
/// view sharing the same table but scoped to one namespace.
#[derive(Clone)]
pub struct FakeNetlink {
    state: Arc<Mutex<NetState>>,
    scope: String,
}

impl Default for FakeNetlink {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNetlink {
    /// Empty host namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState::default())),
            scope: HOST_SCOPE.to_string(),
        }
    }

    fn scoped(&self, netns: &NetnsHandle) -> Self {
        Self {
            state: Arc::clone(&self.state),
            scope: netns.to_string(),
        }
    }

    /// View of the namespace `netns`, for inspection.
    #[must_use]
    pub fn namespace(&self, netns: &NetnsHandle) -> Self {
        self.scoped(netns)
    }

    fn record(&self, state: &mut NetState, call: String) {
        if self.scope == HOST_SCOPE {
            state.calls.push(call);
        } else {
            state.calls.push(format!("[{}] {call}", self.scope));
        }
    }

    /// Create a down link named `name` in this view's namespace.
    pub fn seed_link(&self, name: &str) {
        let mut state = self.state.lock();
        let mac = state.allocate_mac();
        state.links.insert(
            (self.scope.clone(), name.to_string()),
            FakeLink {
                up: false,
                mac,
                master: None,
                hairpin: false,
                addresses: Vec::new(),
                routes: Vec::new(),
                peer: None,
                is_bridge: false,
            },
        );
    }

    /// Create a bridge named `name` in this view's namespace.
    pub fn seed_bridge(&self, name: &str) {
        self.seed_link(name);
        if let Some(link) = self
            .state
            .lock()
            .links
            .get_mut(&(self.scope.clone(), name.to_string()))
        {
            link.is_bridge = true;
        }
    }

    /// Fail the next and every later call of `op` on `key`.
    ///
    /// `op` is a [`NetlinkInterface`] method name. `key` is the link name, or
    /// the neighbor IP for `set_or_remove_neighbor`; an empty key matches all.
    pub fn fail_on(&self, op: &str, key: &str) {
        self.state
            .lock()
            .failures
            .push((op.to_string(), key.to_string()));
    }

    /// Snapshot of a link in this view's namespace.
    #[must_use]
    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state
            .lock()
            .links
            .get(&(self.scope.clone(), name.to_string()))
            .cloned()
    }

    /// Whether `name` exists in this view's namespace.
    #[must_use]
    pub fn has_link(&self, name: &str) -> bool {
        self.link(name).is_some()
    }

    /// Whether `name` exists and is up.
    #[must_use]
    pub fn link_is_up(&self, name: &str) -> bool {
        self.link(name).is_some_and(|l| l.up)
    }

    /// Addresses on `name`.
    #[must_use]
    pub fn addresses(&self, name: &str) -> Vec<IpNet> {
        self.link(name).map(|l| l.addresses).unwrap_or_default()
    }

    /// Routes out of `name`.
    #[must_use]
    pub fn routes(&self, name: &str) -> Vec<RouteInfo> {
        self.link(name).map(|l| l.routes).unwrap_or_default()
    }

    /// Neighbor entries in this view's namespace.
    #[must_use]
    pub fn neighbors(&self) -> Vec<FakeNeighbor> {
        self.state
            .lock()
            .neighbors
            .iter()
            .filter(|n| n.scope == self.scope)
            .cloned()
            .collect()
    }

    /// Every mutating call across all namespaces, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Total number of links across all namespaces.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }
}

#[async_trait]
impl NetlinkInterface for FakeNetlink {
    async fn add_link(&self, link: &LinkInfo) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("add_link {}", link.name));
        state.check("add_link", &link.name)?;

        let key = (self.scope.clone(), link.name.clone());
        if state.links.contains_key(&key) {
            return Err(TetherError::AlreadyExists {
                what: format!("link {}", link.name),
            });
        }

        let mac = match link.mac {
            Some(mac) => mac,
            None => state.allocate_mac(),
        };
        let mut created = FakeLink {
            up: false,
            mac,
            master: None,
            hairpin: false,
            addresses: Vec::new(),
            routes: Vec::new(),
            peer: None,
            is_bridge: false,
        };

        match &link.link_type {
            LinkType::Bridge => created.is_bridge = true,
            LinkType::Veth { peer } => {
                let peer_key = (self.scope.clone(), peer.clone());
                if state.links.contains_key(&peer_key) {
                    return Err(TetherError::AlreadyExists {
                        what: format!("link {peer}"),
                    });
                }
                created.peer = Some(peer.clone());
                let peer_mac = state.allocate_mac();
                let peer_link = FakeLink {
                    mac: peer_mac,
                    peer: Some(link.name.clone()),
                    ..created.clone()
                };
                state.links.insert(peer_key, peer_link);
            }
            LinkType::Unspecified => {
                return Err(TetherError::LinkCreation {
                    name: link.name.clone(),
                    message: "link type required".to_string(),
                });
            }
        }

        state.links.insert(key, created);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("delete_link {name}"));
        state.check("delete_link", name)?;

        if let Some(link) = state.links.remove(&(self.scope.clone(), name.to_string())) {
            if let Some(peer) = link.peer {
                state.links.retain(|(_, n), l| !(n == &peer && l.peer.as_deref() == Some(name)));
            }
        }
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> TetherResult<bool> {
        let state = self.state.lock();
        state.check("link_exists", name)?;
        Ok(state
            .links
            .contains_key(&(self.scope.clone(), name.to_string())))
    }

    async fn hardware_address(&self, name: &str) -> TetherResult<MacAddr> {
        let mut state = self.state.lock();
        state.check("hardware_address", name)?;
        Ok(state.link_mut(&self.scope, name)?.mac)
    }

    async fn set_link_name(&self, name: &str, new_name: &str) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("set_link_name {name} {new_name}"));
        state.check("set_link_name", name)?;

        let link = state
            .links
            .remove(&(self.scope.clone(), name.to_string()))
            .ok_or_else(|| TetherError::Namespace {
                name: name.to_string(),
                message: format!("Cannot find device \"{name}\""),
            })?;
        if let Some(peer) = &link.peer {
            for ((_, n), l) in &mut state.links {
                if n == peer {
                    l.peer = Some(new_name.to_string());
                }
            }
        }
        state
            .links
            .insert((self.scope.clone(), new_name.to_string()), link);
        Ok(())
    }

    async fn set_link_state(&self, name: &str, up: bool) -> TetherResult<()> {
        let mut state = self.state.lock();
        let verb = if up { "up" } else { "down" };
        self.record(&mut state, format!("set_link_state {name} {verb}"));
        state.check("set_link_state", name)?;
        state.link_mut(&self.scope, name)?.up = up;
        Ok(())
    }

    async fn set_link_master(&self, name: &str, master: &str) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("set_link_master {name} {master}"));
        state.check("set_link_master", name)?;
        if !state
            .links
            .contains_key(&(self.scope.clone(), master.to_string()))
        {
            return Err(TetherError::LinkMutation {
                name: master.to_string(),
                message: format!("Cannot find device \"{master}\""),
            });
        }
        state.link_mut(&self.scope, name)?.master = Some(master.to_string());
        Ok(())
    }

    async fn set_link_hairpin(&self, name: &str, on: bool) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("set_link_hairpin {name} {on}"));
        state.check("set_link_hairpin", name)?;
        state.link_mut(&self.scope, name)?.hairpin = on;
        Ok(())
    }

    async fn set_link_address(&self, name: &str, mac: MacAddr) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("set_link_address {name} {mac}"));
        state.check("set_link_address", name)?;
        state.link_mut(&self.scope, name)?.mac = mac;
        Ok(())
    }

    async fn set_link_netns(&self, name: &str, netns: &NetnsHandle) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("set_link_netns {name} {netns}"));
        state.check("set_link_netns", name)?;

        let link = state
            .links
            .remove(&(self.scope.clone(), name.to_string()))
            .ok_or_else(|| TetherError::Namespace {
                name: name.to_string(),
                message: format!("Cannot find device \"{name}\""),
            })?;
        state.links.insert((netns.to_string(), name.to_string()), link);
        Ok(())
    }

    async fn add_ip_address(&self, name: &str, addr: IpNet) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("add_ip_address {name} {addr}"));
        state.check("add_ip_address", name)?;

        let link = state.link_mut(&self.scope, name)?;
        if link.addresses.contains(&addr) {
            return Err(TetherError::AlreadyExists {
                what: format!("address {addr} on {name}"),
            });
        }
        link.addresses.push(addr);
        Ok(())
    }

    async fn add_route(&self, name: &str, route: &RouteInfo) -> TetherResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("add_route {name} {}", route.dst));
        state.check("add_route", name)?;

        let link = state.link_mut(&self.scope, name)?;
        if link.routes.iter().any(|r| r.dst == route.dst && r.gw == route.gw) {
            return Err(TetherError::AlreadyExists {
                what: format!("route {} on {name}", route.dst),
            });
        }
        link.routes.push(route.clone());
        Ok(())
    }

    async fn set_or_remove_neighbor(
        &self,
        link: &LinkInfo,
        op: NeighborOp,
        _state: NeighborState,
    ) -> TetherResult<()> {
        let ip = link.ip_addr.ok_or_else(|| TetherError::LinkMutation {
            name: link.name.clone(),
            message: "neighbor entry requires an IP address".to_string(),
        })?;

        let mut state = self.state.lock();
        self.record(
            &mut state,
            format!("set_or_remove_neighbor {op:?} {} {ip}", link.name),
        );
        state.check("set_or_remove_neighbor", &ip.to_string())?;

        let scope = self.scope.clone();
        state
            .neighbors
            .retain(|n| !(n.scope == scope && n.dev == link.name && n.ip == ip));
        if op == NeighborOp::Add {
            if link.mac.is_none() {
                return Err(TetherError::LinkMutation {
                    name: link.name.clone(),
                    message: format!("neighbor entry for {ip} requires a MAC address"),
                });
            }
            state.neighbors.push(FakeNeighbor {
                scope,
                dev: link.name.clone(),
                ip,
                mac: link.mac,
            });
        }
        Ok(())
    }

    fn in_namespace(&self, netns: &NetnsHandle) -> Arc<dyn NetlinkInterface> {
        Arc::new(self.scoped(netns))
    }
}

// ---------------------------------------------------------------------------
// Ebtables
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EbState {
    chains: BTreeMap<(String, String), Vec<String>>,
    applied: Vec<(RuleAction, EbRule)>,
    failures: Vec<String>,
}

/// [`EbtablesInterface`] over in-memory chains.
#[derive(Clone, Default)]
pub struct FakeEbtables {
    state: Arc<Mutex<EbState>>,
}

impl FakeEbtables {
    /// Empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every mutation whose rule text contains `pattern`.
    pub fn fail_matching(&self, pattern: &str) {
        self.state.lock().failures.push(pattern.to_string());
    }

    /// Rule texts of one chain, in chain order.
    #[must_use]
    pub fn rules(&self, table: EbTable, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .chains
            .get(&(table.as_str().to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of rules across all chains.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.state.lock().chains.values().map(Vec::len).sum()
    }

    /// Number of successful `action` calls whose rule text contains `pattern`.
    #[must_use]
    pub fn applied(&self, action: RuleAction, pattern: &str) -> usize {
        self.state
            .lock()
            .applied
            .iter()
            .filter(|(a, r)| *a == action && r.match_text().contains(pattern))
            .count()
    }
}

#[async_trait]
impl EbtablesInterface for FakeEbtables {
    async fn list_rules(&self, table: EbTable, chain: &str) -> TetherResult<String> {
        let rules = self.rules(table, chain);
        let mut listing = format!(
            "Bridge table: {table}\n\nBridge chain: {chain}, entries: {}, policy: ACCEPT\n",
            rules.len()
        );
        for rule in rules {
            listing.push_str(&rule);
            listing.push('\n');
        }
        Ok(listing)
    }

    async fn apply(&self, rule: &EbRule, action: RuleAction) -> TetherResult<()> {
        let mut state = self.state.lock();
        let text = rule.match_text();
        if state.failures.iter().any(|p| text.contains(p.as_str())) {
            return Err(TetherError::RuleInstall {
                table: rule.table.to_string(),
                chain: rule.chain.clone(),
                message: injected(&text),
            });
        }

        let chain = state
            .chains
            .entry((rule.table.as_str().to_string(), rule.chain.clone()))
            .or_default();
        match action {
            RuleAction::Append => chain.push(text),
            RuleAction::Insert => chain.insert(0, text),
            RuleAction::Delete => {
                if let Some(pos) = chain.iter().position(|r| *r == text) {
                    chain.remove(pos);
                }
            }
        }
        state.applied.push((action, rule.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Iptables
// ---------------------------------------------------------------------------

#[derive(Default)]
struct IptState {
    chains: BTreeMap<(String, String), Vec<String>>,
    inserts: usize,
    appends: usize,
    deletes: usize,
    failures: Vec<String>,
}

/// [`IptablesInterface`] over in-memory chains.
///
/// Rules are stored as `"<match> -j <target>"`.
#[derive(Clone, Default)]
pub struct FakeIptables {
    state: Arc<Mutex<IptState>>,
}

fn table_key(version: IpVersion, table: &str) -> String {
    match version {
        IpVersion::V4 => table.to_string(),
        IpVersion::V6 => format!("ip6/{table}"),
    }
}

fn rule_key(rule: &IptRule) -> (String, String) {
    (table_key(rule.version, &rule.table), rule.chain.clone())
}

fn rule_text(rule: &IptRule) -> String {
    let condition = rule.match_condition.trim();
    if condition.is_empty() {
        format!("-j {}", rule.target)
    } else {
        format!("{condition} -j {}", rule.target)
    }
}

impl FakeIptables {
    /// Empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every mutation whose rule text contains `pattern`.
    pub fn fail_matching(&self, pattern: &str) {
        self.state.lock().failures.push(pattern.to_string());
    }

    /// IPv4 rules of one chain, in chain order.
    #[must_use]
    pub fn chain_rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether an IPv4 chain exists, created or holding rules.
    #[must_use]
    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .chains
            .contains_key(&(table.to_string(), chain.to_string()))
    }

    /// Successful insert, append and delete counts.
    #[must_use]
    pub fn mutation_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.inserts, state.appends, state.deletes)
    }

    fn guard(state: &IptState, rule: &IptRule) -> TetherResult<()> {
        let text = rule_text(rule);
        if state.failures.iter().any(|p| text.contains(p.as_str())) {
            return Err(TetherError::RuleInstall {
                table: rule.table.clone(),
                chain: rule.chain.clone(),
                message: injected(&text),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl IptablesInterface for FakeIptables {
    async fn create_chain(&self, version: IpVersion, table: &str, chain: &str) -> TetherResult<()> {
        self.state
            .lock()
            .chains
            .entry((table_key(version, table), chain.to_string()))
            .or_default();
        Ok(())
    }

    async fn rule_exists(&self, rule: &IptRule) -> TetherResult<bool> {
        let text = rule_text(rule);
        Ok(self
            .state
            .lock()
            .chains
            .get(&rule_key(rule))
            .is_some_and(|rules| rules.contains(&text)))
    }

    async fn insert_rule(&self, rule: &IptRule) -> TetherResult<()> {
        let mut state = self.state.lock();
        Self::guard(&state, rule)?;
        state
            .chains
            .entry(rule_key(rule))
            .or_default()
            .insert(0, rule_text(rule));
        state.inserts += 1;
        Ok(())
    }

    async fn append_rule(&self, rule: &IptRule) -> TetherResult<()> {
        let mut state = self.state.lock();
        Self::guard(&state, rule)?;
        state
            .chains
            .entry(rule_key(rule))
            .or_default()
            .push(rule_text(rule));
        state.appends += 1;
        Ok(())
    }

    async fn delete_rule(&self, rule: &IptRule) -> TetherResult<()> {
        let mut state = self.state.lock();
        Self::guard(&state, rule)?;
        let text = rule_text(rule);
        if let Some(rules) = state.chains.get_mut(&rule_key(rule)) {
            if let Some(pos) = rules.iter().position(|r| *r == text) {
                rules.remove(pos);
            }
        }
        state.deletes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn veth_peer_follows_namespace_move() {
        let netlink = FakeNetlink::new();
        let netns = NetnsHandle::path("/var/run/netns/ns1");

        netlink
            .add_link(&LinkInfo::veth("vth1", "vtc1", None))
            .await
            .unwrap();
        netlink.set_link_netns("vtc1", &netns).await.unwrap();

        assert!(netlink.has_link("vth1"));
        assert!(!netlink.has_link("vtc1"));
        assert!(netlink.namespace(&netns).has_link("vtc1"));

        netlink.delete_link("vth1").await.unwrap();
        assert_eq!(netlink.link_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_link_is_already_exists() {
        let netlink = FakeNetlink::new();
        netlink.seed_bridge("br0");
        let err = netlink
            .add_link(&LinkInfo::bridge("br0"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn exec_failure_carries_code() {
        let exec = FakeExec::new();
        exec.fail_with_code("-C", 1, "Bad rule");
        let err = exec
            .execute("iptables", &["-C".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Command { code: Some(1), .. }));
        assert!(exec.execute("iptables", &["-A".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn ebtables_listing_contains_rules() {
        let eb = FakeEbtables::new();
        eb.apply(&EbRule::vlan_drop(), RuleAction::Append)
            .await
            .unwrap();
        let listing = eb.list_rules(EbTable::Nat, "PREROUTING").await.unwrap();
        assert!(listing.contains("-p 802_1Q -j DROP"));
        assert_eq!(eb.applied(RuleAction::Append, "802_1Q"), 1);
    }
}
