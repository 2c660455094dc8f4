//! Bridging-layer (ebtables) rules.
//!
//! Endpoint clients use these for ARP replies, MAC DNAT of inbound traffic,
//! route-via-host redirects and the SNAT bridge's VLAN drop.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tether_common::{MacAddr, TetherError, TetherResult};

use crate::exec::{ExecClient, args};

/// Ebtables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EbTable {
    /// `nat`: ARP reply, DNAT and VLAN drop rules.
    Nat,
    /// `broute`: redirects to the host stack.
    Broute,
    /// `filter`.
    Filter,
}

impl EbTable {
    /// Table name on the command line.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Broute => "broute",
            Self::Filter => "filter",
        }
    }
}

impl fmt::Display for EbTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Add at the end of the chain.
    Append,
    /// Add at the head of the chain.
    Insert,
    /// Remove the rule.
    Delete,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Insert => "-I",
            Self::Delete => "-D",
        }
    }
}

/// One ebtables rule: table, chain and match/target specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EbRule {
    /// Table.
    pub table: EbTable,
    /// Chain.
    pub chain: String,
    /// Match and target arguments.
    pub spec: Vec<String>,
}

impl EbRule {
    fn new(table: EbTable, chain: &str, spec: Vec<String>) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            spec,
        }
    }

    /// Answer ARP requests for `ip` with `mac`.
    #[must_use]
    pub fn arp_reply(ip: Ipv4Addr, mac: MacAddr) -> Self {
        Self::new(
            EbTable::Nat,
            "PREROUTING",
            args([
                "-p".to_string(),
                "ARP".to_string(),
                "--arp-op".to_string(),
                "Request".to_string(),
                "--arp-ip-dst".to_string(),
                ip.to_string(),
                "-j".to_string(),
                "arpreply".to_string(),
                "--arpreply-mac".to_string(),
                mac.to_string(),
            ]),
        )
    }

    /// Rewrite the destination MAC of frames for `ip` arriving on `ifname`.
    #[must_use]
    pub fn dnat_for_ip(ifname: &str, ip: IpAddr, mac: MacAddr) -> Self {
        let (proto, dst_flag) = match ip {
            IpAddr::V4(_) => ("IPv4", "--ip-dst"),
            IpAddr::V6(_) => ("IPv6", "--ip6-dst"),
        };
        Self::new(
            EbTable::Nat,
            "PREROUTING",
            args([
                "-i".to_string(),
                ifname.to_string(),
                "-p".to_string(),
                proto.to_string(),
                dst_flag.to_string(),
                ip.to_string(),
                "-j".to_string(),
                "dnat".to_string(),
                "--to-dst".to_string(),
                mac.to_string(),
                "--dnat-target".to_string(),
                "ACCEPT".to_string(),
            ]),
        )
    }

    /// Hand frames for `ip` to the host stack instead of bridging them.
    #[must_use]
    pub fn broute_redirect(ip: IpAddr) -> Self {
        Self::new(
            EbTable::Broute,
            "BROUTING",
            args([
                "-p".to_string(),
                "IPv4".to_string(),
                "--ip-dst".to_string(),
                ip.to_string(),
                "-j".to_string(),
                "redirect".to_string(),
            ]),
        )
    }

    /// Drop all 802.1Q tagged frames.
    #[must_use]
    pub fn vlan_drop() -> Self {
        Self::new(EbTable::Nat, "PREROUTING", args(["-p", "802_1Q", "-j", "DROP"]))
    }

    /// Drop ARP requests for `cidr` arriving on `ifname`.
    #[must_use]
    pub fn arp_drop_for_cidr(cidr: IpNet, ifname: &str) -> Self {
        Self::new(
            EbTable::Nat,
            "PREROUTING",
            args([
                "-p".to_string(),
                "ARP".to_string(),
                "-i".to_string(),
                ifname.to_string(),
                "--arp-op".to_string(),
                "Request".to_string(),
                "--arp-ip-dst".to_string(),
                cidr.trunc().to_string(),
                "-j".to_string(),
                "DROP".to_string(),
            ]),
        )
    }

    /// Text the rule shows up as in `ebtables -L` output.
    #[must_use]
    pub fn match_text(&self) -> String {
        self.spec.join(" ")
    }
}

impl fmt::Display for EbRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.match_text())
    }
}

/// Bridging-layer packet filter.
#[async_trait]
pub trait EbtablesInterface: Send + Sync {
    /// Raw rule listing of one chain.
    async fn list_rules(&self, table: EbTable, chain: &str) -> TetherResult<String>;

    /// Append, insert or delete a rule. Deleting a rule that is not present is not an error.
    async fn apply(&self, rule: &EbRule, action: RuleAction) -> TetherResult<()>;
}

/// Check for `rule` by matching its text against the chain listing.
pub async fn rule_exists(eb: &dyn EbtablesInterface, rule: &EbRule) -> TetherResult<bool> {
    let listing = eb.list_rules(rule.table, &rule.chain).await?;
    Ok(listing.contains(&rule.match_text()))
}

/// Append `rule` unless the listing already contains it. Returns whether it was added.
pub async fn append_if_absent(eb: &dyn EbtablesInterface, rule: &EbRule) -> TetherResult<bool> {
    if rule_exists(eb, rule).await? {
        tracing::debug!(%rule, "Ebtables rule already present");
        return Ok(false);
    }

    eb.apply(rule, RuleAction::Append).await?;
    Ok(true)
}

/// [`EbtablesInterface`] backed by the `ebtables` tool.
#[derive(Clone)]
pub struct Ebtables {
    exec: Arc<dyn ExecClient>,
}

impl Ebtables {
    /// Create an ebtables client.
    pub fn new(exec: Arc<dyn ExecClient>) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl EbtablesInterface for Ebtables {
    async fn list_rules(&self, table: EbTable, chain: &str) -> TetherResult<String> {
        self.exec
            .execute("ebtables", &args(["-t", table.as_str(), "-L", chain]))
            .await
            .map_err(|e| TetherError::RuleQuery {
                table: table.to_string(),
                chain: chain.to_string(),
                message: e.to_string(),
            })
    }

    async fn apply(&self, rule: &EbRule, action: RuleAction) -> TetherResult<()> {
        tracing::debug!(%rule, ?action, "Applying ebtables rule");

        let mut argv = args(["-t", rule.table.as_str(), action.flag(), rule.chain.as_str()]);
        argv.extend(rule.spec.iter().cloned());

        match self.exec.execute("ebtables", &argv).await {
            Ok(_) => Ok(()),
            Err(TetherError::Command { ref stderr, .. })
                if action == RuleAction::Delete && stderr.contains("does not exist") =>
            {
                tracing::debug!(%rule, "Ebtables rule already absent");
                Ok(())
            }
            Err(e) => Err(TetherError::RuleInstall {
                table: rule.table.to_string(),
                chain: rule.chain.clone(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeExec;

    #[test]
    fn arp_reply_spec() {
        let rule = EbRule::arp_reply(
            Ipv4Addr::new(10, 0, 0, 5),
            "12:34:56:78:9a:bc".parse().unwrap(),
        );
        assert_eq!(
            rule.to_string(),
            "-t nat PREROUTING -p ARP --arp-op Request --arp-ip-dst 10.0.0.5 -j arpreply --arpreply-mac 12:34:56:78:9a:bc"
        );
    }

    #[test]
    fn dnat_uses_family_specific_match() {
        let mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let v4 = EbRule::dnat_for_ip("eth0", "10.0.0.5".parse().unwrap(), mac);
        let v6 = EbRule::dnat_for_ip("eth0", "fd00::5".parse().unwrap(), mac);
        assert!(v4.match_text().contains("-p IPv4 --ip-dst 10.0.0.5"));
        assert!(v6.match_text().contains("-p IPv6 --ip6-dst fd00::5"));
    }

    #[test]
    fn vlan_drop_matches_listing() {
        assert_eq!(EbRule::vlan_drop().match_text(), "-p 802_1Q -j DROP");
    }

    #[tokio::test]
    async fn append_if_absent_skips_listed_rule() {
        let exec = Arc::new(FakeExec::new());
        exec.respond_matching(
            "-L PREROUTING",
            "Bridge table: nat\n\nBridge chain: PREROUTING, entries: 1, policy: ACCEPT\n-p 802_1Q -j DROP\n",
        );
        let eb = Ebtables::new(Arc::clone(&exec) as Arc<dyn ExecClient>);

        let added = append_if_absent(&eb, &EbRule::vlan_drop()).await.unwrap();
        assert!(!added);
        assert_eq!(exec.commands(), vec!["ebtables -t nat -L PREROUTING"]);
    }

    #[tokio::test]
    async fn delete_of_missing_rule_succeeds() {
        let exec = Arc::new(FakeExec::new());
        exec.fail_matching(" -D ", "Sorry, rule does not exist.");
        let eb = Ebtables::new(Arc::clone(&exec) as Arc<dyn ExecClient>);

        eb.apply(&EbRule::vlan_drop(), RuleAction::Delete)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn install_failure_is_rule_install_error() {
        let exec = Arc::new(FakeExec::new());
        exec.fail_matching(" -A ", "Illegal target name");
        let eb = Ebtables::new(Arc::clone(&exec) as Arc<dyn ExecClient>);

        let err = eb
            .apply(&EbRule::vlan_drop(), RuleAction::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::RuleInstall { .. }));
    }
}
