//! Routing-layer (iptables) rules.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tether_common::{TetherError, TetherResult};

use crate::exec::{ExecClient, args};

/// `filter` table.
pub const FILTER: &str = "filter";
/// `nat` table.
pub const NAT: &str = "nat";

/// Built-in INPUT chain.
pub const INPUT: &str = "INPUT";
/// Built-in OUTPUT chain.
pub const OUTPUT: &str = "OUTPUT";
/// Built-in FORWARD chain.
pub const FORWARD: &str = "FORWARD";
/// Built-in POSTROUTING chain.
pub const POSTROUTING: &str = "POSTROUTING";
/// Chain holding host/container input exceptions, jumped to from INPUT.
pub const TETHER_INPUT: &str = "TETHER-INPUT";
/// Chain holding host/container output exceptions, jumped to from OUTPUT.
pub const TETHER_OUTPUT: &str = "TETHER-OUTPUT";

/// Accept target.
pub const ACCEPT: &str = "ACCEPT";
/// Drop target.
pub const DROP: &str = "DROP";
/// Masquerade target.
pub const MASQUERADE: &str = "MASQUERADE";

/// Connection-tracking state of an established flow.
pub const ESTABLISHED: &str = "ESTABLISHED";
/// Connection-tracking state of a flow related to an established one.
pub const RELATED: &str = "RELATED";

/// Seconds to wait for the xtables lock.
const LOCK_WAIT_SECS: &str = "60";

/// Address family a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// `iptables`.
    V4,
    /// `ip6tables`.
    V6,
}

impl IpVersion {
    fn program(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }
}

/// A rule keyed by table, chain, match condition and target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IptRule {
    /// Address family.
    pub version: IpVersion,
    /// Table.
    pub table: String,
    /// Chain.
    pub chain: String,
    /// Match condition, e.g. `-s 10.0.0.0/8 -o br0`. May be empty.
    pub match_condition: String,
    /// Jump target: a verdict or another chain.
    pub target: String,
}

impl IptRule {
    /// An IPv4 rule.
    pub fn v4(
        table: &str,
        chain: &str,
        match_condition: impl Into<String>,
        target: &str,
    ) -> Self {
        Self {
            version: IpVersion::V4,
            table: table.to_string(),
            chain: chain.to_string(),
            match_condition: match_condition.into(),
            target: target.to_string(),
        }
    }

    fn argv(&self, flag: &str) -> Vec<String> {
        let mut argv = args(["-w", LOCK_WAIT_SECS, "-t", self.table.as_str(), flag, self.chain.as_str()]);
        argv.extend(self.match_condition.split_whitespace().map(str::to_string));
        argv.extend(args(["-j", self.target.as_str()]));
        argv
    }
}

impl fmt::Display for IptRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {}", self.table, self.chain)?;
        let condition = self.match_condition.trim();
        if !condition.is_empty() {
            write!(f, " {condition}")?;
        }
        write!(f, " -j {}", self.target)
    }
}

/// Routing-layer packet filter.
#[async_trait]
pub trait IptablesInterface: Send + Sync {
    /// Create a chain. An existing chain is not an error.
    async fn create_chain(&self, version: IpVersion, table: &str, chain: &str) -> TetherResult<()>;

    /// Check whether `rule` is present.
    async fn rule_exists(&self, rule: &IptRule) -> TetherResult<bool>;

    /// Insert `rule` at the head of its chain.
    async fn insert_rule(&self, rule: &IptRule) -> TetherResult<()>;

    /// Append `rule` to its chain.
    async fn append_rule(&self, rule: &IptRule) -> TetherResult<()>;

    /// Delete `rule`.
    async fn delete_rule(&self, rule: &IptRule) -> TetherResult<()>;
}

/// Insert `rule` unless present. Returns whether it was added.
pub async fn ensure_inserted(ipt: &dyn IptablesInterface, rule: &IptRule) -> TetherResult<bool> {
    if ipt.rule_exists(rule).await? {
        tracing::debug!(%rule, "Iptables rule already present");
        return Ok(false);
    }
    ipt.insert_rule(rule).await?;
    Ok(true)
}

/// Append `rule` unless present. Returns whether it was added.
pub async fn ensure_appended(ipt: &dyn IptablesInterface, rule: &IptRule) -> TetherResult<bool> {
    if ipt.rule_exists(rule).await? {
        tracing::debug!(%rule, "Iptables rule already present");
        return Ok(false);
    }
    ipt.append_rule(rule).await?;
    Ok(true)
}

/// Delete `rule` if present. Returns whether it was removed.
pub async fn delete_if_present(ipt: &dyn IptablesInterface, rule: &IptRule) -> TetherResult<bool> {
    if !ipt.rule_exists(rule).await? {
        return Ok(false);
    }
    ipt.delete_rule(rule).await?;
    Ok(true)
}

/// [`IptablesInterface`] backed by `iptables`/`ip6tables`.
#[derive(Clone)]
pub struct Iptables {
    exec: Arc<dyn ExecClient>,
}

impl Iptables {
    /// Create an iptables client.
    pub fn new(exec: Arc<dyn ExecClient>) -> Self {
        Self { exec }
    }

    async fn mutate(&self, rule: &IptRule, flag: &str) -> TetherResult<()> {
        tracing::debug!(%rule, flag, "Applying iptables rule");
        self.exec
            .execute(rule.version.program(), &rule.argv(flag))
            .await
            .map(drop)
            .map_err(|e| TetherError::RuleInstall {
                table: rule.table.clone(),
                chain: rule.chain.clone(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl IptablesInterface for Iptables {
    async fn create_chain(&self, version: IpVersion, table: &str, chain: &str) -> TetherResult<()> {
        let listed = self
            .exec
            .execute(
                version.program(),
                &args(["-w", LOCK_WAIT_SECS, "-t", table, "-nL", chain]),
            )
            .await;
        if listed.is_ok() {
            tracing::debug!(table, chain, "Chain already exists");
            return Ok(());
        }

        match self
            .exec
            .execute(
                version.program(),
                &args(["-w", LOCK_WAIT_SECS, "-t", table, "-N", chain]),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(TetherError::Command { ref stderr, .. }) if stderr.contains("already exists") => {
                Ok(())
            }
            Err(e) => Err(TetherError::RuleInstall {
                table: table.to_string(),
                chain: chain.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn rule_exists(&self, rule: &IptRule) -> TetherResult<bool> {
        match self
            .exec
            .execute(rule.version.program(), &rule.argv("-C"))
            .await
        {
            Ok(_) => Ok(true),
            Err(TetherError::Command { code: Some(1), .. }) => Ok(false),
            Err(e) => Err(TetherError::RuleQuery {
                table: rule.table.clone(),
                chain: rule.chain.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn insert_rule(&self, rule: &IptRule) -> TetherResult<()> {
        self.mutate(rule, "-I").await
    }

    async fn append_rule(&self, rule: &IptRule) -> TetherResult<()> {
        self.mutate(rule, "-A").await
    }

    async fn delete_rule(&self, rule: &IptRule) -> TetherResult<()> {
        self.mutate(rule, "-D").await
    }
}
