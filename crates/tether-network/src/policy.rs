//! Failure policy for lifecycle steps.
//!
//! Every kernel or filter mutation the endpoint clients perform is named by an
//! [`Operation`]. [`Operation::severity`] is the single table deciding whether
//! a failure aborts the lifecycle or is logged and skipped, and
//! [`enforce`] applies it at each call site.

use std::fmt;

use tether_common::{Severity, TetherError, TetherResult};

/// A named step of an endpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create the veth pair.
    CreateVeth,
    /// Read back the container-side MAC.
    ReadContainerMac,
    /// Enslave the host veth to the bridge.
    SetLinkMaster,
    /// Install an ARP-reply rule.
    AddArpReply,
    /// Install a MAC-DNAT rule.
    AddDnat,
    /// Install a static neighbor entry for a container IP.
    AddStaticNeighbor,
    /// Install a route-via-host redirect.
    AddRouteViaHost,
    /// Enable hairpin on the host veth.
    SetHairpin,
    /// Move the container veth into its namespace.
    MoveToNamespace,
    /// Rename the container veth to its final name.
    RenameInterface,
    /// Assign container addresses.
    AssignAddress,
    /// Install caller-supplied routes.
    AddRoute,
    /// Install the synthesized IPv6 route set.
    AddIpv6Routes,
    /// Install the IPv6 gateway neighbor entry.
    AddIpv6Neighbor,
    /// Remove an ARP-reply rule.
    DeleteArpReply,
    /// Remove a MAC-DNAT rule.
    DeleteDnat,
    /// Remove a static neighbor entry.
    DeleteStaticNeighbor,
    /// Delete the host veth.
    DeleteLink,
    /// Create or configure the SNAT bridge.
    ProvisionSnatBridge,
    /// Enable proxy-ARP on the SNAT bridge.
    EnableProxyArp,
    /// Install the SNAT masquerade rule.
    AddMasquerade,
    /// Install the VLAN drop rule.
    AddVlanDrop,
    /// Install the ARP drop for the SNAT bridge range.
    AddArpDrop,
    /// Remove the ARP drop for the SNAT bridge range.
    DeleteArpDrop,
    /// Create a filter chain or its jump.
    CreateChain,
    /// Install a host/container directional allow rule.
    AddDirectionalRule,
    /// Remove a host/container directional allow rule.
    DeleteDirectionalRule,
    /// Install SNAT bridge allow or block rules.
    SetAddressFilter,
}

impl Operation {
    /// Whether a failure of this step aborts the lifecycle.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::AddArpReply
            | Self::AddStaticNeighbor
            | Self::AddRouteViaHost
            | Self::AddIpv6Routes
            | Self::AddIpv6Neighbor
            | Self::DeleteArpReply
            | Self::DeleteDnat
            | Self::DeleteStaticNeighbor
            | Self::DeleteArpDrop
            | Self::DeleteDirectionalRule => Severity::BestEffort,
            Self::CreateVeth
            | Self::ReadContainerMac
            | Self::SetLinkMaster
            | Self::AddDnat
            | Self::SetHairpin
            | Self::MoveToNamespace
            | Self::RenameInterface
            | Self::AssignAddress
            | Self::AddRoute
            | Self::DeleteLink
            | Self::ProvisionSnatBridge
            | Self::EnableProxyArp
            | Self::AddMasquerade
            | Self::AddVlanDrop
            | Self::AddArpDrop
            | Self::CreateChain
            | Self::AddDirectionalRule
            | Self::SetAddressFilter => Severity::Fatal,
        }
    }

    /// Whether an "already exists" failure counts as success.
    #[must_use]
    pub const fn tolerates_existing(self) -> bool {
        matches!(
            self,
            Self::AssignAddress | Self::AddRoute | Self::AddIpv6Routes | Self::ProvisionSnatBridge
        )
    }

    /// Human-readable step name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CreateVeth => "create veth pair",
            Self::ReadContainerMac => "read container MAC",
            Self::SetLinkMaster => "set link master",
            Self::AddArpReply => "add ARP reply rule",
            Self::AddDnat => "add MAC DNAT rule",
            Self::AddStaticNeighbor => "add static neighbor",
            Self::AddRouteViaHost => "add route-via-host rule",
            Self::SetHairpin => "set hairpin",
            Self::MoveToNamespace => "move to namespace",
            Self::RenameInterface => "rename interface",
            Self::AssignAddress => "assign address",
            Self::AddRoute => "add route",
            Self::AddIpv6Routes => "add IPv6 routes",
            Self::AddIpv6Neighbor => "add IPv6 gateway neighbor",
            Self::DeleteArpReply => "delete ARP reply rule",
            Self::DeleteDnat => "delete MAC DNAT rule",
            Self::DeleteStaticNeighbor => "delete static neighbor",
            Self::DeleteLink => "delete link",
            Self::ProvisionSnatBridge => "provision SNAT bridge",
            Self::EnableProxyArp => "enable proxy ARP",
            Self::AddMasquerade => "add masquerade rule",
            Self::AddVlanDrop => "add VLAN drop rule",
            Self::AddArpDrop => "add ARP drop rule",
            Self::DeleteArpDrop => "delete ARP drop rule",
            Self::CreateChain => "create chain",
            Self::AddDirectionalRule => "add directional rule",
            Self::DeleteDirectionalRule => "delete directional rule",
            Self::SetAddressFilter => "set address filter",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Apply the policy for `op` to `result`.
///
/// Fatal failures come back wrapped in [`TetherError::Step`]; best-effort
/// failures are logged and turned into `Ok(None)`.
///
/// # Errors
///
/// Returns the wrapped error when `op` is fatal.
pub fn enforce<T>(op: Operation, result: TetherResult<T>) -> TetherResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if op.tolerates_existing() && err.is_already_exists() => {
            tracing::debug!(operation = %op, "Already present, treating as success");
            Ok(None)
        }
        Err(err) => match op.severity() {
            Severity::Fatal => Err(TetherError::Step {
                operation: op.name(),
                severity: Severity::Fatal,
                source: Box::new(err),
            }),
            Severity::BestEffort => {
                tracing::warn!(operation = %op, error = %err, "Best-effort step failed, continuing");
                Ok(None)
            }
        },
    }
}

/// [`enforce`] for steps without a value.
///
/// # Errors
///
/// Returns the wrapped error when `op` is fatal.
pub fn check(op: Operation, result: TetherResult<()>) -> TetherResult<()> {
    enforce(op, result).map(drop)
}

/// Run a teardown step: the outcome never propagates.
///
/// A failure the policy would treat as fatal is still logged, at error level.
pub fn cleanup(op: Operation, result: TetherResult<()>) {
    if let Err(err) = check(op, result) {
        tracing::error!(operation = %op, error = %err, "Teardown step failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> TetherError {
        TetherError::LinkMutation {
            name: "vth0".to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn fatal_steps() {
        for op in [
            Operation::CreateVeth,
            Operation::SetLinkMaster,
            Operation::AddDnat,
            Operation::MoveToNamespace,
            Operation::RenameInterface,
            Operation::DeleteLink,
        ] {
            assert_eq!(op.severity(), Severity::Fatal, "{op}");
        }
    }

    #[test]
    fn best_effort_steps() {
        for op in [
            Operation::AddArpReply,
            Operation::AddStaticNeighbor,
            Operation::AddIpv6Routes,
            Operation::AddIpv6Neighbor,
            Operation::DeleteArpReply,
            Operation::DeleteDnat,
            Operation::DeleteStaticNeighbor,
            Operation::DeleteArpDrop,
            Operation::DeleteDirectionalRule,
        ] {
            assert_eq!(op.severity(), Severity::BestEffort, "{op}");
        }
    }

    #[test]
    fn fatal_failure_is_wrapped() {
        let err = check(Operation::SetLinkMaster, Err(failure())).unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(err.to_string().starts_with("set link master failed"));
    }

    #[test]
    fn best_effort_failure_is_swallowed() {
        assert!(check(Operation::AddArpReply, Err(failure())).is_ok());
    }

    #[test]
    fn existing_address_is_success() {
        let exists = TetherError::AlreadyExists {
            what: "10.0.0.5/24".to_string(),
        };
        assert!(check(Operation::AssignAddress, Err(exists)).is_ok());
    }

    #[test]
    fn existing_veth_is_still_fatal() {
        let exists = TetherError::AlreadyExists {
            what: "link vth0".to_string(),
        };
        assert!(check(Operation::CreateVeth, Err(exists)).is_err());
    }
}
