//! Engine configuration.
//!
//! All well-known addresses used by the endpoint clients (the IPv6 host
//! gateway, the fixed MACs used for hairpinning and gateway resolution, the
//! SNAT bridge naming) live here so deployments can override them without
//! code changes. Every field has a default; a TOML file only needs to list
//! what it changes.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::{TetherError, TetherResult};
use crate::mac::MacAddr;

/// How container endpoints are attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Plain bridged: ARP resolves to the container's own MAC.
    #[default]
    Bridge,
    /// Overlay: ARP resolves to a fixed virtual MAC for host hairpinning.
    Tunnel,
    /// Outbound-only connectivity through the host SNAT bridge.
    Snat,
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Tunnel => write!(f, "tunnel"),
            Self::Snat => write!(f, "snat"),
        }
    }
}

/// Well-known addressing shared by every endpoint on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WellKnownAddresses {
    /// Link-local address the host answers on as the containers' IPv6 gateway.
    pub ipv6_host_gateway: Ipv6Addr,
    /// MAC bound to [`Self::ipv6_host_gateway`] inside every container.
    pub host_gateway_mac: MacAddr,
    /// MAC that tunnel-mode ARP replies resolve to.
    pub virtual_mac: MacAddr,
    /// VNET CIDR used when an endpoint does not override it.
    pub default_vnet_cidr: Ipv6Net,
    /// Instance metadata address, never blocked on the SNAT bridge.
    pub imds_ip: Ipv4Net,
}

impl Default for WellKnownAddresses {
    fn default() -> Self {
        Self {
            ipv6_host_gateway: Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0x1234, 0x5678, 0x9abc),
            host_gateway_mac: MacAddr([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]),
            virtual_mac: MacAddr([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]),
            default_vnet_cidr: Ipv6Net::new_assert(
                Ipv6Addr::new(0x2001, 0x1234, 0x5678, 0x9abc, 0, 0, 0, 0),
                64,
            ),
            imds_ip: Ipv4Net::new_assert(Ipv4Addr::new(169, 254, 169, 254), 32),
        }
    }
}

/// Host SNAT bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnatConfig {
    /// Name of the host-scoped SNAT bridge.
    pub bridge_name: String,
    /// Final name of the SNAT interface inside the container.
    pub container_if_name: String,
    /// Bridge address with prefix; the prefix is the masqueraded subnet.
    pub bridge_ip: Option<IpNet>,
    /// Enable proxy-ARP on the bridge.
    pub enable_proxy_arp: bool,
    /// Addresses that stay reachable through the bridge despite the private-range block.
    pub skip_addresses_from_block: Vec<IpNet>,
    /// Let the host open connections to the container's SNAT address.
    pub allow_inbound_from_host_to_nc: bool,
    /// Let the container open connections to the host's bridge address.
    pub allow_inbound_from_nc_to_host: bool,
}

impl Default for SnatConfig {
    fn default() -> Self {
        Self {
            bridge_name: "snatbr0".to_string(),
            container_if_name: "eth1".to_string(),
            bridge_ip: None,
            enable_proxy_arp: false,
            skip_addresses_from_block: Vec::new(),
            allow_inbound_from_host_to_nc: false,
            allow_inbound_from_nc_to_host: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Operating mode for new endpoint clients.
    pub mode: OperatingMode,
    /// Well-known addresses.
    pub addresses: WellKnownAddresses,
    /// SNAT bridge settings.
    pub snat: SnatConfig,
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] if the text is not valid configuration.
    pub fn from_toml_str(text: &str) -> TetherResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> TetherResult<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading engine config");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> TetherResult<()> {
        if self.snat.bridge_name.is_empty() || self.snat.bridge_name.len() > crate::id::MAX_IFNAME_LEN
        {
            return Err(TetherError::Config {
                message: format!("invalid SNAT bridge name '{}'", self.snat.bridge_name),
            });
        }

        if self.mode == OperatingMode::Snat && self.snat.bridge_ip.is_none() {
            return Err(TetherError::Config {
                message: "snat mode requires snat.bridge_ip".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_well_known_values() {
        let config = EngineConfig::default();
        assert_eq!(config.mode, OperatingMode::Bridge);
        assert_eq!(
            config.addresses.ipv6_host_gateway.to_string(),
            "fe80::1234:5678:9abc"
        );
        assert_eq!(config.addresses.host_gateway_mac.to_string(), "12:34:56:78:9a:bc");
        assert_eq!(
            config.addresses.default_vnet_cidr.to_string(),
            "2001:1234:5678:9abc::/64"
        );
        assert_eq!(config.addresses.imds_ip.to_string(), "169.254.169.254/32");
        assert_eq!(config.snat.container_if_name, "eth1");
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            mode = "tunnel"

            [addresses]
            virtual_mac = "02:00:00:00:00:aa"

            [snat]
            bridge_ip = "169.254.128.1/17"
            enable_proxy_arp = true
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, OperatingMode::Tunnel);
        assert_eq!(config.addresses.virtual_mac.to_string(), "02:00:00:00:00:aa");
        assert_eq!(
            config.addresses.host_gateway_mac,
            WellKnownAddresses::default().host_gateway_mac
        );
        assert!(config.snat.enable_proxy_arp);
        assert_eq!(config.snat.bridge_name, "snatbr0");
    }

    #[test]
    fn snat_mode_requires_bridge_ip() {
        let err = EngineConfig::from_toml_str("mode = \"snat\"").unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[test]
    fn rejects_bad_mac() {
        let err = EngineConfig::from_toml_str("[addresses]\nvirtual_mac = \"nope\"").unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[test]
    fn load_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tether.toml");
        std::fs::write(&path, "mode = \"bridge\"\n[snat]\nbridge_name = \"natbr\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.snat.bridge_name, "natbr");
    }
}
