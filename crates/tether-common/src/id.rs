//! Endpoint ID validation and veth name derivation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{TetherError, TetherResult};

/// Prefix for host-side veth names.
pub const HOST_VETH_PREFIX: &str = "vth";

/// Prefix for container-side veth names before the in-namespace rename.
pub const CONTAINER_VETH_PREFIX: &str = "vtc";

/// Kernel limit on interface name length, excluding the trailing NUL.
pub const MAX_IFNAME_LEN: usize = 15;

/// A validated endpoint ID.
///
/// Endpoint IDs must:
/// - Be 1-128 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Maximum length of an endpoint ID.
    pub const MAX_LENGTH: usize = 128;

    /// Number of hash hex digits appended to a veth prefix.
    const HASH_DIGITS: usize = 11;

    /// Create a new endpoint ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> TetherResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the endpoint ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the (host, container) veth names for this endpoint.
    ///
    /// Names are stable for a given ID and always fit in [`MAX_IFNAME_LEN`].
    #[must_use]
    pub fn veth_names(&self) -> (String, String) {
        let digest = hex::encode(Sha256::digest(self.0.as_bytes()));
        let suffix = &digest[..Self::HASH_DIGITS];
        (
            format!("{HOST_VETH_PREFIX}{suffix}"),
            format!("{CONTAINER_VETH_PREFIX}{suffix}"),
        )
    }

    fn validate(id: &str) -> TetherResult<()> {
        let invalid = || TetherError::InvalidEndpointId { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EndpointId {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for EndpointId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_endpoint_ids() {
        assert!(EndpointId::new("abc123").is_ok());
        assert!(EndpointId::new("3f2a9c1b-eth0").is_ok());
        assert!(EndpointId::new("pod_1.eth0").is_ok());
    }

    #[test]
    fn invalid_endpoint_ids() {
        assert!(EndpointId::new("").is_err());
        assert!(EndpointId::new("-invalid").is_err());
        assert!(EndpointId::new("bad/id").is_err());
        assert!(EndpointId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn veth_names_are_prefixed_and_paired() {
        let id = EndpointId::new("3f2a9c1b-eth0").unwrap();
        let (host, container) = id.veth_names();
        assert!(host.starts_with(HOST_VETH_PREFIX));
        assert!(container.starts_with(CONTAINER_VETH_PREFIX));
        assert_eq!(host[3..], container[3..]);
        assert_ne!(host, container);
    }

    proptest! {
        #[test]
        fn veth_names_fit_ifnamsiz(id in "[a-z0-9][a-z0-9._-]{0,127}") {
            let id = EndpointId::new(id).unwrap();
            let (host, container) = id.veth_names();
            prop_assert!(host.len() <= MAX_IFNAME_LEN);
            prop_assert!(container.len() <= MAX_IFNAME_LEN);
            prop_assert_eq!(id.veth_names(), (host, container));
        }
    }
}
