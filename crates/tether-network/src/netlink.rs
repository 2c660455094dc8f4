//! Kernel link, address, route and neighbor configuration.
//!
//! [`NetlinkInterface`] is the capability the endpoint clients program the
//! kernel through. [`IpRoute2`] implements it on top of the `ip` and
//! `bridge` tools; a namespaced view wraps every command in `nsenter`.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use tether_common::{MacAddr, TetherError, TetherResult};

use crate::exec::{ExecClient, args};
use crate::types::{LinkInfo, LinkType, NeighborOp, NeighborState, NetnsHandle, RouteInfo};

/// Link, address, route and neighbor manipulation.
#[async_trait]
pub trait NetlinkInterface: Send + Sync {
    /// Create a link described by `link`.
    async fn add_link(&self, link: &LinkInfo) -> TetherResult<()>;

    /// Delete a link. A link that does not exist is not an error.
    async fn delete_link(&self, name: &str) -> TetherResult<()>;

    /// Check whether a link exists.
    async fn link_exists(&self, name: &str) -> TetherResult<bool>;

    /// Read a link's hardware address.
    async fn hardware_address(&self, name: &str) -> TetherResult<MacAddr>;

    /// Rename a link.
    async fn set_link_name(&self, name: &str, new_name: &str) -> TetherResult<()>;

    /// Set a link administratively up or down.
    async fn set_link_state(&self, name: &str, up: bool) -> TetherResult<()>;

    /// Enslave a link to a bridge.
    async fn set_link_master(&self, name: &str, master: &str) -> TetherResult<()>;

    /// Toggle hairpin mode on a bridge port.
    async fn set_link_hairpin(&self, name: &str, on: bool) -> TetherResult<()>;

    /// Set a link's hardware address.
    async fn set_link_address(&self, name: &str, mac: MacAddr) -> TetherResult<()>;

    /// Move a link into another network namespace.
    async fn set_link_netns(&self, name: &str, netns: &NetnsHandle) -> TetherResult<()>;

    /// Assign an address to a link.
    async fn add_ip_address(&self, name: &str, addr: IpNet) -> TetherResult<()>;

    /// Install a route out of `name`.
    async fn add_route(&self, name: &str, route: &RouteInfo) -> TetherResult<()>;

    /// Add or remove the neighbor entry described by `link`.
    async fn set_or_remove_neighbor(
        &self,
        link: &LinkInfo,
        op: NeighborOp,
        state: NeighborState,
    ) -> TetherResult<()>;

    /// A view of this interface operating inside `netns`.
    fn in_namespace(&self, netns: &NetnsHandle) -> Arc<dyn NetlinkInterface>;
}

/// [`NetlinkInterface`] backed by iproute2.
#[derive(Clone)]
pub struct IpRoute2 {
    exec: Arc<dyn ExecClient>,
    netns: Option<NetnsHandle>,
}

#[derive(Deserialize)]
struct IpLink {
    address: Option<String>,
}

impl IpRoute2 {
    /// Create an iproute2 client in the current namespace.
    pub fn new(exec: Arc<dyn ExecClient>) -> Self {
        Self { exec, netns: None }
    }

    async fn run(&self, program: &str, argv: Vec<String>) -> TetherResult<String> {
        match &self.netns {
            None => self.exec.execute(program, &argv).await,
            Some(netns) => {
                let mut wrapped = match netns {
                    NetnsHandle::Path(path) => vec![format!("--net={}", path.display())],
                    NetnsHandle::Pid(pid) => args(["-t", &pid.to_string(), "-n"]),
                };
                wrapped.push(program.to_string());
                wrapped.extend(argv);
                self.exec.execute("nsenter", &wrapped).await
            }
        }
    }

    async fn ip(&self, argv: Vec<String>) -> TetherResult<String> {
        self.run("ip", argv).await
    }
}

fn stderr_of(err: &TetherError) -> String {
    match err {
        TetherError::Command { stderr, .. } => stderr.clone(),
        other => other.to_string(),
    }
}

fn is_missing(err: &TetherError) -> bool {
    let stderr = stderr_of(err).to_lowercase();
    stderr.contains("cannot find device")
        || stderr.contains("does not exist")
        || stderr.contains("no such device")
        || stderr.contains("no such file or directory")
}

fn mutation(name: &str, err: TetherError) -> TetherError {
    if err.is_already_exists() {
        return TetherError::AlreadyExists {
            what: name.to_string(),
        };
    }
    TetherError::LinkMutation {
        name: name.to_string(),
        message: stderr_of(&err),
    }
}

fn namespace(name: &str, err: &TetherError) -> TetherError {
    TetherError::Namespace {
        name: name.to_string(),
        message: stderr_of(err),
    }
}

#[async_trait]
impl NetlinkInterface for IpRoute2 {
    async fn add_link(&self, link: &LinkInfo) -> TetherResult<()> {
        tracing::debug!(name = %link.name, kind = ?link.link_type, "Adding link");

        let mut argv = args(["link", "add", "name", link.name.as_str()]);
        if let Some(mac) = link.mac {
            argv.extend(args(["address".to_string(), mac.to_string()]));
        }
        match &link.link_type {
            LinkType::Bridge => argv.extend(args(["type", "bridge"])),
            LinkType::Veth { peer } => {
                argv.extend(args(["type", "veth", "peer", "name", peer.as_str()]));
            }
            LinkType::Unspecified => {
                return Err(TetherError::LinkCreation {
                    name: link.name.clone(),
                    message: "link type required".to_string(),
                });
            }
        }

        self.ip(argv).await.map(drop).map_err(|e| {
            if e.is_already_exists() {
                TetherError::AlreadyExists {
                    what: format!("link {}", link.name),
                }
            } else {
                TetherError::LinkCreation {
                    name: link.name.clone(),
                    message: stderr_of(&e),
                }
            }
        })
    }

    async fn delete_link(&self, name: &str) -> TetherResult<()> {
        match self.ip(args(["link", "delete", name])).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => {
                tracing::debug!(name, "Link already gone");
                Ok(())
            }
            Err(e) => Err(mutation(name, e)),
        }
    }

    async fn link_exists(&self, name: &str) -> TetherResult<bool> {
        match self.ip(args(["link", "show", name])).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(mutation(name, e)),
        }
    }

    async fn hardware_address(&self, name: &str) -> TetherResult<MacAddr> {
        let out = self
            .ip(args(["-j", "link", "show", name]))
            .await
            .map_err(|e| mutation(name, e))?;
        let links: Vec<IpLink> = serde_json::from_str(&out)?;
        let address = links
            .into_iter()
            .find_map(|l| l.address)
            .ok_or_else(|| TetherError::LinkMutation {
                name: name.to_string(),
                message: "link has no hardware address".to_string(),
            })?;
        address.parse()
    }

    async fn set_link_name(&self, name: &str, new_name: &str) -> TetherResult<()> {
        self.ip(args(["link", "set", "dev", name, "name", new_name]))
            .await
            .map(drop)
            .map_err(|e| namespace(name, &e))
    }

    async fn set_link_state(&self, name: &str, up: bool) -> TetherResult<()> {
        let state = if up { "up" } else { "down" };
        self.ip(args(["link", "set", "dev", name, state]))
            .await
            .map(drop)
            .map_err(|e| mutation(name, e))
    }

    async fn set_link_master(&self, name: &str, master: &str) -> TetherResult<()> {
        self.ip(args(["link", "set", "dev", name, "master", master]))
            .await
            .map(drop)
            .map_err(|e| mutation(name, e))
    }

    async fn set_link_hairpin(&self, name: &str, on: bool) -> TetherResult<()> {
        let mode = if on { "on" } else { "off" };
        self.run("bridge", args(["link", "set", "dev", name, "hairpin", mode]))
            .await
            .map(drop)
            .map_err(|e| mutation(name, e))
    }

    async fn set_link_address(&self, name: &str, mac: MacAddr) -> TetherResult<()> {
        self.ip(args([
            "link".to_string(),
            "set".to_string(),
            "dev".to_string(),
            name.to_string(),
            "address".to_string(),
            mac.to_string(),
        ]))
        .await
        .map(drop)
        .map_err(|e| mutation(name, e))
    }

    async fn set_link_netns(&self, name: &str, netns: &NetnsHandle) -> TetherResult<()> {
        self.ip(args([
            "link".to_string(),
            "set".to_string(),
            "dev".to_string(),
            name.to_string(),
            "netns".to_string(),
            netns.as_ip_arg(),
        ]))
        .await
        .map(drop)
        .map_err(|e| namespace(name, &e))
    }

    async fn add_ip_address(&self, name: &str, addr: IpNet) -> TetherResult<()> {
        self.ip(args([
            "addr".to_string(),
            "add".to_string(),
            addr.to_string(),
            "dev".to_string(),
            name.to_string(),
        ]))
        .await
        .map(drop)
        .map_err(|e| mutation(name, e))
    }

    async fn add_route(&self, name: &str, route: &RouteInfo) -> TetherResult<()> {
        let mut argv = Vec::new();
        if route.dst.addr().is_ipv6() {
            argv.push("-6".to_string());
        }
        argv.extend(args(["route".to_string(), "add".to_string(), route.dst.to_string()]));
        if let Some(gw) = route.gw {
            argv.extend(args(["via".to_string(), gw.to_string()]));
        }
        argv.extend(args(["dev", name]));
        if let Some(priority) = route.priority {
            argv.extend(args(["metric".to_string(), priority.to_string()]));
        }

        self.ip(argv).await.map(drop).map_err(|e| mutation(name, e))
    }

    async fn set_or_remove_neighbor(
        &self,
        link: &LinkInfo,
        op: NeighborOp,
        state: NeighborState,
    ) -> TetherResult<()> {
        let ip = link.ip_addr.ok_or_else(|| TetherError::LinkMutation {
            name: link.name.clone(),
            message: "neighbor entry requires an IP address".to_string(),
        })?;

        let argv = match op {
            NeighborOp::Add => {
                let mac = link.mac.ok_or_else(|| TetherError::LinkMutation {
                    name: link.name.clone(),
                    message: format!("neighbor entry for {ip} requires a MAC address"),
                })?;
                neighbor_args("replace", ip, Some(mac), &link.name, state)
            }
            NeighborOp::Remove => neighbor_args("del", ip, None, &link.name, state),
        };

        match self.ip(argv).await {
            Ok(_) => Ok(()),
            Err(e) if op == NeighborOp::Remove && is_missing(&e) => Ok(()),
            Err(e) => Err(mutation(&link.name, e)),
        }
    }

    fn in_namespace(&self, netns: &NetnsHandle) -> Arc<dyn NetlinkInterface> {
        Arc::new(Self {
            exec: Arc::clone(&self.exec),
            netns: Some(netns.clone()),
        })
    }
}

fn neighbor_args(
    verb: &str,
    ip: IpAddr,
    mac: Option<MacAddr>,
    dev: &str,
    state: NeighborState,
) -> Vec<String> {
    let mut argv = Vec::new();
    if ip.is_ipv6() {
        argv.push("-6".to_string());
    }
    argv.extend(args(["neigh".to_string(), verb.to_string(), ip.to_string()]));
    if let Some(mac) = mac {
        argv.extend(args(["lladdr".to_string(), mac.to_string()]));
    }
    argv.extend(args(["dev", dev]));
    if verb != "del" {
        argv.extend(args(["nud", state.as_str()]));
    }
    argv
}
