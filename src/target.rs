//! Value descriptors for remote targets, routing preferences, and endpoints.
//!
//! These types are read-only snapshots handed over by the provisioning and
//! inventory collaborators. Nothing in this crate mutates them after
//! construction.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Default SSH port on freshly provisioned instances.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identifier of a private network scope (VPC / private network).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NetworkScope(String);

impl NetworkScope {
    /// Wraps a provider network identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkScope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A compute instance descriptor as reported by the inventory collaborator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Provider instance identifier.
    pub id: String,
    /// Human readable instance name.
    pub name: String,
    /// Address on the instance's private network.
    pub private_ip: IpAddr,
    /// Public address, when the instance has one attached.
    pub public_ip: Option<IpAddr>,
    /// Private network the instance belongs to, when attached to one.
    pub network: Option<NetworkScope>,
    /// TCP port the instance's SSH daemon listens on.
    pub ssh_port: u16,
}

impl RemoteTarget {
    /// Returns `true` when the target can only be reached through a mediator.
    #[must_use]
    pub const fn is_private_only(&self) -> bool {
        self.public_ip.is_none()
    }
}

/// Caller preference flags influencing transport selection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RoutePreferences {
    /// Dial the target directly no matter what; the caller accepts the risk.
    pub force_direct: bool,
    /// Prefer the public address when the target has one.
    pub prefer_direct: bool,
    /// Pin a specific mediating host by name or identifier.
    pub named_host: Option<String>,
    /// Ask the provisioning layer to offer creating a mediator when none
    /// exists. Resolution itself never creates anything.
    pub auto_create: bool,
}

/// A dialable endpoint handed to the remote-shell launcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Host address to dial.
    pub host: IpAddr,
    /// TCP port to dial.
    pub port: u16,
}

impl Endpoint {
    /// Builds a loopback endpoint on the given port.
    #[must_use]
    pub const fn loopback(port: u16) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    /// Returns `true` when the endpoint dials the loopback interface.
    #[must_use]
    pub const fn is_loopback(&self) -> bool {
        self.host.is_loopback()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
