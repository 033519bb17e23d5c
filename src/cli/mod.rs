//! Command-line interface definitions for the `mist` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `mist` binary.
#[derive(Debug, Parser)]
#[command(
    name = "mist",
    about = "Reach private dev instances directly or through a bastion tunnel",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Resolve and print the connection plan without opening anything.
    #[command(name = "route", about = "Resolve the transport for an instance")]
    Route(RouteCommand),
    /// Resolve, open a tunnel when mediation is needed, and print the endpoint.
    #[command(name = "connect", about = "Open a connection path to an instance")]
    Connect(ConnectCommand),
}

/// Preference flags shared by routing subcommands.
#[derive(Debug, Parser)]
pub(crate) struct PreferenceFlags {
    /// Dial the instance directly no matter what; you accept the risk.
    ///
    /// This is the only way a private-only instance is ever dialled without
    /// a bastion.
    #[arg(long = "direct", conflicts_with = "prefer_direct")]
    pub(crate) direct: bool,
    /// Prefer the public address when the instance has one.
    #[arg(long)]
    pub(crate) prefer_direct: bool,
    /// Pin a specific bastion by name or identifier.
    ///
    /// The pinned bastion must be operational and support tunnelling;
    /// resolution fails rather than falling back to another host.
    #[arg(long, value_name = "BASTION")]
    pub(crate) via: Option<String>,
    /// Offer to create a bastion when none exists (handled by the
    /// provisioning flow; resolution itself never creates anything).
    #[arg(long)]
    pub(crate) auto_create: bool,
}

/// Arguments for the `mist route` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RouteCommand {
    /// Name of the instance to resolve.
    #[arg(value_name = "INSTANCE")]
    pub(crate) instance: String,
    #[command(flatten)]
    pub(crate) prefs: PreferenceFlags,
}

/// Arguments for the `mist connect` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ConnectCommand {
    /// Name of the instance to connect to.
    #[arg(value_name = "INSTANCE")]
    pub(crate) instance: String,
    #[command(flatten)]
    pub(crate) prefs: PreferenceFlags,
}
