//! Binary entry point for the mist CLI.

use std::io::{self, IsTerminal, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mist::{
    AccessResolver, AffinityStore, BastionDirectory, CliCredentialStatus, ConfigError, Connection,
    ConnectionPlan, ConnectionRouter, CredentialGuard, InstanceInventory, InventoryError,
    MistConfig, ProcessCommandRunner, RouteError, RoutePreferences, RouterSettings,
    SshProxySpawner, TracingAuditSink, TunnelManager, TunnelRegistry,
};

mod cli;

use cli::{Cli, ConnectCommand, PreferenceFlags, RouteCommand};

/// Exit code reported when a shutdown signal cut the session short.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

type Router = ConnectionRouter<
    ProcessCommandRunner,
    CliCredentialStatus<ProcessCommandRunner>,
    SshProxySpawner,
    AffinityStore,
    TracingAuditSink,
>;

struct Stack {
    router: Router,
    inventory: InstanceInventory<ProcessCommandRunner>,
    registry: Arc<TunnelRegistry>,
    grace: Duration,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Route(command) => route_command(&command).await,
        Cli::Connect(command) => connect_command(&command).await,
    }
}

fn build_stack(config: &MistConfig) -> Result<Stack, CliError> {
    let query = config.cloud_query()?;
    let inventory = InstanceInventory::with_process_runner(query.clone());
    let directory = BastionDirectory::with_process_runner(query);
    let guard = CredentialGuard::new(CliCredentialStatus::with_process_runner(
        config.cloud_bin.clone(),
    ));
    let resolver = AccessResolver::new(directory, guard, config.resolver_settings());

    let registry = Arc::new(TunnelRegistry::new());
    let tunnels = TunnelManager::new(
        SshProxySpawner::new(config.ssh_options()),
        Arc::clone(&registry),
        config.tunnel_settings(),
    );

    let router = ConnectionRouter::new(
        resolver,
        tunnels,
        AffinityStore::new(),
        TracingAuditSink,
        RouterSettings::default(),
    );

    Ok(Stack {
        router,
        inventory,
        registry,
        grace: config.tunnel_grace(),
    })
}

async fn route_command(args: &RouteCommand) -> Result<i32, CliError> {
    let config = MistConfig::load_without_cli_args()?;
    let stack = build_stack(&config)?;
    let target = stack.inventory.lookup(&args.instance)?;
    let prefs = preferences_from(&args.prefs);

    let plan = stack.router.route(&target, &prefs).await?;
    match plan {
        ConnectionPlan::Direct => {
            writeln!(io::stdout(), "direct").ok();
        }
        ConnectionPlan::Mediated { host } => {
            writeln!(io::stdout(), "mediated via {} ({})", host.name, host.id).ok();
        }
    }
    Ok(0)
}

async fn connect_command(args: &ConnectCommand) -> Result<i32, CliError> {
    let config = MistConfig::load_without_cli_args()?;
    let stack = build_stack(&config)?;

    let outcome = tokio::select! {
        result = run_connect(&stack, args) => result,
        () = shutdown_signal() => Ok(EXIT_INTERRUPTED),
    };

    // Single drain point for every exit path; no tunnel subprocess may
    // outlive the controlling process.
    stack.registry.drain_all(stack.grace).await;
    outcome
}

async fn run_connect(stack: &Stack, args: &ConnectCommand) -> Result<i32, CliError> {
    let target = stack.inventory.lookup(&args.instance)?;
    let prefs = preferences_from(&args.prefs);

    let connection: Connection = stack.router.connect(&target, &prefs).await?;
    writeln!(io::stdout(), "{}", connection.endpoint).ok();

    if connection.session.is_some() {
        info!(endpoint = %connection.endpoint, "tunnel established; press Ctrl-C to close");
        // Hold the tunnel until a shutdown signal cancels this future.
        std::future::pending::<()>().await;
    }
    Ok(0)
}

fn preferences_from(flags: &PreferenceFlags) -> RoutePreferences {
    RoutePreferences {
        force_direct: flags.direct,
        prefer_direct: flags.prefer_direct,
        named_host: flags.via.clone(),
        auto_create: flags.auto_create,
    }
}

async fn shutdown_signal() {
    let terminate = signal(SignalKind::terminate());
    match terminate {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferences_map_every_flag() {
        let flags = PreferenceFlags {
            direct: true,
            prefer_direct: false,
            via: Some(String::from("gw-alpha")),
            auto_create: true,
        };
        let prefs = preferences_from(&flags);
        assert!(prefs.force_direct);
        assert!(!prefs.prefer_direct);
        assert_eq!(prefs.named_host.as_deref(), Some("gw-alpha"));
        assert!(prefs.auto_create);
    }

    #[test]
    fn write_error_renders_the_configuration_error() {
        let mut buf = Vec::new();
        let err = CliError::Config(ConfigError::MissingField(String::from(
            "missing project ID",
        )));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("missing project ID"),
            "rendered: {rendered}"
        );
    }
}
