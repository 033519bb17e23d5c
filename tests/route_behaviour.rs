//! Behavioural coverage for connection routing at the public API surface.
//!
//! These scenarios pin the fail-secure contract: a private-only target is
//! never dialled directly unless the caller explicitly forced it, and no
//! tunnel subprocess is ever spawned once resolution has refused a path.

#[path = "common/test_constants.rs"]
mod test_constants;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use mist::test_support::{
    GatewayFixture, MemoryAffinity, MemoryAuditSink, ScriptedRunner, StaticCredentialStatus,
    UnreachableSpawner, json_gateways,
};
use mist::{
    AccessResolver, AuthError, BastionDirectory, CloudQueryConfig, ConnectionPlan,
    ConnectionRouter, CredentialGuard, DEFAULT_SSH_PORT, NetworkScope, RemoteTarget,
    ResolverSettings, RouteError, RoutePreferences, RouterSettings, TunnelManager, TunnelRegistry,
    TunnelSettings,
};
use test_constants::{TEST_NETWORK, TEST_PRINCIPAL, TEST_PROJECT_ID};

fn private_target() -> RemoteTarget {
    RemoteTarget {
        id: String::from("srv-1"),
        name: String::from("dev-box"),
        private_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        public_ip: None,
        network: Some(NetworkScope::new(TEST_NETWORK)),
        ssh_port: DEFAULT_SSH_PORT,
    }
}

fn router_over(
    runner: ScriptedRunner,
    credential: StaticCredentialStatus,
) -> ConnectionRouter<
    ScriptedRunner,
    StaticCredentialStatus,
    UnreachableSpawner,
    MemoryAffinity,
    MemoryAuditSink,
> {
    let config =
        CloudQueryConfig::new("scw", TEST_PROJECT_ID).expect("query config should validate");
    let resolver = AccessResolver::new(
        BastionDirectory::new(config, runner),
        CredentialGuard::new(credential),
        ResolverSettings {
            discovery_backoff: Duration::from_millis(1),
            ..ResolverSettings::default()
        },
    );
    ConnectionRouter::new(
        resolver,
        TunnelManager::new(
            UnreachableSpawner,
            Arc::new(TunnelRegistry::new()),
            TunnelSettings::default(),
        ),
        MemoryAffinity::new(),
        MemoryAuditSink::new(),
        RouterSettings::default(),
    )
}

#[tokio::test]
async fn private_only_target_without_bastion_never_reaches_a_spawn() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "[]", "");
    let router = router_over(
        runner,
        StaticCredentialStatus::non_expiring(TEST_PRINCIPAL),
    );

    let err = router
        .connect(&private_target(), &RoutePreferences::default())
        .await
        .expect_err("no path must be refused");
    // UnreachableSpawner panics on use, so reaching this assertion also
    // proves no subprocess spawn was attempted.
    assert!(
        matches!(err, RouteError::NoPathAvailable { .. }),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn provisioning_bastion_counts_as_absent() {
    let runner = ScriptedRunner::new();
    let mut provisioning = GatewayFixture::usable("gw-alpha");
    provisioning.status = String::from("allocating");
    runner.push_output(Some(0), json_gateways(&[provisioning]), "");
    let router = router_over(
        runner,
        StaticCredentialStatus::non_expiring(TEST_PRINCIPAL),
    );

    let err = router
        .connect(&private_target(), &RoutePreferences::default())
        .await
        .expect_err("a provisioning bastion must not carry tunnels");
    assert!(
        matches!(err, RouteError::NoPathAvailable { .. }),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn thin_credential_refuses_before_any_subprocess_work() {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(0),
        json_gateways(&[GatewayFixture::usable("gw-alpha")]),
        "",
    );
    let router = router_over(
        runner,
        StaticCredentialStatus::expiring_in(TEST_PRINCIPAL, 120),
    );

    let err = router
        .connect(&private_target(), &RoutePreferences::default())
        .await
        .expect_err("a thin credential must refuse the connection");
    assert_eq!(
        err,
        RouteError::Auth(AuthError::Expiring {
            remaining_secs: 120,
            required_secs: 300,
        })
    );
}

#[tokio::test]
async fn forced_direct_dials_the_private_address_without_discovery() {
    let runner = ScriptedRunner::new();
    let router = router_over(
        runner.clone(),
        StaticCredentialStatus::non_expiring(TEST_PRINCIPAL),
    );
    let prefs = RoutePreferences {
        force_direct: true,
        ..RoutePreferences::default()
    };

    let connection = router
        .connect(&private_target(), &prefs)
        .await
        .expect("forced direct should succeed");
    assert_eq!(
        connection.endpoint.host,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
    );
    assert_eq!(connection.endpoint.port, DEFAULT_SSH_PORT);
    assert!(connection.session.is_none());
    assert!(
        runner.invocations().is_empty(),
        "force-direct must not consult the directory"
    );
}

#[tokio::test]
async fn route_reports_the_deterministic_mediated_plan() {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(0),
        json_gateways(&[
            GatewayFixture::usable("gw-bravo"),
            GatewayFixture::usable("gw-alpha"),
        ]),
        "",
    );
    let router = router_over(
        runner,
        StaticCredentialStatus::non_expiring(TEST_PRINCIPAL),
    );

    let plan = router
        .route(&private_target(), &RoutePreferences::default())
        .await
        .expect("routing should succeed");
    let ConnectionPlan::Mediated { host } = plan else {
        panic!("expected a mediated plan");
    };
    assert_eq!(host.id, "gw-alpha", "tie-break must be reproducible");
}
