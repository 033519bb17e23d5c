//! Lifecycle coverage for tunnel sessions using real placeholder processes.
//!
//! The placeholder subprocess is an inert `sleep`; each test that needs the
//! readiness poll to succeed holds its own loopback listener on the port the
//! manager is allowed to draw.

#[path = "common/test_constants.rs"]
mod test_constants;

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use mist::test_support::{
    GatewayFixture, InertProxySpawner, MemoryAffinity, MemoryAuditSink, ScriptedRunner,
    StaticCredentialStatus, json_gateways,
};
use mist::{
    AccessResolver, AuditOutcome, BastionDirectory, BastionHost, BastionState, BastionTier,
    CloudQueryConfig, ConnectionRouter, CredentialGuard, DEFAULT_SSH_PORT, NetworkScope,
    RemoteTarget, ResolverSettings, RoutePreferences, RouterSettings, SessionState, TunnelError,
    TunnelManager, TunnelRegistry, TunnelSettings,
};
use test_constants::{TEST_NETWORK, TEST_PRINCIPAL, TEST_PROJECT_ID};

fn target() -> RemoteTarget {
    RemoteTarget {
        id: String::from("srv-1"),
        name: String::from("dev-box"),
        private_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        public_ip: None,
        network: Some(NetworkScope::new(TEST_NETWORK)),
        ssh_port: DEFAULT_SSH_PORT,
    }
}

fn bastion() -> BastionHost {
    BastionHost {
        id: String::from("gw-alpha"),
        name: String::from("gw-gw-alpha"),
        state: BastionState::Ready,
        tier: BastionTier::Standard,
        networks: vec![NetworkScope::new(TEST_NETWORK)],
        public_ip: Some(IpAddr::V4(Ipv4Addr::new(51, 15, 0, 1))),
    }
}

/// Reserves a loopback port by holding a listener on it.
fn reserve_loopback_port() -> (TcpListener, u16) {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("loopback bind should succeed");
    let port = listener
        .local_addr()
        .expect("listener should report its address")
        .port();
    (listener, port)
}

fn settings_for_port(port: u16) -> TunnelSettings {
    TunnelSettings {
        port_range: port..=port,
        ready_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        grace: Duration::from_secs(1),
        ..TunnelSettings::default()
    }
}

fn manager_for_port(
    spawner: &InertProxySpawner,
    registry: &Arc<TunnelRegistry>,
    port: u16,
) -> TunnelManager<InertProxySpawner> {
    TunnelManager::new(spawner.clone(), Arc::clone(registry), settings_for_port(port))
}

/// Returns `true` once the process no longer exists.
fn process_gone(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

#[tokio::test]
async fn open_hands_back_a_listening_loopback_endpoint() {
    let (listener, port) = reserve_loopback_port();
    let spawner = InertProxySpawner::new();
    let registry = Arc::new(TunnelRegistry::new());
    let manager = manager_for_port(&spawner, &registry, port);

    let handle = manager
        .open(&target(), &bastion())
        .await
        .expect("open should succeed while the port accepts connections");

    assert!(handle.endpoint.is_loopback());
    assert_eq!(handle.endpoint.port, port);

    let summaries = registry.list();
    let Some(summary) = summaries.first() else {
        panic!("the session should be registered");
    };
    assert_eq!(summary.state, SessionState::Listening);
    assert_eq!(summary.target_id, "srv-1");
    assert_eq!(summary.bastion_id, "gw-alpha");

    assert!(registry.mark_active(handle.id));
    manager.close(handle.id).await;
    drop(listener);
}

#[tokio::test]
async fn close_is_idempotent_and_terminates_the_proxy() {
    let (_listener, port) = reserve_loopback_port();
    let spawner = InertProxySpawner::new();
    let registry = Arc::new(TunnelRegistry::new());
    let manager = manager_for_port(&spawner, &registry, port);

    let handle = manager
        .open(&target(), &bastion())
        .await
        .expect("open should succeed");
    let pids = spawner.pids();
    let Some(&pid) = pids.first() else {
        panic!("a placeholder process should have been spawned");
    };

    manager.close(handle.id).await;
    assert!(registry.is_empty());
    assert!(process_gone(pid), "the proxy must not outlive its session");

    // Closing again is a no-op, not an error or a double-free.
    manager.close(handle.id).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn drain_all_terminates_every_proxy() {
    let spawner = InertProxySpawner::new();
    let registry = Arc::new(TunnelRegistry::new());

    let mut listeners = Vec::new();
    for _ in 0..5 {
        let (listener, port) = reserve_loopback_port();
        let manager = manager_for_port(&spawner, &registry, port);
        manager
            .open(&target(), &bastion())
            .await
            .expect("open should succeed");
        listeners.push(listener);
    }
    assert_eq!(registry.len(), 5);

    registry.drain_all(Duration::from_secs(1)).await;

    assert!(registry.is_empty(), "drain must leave the registry empty");
    let pids = spawner.pids();
    assert_eq!(pids.len(), 5);
    for pid in pids {
        assert!(process_gone(pid), "proxy {pid} must be terminated");
    }
}

#[tokio::test]
async fn readiness_timeout_leaves_no_process_behind() {
    // Reserve a port, then free it so nothing listens there.
    let (listener, port) = reserve_loopback_port();
    drop(listener);

    let spawner = InertProxySpawner::new();
    let registry = Arc::new(TunnelRegistry::new());
    let settings = TunnelSettings {
        ready_timeout: Duration::from_millis(200),
        ..settings_for_port(port)
    };
    let manager = TunnelManager::new(spawner.clone(), Arc::clone(&registry), settings);

    let err = manager
        .open(&target(), &bastion())
        .await
        .expect_err("no listener means the proxy never reaches listening");
    assert!(
        matches!(err, TunnelError::Timeout { .. }),
        "unexpected error: {err:?}"
    );

    assert!(registry.is_empty(), "nothing may be registered on timeout");
    let pids = spawner.pids();
    let Some(&pid) = pids.first() else {
        panic!("a placeholder process should have been spawned");
    };
    assert!(
        process_gone(pid),
        "a half-initialised proxy must not be left running"
    );
}

#[tokio::test]
async fn mediated_connect_returns_a_loopback_endpoint_end_to_end() {
    let (_listener, port) = reserve_loopback_port();
    let spawner = InertProxySpawner::new();
    let registry = Arc::new(TunnelRegistry::new());

    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(0),
        json_gateways(&[GatewayFixture::usable("gw-alpha")]),
        "",
    );
    let query =
        CloudQueryConfig::new("scw", TEST_PROJECT_ID).expect("query config should validate");
    let resolver = AccessResolver::new(
        BastionDirectory::new(query, runner),
        CredentialGuard::new(StaticCredentialStatus::non_expiring(TEST_PRINCIPAL)),
        ResolverSettings::default(),
    );
    let affinity = MemoryAffinity::new();
    let audit = MemoryAuditSink::new();
    let router = ConnectionRouter::new(
        resolver,
        TunnelManager::new(spawner, Arc::clone(&registry), settings_for_port(port)),
        affinity.clone(),
        audit.clone(),
        RouterSettings::default(),
    );

    let connection = router
        .connect(&target(), &RoutePreferences::default())
        .await
        .expect("mediated connect should succeed");

    assert!(connection.endpoint.is_loopback());
    assert_eq!(connection.endpoint.port, port);
    let Some(session) = connection.session else {
        panic!("a mediated connection must carry its session id");
    };

    assert_eq!(
        affinity.hints().get("srv-1").map(String::as_str),
        Some("gw-alpha"),
        "a successful mediated connect records affinity"
    );
    let events = audit.events();
    let Some(event) = events.first() else {
        panic!("an audit event should be recorded");
    };
    assert_eq!(event.outcome, AuditOutcome::Connected);
    assert_eq!(event.bastion_id.as_deref(), Some("gw-alpha"));

    router.disconnect(session).await;
    assert!(registry.is_empty());
}
