mod common;

use spindle_net::config::{ConnectionConfig, ConnectionParams, LocatorConfig};
use spindle_net::{
    ConnectOutcome, ConnectionSetup, ConnectionStatusCode, Deployment, DeploymentConfig,
    WorkerConnection, WorkerRole,
};

use common::*;

fn secured() -> Deployment {
    start(DeploymentConfig {
        name: "secured".to_string(),
        locator_addr: Some("127.0.0.1:0".to_string()),
        player_identity_tokens: vec!["pit".to_string()],
        login_tokens: vec!["lt".to_string()],
        ..Default::default()
    })
}

fn through_locator(
    deployment: &Deployment,
    player_identity_token: &str,
    login_token: &str,
    name: Option<&str>,
) -> WorkerConnection {
    let locator = deployment.locator_addr().unwrap();
    WorkerConnection::new(ConnectionSetup {
        config: ConnectionConfig::Locator(LocatorConfig {
            locator_host: locator.ip().to_string(),
            port: locator.port(),
            player_identity_token: player_identity_token.to_string(),
            login_token: login_token.to_string(),
            worker_type: "UnrealClient".to_string(),
            deployment: name.map(|n| n.to_string()),
        }),
        params: ConnectionParams::default(),
    })
}

fn failure_code(outcome: ConnectOutcome) -> ConnectionStatusCode {
    match outcome {
        ConnectOutcome::Failed { code, .. } => code,
        ConnectOutcome::Connected => panic!("unexpectedly connected"),
    }
}

#[test]
fn valid_tokens_connect_through_locator() {
    let deployment = secured();
    let mut connection = through_locator(&deployment, "pit", "lt", None);
    assert_eq!(
        connect(&mut connection, WorkerRole::Client, 0),
        ConnectOutcome::Connected
    );
    assert_eq!(
        connection.bridge_address(),
        Some(deployment.receptionist_addr().to_string())
    );
}

#[test]
fn bad_tokens_are_refused() {
    let deployment = secured();

    let mut connection = through_locator(&deployment, "nope", "lt", None);
    assert_eq!(
        failure_code(connect(&mut connection, WorkerRole::Client, 0)),
        ConnectionStatusCode::PlayerIdentityTokenExpired
    );

    let mut connection = through_locator(&deployment, "pit", "nope", None);
    assert_eq!(
        failure_code(connect(&mut connection, WorkerRole::Client, 0)),
        ConnectionStatusCode::LoginTokenExpired
    );

    // url without tokens
    let mut connection = through_locator(&deployment, "", "", None);
    assert_eq!(
        failure_code(connect(&mut connection, WorkerRole::Client, 0)),
        ConnectionStatusCode::PlayerIdentityTokenExpired
    );
}

#[test]
fn unknown_deployment_is_rejected() {
    let deployment = secured();
    let mut connection = through_locator(&deployment, "pit", "lt", Some("elsewhere"));
    assert_eq!(
        failure_code(connect(&mut connection, WorkerRole::Client, 0)),
        ConnectionStatusCode::Rejected
    );

    let mut connection = through_locator(&deployment, "pit", "lt", Some("secured"));
    assert!(connect(&mut connection, WorkerRole::Client, 0).is_connected());
}

#[test]
fn unreachable_locator_fails() {
    init_logging();
    let mut setup = ConnectionSetup::locator("127.0.0.1", "pit", "lt", "UnrealClient");
    if let ConnectionConfig::Locator(config) = &mut setup.config {
        config.port = closed_port();
    }
    let mut connection = WorkerConnection::new(setup);
    assert_eq!(
        failure_code(connect(&mut connection, WorkerRole::Client, 0)),
        ConnectionStatusCode::NetworkError
    );
}
