mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spindle_net::connection::ConnectionState;
use spindle_net::spindle_core::{ComponentData, Op, OpType, StatusCode};
use spindle_net::{
    ConnectOutcome, ConnectionSetup, ConnectionStatusCode, Lifecycle, WorkerConnection, WorkerRole,
};

use common::*;

#[test]
fn both_roles_fail_without_deployment() {
    init_logging();
    let port = closed_port();
    for role in &[WorkerRole::Client, WorkerRole::Server] {
        let mut connection =
            WorkerConnection::new(ConnectionSetup::receptionist("127.0.0.1", port, "Managed"));

        let connected = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        connection.on_connected(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let f = failed.clone();
        connection.on_failed_to_connect(move |code, _| {
            assert_eq!(code, u8::from(ConnectionStatusCode::NetworkError));
            f.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = connect(&mut connection, *role, 0);
        assert!(!outcome.is_connected());
        assert!(!connection.is_connected());
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn both_roles_connect_to_deployment() {
    let deployment = start_local();
    let connected = Arc::new(AtomicUsize::new(0));

    let mut server = worker(&deployment, "Managed");
    let c = connected.clone();
    server.on_connected(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    server.on_failed_to_connect(|code, message| panic!("failed: {} {}", code, message));
    assert_eq!(connect(&mut server, WorkerRole::Server, 0), ConnectOutcome::Connected);

    let mut client = worker(&deployment, "Client");
    assert_eq!(connect(&mut client, WorkerRole::Client, 0), ConnectOutcome::Connected);

    assert!(server.is_connected());
    assert!(client.is_connected());
    assert_eq!(server.worker_id(), Some("Managed0"));
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert!(client.bridge_address().is_some());

    // second attempt while connected is refused
    assert!(client.connect(WorkerRole::Client, 1).is_err());

    // status snapshot is published at the end of the runtime's poll
    let started = std::time::Instant::now();
    while deployment.status().workers.len() < 2 && started.elapsed() < WAIT {
        std::thread::sleep(Duration::from_millis(5));
    }
    let status = deployment.status();
    assert_eq!(status.workers.len(), 2);
    assert!(status.worker("Client0").is_some());
}

#[test]
fn entity_requests_are_answered_on_both_roles() {
    let deployment = start_local();
    for (role, worker_type) in &[(WorkerRole::Server, "Managed"), (WorkerRole::Client, "Client")] {
        let mut connection = connected(&deployment, worker_type, *role);

        let request_id = connection.send_reserve_entity_ids_request(1, None).unwrap();
        let first = match wait_for_response(&mut connection, request_id) {
            Op::ReserveEntityIdsResponse {
                status_code,
                first_entity_id,
                number_of_entity_ids,
                ..
            } => {
                assert_eq!(status_code, StatusCode::Success);
                assert_eq!(number_of_entity_ids, 1);
                first_entity_id
            }
            other => panic!("unexpected op: {:?}", other),
        };

        let request_id = connection
            .send_create_entity_request(
                vec![ComponentData::new(54).with_field("x", 0.5)],
                Some(first),
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        match wait_for_response(&mut connection, request_id) {
            Op::CreateEntityResponse {
                status_code,
                entity_id,
                ..
            } => {
                assert_eq!(status_code, StatusCode::Success);
                assert_eq!(entity_id, first);
            }
            other => panic!("unexpected op: {:?}", other),
        }

        let request_id = connection.send_delete_entity_request(first, None).unwrap();
        match wait_for_response(&mut connection, request_id) {
            Op::DeleteEntityResponse { status_code, .. } => {
                assert_eq!(status_code, StatusCode::Success)
            }
            other => panic!("unexpected op: {:?}", other),
        }

        // deleting twice reports the entity missing
        let request_id = connection.send_delete_entity_request(first, None).unwrap();
        match wait_for_response(&mut connection, request_id) {
            Op::DeleteEntityResponse { status_code, .. } => {
                assert_eq!(status_code, StatusCode::NotFound)
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }
}

#[test]
fn empty_entity_and_invalid_delete_are_answered() {
    let deployment = start_local();
    for (role, worker_type) in &[(WorkerRole::Server, "Managed"), (WorkerRole::Client, "Client")] {
        let mut connection = connected(&deployment, worker_type, *role);

        let request_id = connection
            .send_create_entity_request(vec![], None, None)
            .unwrap();
        match wait_for_response(&mut connection, request_id) {
            Op::CreateEntityResponse {
                status_code,
                entity_id,
                ..
            } => {
                assert_eq!(status_code, StatusCode::Success);
                assert!(entity_id > 0);
            }
            other => panic!("unexpected op: {:?}", other),
        }

        let request_id = connection.send_delete_entity_request(0, None).unwrap();
        match wait_for_response(&mut connection, request_id) {
            Op::DeleteEntityResponse {
                status_code,
                entity_id,
                ..
            } => {
                assert_eq!(status_code, StatusCode::NotFound);
                assert_eq!(entity_id, 0);
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }
}

#[test]
fn op_lists_are_never_returned_twice() {
    let deployment = start_local();
    let mut connection = connected(&deployment, "Managed", WorkerRole::Server);

    let ids: Vec<_> = (0..3)
        .map(|_| connection.send_reserve_entity_ids_request(2, None).unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let mut responses = Vec::new();
    let started = std::time::Instant::now();
    while responses.len() < ids.len() && started.elapsed() < WAIT {
        for op_list in connection.get_op_list() {
            for op in op_list.iter() {
                if op.op_type() == OpType::ReserveEntityIdsResponse {
                    responses.push(op.request_id());
                }
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(responses, vec![Some(1), Some(2), Some(3)]);
    assert!(connection
        .get_op_list()
        .iter()
        .all(|list| !list.contains(OpType::ReserveEntityIdsResponse)));
}

#[test]
fn stopping_deployment_yields_disconnect_op() {
    let deployment = start_local();
    let mut connection = connected(&deployment, "Managed", WorkerRole::Server);

    deployment.stop();
    assert!(deployment.wait_until_stopped(WAIT));

    let (op, _) = wait_for_op(&mut connection, |op| op.op_type() == OpType::Disconnect);
    match op {
        Some(Op::Disconnect { code, .. }) => {
            assert_eq!(code, u8::from(ConnectionStatusCode::ServerShutdown))
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert!(!connection.is_connected());
    assert!(connection
        .send_reserve_entity_ids_request(1, None)
        .is_err());
}

#[test]
fn worker_disconnect_is_reported_as_cancelled() {
    let deployment = start_local();
    let mut connection = connected(&deployment, "Managed", WorkerRole::Server);
    connection.disconnect();

    let (op, _) = wait_for_op(&mut connection, |op| op.op_type() == OpType::Disconnect);
    match op {
        Some(Op::Disconnect { code, .. }) => {
            assert_eq!(code, u8::from(ConnectionStatusCode::Cancelled))
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // reconnecting with a fresh attempt works
    assert_eq!(
        connect(&mut connection, WorkerRole::Server, 1),
        ConnectOutcome::Connected
    );
}

#[test]
fn session_ends_when_last_holder_releases() {
    let deployment = start_local();
    let mut connection = connected(&deployment, "Managed", WorkerRole::Server);
    connection.acquire();
    connection.acquire();

    connection.release();
    assert!(connection.is_connected());

    connection.release();
    let (op, _) = wait_for_op(&mut connection, |op| op.op_type() == OpType::Disconnect);
    match op {
        Some(Op::Disconnect { code, .. }) => {
            assert_eq!(code, u8::from(ConnectionStatusCode::Cancelled))
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert!(!connection.is_connected());
}

#[test]
fn worker_reconnects_under_the_same_id() {
    let deployment = start_local();
    let mut connection = connected(&deployment, "Managed", WorkerRole::Server);
    for _ in 0..5 {
        connection.disconnect();
        assert_eq!(
            connect(&mut connection, WorkerRole::Server, 0),
            ConnectOutcome::Connected
        );
        assert_eq!(connection.worker_id(), Some("Managed0"));
    }
}

#[test]
fn rejected_handshakes_report_runtime_codes() {
    let deployment = start(spindle_net::DeploymentConfig {
        max_workers: Some(1),
        worker_types: vec!["Managed".to_string()],
        ..Default::default()
    });

    let mut unknown = worker(&deployment, "Stranger");
    match connect(&mut unknown, WorkerRole::Client, 0) {
        ConnectOutcome::Failed { code, .. } => assert_eq!(code, ConnectionStatusCode::Rejected),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let _first = connected(&deployment, "Managed", WorkerRole::Server);

    let mut duplicate = worker(&deployment, "Managed");
    match connect(&mut duplicate, WorkerRole::Server, 0) {
        ConnectOutcome::Failed { code, .. } => assert_eq!(code, ConnectionStatusCode::Rejected),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let mut second = worker(&deployment, "Managed");
    match connect(&mut second, WorkerRole::Server, 1) {
        ConnectOutcome::Failed { code, .. } => {
            assert_eq!(code, ConnectionStatusCode::CapacityExceeded)
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}
