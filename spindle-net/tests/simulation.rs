mod common;

use std::time::Duration;

use spindle_net::latent::{
    Connect, LatentQueue, Run, StartDeployment, StopDeployment, WaitFor, WaitForConnectionOutcome,
    WaitForOp,
};
use spindle_net::spindle_core::{
    ComponentData, ComponentUpdate, EntityId, Fields, Interest, Metrics, Op, OpType, StatusCode,
    Value,
};
use spindle_net::{ConnectionSetup, Deployment, DeploymentConfig, WorkerConnection, WorkerRole};

use common::*;

const POSITION: u32 = 54;
const HEALTH: u32 = 1000;

fn create_entity(connection: &mut WorkerConnection, components: Vec<ComponentData>) -> EntityId {
    let request_id = connection
        .send_create_entity_request(components, None, None)
        .unwrap();
    match wait_for_response(connection, request_id) {
        Op::CreateEntityResponse {
            status_code,
            entity_id,
            ..
        } => {
            assert_eq!(status_code, StatusCode::Success);
            entity_id
        }
        other => panic!("unexpected op: {:?}", other),
    }
}

fn wait_for_authority(connection: &mut WorkerConnection, entity_id: EntityId) {
    let (op, _) = wait_for_op(connection, |op| match op {
        Op::AuthorityChange {
            entity_id: id,
            authoritative,
            ..
        } => *id == entity_id && *authoritative,
        _ => false,
    });
    assert!(op.is_some(), "authority over {} never arrived", entity_id);
}

/// Waits for a command request and returns its runtime-side request id.
fn wait_for_command(connection: &mut WorkerConnection) -> (u32, Fields) {
    match wait_for_op(connection, |op| op.op_type() == OpType::CommandRequest).0 {
        Some(Op::CommandRequest {
            request_id,
            payload,
            caller_worker_id,
            ..
        }) => {
            assert_eq!(caller_worker_id, "Client0");
            (request_id, payload)
        }
        other => panic!("expected command request, got {:?}", other),
    }
}

fn payload(n: i64) -> Fields {
    let mut fields = Fields::new();
    fields.insert("n".to_string(), Value::Int(n));
    fields
}

#[test]
fn commands_are_routed_through_authoritative_worker() {
    let deployment = start_local();
    let mut server = connected(&deployment, "Managed", WorkerRole::Server);
    let mut client = connected(&deployment, "Client", WorkerRole::Client);

    let entity_id = create_entity(&mut client, vec![ComponentData::new(HEALTH)]);
    wait_for_authority(&mut server, entity_id);

    // successful round trip
    let request_id = client
        .send_command_request(entity_id, HEALTH, 1, payload(2), None)
        .unwrap();
    let (handler_request_id, received) = wait_for_command(&mut server);
    assert_eq!(received, payload(2));
    server
        .send_command_response(handler_request_id, payload(4))
        .unwrap();
    match wait_for_response(&mut client, request_id) {
        Op::CommandResponse {
            status_code,
            payload: response,
            command_index,
            ..
        } => {
            assert_eq!(status_code, StatusCode::Success);
            assert_eq!(command_index, 1);
            assert_eq!(response, Some(payload(4)));
        }
        other => panic!("unexpected op: {:?}", other),
    }

    // handler failure
    let request_id = client
        .send_command_request(entity_id, HEALTH, 1, payload(0), None)
        .unwrap();
    let (handler_request_id, _) = wait_for_command(&mut server);
    server
        .send_command_failure(handler_request_id, "division by zero")
        .unwrap();
    match wait_for_response(&mut client, request_id) {
        Op::CommandResponse {
            status_code,
            message,
            payload,
            ..
        } => {
            assert_eq!(status_code, StatusCode::ApplicationError);
            assert_eq!(message, "division by zero");
            assert_eq!(payload, None);
        }
        other => panic!("unexpected op: {:?}", other),
    }

    // nobody answers
    let request_id = client
        .send_command_request(
            entity_id,
            HEALTH,
            1,
            payload(1),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
    match wait_for_response(&mut client, request_id) {
        Op::CommandResponse { status_code, .. } => assert_eq!(status_code, StatusCode::Timeout),
        other => panic!("unexpected op: {:?}", other),
    }

    // missing entity
    let request_id = client
        .send_command_request(entity_id + 100, HEALTH, 1, payload(1), None)
        .unwrap();
    match wait_for_response(&mut client, request_id) {
        Op::CommandResponse { status_code, .. } => {
            assert_eq!(status_code, StatusCode::NotFound)
        }
        other => panic!("unexpected op: {:?}", other),
    }
}

#[test]
fn commands_without_authority_fail() {
    let deployment = start_local();
    let mut client = connected(&deployment, "Client", WorkerRole::Client);
    let entity_id = create_entity(&mut client, vec![ComponentData::new(HEALTH)]);

    let request_id = client
        .send_command_request(entity_id, HEALTH, 0, Fields::new(), None)
        .unwrap();
    match wait_for_response(&mut client, request_id) {
        Op::CommandResponse { status_code, .. } => {
            assert_eq!(status_code, StatusCode::AuthorityLost)
        }
        other => panic!("unexpected op: {:?}", other),
    }
}

#[test]
fn only_authoritative_worker_updates_components() {
    let deployment = start_local();
    let mut server = connected(&deployment, "Managed", WorkerRole::Server);
    let mut client = connected(&deployment, "Client", WorkerRole::Client);

    let entity_id = create_entity(
        &mut client,
        vec![ComponentData::new(POSITION).with_field("x", 0.0)],
    );
    wait_for_authority(&mut server, entity_id);

    server
        .send_component_update(
            entity_id,
            ComponentUpdate::new(POSITION).with_field("x", 3.0),
        )
        .unwrap();
    let (op, _) = wait_for_op(&mut client, |op| op.op_type() == OpType::ComponentUpdate);
    match op {
        Some(Op::ComponentUpdate { update, .. }) => {
            assert_eq!(update.fields.get("x"), Some(&Value::Float(3.0)))
        }
        other => panic!("expected component update, got {:?}", other),
    }

    client
        .send_component_update(
            entity_id,
            ComponentUpdate::new(POSITION).with_field("x", 9.0),
        )
        .unwrap();
    let (op, _) = wait_for_op(&mut client, |op| op.op_type() == OpType::LogMessage);
    assert!(op.is_some());

    let request_id = client
        .send_entity_query_request(
            spindle_net::spindle_core::EntityQuery::snapshot(
                spindle_net::spindle_core::Constraint::EntityId(entity_id),
                vec![POSITION],
            ),
            None,
        )
        .unwrap();
    match wait_for_response(&mut client, request_id) {
        Op::EntityQueryResponse {
            result_count,
            results,
            ..
        } => {
            assert_eq!(result_count, 1);
            assert_eq!(results[0].1[0].get("x"), Some(&Value::Float(3.0)));
        }
        other => panic!("unexpected op: {:?}", other),
    }
}

#[test]
fn authority_moves_to_remaining_server() {
    let deployment = start_local();
    let mut first = connected(&deployment, "Managed", WorkerRole::Server);
    let mut second = worker(&deployment, "Managed");
    assert!(connect(&mut second, WorkerRole::Server, 1).is_connected());
    let mut client = connected(&deployment, "Client", WorkerRole::Client);

    let entity_id = create_entity(&mut client, vec![ComponentData::new(HEALTH)]);
    wait_for_authority(&mut first, entity_id);

    // command left hanging when its handler leaves
    let request_id = client
        .send_command_request(entity_id, HEALTH, 0, Fields::new(), None)
        .unwrap();
    wait_for_command(&mut first);
    first.disconnect();

    match wait_for_response(&mut client, request_id) {
        Op::CommandResponse { status_code, .. } => {
            assert_eq!(status_code, StatusCode::AuthorityLost)
        }
        other => panic!("unexpected op: {:?}", other),
    }
    wait_for_authority(&mut second, entity_id);
}

#[test]
fn interest_controls_visible_entities() {
    let deployment = start_local();
    let mut server = connected(&deployment, "Managed", WorkerRole::Server);
    let mut client = connected(&deployment, "Client", WorkerRole::Client);

    let entity_id = create_entity(&mut server, vec![ComponentData::new(HEALTH)]);
    wait_for_authority(&mut server, entity_id);
    let (op, _) = wait_for_op(&mut client, |op| op.op_type() == OpType::AddEntity);
    assert_eq!(op, Some(Op::AddEntity { entity_id }));

    client
        .send_interest_change(Interest::components(vec![POSITION]))
        .unwrap();
    let (op, _) = wait_for_op(&mut client, |op| op.op_type() == OpType::RemoveEntity);
    assert_eq!(op, Some(Op::RemoveEntity { entity_id }));

    server
        .send_add_component(entity_id, ComponentData::new(POSITION))
        .unwrap();
    let (op, drained) = wait_for_op(&mut client, |op| op.op_type() == OpType::AddEntity);
    assert_eq!(op, Some(Op::AddEntity { entity_id }));
    assert!(!drained
        .iter()
        .any(|list| list.contains(OpType::RemoveEntity)));

    client
        .send_component_interest(entity_id, Interest::components(vec![7]))
        .unwrap();
    let (op, _) = wait_for_op(&mut client, |op| op.op_type() == OpType::RemoveEntity);
    assert_eq!(op, Some(Op::RemoveEntity { entity_id }));
}

#[test]
fn worker_metrics_show_up_in_status() {
    let deployment = start_local();
    let mut server = connected(&deployment, "Managed", WorkerRole::Server);
    server
        .send_metrics(Metrics::default().with_gauge("fps", 60.0))
        .unwrap();

    let started = std::time::Instant::now();
    loop {
        let fps = deployment
            .status()
            .worker("Managed0")
            .and_then(|w| w.metrics.gauges.get("fps").cloned());
        if fps == Some(60.0) {
            break;
        }
        assert!(started.elapsed() < WAIT, "metrics never arrived");
        std::thread::sleep(Duration::from_millis(5));
    }
}

struct Scenario {
    deployment: Option<Deployment>,
    worker: WorkerConnection,
    reserved: Option<EntityId>,
}

fn scenario_deployment(s: &mut Scenario) -> &mut Option<Deployment> {
    &mut s.deployment
}

fn scenario_worker(s: &mut Scenario) -> &mut WorkerConnection {
    &mut s.worker
}

#[test]
fn latent_scenario_runs_to_completion() {
    init_logging();
    let mut state = Scenario {
        deployment: None,
        worker: WorkerConnection::new(ConnectionSetup::receptionist("127.0.0.1", 0, "Managed")),
        reserved: None,
    };

    let mut queue = LatentQueue::new();
    queue
        .push(StartDeployment::new(
            scenario_deployment,
            DeploymentConfig {
                receptionist_addr: "127.0.0.1:0".to_string(),
                ..Default::default()
            },
        ))
        .push(Run::new("point worker at deployment", |s: &mut Scenario| {
            let port = match &s.deployment {
                Some(d) => d.receptionist_addr().port(),
                None => return Err(spindle_net::Error::NotConnected),
            };
            s.worker = WorkerConnection::new(ConnectionSetup::receptionist(
                "127.0.0.1",
                port,
                "Managed",
            ));
            Ok(())
        }))
        .push(Connect::new(scenario_worker, WorkerRole::Server, 0))
        .push(WaitForConnectionOutcome::new(scenario_worker, WAIT).expect_connected(true))
        .push(Run::new("reserve ids", |s: &mut Scenario| {
            s.worker.send_reserve_entity_ids_request(5, None).map(|_| ())
        }))
        .push(
            WaitForOp::new(scenario_worker, OpType::ReserveEntityIdsResponse, WAIT).then(
                |s: &mut Scenario, op| {
                    if let Op::ReserveEntityIdsResponse {
                        first_entity_id, ..
                    } = op
                    {
                        s.reserved = Some(first_entity_id);
                    }
                },
            ),
        )
        .push(WaitFor::new(
            "reservation",
            |s: &mut Scenario| s.reserved.is_some(),
            WAIT,
        ))
        .push(StopDeployment::new(scenario_deployment))
        .push(WaitForOp::new(scenario_worker, OpType::Disconnect, WAIT));

    queue.run(&mut state, Duration::from_millis(5)).unwrap();
    assert!(state.deployment.is_none());
    assert!(state.reserved.is_some());
    assert!(!state.worker.is_connected());
}

#[test]
fn latent_waits_see_ops_from_the_same_batch() {
    let deployment = start_local();
    let mut state = Scenario {
        deployment: None,
        worker: worker(&deployment, "Managed"),
        reserved: None,
    };

    // the create response, the new entity and its authority all arrive in
    // one op list, waited for here out of order
    let mut queue = LatentQueue::new();
    queue
        .push(Connect::new(scenario_worker, WorkerRole::Server, 0))
        .push(WaitForConnectionOutcome::new(scenario_worker, WAIT).expect_connected(true))
        .push(Run::new("create entity", |s: &mut Scenario| {
            s.worker
                .send_create_entity_request(
                    vec![ComponentData::new(POSITION).with_field("x", 1.0)],
                    None,
                    None,
                )
                .map(|_| ())
        }))
        .push(
            WaitForOp::new(scenario_worker, OpType::CreateEntityResponse, WAIT).then(
                |s: &mut Scenario, op| {
                    if let Op::CreateEntityResponse { entity_id, .. } = op {
                        s.reserved = Some(entity_id);
                    }
                },
            ),
        )
        .push(
            WaitForOp::new(scenario_worker, OpType::AuthorityChange, WAIT)
                .matching(|s: &Scenario, op| match op {
                    Op::AuthorityChange { entity_id, .. } => Some(*entity_id) == s.reserved,
                    _ => false,
                }),
        )
        .push(
            WaitForOp::new(scenario_worker, OpType::AddEntity, WAIT).matching(
                |s: &Scenario, op| match op {
                    Op::AddEntity { entity_id } => Some(*entity_id) == s.reserved,
                    _ => false,
                },
            ),
        )
        .push(WaitForOp::new(scenario_worker, OpType::AddComponent, WAIT));

    queue.run(&mut state, Duration::from_millis(5)).unwrap();
    assert!(state.reserved.is_some());

    // the critical section markers were never consumed and are still there
    let remaining: Vec<OpType> = state
        .worker
        .get_op_list()
        .iter()
        .flat_map(|list| list.iter().map(|op| op.op_type()))
        .collect();
    assert!(remaining.contains(&OpType::CriticalSection));
    assert!(!remaining.contains(&OpType::CreateEntityResponse));
}

#[test]
fn latent_timeouts_are_failures() {
    init_logging();
    let mut state = Scenario {
        deployment: None,
        worker: WorkerConnection::new(ConnectionSetup::receptionist(
            "127.0.0.1",
            closed_port(),
            "Managed",
        )),
        reserved: None,
    };
    let mut queue = LatentQueue::new();
    queue
        .push(Connect::new(scenario_worker, WorkerRole::Client, 0))
        .push(WaitForConnectionOutcome::new(scenario_worker, WAIT).expect_connected(true));
    let failures = queue
        .run(&mut state, Duration::from_millis(5))
        .unwrap_err();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("unexpected connection outcome"));
}
