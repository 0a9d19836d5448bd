//! Connectivity check.
//!
//! Connects a server-role and a client-role worker one after another, and
//! has each of them reserve an entity id, create an entity with it and
//! delete it again. Without an url a local deployment is started for the
//! duration of the check.

use std::time::Duration;

use anyhow::{Error, Result};
use colored::*;

use spindle_core::{ComponentData, EntityId, Op, OpType, RequestId};
use spindle_net::latent::{
    ConnectionAccessor, Connect, LatentQueue, Run, StartDeployment, StopDeployment,
    WaitForConnectionOutcome, WaitForOp,
};
use spindle_net::{
    ConnectionSetup, Deployment, DeploymentConfig, WorkerConnection, WorkerRole, WorkerUrl,
};

/// Component attached to the entity created during the check.
const CHECK_COMPONENT: u32 = 1;

struct State {
    deployment: Option<Deployment>,
    server: WorkerConnection,
    client: WorkerConnection,
    last_request: Option<RequestId>,
    reserved: Option<EntityId>,
    errors: Vec<String>,
}

fn deployment(s: &mut State) -> &mut Option<Deployment> {
    &mut s.deployment
}

fn server(s: &mut State) -> &mut WorkerConnection {
    &mut s.server
}

fn client(s: &mut State) -> &mut WorkerConnection {
    &mut s.client
}

/// Waits for the response to the last request, recording a non-success
/// status as an error.
fn wait_for_response(
    connection: ConnectionAccessor<State>,
    op_type: OpType,
    timeout: Duration,
) -> WaitForOp<State> {
    WaitForOp::new(connection, op_type, timeout)
        .matching(|s: &State, op: &Op| op.request_id().is_some() && op.request_id() == s.last_request)
        .then(|s: &mut State, op: Op| {
            if let Some(code) = op.status_code() {
                if !code.is_success() {
                    s.errors.push(format!("{:?} failed with {:?}", op.op_type(), code));
                }
            }
            if let Op::ReserveEntityIdsResponse {
                first_entity_id, ..
            } = op
            {
                s.reserved = Some(first_entity_id);
            }
        })
}

fn push_entity_steps(
    queue: &mut LatentQueue<State>,
    connection: ConnectionAccessor<State>,
    role: WorkerRole,
    timeout: Duration,
) {
    queue
        .push(Connect::new(connection, role, 0))
        .push(WaitForConnectionOutcome::new(connection, timeout).expect_connected(true))
        .push(Run::new("reserve entity id", move |s: &mut State| {
            s.last_request = Some(connection(s).send_reserve_entity_ids_request(1, Some(timeout))?);
            Ok(())
        }))
        .push(wait_for_response(
            connection,
            OpType::ReserveEntityIdsResponse,
            timeout,
        ))
        .push(Run::new("create entity", move |s: &mut State| {
            let reserved = s.reserved;
            s.last_request = Some(connection(s).send_create_entity_request(
                vec![ComponentData::new(CHECK_COMPONENT).with_field("role", role.to_string())],
                reserved,
                Some(timeout),
            )?);
            Ok(())
        }))
        .push(wait_for_response(
            connection,
            OpType::CreateEntityResponse,
            timeout,
        ))
        .push(Run::new("delete entity", move |s: &mut State| {
            let entity_id = s.reserved.take().unwrap_or_default();
            s.last_request =
                Some(connection(s).send_delete_entity_request(entity_id, Some(timeout))?);
            Ok(())
        }))
        .push(wait_for_response(
            connection,
            OpType::DeleteEntityResponse,
            timeout,
        ));
}

pub fn run(url: Option<WorkerUrl>, worker_type: &str, timeout: Duration) -> Result<()> {
    let setup = match &url {
        Some(url) => ConnectionSetup::from_url(url, worker_type, &[])?,
        None => ConnectionSetup::receptionist("127.0.0.1", 0, worker_type),
    };
    let mut state = State {
        deployment: None,
        server: WorkerConnection::new(setup.clone()),
        client: WorkerConnection::new(setup),
        last_request: None,
        reserved: None,
        errors: Vec::new(),
    };

    let mut queue = LatentQueue::new();
    if url.is_none() {
        let worker_type = worker_type.to_string();
        queue
            .push(StartDeployment::new(
                deployment,
                DeploymentConfig {
                    name: "check".to_string(),
                    receptionist_addr: "127.0.0.1:0".to_string(),
                    ..Default::default()
                },
            ))
            .push(Run::new("point workers at deployment", move |s: &mut State| {
                let port = match &s.deployment {
                    Some(d) => d.receptionist_addr().port(),
                    None => return Err(spindle_net::Error::Other("no deployment".to_string())),
                };
                let setup = ConnectionSetup::receptionist("127.0.0.1", port, &worker_type);
                s.server = WorkerConnection::new(setup.clone());
                s.client = WorkerConnection::new(setup);
                Ok(())
            }));
    }
    push_entity_steps(&mut queue, server, WorkerRole::Server, timeout);
    push_entity_steps(&mut queue, client, WorkerRole::Client, timeout);
    if url.is_none() {
        queue.push(StopDeployment::new(deployment));
    }

    let result = queue.run(&mut state, Duration::from_millis(10));
    let mut problems: Vec<String> = state.errors;
    if let Err(failures) = result {
        problems.extend(failures.iter().map(|f| f.to_string()));
    }
    if problems.is_empty() {
        println!("{}", "check passed".green());
        Ok(())
    } else {
        for problem in &problems {
            println!("{} {}", "failed:".red(), problem);
        }
        Err(Error::msg(format!("check failed with {} problems", problems.len())))
    }
}
