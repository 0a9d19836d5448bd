#![allow(dead_code)]

use std::net::TcpListener;
use std::time::{Duration, Instant};

use spindle_net::spindle_core::{Op, OpList, RequestId};
use spindle_net::{
    ConnectOutcome, ConnectionSetup, Deployment, DeploymentConfig, WorkerConnection, WorkerRole,
};

/// Upper bound on waiting for anything coming from a deployment.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = simplelog::TestLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
}

/// Starts a deployment on random local ports.
pub fn start(config: DeploymentConfig) -> Deployment {
    init_logging();
    let deployment = Deployment::start(DeploymentConfig {
        receptionist_addr: "127.0.0.1:0".to_string(),
        ..config
    })
    .unwrap();
    assert!(deployment.wait_until_running(WAIT));
    deployment
}

pub fn start_local() -> Deployment {
    start(DeploymentConfig::default())
}

/// Port nothing is listening on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn worker(deployment: &Deployment, worker_type: &str) -> WorkerConnection {
    WorkerConnection::new(ConnectionSetup::receptionist(
        "127.0.0.1",
        deployment.receptionist_addr().port(),
        worker_type,
    ))
}

pub fn connect(connection: &mut WorkerConnection, role: WorkerRole, context_id: u32) -> ConnectOutcome {
    connection
        .connect(role, context_id)
        .unwrap()
        .wait_timeout(WAIT)
        .expect("no connection outcome")
}

pub fn connected(deployment: &Deployment, worker_type: &str, role: WorkerRole) -> WorkerConnection {
    let mut connection = worker(deployment, worker_type);
    assert_eq!(connect(&mut connection, role, 0), ConnectOutcome::Connected);
    connection
}

/// Drains op lists until an op matching the predicate shows up, returning
/// it along with all the op lists drained so far.
pub fn wait_for_op<F: Fn(&Op) -> bool>(
    connection: &mut WorkerConnection,
    predicate: F,
) -> (Option<Op>, Vec<OpList>) {
    let started = Instant::now();
    let mut drained = Vec::new();
    while started.elapsed() < WAIT {
        for op_list in connection.get_op_list() {
            let found = op_list.iter().find(|op| predicate(op)).cloned();
            drained.push(op_list);
            if found.is_some() {
                return (found, drained);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    (None, drained)
}

pub fn wait_for_response(connection: &mut WorkerConnection, request_id: RequestId) -> Op {
    wait_for_op(connection, |op| {
        op.request_id() == Some(request_id) && op.status_code().is_some()
    })
    .0
    .unwrap_or_else(|| panic!("no response to request {}", request_id))
}
