//! Locator service and the worker-side login procedure.
//!
//! Workers that don't know the address of the deployment they want to join
//! log in to a locator first. The locator checks the worker's player
//! identity token and login token, picks the deployment and responds with
//! the address of its receptionist.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{ConnectionParams, LocatorConfig};
use crate::msg::*;
use crate::socket::{Socket, SocketConfig, SocketEventType};
use crate::util::resolve;
use crate::{Error, Result};

/// Logs in to the locator, blocking for at most the configured connect
/// timeout.
///
/// The returned response may carry a failure code, it's up to the caller
/// to check it.
pub fn login(config: &LocatorConfig, params: &ConnectionParams) -> Result<LoginResponse> {
    let addr = resolve(&config.locator_host, config.port)?;
    debug!("logging in to locator at {}", addr);
    let mut socket = Socket::connect(addr, params.socket_config(), params.connect_timeout)?;
    socket.send_payload(
        &LoginRequest {
            player_identity_token: config.player_identity_token.clone(),
            login_token: config.login_token.clone(),
            worker_type: config.worker_type.clone(),
            deployment: config.deployment.clone(),
        },
        0,
        None,
    )?;
    let (_, msg) = socket.recv_msg_timeout(params.connect_timeout)?;
    msg.expect_payload(socket.encoding(), MessageType::LoginResponse)
}

/// Configuration settings for the locator service.
#[derive(Debug, Clone)]
pub struct LocatorServiceConfig {
    /// Accepted player identity tokens, empty list accepts any token
    pub player_identity_tokens: Vec<String>,
    /// Accepted login tokens, empty list accepts any token
    pub login_tokens: Vec<String>,
    /// Time between polls in the main loop
    pub poll_wait: Duration,
    pub socket: SocketConfig,
}

impl Default for LocatorServiceConfig {
    fn default() -> Self {
        Self {
            player_identity_tokens: Vec::new(),
            login_tokens: Vec::new(),
            poll_wait: Duration::from_millis(1),
            socket: SocketConfig::default(),
        }
    }
}

/// Deployment as known to the locator.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentEntry {
    pub name: String,
    pub receptionist_addr: String,
}

/// Authenticated lookup service mapping workers onto deployments.
pub struct LocatorService {
    pub config: LocatorServiceConfig,
    greeter: Socket,
    deployments: Vec<DeploymentEntry>,
}

impl LocatorService {
    pub fn new(addr: SocketAddr, config: LocatorServiceConfig) -> Result<Self> {
        let greeter = Socket::bind(addr, config.socket)?;
        info!("locator listening on {}", greeter.listener_addr()?);
        Ok(Self {
            config,
            greeter,
            deployments: Vec::new(),
        })
    }

    pub fn listener_addr(&self) -> Result<SocketAddr> {
        self.greeter.listener_addr()
    }

    pub fn register_deployment(&mut self, name: &str, receptionist_addr: &str) {
        self.deployments.retain(|d| d.name != name);
        self.deployments.push(DeploymentEntry {
            name: name.to_string(),
            receptionist_addr: receptionist_addr.to_string(),
        });
    }

    pub fn deployments(&self) -> &[DeploymentEntry] {
        &self.deployments
    }

    /// Handles all the currently pending login requests.
    pub fn manual_poll(&mut self) -> Result<()> {
        loop {
            let (addr, event) = match self.greeter.try_recv() {
                Ok(e) => e,
                Err(Error::WouldBlock) => return Ok(()),
                Err(e) => return Err(e),
            };
            if event.type_ != SocketEventType::Bytes {
                continue;
            }
            let msg = Message::from_bytes(&event.bytes, self.greeter.encoding())?;
            let request: LoginRequest =
                match msg.expect_payload(self.greeter.encoding(), MessageType::LoginRequest) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("locator: bad message from {}: {}", addr, e);
                        continue;
                    }
                };
            let response = self.login(&request);
            debug!(
                "locator: login from {} as {}: {}",
                addr, request.worker_type, response.code
            );
            self.greeter
                .send_payload(&response, msg.task_id, Some(addr))?;
        }
    }

    /// Start a polling loop.
    ///
    /// Allows for remote termination.
    pub fn start_polling(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.manual_poll() {
                warn!("locator error: {}", e);
            }
            thread::sleep(self.config.poll_wait);
        }
        Ok(())
    }

    /// Verifies the tokens and resolves the deployment.
    pub fn login(&self, request: &LoginRequest) -> LoginResponse {
        let reject = |code, message: &str| LoginResponse {
            code,
            message: message.to_string(),
            deployment: String::new(),
            receptionist_addr: String::new(),
        };

        if !self.config.player_identity_tokens.is_empty()
            && !self
                .config
                .player_identity_tokens
                .contains(&request.player_identity_token)
        {
            return reject(
                ConnectionStatusCode::PlayerIdentityTokenExpired,
                "player identity token is invalid or expired",
            );
        }
        if !self.config.login_tokens.is_empty()
            && !self.config.login_tokens.contains(&request.login_token)
        {
            return reject(
                ConnectionStatusCode::LoginTokenExpired,
                "login token is invalid or expired",
            );
        }

        let deployment = match &request.deployment {
            Some(name) => self.deployments.iter().find(|d| &d.name == name),
            None => self.deployments.first(),
        };
        match deployment {
            Some(d) => LoginResponse {
                code: ConnectionStatusCode::Success,
                message: String::new(),
                deployment: d.name.clone(),
                receptionist_addr: d.receptionist_addr.clone(),
            },
            None => {
                let message = match &request.deployment {
                    Some(name) => format!("no such deployment: {}", name),
                    None => "no deployments available".to_string(),
                };
                reject(ConnectionStatusCode::Rejected, message.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(identity: &[&str], login: &[&str]) -> LocatorService {
        let config = LocatorServiceConfig {
            player_identity_tokens: identity.iter().map(|s| s.to_string()).collect(),
            login_tokens: login.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        LocatorService::new("127.0.0.1:0".parse().unwrap(), config).unwrap()
    }

    fn request(pit: &str, lt: &str, deployment: Option<&str>) -> LoginRequest {
        LoginRequest {
            player_identity_token: pit.to_string(),
            login_token: lt.to_string(),
            worker_type: "UnrealClient".to_string(),
            deployment: deployment.map(|d| d.to_string()),
        }
    }

    #[test]
    fn tokens_are_checked_in_order() {
        let mut locator = service(&["pit"], &["lt"]);
        locator.register_deployment("dep", "127.0.0.1:7777");

        assert_eq!(
            locator.login(&request("bad", "bad", None)).code,
            ConnectionStatusCode::PlayerIdentityTokenExpired
        );
        assert_eq!(
            locator.login(&request("pit", "bad", None)).code,
            ConnectionStatusCode::LoginTokenExpired
        );
        let ok = locator.login(&request("pit", "lt", None));
        assert_eq!(ok.code, ConnectionStatusCode::Success);
        assert_eq!(ok.receptionist_addr, "127.0.0.1:7777");
    }

    #[test]
    fn deployment_selection() {
        let mut locator = service(&[], &[]);
        assert_eq!(
            locator.login(&request("any", "any", None)).code,
            ConnectionStatusCode::Rejected
        );

        locator.register_deployment("first", "127.0.0.1:1000");
        locator.register_deployment("second", "127.0.0.1:2000");
        assert_eq!(locator.login(&request("a", "b", None)).deployment, "first");
        assert_eq!(
            locator
                .login(&request("a", "b", Some("second")))
                .receptionist_addr,
            "127.0.0.1:2000"
        );
        assert_eq!(
            locator.login(&request("a", "b", Some("third"))).code,
            ConnectionStatusCode::Rejected
        );
    }
}
