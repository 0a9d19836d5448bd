//! Local deployment made up of a runtime and an optional locator.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::locator::{LocatorService, LocatorServiceConfig};
use crate::runtime::{Runtime, RuntimeConfig, RuntimeStatus};
use crate::socket::{Encoding, SocketConfig};
use crate::util::lock;
use crate::{Error, Result};

/// Deployment settings, usually read from a toml file.
///
/// ```toml
/// name = "test_deployment"
/// receptionist_addr = "127.0.0.1:7777"
/// locator_addr = "127.0.0.1:9876"
/// login_tokens = ["secret"]
///
/// [flags]
/// difficulty = "hard"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub name: String,
    pub receptionist_addr: String,
    /// Locator is only started if an address is provided
    pub locator_addr: Option<String>,
    pub player_identity_tokens: Vec<String>,
    pub login_tokens: Vec<String>,
    pub worker_types: Vec<String>,
    pub max_workers: Option<usize>,
    /// Zero keeps idle workers around forever
    pub worker_keepalive_ms: u64,
    pub command_timeout_ms: u64,
    pub flags: BTreeMap<String, String>,
    pub external_ip: Option<String>,
    pub encoding: String,
    pub compress_above: Option<usize>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            receptionist_addr: "127.0.0.1:7777".to_string(),
            locator_addr: None,
            player_identity_tokens: Vec::new(),
            login_tokens: Vec::new(),
            worker_types: Vec::new(),
            max_workers: None,
            worker_keepalive_ms: 4000,
            command_timeout_ms: 5000,
            flags: BTreeMap::new(),
            external_ip: None,
            encoding: Encoding::Bincode.to_string(),
            compress_above: None,
        }
    }
}

impl DeploymentConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    fn socket_config(&self) -> Result<SocketConfig> {
        Ok(SocketConfig {
            encoding: self.encoding.parse()?,
            compress_above: self.compress_above,
            ..Default::default()
        })
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(RuntimeConfig {
            name: self.name.clone(),
            worker_keepalive: match self.worker_keepalive_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_workers: self.max_workers,
            worker_types: self.worker_types.clone(),
            flags: self.flags.clone(),
            external_ip: self.external_ip.clone(),
            default_command_timeout: Duration::from_millis(self.command_timeout_ms),
            socket: self.socket_config()?,
            ..Default::default()
        })
    }

    pub fn locator_config(&self) -> Result<LocatorServiceConfig> {
        Ok(LocatorServiceConfig {
            player_identity_tokens: self.player_identity_tokens.clone(),
            login_tokens: self.login_tokens.clone(),
            socket: self.socket_config()?,
            ..Default::default()
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeploymentState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

type SharedState = Arc<(Mutex<DeploymentState>, Condvar)>;

fn set_state(state: &SharedState, new: DeploymentState) {
    let (mutex, condvar) = &**state;
    *lock(mutex) = new;
    condvar.notify_all();
}

/// Handle to a deployment running on background threads.
///
/// Dropping the handle stops the deployment and waits for its threads to
/// finish.
pub struct Deployment {
    config: DeploymentConfig,
    receptionist_addr: SocketAddr,
    locator_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    state: SharedState,
    status: Arc<Mutex<RuntimeStatus>>,
    handles: Vec<JoinHandle<()>>,
}

impl Deployment {
    /// Binds the listeners and starts serving.
    ///
    /// Listener addresses are bound before this returns, so the handle
    /// knows the actual ports even when configured with port zero.
    pub fn start(config: DeploymentConfig) -> Result<Self> {
        let receptionist: SocketAddr = config.receptionist_addr.parse()?;
        let mut runtime = Runtime::new(receptionist, config.runtime_config()?)?;
        let receptionist_addr = runtime.listener_addr()?;
        let status = runtime.share_status();

        let locator = match &config.locator_addr {
            Some(addr) => {
                let mut locator = LocatorService::new(addr.parse()?, config.locator_config()?)?;
                locator.register_deployment(&config.name, &advertised(receptionist_addr));
                Some(locator)
            }
            None => None,
        };
        let locator_addr = match &locator {
            Some(l) => Some(l.listener_addr()?),
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));
        let state: SharedState = Arc::new((Mutex::new(DeploymentState::Starting), Condvar::new()));
        let mut handles = Vec::new();

        if let Some(mut locator) = locator {
            let running = running.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("{}-locator", config.name))
                    .spawn(move || {
                        if let Err(e) = locator.start_polling(running) {
                            error!("locator failed: {}", e);
                        }
                    })?,
            );
        }

        let thread_running = running.clone();
        let thread_state = state.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-runtime", config.name))
            .spawn(move || {
                set_state(&thread_state, DeploymentState::Running);
                if let Err(e) = runtime.start_polling(thread_running) {
                    error!("runtime failed: {}", e);
                }
                set_state(&thread_state, DeploymentState::Stopped);
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        info!(
            "deployment {} started, receptionist at {}",
            config.name, receptionist_addr
        );
        Ok(Self {
            config,
            receptionist_addr,
            locator_addr,
            running,
            state,
            status,
            handles,
        })
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn receptionist_addr(&self) -> SocketAddr {
        self.receptionist_addr
    }

    pub fn locator_addr(&self) -> Option<SocketAddr> {
        self.locator_addr
    }

    pub fn state(&self) -> DeploymentState {
        *lock(&self.state.0)
    }

    pub fn is_running(&self) -> bool {
        self.state() == DeploymentState::Running
    }

    /// Latest status snapshot published by the runtime.
    pub fn status(&self) -> RuntimeStatus {
        lock(&self.status).clone()
    }

    /// Blocks until the deployment is running, returning false on timeout.
    pub fn wait_until_running(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |s| s != DeploymentState::Starting)
            && self.state() == DeploymentState::Running
    }

    /// Signals the deployment to stop, without waiting for it.
    pub fn stop(&self) {
        let (mutex, condvar) = &*self.state;
        {
            let mut state = lock(mutex);
            if *state == DeploymentState::Stopped {
                return;
            }
            *state = DeploymentState::Stopping;
        }
        condvar.notify_all();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Blocks until the deployment is stopped, returning false on timeout.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |s| s == DeploymentState::Stopped)
    }

    fn wait_for<F: Fn(DeploymentState) -> bool>(&self, timeout: Duration, done: F) -> bool {
        let (mutex, condvar) = &*self.state;
        let guard = lock(mutex);
        match condvar.wait_timeout_while(guard, timeout, |s| !done(*s)) {
            Ok((_, result)) => !result.timed_out(),
            Err(poisoned) => !poisoned.into_inner().1.timed_out(),
        }
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("deployment thread panicked");
            }
        }
    }
}

/// Address workers should use for reaching a listener bound to `addr`.
fn advertised(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("127.0.0.1:{}", addr.port())
    } else {
        addr.to_string()
    }
}

impl std::str::FromStr for DeploymentConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_toml_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_toml() {
        let config = DeploymentConfig::from_toml_str(
            r#"
            name = "dep"
            receptionist_addr = "127.0.0.1:0"
            locator_addr = "127.0.0.1:0"
            login_tokens = ["secret"]
            worker_keepalive_ms = 0

            [flags]
            difficulty = "hard"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "dep");
        assert_eq!(config.login_tokens, vec!["secret".to_string()]);
        assert_eq!(config.flags.get("difficulty").map(|s| s.as_str()), Some("hard"));

        let runtime = config.runtime_config().unwrap();
        assert_eq!(runtime.worker_keepalive, None);
        assert_eq!(runtime.default_command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_encoding_is_an_error() {
        let config = DeploymentConfig {
            encoding: "yaml".to_string(),
            ..Default::default()
        };
        assert!(config.runtime_config().is_err());
    }

    #[test]
    fn start_and_stop() {
        let deployment = Deployment::start(DeploymentConfig {
            receptionist_addr: "127.0.0.1:0".to_string(),
            locator_addr: Some("127.0.0.1:0".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(deployment.wait_until_running(Duration::from_secs(5)));
        assert_ne!(deployment.receptionist_addr().port(), 0);
        assert!(deployment.locator_addr().is_some());

        deployment.stop();
        assert!(deployment.wait_until_stopped(Duration::from_secs(5)));
        assert!(!deployment.is_running());
    }
}
