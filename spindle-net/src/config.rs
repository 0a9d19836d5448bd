//! Connection configuration.
//!
//! A connection is configured with exactly one of two variants. A
//! [`ReceptionistConfig`] points directly at a deployment's runtime, while a
//! [`LocatorConfig`] points at a locator service which authenticates the
//! worker and resolves the deployment to join.
//!
//! Configuration is usually built from a URL-like descriptor, see
//! [`ConnectionSetup::from_url`].
//!
//! [`ReceptionistConfig`]: struct.ReceptionistConfig.html
//! [`LocatorConfig`]: struct.LocatorConfig.html
//! [`ConnectionSetup::from_url`]: struct.ConnectionSetup.html#method.from_url

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::socket::{Encoding, SocketConfig};
use crate::util::split_host_port;
use crate::{Error, Result};

pub const DEFAULT_RECEPTIONIST_HOST: &str = "127.0.0.1";
pub const DEFAULT_RECEPTIONIST_PORT: u16 = 7777;
pub const DEFAULT_LOCATOR_PORT: u16 = 9876;

/// Hosts starting with this prefix are treated as locator hosts.
pub const LOCATOR_HOST_PREFIX: &str = "locator.";

/// Command line argument overriding the locator host.
pub const LOCATOR_HOST_ARG: &str = "-locatorHost";

/// Role a worker takes on within the simulation.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize_repr,
    Deserialize_repr,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum WorkerRole {
    /// Player-facing worker, typically not authoritative over anything
    Client = 1,
    /// Simulation worker, eligible for authority over entities
    Server = 2,
}

impl Display for WorkerRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Client => write!(f, "client"),
            WorkerRole::Server => write!(f, "server"),
        }
    }
}

impl FromStr for WorkerRole {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "client" => Ok(WorkerRole::Client),
            "server" => Ok(WorkerRole::Server),
            _ => Err(Error::Other(format!("unknown worker role: {}", s))),
        }
    }
}

/// Direct connection to a deployment's receptionist.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceptionistConfig {
    pub host: String,
    pub port: u16,
    pub worker_type: String,
    pub use_external_ip: bool,
}

impl ReceptionistConfig {
    pub fn new(host: &str, port: u16, worker_type: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            worker_type: worker_type.to_string(),
            use_external_ip: true,
        }
    }
}

/// Authenticated connection through a locator service.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatorConfig {
    pub locator_host: String,
    pub port: u16,
    pub player_identity_token: String,
    pub login_token: String,
    pub worker_type: String,
    /// Deployment to join, first available one if not specified
    pub deployment: Option<String>,
}

/// Selects how the connection reaches the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionConfig {
    Receptionist(ReceptionistConfig),
    Locator(LocatorConfig),
}

impl ConnectionConfig {
    pub fn worker_type(&self) -> &str {
        match self {
            ConnectionConfig::Receptionist(c) => &c.worker_type,
            ConnectionConfig::Locator(c) => &c.worker_type,
        }
    }

    pub fn is_locator(&self) -> bool {
        matches!(self, ConnectionConfig::Locator(_))
    }
}

/// Network-level tunables of a worker connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionParams {
    /// Bounds both establishing the tcp connection and waiting for the
    /// handshake (or login) response
    pub connect_timeout: Duration,
    /// Session is considered dead if nothing arrives for this long
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub encoding: Encoding,
    pub compress_above: Option<usize>,
    /// Sleep duration of the session thread when there's nothing to do
    pub poll_wait: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            encoding: Encoding::Bincode,
            compress_above: Some(64 * 1024),
            poll_wait: Duration::from_millis(1),
        }
    }
}

impl ConnectionParams {
    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            encoding: self.encoding,
            compress_above: self.compress_above,
            heartbeat_interval: Some(self.heartbeat_interval),
            ..SocketConfig::default()
        }
    }
}

/// URL-like worker connection descriptor.
///
/// Format is `host[:port][?option[=value]]*`, where options are separated
/// with `?` (or `&`) and option keys are case-insensitive.
///
/// # Example
///
/// ```
/// # use spindle_net::WorkerUrl;
/// let url: WorkerUrl = "locator.example.com?playeridentity=abc?login=xyz"
///     .parse()
///     .unwrap();
/// assert_eq!(url.host, "locator.example.com");
/// assert_eq!(url.option("PlayerIdentity"), Some("abc"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerUrl {
    pub host: String,
    pub port: Option<u16>,
    options: Vec<(String, Option<String>)>,
}

impl FromStr for WorkerUrl {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = match s.find("://") {
            Some(idx) => &s[idx + 3..],
            None => s,
        };
        let mut split = s.split(|c: char| c == '?' || c == '&');
        let address = split.next().unwrap_or("").trim_end_matches('/');

        let (host, port) = if address.is_empty() {
            (DEFAULT_RECEPTIONIST_HOST.to_string(), None)
        } else {
            // port 0 marks the port as not given
            let (host, port) = split_host_port(address, 0)
                .map_err(|e| Error::InvalidUrl(format!("{}: {}", s, e)))?;
            (host, if port == 0 { None } else { Some(port) })
        };

        let mut options = Vec::new();
        for option in split {
            if option.is_empty() {
                continue;
            }
            match option.find('=') {
                Some(idx) => options.push((
                    option[..idx].to_lowercase(),
                    Some(option[idx + 1..].to_string()),
                )),
                None => options.push((option.to_lowercase(), None)),
            }
        }

        Ok(WorkerUrl {
            host,
            port,
            options,
        })
    }
}

impl WorkerUrl {
    pub fn has_option(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.options.iter().any(|(k, _)| k == &key)
    }

    /// Value of the given option, `None` if the option is missing or was
    /// given without a value.
    pub fn option(&self, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.options
            .iter()
            .find(|(k, _)| k == &key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether this url points at a locator.
    pub fn is_locator(&self) -> bool {
        self.has_option("locator") || self.host.to_lowercase().starts_with(LOCATOR_HOST_PREFIX)
    }
}

/// Looks for the locator host override among command line arguments.
///
/// Both `-locatorHost <host>` and `-locatorHost=<host>` are accepted.
pub fn locator_host_override(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let lower = arg.to_lowercase();
        let flag = LOCATOR_HOST_ARG.to_lowercase();
        if lower == flag {
            return iter.next().cloned();
        }
        if lower.starts_with(&format!("{}=", flag)) {
            return Some(arg[flag.len() + 1..].to_string());
        }
    }
    None
}

/// Complete description of a connection, ready to be handed to a
/// `WorkerConnection`.
#[derive(Debug, Clone)]
pub struct ConnectionSetup {
    pub config: ConnectionConfig,
    pub params: ConnectionParams,
}

impl ConnectionSetup {
    pub fn receptionist(host: &str, port: u16, worker_type: &str) -> Self {
        Self {
            config: ConnectionConfig::Receptionist(ReceptionistConfig::new(
                host,
                port,
                worker_type,
            )),
            params: ConnectionParams::default(),
        }
    }

    pub fn locator(
        locator_host: &str,
        player_identity_token: &str,
        login_token: &str,
        worker_type: &str,
    ) -> Self {
        Self {
            config: ConnectionConfig::Locator(LocatorConfig {
                locator_host: locator_host.to_string(),
                port: DEFAULT_LOCATOR_PORT,
                player_identity_token: player_identity_token.to_string(),
                login_token: login_token.to_string(),
                worker_type: worker_type.to_string(),
                deployment: None,
            }),
            params: ConnectionParams::default(),
        }
    }

    /// Builds the setup from a url descriptor and command line arguments.
    pub fn from_url(url: &WorkerUrl, worker_type: &str, args: &[String]) -> Result<Self> {
        let config = if url.is_locator() {
            let (locator_host, port) = match locator_host_override(args) {
                Some(h) => split_host_port(&h, DEFAULT_LOCATOR_PORT)?,
                None => (url.host.clone(), url.port.unwrap_or(DEFAULT_LOCATOR_PORT)),
            };
            // missing tokens are sent empty, it's up to the locator to refuse them
            let player_identity_token = url.option("playeridentity").unwrap_or("").to_string();
            let login_token = url.option("login").unwrap_or("").to_string();
            ConnectionConfig::Locator(LocatorConfig {
                locator_host,
                port,
                player_identity_token,
                login_token,
                worker_type: worker_type.to_string(),
                deployment: url.option("deployment").map(|d| d.to_string()),
            })
        } else {
            let use_external_ip = url
                .option("useExternalIpForBridge")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true);
            ConnectionConfig::Receptionist(ReceptionistConfig {
                host: url.host.clone(),
                port: url.port.unwrap_or(DEFAULT_RECEPTIONIST_PORT),
                worker_type: worker_type.to_string(),
                use_external_ip,
            })
        };
        Ok(Self {
            config,
            params: ConnectionParams::default(),
        })
    }

    pub fn with_params(mut self, params: ConnectionParams) -> Self {
        self.params = params;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(url: &str, args: &[&str]) -> Result<ConnectionSetup> {
        let url: WorkerUrl = url.parse()?;
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        ConnectionSetup::from_url(&url, "UnrealWorker", &args)
    }

    #[test]
    fn plain_host_is_receptionist_with_default_port() {
        let setup = setup("10.0.0.5", &[]).unwrap();
        match setup.config {
            ConnectionConfig::Receptionist(c) => {
                assert_eq!(c.host, "10.0.0.5");
                assert_eq!(c.port, DEFAULT_RECEPTIONIST_PORT);
                assert_eq!(c.worker_type, "UnrealWorker");
                assert!(c.use_external_ip);
            }
            _ => panic!("expected receptionist config"),
        }
    }

    #[test]
    fn empty_url_falls_back_on_local_receptionist() {
        let url: WorkerUrl = "".parse().unwrap();
        assert_eq!(url.host, DEFAULT_RECEPTIONIST_HOST);
        assert_eq!(url.port, None);
    }

    #[test]
    fn external_ip_only_disabled_by_false() {
        for (url, expected) in &[
            ("127.0.0.1:7777?useExternalIpForBridge=false", false),
            ("127.0.0.1:7777?useexternalipforbridge=FALSE", false),
            ("127.0.0.1:7777?useExternalIpForBridge=true", true),
            ("127.0.0.1:7777?useExternalIpForBridge=no", true),
            ("127.0.0.1:7777?useExternalIpForBridge", true),
        ] {
            match setup(url, &[]).unwrap().config {
                ConnectionConfig::Receptionist(c) => {
                    assert_eq!(c.use_external_ip, *expected, "{}", url);
                    assert_eq!(c.port, 7777);
                }
                _ => panic!("expected receptionist config"),
            }
        }
    }

    #[test]
    fn locator_selected_by_option_or_host() {
        let by_option = setup("10.0.0.1?locator?playeridentity=pit?login=lt", &[]).unwrap();
        assert!(by_option.config.is_locator());

        let by_host = setup(
            "locator.improbable.io?playeridentity=pit?login=lt?deployment=dep1",
            &[],
        )
        .unwrap();
        match by_host.config {
            ConnectionConfig::Locator(c) => {
                assert_eq!(c.locator_host, "locator.improbable.io");
                assert_eq!(c.port, DEFAULT_LOCATOR_PORT);
                assert_eq!(c.player_identity_token, "pit");
                assert_eq!(c.login_token, "lt");
                assert_eq!(c.deployment.as_deref(), Some("dep1"));
            }
            _ => panic!("expected locator config"),
        }
    }

    #[test]
    fn missing_locator_tokens_are_left_empty() {
        match setup("locator.example.com?login=lt", &[]).unwrap().config {
            ConnectionConfig::Locator(c) => {
                assert_eq!(c.player_identity_token, "");
                assert_eq!(c.login_token, "lt");
            }
            _ => panic!("expected locator config"),
        }
        match setup("10.0.0.1?locator", &[]).unwrap().config {
            ConnectionConfig::Locator(c) => {
                assert_eq!(c.player_identity_token, "");
                assert_eq!(c.login_token, "");
            }
            _ => panic!("expected locator config"),
        }
    }

    #[test]
    fn locator_host_can_be_overridden() {
        let url = "locator.example.com?playeridentity=pit?login=lt";
        for args in &[
            vec!["game.exe", "-locatorHost", "10.1.1.1"],
            vec!["-locatorhost=10.1.1.1"],
        ] {
            match setup(url, args).unwrap().config {
                ConnectionConfig::Locator(c) => assert_eq!(c.locator_host, "10.1.1.1"),
                _ => panic!("expected locator config"),
            }
        }

        match setup(url, &["-locatorHost=10.1.1.1:4000"]).unwrap().config {
            ConnectionConfig::Locator(c) => assert_eq!(c.port, 4000),
            _ => panic!("expected locator config"),
        }
    }

    #[test]
    fn role_parsing() {
        assert_eq!("Server".parse::<WorkerRole>().unwrap(), WorkerRole::Server);
        assert_eq!(u8::from(WorkerRole::Client), 1);
        assert!("observer".parse::<WorkerRole>().is_err());
    }
}
