//! Socket abstraction carrying length-delimited events over TCP.
//!
//! Every socket spawns a background thread responsible for moving bytes
//! between the network and a pair of channels. Events travelling over the
//! wire are encoded using `bincode` and prefixed with a little-endian `u32`
//! length. Message payloads carried inside `Bytes` events use the socket's
//! configured [`Encoding`].
//!
//! [`Encoding`]: enum.Encoding.html

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::msg::{Message, Payload, TaskId};
use crate::{Error, Result};

mod tcp;

pub use tcp::MAX_FRAME_SIZE;

#[derive(Copy, Clone, Debug)]
pub struct SocketConfig {
    /// Encoding scheme used for messages
    pub encoding: Encoding,
    /// Payloads larger than this number of bytes get compressed, `None`
    /// disables compression
    pub compress_above: Option<usize>,
    /// Interval at which heartbeat events are sent to all connections
    pub heartbeat_interval: Option<Duration>,
    /// Sleep duration between consecutive polls of the socket thread
    pub poll_wait: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Bincode,
            compress_above: None,
            heartbeat_interval: Some(Duration::from_secs(1)),
            poll_wait: Duration::from_millis(1),
        }
    }
}

/// Main socket abstraction.
///
/// # Multiple connections
///
/// A socket bound to a listener address accepts any number of incoming
/// connections. Received events are always tagged with the address of the
/// connection they came from, and sending requires specifying the target
/// address. Sockets with a single outgoing connection can skip the address.
pub struct Socket {
    config: SocketConfig,
    inner: tcp::TcpSocket,
    event_backlog: VecDeque<(SocketAddr, SocketEvent)>,
}

impl Socket {
    /// Creates a new socket listening on the given address.
    pub fn bind(addr: SocketAddr, config: SocketConfig) -> Result<Self> {
        Ok(Self {
            config,
            inner: tcp::TcpSocket::new(Some(addr), config)?,
            event_backlog: VecDeque::new(),
        })
    }

    /// Creates a new socket with a single connection to the given address.
    ///
    /// Fails if the connection can't be established within the timeout.
    pub fn connect(addr: SocketAddr, config: SocketConfig, timeout: Duration) -> Result<Self> {
        let mut inner = tcp::TcpSocket::new(None, config)?;
        inner.connect(addr, timeout)?;
        Ok(Self {
            config,
            inner,
            event_backlog: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn encoding(&self) -> Encoding {
        self.config.encoding
    }

    pub fn listener_addr(&self) -> Result<SocketAddr> {
        self.inner.listener_addr()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn connections(&self) -> &[SocketAddr] {
        self.inner.connections()
    }

    /// Terminates an already established connection.
    ///
    /// Passing `None` terminates the first connection, which is only
    /// meaningful for sockets holding a single connection.
    pub fn disconnect(&mut self, addr: Option<SocketAddr>) -> Result<()> {
        self.inner.disconnect(addr)
    }

    /// Receives the next socket event, blocking until one is available.
    pub fn recv(&mut self) -> Result<(SocketAddr, SocketEvent)> {
        if let Some(event) = self.event_backlog.pop_front() {
            return Ok(event);
        }
        self.inner.recv()
    }

    /// Receives the next socket event, blocking for at most `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<(SocketAddr, SocketEvent)> {
        if let Some(event) = self.event_backlog.pop_front() {
            return Ok(event);
        }
        self.inner.recv_timeout(timeout)
    }

    /// Tries to receive the next event without blocking. If no event is
    /// currently available returns `Error::WouldBlock`.
    pub fn try_recv(&mut self) -> Result<(SocketAddr, SocketEvent)> {
        if let Some(event) = self.event_backlog.pop_front() {
            return Ok(event);
        }
        self.inner.try_recv()
    }

    /// Receives the next message, blocking for at most `timeout`.
    ///
    /// # Event backlog
    ///
    /// Any non-message events received in the meantime are placed in an
    /// internal event backlog, with the exception of heartbeats which are
    /// dropped. Events pushed to the backlog can still be read using the
    /// regular event receiving functions. A disconnect event ends the wait
    /// with `Error::HostUnreachable`.
    pub fn recv_msg_timeout(&mut self, timeout: Duration) -> Result<(SocketAddr, Message)> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut);
            }
            let (addr, event) = self.inner.recv_timeout(deadline - now)?;
            match event.type_ {
                SocketEventType::Bytes => {
                    return Ok((addr, Message::from_bytes(&event.bytes, self.encoding())?))
                }
                SocketEventType::Heartbeat => continue,
                SocketEventType::Disconnect => {
                    self.event_backlog.push_back((addr, event));
                    return Err(Error::HostUnreachable);
                }
                _ => self.event_backlog.push_back((addr, event)),
            }
        }
    }

    pub fn send_event(&self, event: SocketEvent, addr: Option<SocketAddr>) -> Result<()> {
        self.inner.send_event(event, addr)
    }

    pub fn send_msg(&self, msg: &Message, addr: Option<SocketAddr>) -> Result<()> {
        let bytes = msg.to_bytes(self.encoding())?;
        self.send_event(SocketEvent::new_bytes(bytes), addr)
    }

    pub fn send_payload<P: Payload + Serialize>(
        &self,
        payload: &P,
        task_id: TaskId,
        addr: Option<SocketAddr>,
    ) -> Result<()> {
        let msg = Message::from_payload(payload, task_id, &self.config)?;
        self.send_msg(&msg, addr)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SocketEvent {
    pub type_: SocketEventType,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl SocketEvent {
    pub fn new(type_: SocketEventType) -> Self {
        Self {
            type_,
            bytes: Default::default(),
        }
    }

    pub fn new_bytes(bytes: Vec<u8>) -> Self {
        Self {
            type_: SocketEventType::Bytes,
            bytes,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum SocketEventType {
    Bytes,
    Heartbeat,
    Connect,
    Disconnect,
}

/// List of possible formats for encoding data sent over the network.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum Encoding {
    /// Fast binary format, useful for communicating directly between Rust apps
    Bincode,
    /// Binary format with implementations in many different languages
    MsgPack,
    /// Very common but more verbose format
    Json,
}

impl FromStr for Encoding {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Error> {
        let e = match s.to_lowercase().as_str() {
            "bincode" | "bin" => Self::Bincode,
            "msgpack" | "messagepack" | "rmp" => Self::MsgPack,
            "json" => Self::Json,
            _ => {
                return Err(Error::Other(format!(
                    "failed parsing encoding from string: {}",
                    s
                )))
            }
        };
        Ok(e)
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bincode => write!(f, "bincode"),
            Self::MsgPack => write!(f, "msgpack"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Packs serializable object to bytes based on selected encoding.
pub(crate) fn pack<S: Serialize>(obj: &S, encoding: Encoding) -> Result<Vec<u8>> {
    let packed: Vec<u8> = match encoding {
        Encoding::Bincode => bincode::serialize(obj)?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            return Err(Error::EncodingUnavailable(encoding));
            #[cfg(feature = "msgpack_encoding")]
            {
                let mut buf = Vec::new();
                obj.serialize(&mut rmp_serde::Serializer::new(&mut buf))?;
                buf
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            return Err(Error::EncodingUnavailable(encoding));
            #[cfg(feature = "json_encoding")]
            {
                serde_json::to_vec(obj)?
            }
        }
    };
    Ok(packed)
}

/// Unpacks object from bytes based on selected encoding.
pub(crate) fn unpack<'de, P: Deserialize<'de>>(bytes: &'de [u8], encoding: Encoding) -> Result<P> {
    let unpacked = match encoding {
        Encoding::Bincode => bincode::deserialize(bytes)?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            return Err(Error::EncodingUnavailable(encoding));
            #[cfg(feature = "msgpack_encoding")]
            {
                let mut de = rmp_serde::Deserializer::new(bytes).with_binary();
                Deserialize::deserialize(&mut de)?
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            return Err(Error::EncodingUnavailable(encoding));
            #[cfg(feature = "json_encoding")]
            {
                serde_json::from_slice(bytes)?
            }
        }
    };
    Ok(unpacked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{DisconnectNotice, MessageType};
    use crate::ConnectionStatusCode;

    fn listener() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap(), SocketConfig::default()).unwrap()
    }

    #[test]
    fn encoding_from_str() {
        assert_eq!(Encoding::from_str("BIN").unwrap(), Encoding::Bincode);
        assert_eq!(Encoding::from_str("json").unwrap(), Encoding::Json);
        assert!(Encoding::from_str("xml").is_err());
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let addr = {
            let socket = listener();
            socket.listener_addr().unwrap()
        };
        // give the listener thread a moment to release the port
        std::thread::sleep(Duration::from_millis(50));
        let result = Socket::connect(addr, SocketConfig::default(), Duration::from_millis(500));
        assert!(result.is_err());
    }

    #[test]
    fn message_travels_both_ways() {
        let mut server = listener();
        let addr = server.listener_addr().unwrap();
        let mut client =
            Socket::connect(addr, SocketConfig::default(), Duration::from_secs(1)).unwrap();

        let notice = DisconnectNotice {
            code: ConnectionStatusCode::ServerShutdown,
            reason: "bye".to_string(),
        };
        client.send_payload(&notice, 3, None).unwrap();

        let (client_addr, msg) = server.recv_msg_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.type_, MessageType::DisconnectNotice);
        assert_eq!(msg.task_id, 3);
        let received: DisconnectNotice = msg.unpack_payload(server.encoding()).unwrap();
        assert_eq!(received.reason, "bye");

        // the connect event was placed in the backlog while waiting for bytes
        let (_, event) = server.try_recv().unwrap();
        assert_eq!(event.type_, SocketEventType::Connect);

        server.send_payload(&notice, 4, Some(client_addr)).unwrap();
        let (_, msg) = client.recv_msg_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.task_id, 4);
    }

    #[test]
    fn dropping_peer_yields_disconnect() {
        let mut server = listener();
        let addr = server.listener_addr().unwrap();
        let client = Socket::connect(addr, SocketConfig::default(), Duration::from_secs(1)).unwrap();
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut disconnected = false;
        while Instant::now() < deadline {
            match server.recv_timeout(Duration::from_millis(100)) {
                Ok((_, event)) if event.type_ == SocketEventType::Disconnect => {
                    disconnected = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(disconnected);
    }
}
