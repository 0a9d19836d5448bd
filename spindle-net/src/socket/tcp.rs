use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::{sleep, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use fnv::FnvHashMap;

use crate::socket::{SocketConfig, SocketEvent, SocketEventType};
use crate::{Error, Result};

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Number of flush attempts made before closing a connection.
const CLOSE_FLUSH_ATTEMPTS: usize = 100;

/// Instruction passed from the socket to its connection handler.
enum Outbound {
    Event(SocketAddr, SocketEvent),
    Adopt(SocketAddr, TcpStream),
}

/// Tcp socket backed by a polling thread.
pub(crate) struct TcpSocket {
    listener_addr: Option<SocketAddr>,
    connections: Vec<SocketAddr>,
    poll_handle: Option<JoinHandle<()>>,
    in_receiver: Receiver<(SocketAddr, SocketEvent)>,
    out_sender: Option<Sender<Outbound>>,
}

impl TcpSocket {
    pub fn new(addr: Option<SocketAddr>, config: SocketConfig) -> Result<Self> {
        let listener = match addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                trace!("binding listener to: {:?}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };
        let listener_addr = match &listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        let (out_sender, out_receiver) = unbounded();
        let (in_sender, in_receiver) = unbounded();

        let mut handler = ConnectionHandler {
            listener,
            connections: Default::default(),
            in_sender,
            out_receiver,
            heartbeat_interval: config.heartbeat_interval,
            time_since_heartbeat: Default::default(),
        };

        // starts the poll mechanism to receive and send events
        let poll_wait = config.poll_wait;
        let poll_handle = std::thread::Builder::new()
            .name("spindle-socket".to_string())
            .spawn(move || handler.start_polling(poll_wait))?;

        Ok(Self {
            listener_addr,
            connections: Vec::new(),
            poll_handle: Some(poll_handle),
            in_receiver,
            out_sender: Some(out_sender),
        })
    }

    /// Establishes a new outgoing connection, blocking for at most `timeout`.
    pub fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::TimedOut,
            _ => Error::IoError(e),
        })?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        debug!("connected to {} from {}", addr, stream.local_addr()?);
        self.out(Outbound::Adopt(addr, stream))?;
        self.connections.push(addr);
        Ok(())
    }

    pub fn disconnect(&mut self, addr: Option<SocketAddr>) -> Result<()> {
        let addr = match addr {
            Some(a) => a,
            None => *self
                .connections
                .first()
                .ok_or_else(|| Error::Other("no connections left to disconnect".to_string()))?,
        };
        if let Some(idx) = self.connections.iter().position(|a| a == &addr) {
            self.connections.remove(idx);
        }
        self.out(Outbound::Event(
            addr,
            SocketEvent::new(SocketEventType::Disconnect),
        ))
    }

    pub fn connections(&self) -> &[SocketAddr] {
        &self.connections
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.connections
            .first()
            .cloned()
            .ok_or(Error::SocketNotConnected)
    }

    pub fn listener_addr(&self) -> Result<SocketAddr> {
        self.listener_addr.ok_or(Error::SocketNotBoundToAddress)
    }

    /// Waits for the next socket event, blocking until one is available.
    pub fn recv(&mut self) -> Result<(SocketAddr, SocketEvent)> {
        let (addr, event) = self
            .in_receiver
            .recv()
            .map_err(|_| Error::HostUnreachable)?;
        self.handle_internally(&addr, &event);
        Ok((addr, event))
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<(SocketAddr, SocketEvent)> {
        let (addr, event) = self.in_receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::TimedOut,
            RecvTimeoutError::Disconnected => Error::HostUnreachable,
        })?;
        self.handle_internally(&addr, &event);
        Ok((addr, event))
    }

    /// Tries receiving next socket event, returning immediately if there are
    /// none available.
    pub fn try_recv(&mut self) -> Result<(SocketAddr, SocketEvent)> {
        let (addr, event) = self.in_receiver.try_recv().map_err(|e| match e {
            TryRecvError::Empty => Error::WouldBlock,
            TryRecvError::Disconnected => Error::HostUnreachable,
        })?;
        self.handle_internally(&addr, &event);
        Ok((addr, event))
    }

    pub fn send_event(&self, event: SocketEvent, addr: Option<SocketAddr>) -> Result<()> {
        let addr = match addr {
            Some(a) => a,
            None => *self.connections.first().ok_or(Error::SocketNotConnected)?,
        };
        self.out(Outbound::Event(addr, event))
    }

    fn out(&self, outbound: Outbound) -> Result<()> {
        self.out_sender
            .as_ref()
            .ok_or(Error::SocketNotConnected)?
            .send(outbound)
            .map_err(|_| Error::Other("socket thread is gone".to_string()))
    }

    /// Some events necessitate changes to socket's state.
    fn handle_internally(&mut self, addr: &SocketAddr, event: &SocketEvent) {
        match &event.type_ {
            SocketEventType::Connect => {
                if !self.connections.contains(addr) {
                    self.connections.push(*addr)
                }
            }
            SocketEventType::Disconnect => {
                if let Some(idx) = self.connections.iter().position(|a| a == addr) {
                    self.connections.remove(idx);
                }
            }
            _ => (),
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        // closing the channel tells the handler to shut down
        self.out_sender.take();
        if let Some(handle) = self.poll_handle.take() {
            if handle.join().is_err() {
                error!("socket thread panicked");
            }
        }
    }
}

struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
        }
    }

    fn queue(&mut self, event: &SocketEvent) -> Result<()> {
        let bytes = bincode::serialize(event)?;
        let mut len_buf = [0; 4];
        LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
        self.write_buf.extend_from_slice(&len_buf);
        self.write_buf.extend_from_slice(&bytes);
        Ok(())
    }

    /// Writes out as much of the buffered data as the stream accepts.
    /// Returns false if the connection is broken.
    fn flush(&mut self) -> bool {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return false,
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
        true
    }

    /// Reads all the available data into the read buffer. Returns false if
    /// the connection was closed.
    fn fill(&mut self) -> bool {
        let mut buf = [0; 8192];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// Pulls the next complete frame out of the read buffer.
    fn next_frame(&mut self) -> Result<Option<SocketEvent>> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }
        let len = LittleEndian::read_u32(&self.read_buf[0..4]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::Other(format!("frame too large: {} bytes", len)));
        }
        if self.read_buf.len() < len + 4 {
            return Ok(None);
        }
        let event = bincode::deserialize::<SocketEvent>(&self.read_buf[4..len + 4]);
        self.read_buf.drain(..len + 4);
        Ok(Some(event?))
    }

    /// Flushes pending data on a best-effort basis and closes the stream.
    fn close(mut self) {
        for _ in 0..CLOSE_FLUSH_ATTEMPTS {
            if !self.flush() || self.write_buf.is_empty() {
                break;
            }
            sleep(Duration::from_millis(1));
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct ConnectionHandler {
    listener: Option<TcpListener>,
    connections: FnvHashMap<SocketAddr, Connection>,
    in_sender: Sender<(SocketAddr, SocketEvent)>,
    out_receiver: Receiver<Outbound>,
    heartbeat_interval: Option<Duration>,
    time_since_heartbeat: Duration,
}

impl ConnectionHandler {
    fn start_polling(&mut self, poll_wait: Duration) {
        let mut last_time = Instant::now();
        loop {
            let now = Instant::now();
            let delta_time = now - last_time;
            last_time = now;
            match self.manual_poll(delta_time) {
                Ok(true) => (),
                Ok(false) => break,
                Err(e) => error!("socket poll error: {}", e),
            }
            sleep(poll_wait);
        }

        // say goodbye to all the peers
        for (addr, mut conn) in self.connections.drain() {
            trace!("closing connection to {}", addr);
            if conn
                .queue(&SocketEvent::new(SocketEventType::Disconnect))
                .is_ok()
            {
                conn.close();
            }
        }
    }

    /// Performs all the necessary operations to maintain the connections.
    ///
    /// Delta time argument represents duration since last manual poll call.
    /// Returns false once the owning socket is gone.
    fn manual_poll(&mut self, delta_time: Duration) -> Result<bool> {
        // queue up all the waiting outbound events
        loop {
            match self.out_receiver.try_recv() {
                Ok(Outbound::Adopt(addr, stream)) => {
                    let mut conn = Connection::new(stream);
                    conn.queue(&SocketEvent::new(SocketEventType::Connect))?;
                    self.connections.insert(addr, conn);
                }
                Ok(Outbound::Event(addr, event)) => {
                    let is_disconnect = event.type_ == SocketEventType::Disconnect;
                    match self.connections.get_mut(&addr) {
                        Some(conn) => conn.queue(&event)?,
                        None => {
                            debug!("dropping event for unknown connection {}", addr);
                            continue;
                        }
                    }
                    if is_disconnect {
                        if let Some(conn) = self.connections.remove(&addr) {
                            conn.close();
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(false),
            }
        }

        // send heartbeats
        if let Some(heartbeat) = self.heartbeat_interval {
            self.time_since_heartbeat += delta_time;
            if self.time_since_heartbeat > heartbeat {
                self.time_since_heartbeat = Duration::from_millis(0);
                let event = SocketEvent::new(SocketEventType::Heartbeat);
                for conn in self.connections.values_mut() {
                    conn.queue(&event)?;
                }
            }
        }

        // accept new connections, if there are any
        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        trace!("accepting new connection: {}", addr);
                        stream.set_nonblocking(true)?;
                        stream.set_nodelay(true)?;
                        self.connections.insert(addr, Connection::new(stream));
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(Error::IoError(e)),
                }
            }
        }

        // write out and read in
        let mut closed = Vec::new();
        let mut said_goodbye = Vec::new();
        for (addr, conn) in &mut self.connections {
            if !conn.flush() || !conn.fill() {
                closed.push(*addr);
            }
            loop {
                match conn.next_frame() {
                    Ok(Some(event)) => {
                        let is_disconnect = event.type_ == SocketEventType::Disconnect;
                        if self.in_sender.send((*addr, event)).is_err() {
                            return Ok(false);
                        }
                        if is_disconnect {
                            said_goodbye.push(*addr);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dropping connection to {}: {}", addr, e);
                        closed.push(*addr);
                        break;
                    }
                }
            }
        }

        for addr in said_goodbye {
            closed.retain(|a| a != &addr);
            if let Some(conn) = self.connections.remove(&addr) {
                let _ = conn.stream.shutdown(Shutdown::Both);
            }
        }
        for addr in closed {
            if self.connections.remove(&addr).is_some() {
                trace!("connection to {} closed", addr);
                if self
                    .in_sender
                    .send((addr, SocketEvent::new(SocketEventType::Disconnect)))
                    .is_err()
                {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}
