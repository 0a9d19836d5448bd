use std::convert::TryFrom;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{Error, Result};

/// Locks the mutex, recovering the guard if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Splits a `host[:port]` string, falling back on the default port.
pub(crate) fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidUrl("empty host".to_string()));
    }
    // bracketed ipv6, e.g. [::1]:7777
    if s.starts_with('[') {
        let end = s
            .find(']')
            .ok_or_else(|| Error::InvalidUrl(format!("unterminated ipv6 address: {}", s)))?;
        let host = s[1..end].to_string();
        let rest = &s[end + 1..];
        let port = match rest.strip_prefix(':') {
            Some(p) => p.parse()?,
            None => default_port,
        };
        return Ok((host, port));
    }
    match s.rfind(':') {
        Some(idx) if s[..idx].find(':').is_none() => {
            Ok((s[..idx].to_string(), s[idx + 1..].parse()?))
        }
        _ => Ok((s.to_string(), default_port)),
    }
}

/// Resolves host and port into the first matching socket address.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Other(format!("failed resolving address: {}:{}", host, port)))
}

/// Whole milliseconds in the duration, saturating at `u32::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

pub(crate) fn timeout_millis(timeout: Option<Duration>) -> u32 {
    timeout.map(duration_millis).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_splitting() {
        assert_eq!(
            split_host_port("127.0.0.1:9000", 7777).unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            split_host_port("localhost", 7777).unwrap(),
            ("localhost".to_string(), 7777)
        );
        assert_eq!(
            split_host_port("[::1]:8000", 7777).unwrap(),
            ("::1".to_string(), 8000)
        );
        assert!(split_host_port("", 7777).is_err());
        assert!(split_host_port("host:port", 7777).is_err());
    }

    #[test]
    fn long_timeouts_saturate() {
        assert_eq!(timeout_millis(None), 0);
        assert_eq!(timeout_millis(Some(Duration::from_secs(5))), 5000);
        assert_eq!(
            timeout_millis(Some(Duration::from_secs(u64::from(u32::MAX)))),
            u32::MAX
        );
        assert_eq!(duration_millis(Duration::from_millis(u64::MAX)), u32::MAX);
    }
}
