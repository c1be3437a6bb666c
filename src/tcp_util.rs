use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StreamOpenError {
    #[error("cannot resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("{host} did not resolve to any address")]
    NoAddress { host: String },
    #[error("connection to {addr} timed out")]
    Timeout { addr: SocketAddr },
    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("cannot set stream read timeout: {0}")]
    ReadTimeoutSetFailure(io::Error),
    #[error("cannot set stream write timeout: {0}")]
    WriteTimeoutSetFailure(io::Error),
}

pub fn is_errorkind_timeout(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Resolves `host` and connects to the first address that accepts. All
/// addresses share one `timeout` budget, which then applies to every later
/// read and write. Name resolution uses the system resolver and its own limits.
pub fn open_stream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, StreamOpenError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| StreamOpenError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(StreamOpenError::NoAddress {
            host: host.to_owned(),
        });
    }
    let stream: TcpStream = connect_any(&addrs, Instant::now() + timeout)?;
    if let Err(err) = stream.set_read_timeout(Some(timeout)) {
        shutdown_stream(&stream);
        return Err(StreamOpenError::ReadTimeoutSetFailure(err));
    }
    if let Err(err) = stream.set_write_timeout(Some(timeout)) {
        shutdown_stream(&stream);
        return Err(StreamOpenError::WriteTimeoutSetFailure(err));
    }
    Ok(stream)
}

/// Tries `addrs` in order until `deadline`. A timeout on any address is
/// reported in preference to other connect errors.
fn connect_any(addrs: &[SocketAddr], deadline: Instant) -> Result<TcpStream, StreamOpenError> {
    let mut timed_out: Option<SocketAddr> = None;
    let mut last_err: Option<StreamOpenError> = None;
    for &addr in addrs {
        let remaining: Duration = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            timed_out.get_or_insert(addr);
            break;
        }
        debug!(%addr, ?remaining, "connecting");
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(err) if is_errorkind_timeout(err.kind()) => {
                timed_out.get_or_insert(addr);
            }
            Err(source) => last_err = Some(StreamOpenError::Connect { addr, source }),
        }
    }
    match (timed_out, last_err) {
        (Some(addr), _) => Err(StreamOpenError::Timeout { addr }),
        (None, Some(err)) => Err(err),
        (None, None) => Err(StreamOpenError::NoAddress {
            host: String::new(),
        }),
    }
}

/// Shuts down both halves of the stream. Failures are logged and dropped.
pub fn shutdown_stream(stream: &TcpStream) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => debug!("stream shut down"),
        // the peer may already have gone away
        Err(err) if err.kind() == io::ErrorKind::NotConnected => {
            debug!("stream already disconnected")
        }
        Err(err) => warn!(error = %err, "failed to shut down stream"),
    }
}
