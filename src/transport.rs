use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::TcpStream,
};

use thiserror::Error;
use tracing::trace;

use crate::{
    config::Endpoint,
    tcp_util::{is_errorkind_timeout, open_stream, shutdown_stream, StreamOpenError},
};

/// Longest response line accepted from the server, terminator included.
pub const MAX_LINE_LENGTH: usize = 4096;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Open(#[from] StreamOpenError),
    #[error("write to stream timed out")]
    SendTimeout,
    #[error("write to stream failed: {0}")]
    SendFailure(io::Error),
    #[error("read from stream timed out")]
    ReceiveTimeout,
    #[error("read from stream failed: {0}")]
    ReceiveFailure(io::Error),
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("received line longer than {max} bytes")]
    LineTooLong { max: usize },
    #[error("connection already closed")]
    Closed,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::SendTimeout | Self::ReceiveTimeout | Self::Open(StreamOpenError::Timeout { .. })
        )
    }
}

/// A line-delimited text stream to one NUT server.
///
/// The stream is shut down when [`Transport::close`] is first called or when
/// the transport is dropped, whichever comes first.
pub struct Transport {
    reader: BufReader<TcpStream>,
    closed: bool,
}

impl Transport {
    pub fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let stream: TcpStream = open_stream(endpoint.host(), endpoint.port(), endpoint.timeout())?;
        Ok(Self {
            reader: BufReader::new(stream),
            closed: false,
        })
    }

    /// Writes `text` followed by a line feed.
    pub fn send_line(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut bytes: Vec<u8> = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(b'\n');
        let stream: &mut TcpStream = self.reader.get_mut();
        match stream.write_all(&bytes).and_then(|()| stream.flush()) {
            Err(err) if is_errorkind_timeout(err.kind()) => Err(TransportError::SendTimeout),
            Err(err) => Err(TransportError::SendFailure(err)),
            Ok(()) => {
                trace!(bytes = bytes.len(), "line sent");
                Ok(())
            }
        }
    }

    /// Reads one line and returns it without its LF or CRLF terminator.
    pub fn read_line(&mut self) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut line: String = String::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_line(&mut line);
        let size: usize = match read {
            Ok(size) => size,
            Err(err) if is_errorkind_timeout(err.kind()) => {
                return Err(TransportError::ReceiveTimeout)
            }
            Err(err) => return Err(TransportError::ReceiveFailure(err)),
        };
        trace!(bytes = size, "line received");
        match line.strip_suffix('\n') {
            Some(stripped) => Ok(stripped.strip_suffix('\r').unwrap_or(stripped).to_owned()),
            None if size == MAX_LINE_LENGTH => Err(TransportError::LineTooLong {
                max: MAX_LINE_LENGTH,
            }),
            // EOF before a terminator
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Releases the stream. Returns `false` when it had already been released.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        shutdown_stream(self.reader.get_ref());
        true
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
