use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::{ClientConfig, Credentials, Endpoint},
    protocol::{
        is_ok, join_tokens, var_value, ArgumentError, ErrorCode, InstantCommand, MalformedLine,
        Request, Response, ServerError, Token, Value,
    },
    tcp_util::StreamOpenError,
    transport::{Transport, TransportError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    /// A fatal error occurred and the connection has been closed.
    Failed,
    Disconnected,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        source: StreamOpenError,
    },
    #[error("timed out talking to {endpoint}")]
    Timeout { endpoint: String },
    #[error("connection to {endpoint} failed: {source}")]
    Io {
        endpoint: String,
        source: TransportError,
    },
    #[error("authentication rejected at {stage}: {error}")]
    Authentication {
        stage: &'static str,
        error: ServerError,
    },
    #[error("server refused `{request}`: {error}")]
    Protocol { request: String, error: ServerError },
    #[error("unexpected response to `{request}`: {response:?}")]
    UnexpectedResponse { request: String, response: String },
    #[error(transparent)]
    InvalidArgument(#[from] ArgumentError),
    #[error("session is not usable ({0:?})")]
    NotConnected(SessionState),
}

impl ClientError {
    /// NUT error code carried by the failure, if the server sent one.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Authentication { error, .. } | Self::Protocol { error, .. } => Some(&error.code),
            _ => None,
        }
    }
}

fn connect_failure(endpoint: &Endpoint, err: TransportError) -> ClientError {
    match err {
        TransportError::Open(StreamOpenError::Timeout { .. }) => ClientError::Timeout {
            endpoint: endpoint.to_string(),
        },
        TransportError::Open(source) => ClientError::Connection {
            endpoint: endpoint.to_string(),
            source,
        },
        source => ClientError::Io {
            endpoint: endpoint.to_string(),
            source,
        },
    }
}

/// A single NUT session. Requests are strictly sequential: every request is
/// answered by exactly one line before the next one is sent.
pub struct Client {
    transport: Transport,
    endpoint: Endpoint,
    state: SessionState,
}

impl Client {
    pub fn connect(endpoint: &Endpoint) -> Result<Self, ClientError> {
        let transport: Transport =
            Transport::connect(endpoint).map_err(|err| connect_failure(endpoint, err))?;
        debug!(%endpoint, "connected");
        Ok(Self {
            transport,
            endpoint: endpoint.clone(),
            state: SessionState::Connected,
        })
    }

    /// Connects, authenticates when the config carries credentials, runs `f`
    /// and disconnects regardless of the outcome.
    pub fn session<T, E, F>(config: &ClientConfig, f: F) -> Result<T, E>
    where
        E: From<ClientError>,
        F: FnOnce(&mut Client) -> Result<T, E>,
    {
        let mut client: Client = Self::connect(&config.endpoint)?;
        let result: Result<T, E> = match &config.credentials {
            Some(credentials) => client.authenticate(credentials).map_err(E::from),
            None => Ok(()),
        }
        .and_then(|()| f(&mut client));
        debug!(state = ?client.state(), ok = result.is_ok(), "session finished");
        client.disconnect();
        result
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn authenticate(&mut self, credentials: &Credentials) -> Result<(), ClientError> {
        if self.state != SessionState::Connected {
            return Err(ClientError::NotConnected(self.state));
        }
        let steps = [
            ("USERNAME", Request::Username(&credentials.username)),
            ("PASSWORD", Request::Password(&credentials.password)),
        ];
        for (stage, request) in steps {
            match self.exchange(&request)? {
                Response::Ok(tokens) if is_ok(&tokens) => {}
                Response::Ok(tokens) => return Err(self.unexpected(&request, &tokens)),
                Response::Err(error) => {
                    self.fail();
                    return Err(ClientError::Authentication { stage, error });
                }
            }
        }
        debug!(username = %credentials.username, "authenticated");
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// `GET VAR <ups> <name>`
    pub fn get_var(&mut self, ups: &str, name: &str) -> Result<Value, ClientError> {
        let request: Request<'_> = Request::GetVar { ups, name };
        match self.exchange(&request)? {
            Response::Ok(tokens) => match var_value(&tokens, ups, name) {
                Some(value) => {
                    debug!(ups, name, %value, "variable read");
                    Ok(value)
                }
                None => Err(self.unexpected(&request, &tokens)),
            },
            Response::Err(error) => Err(ClientError::Protocol {
                request: request.to_string(),
                error,
            }),
        }
    }

    /// `INSTCMD <ups> <command>`
    pub fn run_command(&mut self, ups: &str, command: InstantCommand) -> Result<(), ClientError> {
        if self.state == SessionState::Connected {
            warn!(ups, %command, "sending instant command without authentication");
        }
        let request: Request<'_> = Request::InstCmd { ups, command };
        match self.exchange(&request)? {
            Response::Ok(tokens) if is_ok(&tokens) => {
                debug!(ups, %command, "instant command accepted");
                Ok(())
            }
            Response::Ok(tokens) => Err(self.unexpected(&request, &tokens)),
            Response::Err(error) => Err(ClientError::Protocol {
                request: request.to_string(),
                error,
            }),
        }
    }

    /// Closes the connection. Safe to call in any state, any number of times.
    pub fn disconnect(&mut self) {
        if self.transport.close() {
            debug!(endpoint = %self.endpoint, "disconnected");
        }
        self.state = SessionState::Disconnected;
    }

    fn exchange(&mut self, request: &Request<'_>) -> Result<Response, ClientError> {
        if !matches!(
            self.state,
            SessionState::Connected | SessionState::Authenticated
        ) {
            return Err(ClientError::NotConnected(self.state));
        }
        request.validate()?;
        debug!(%request, "sending");
        if let Err(err) = self.transport.send_line(&request.encode()) {
            return Err(self.transport_failure(err));
        }
        let line: String = match self.transport.read_line() {
            Ok(line) => line,
            Err(err) => return Err(self.transport_failure(err)),
        };
        debug!(response = %line, "received");
        Response::parse(&line).map_err(|err: MalformedLine| {
            let reason: String = err.to_string();
            self.fail();
            ClientError::UnexpectedResponse {
                request: request.to_string(),
                response: format!("{line} ({reason})"),
            }
        })
    }

    fn unexpected(&mut self, request: &Request<'_>, tokens: &[Token]) -> ClientError {
        let response: String = join_tokens(tokens);
        warn!(%request, %response, "response out of step with request");
        self.fail();
        ClientError::UnexpectedResponse {
            request: request.to_string(),
            response,
        }
    }

    fn transport_failure(&mut self, err: TransportError) -> ClientError {
        self.fail();
        let endpoint: String = self.endpoint.to_string();
        if err.is_timeout() {
            ClientError::Timeout { endpoint }
        } else {
            ClientError::Io {
                endpoint,
                source: err,
            }
        }
    }

    fn fail(&mut self) {
        self.transport.close();
        self.state = SessionState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock_server::MockServer;

    fn endpoint(server: &MockServer, timeout: Duration) -> Endpoint {
        Endpoint::new("127.0.0.1", server.port(), timeout)
    }

    #[test]
    fn reads_input_voltage() {
        let server = MockServer::start(vec![Some("VAR myups input.voltage \"230.1\"")]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        let value = client.get_var("myups", "input.voltage").unwrap();
        assert_eq!(value.as_str(), "230.1");
        assert_eq!(value.parse::<f64>().unwrap(), 230.1);
        client.disconnect();
        let log = server.finish();
        assert_eq!(log.lines, vec!["GET VAR myups input.voltage"]);
        assert!(log.closed_by_client);
    }

    #[test]
    fn failed_query_leaves_connection_usable() {
        let server = MockServer::start(vec![
            Some("ERR VAR-NOT-SUPPORTED"),
            Some("VAR myups output.voltage \"229.8\""),
        ]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        let err = client.get_var("myups", "bogus.var").unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol {
                error: ServerError {
                    code: ErrorCode::VarNotSupported,
                    ..
                },
                ..
            }
        ));
        assert_eq!(err.code().map(ErrorCode::as_str), Some("VAR-NOT-SUPPORTED"));
        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(client.get_var("myups", "output.voltage").unwrap().as_str(), "229.8");
        client.disconnect();
        assert_eq!(
            server.finish().lines,
            vec!["GET VAR myups bogus.var", "GET VAR myups output.voltage"]
        );
    }

    #[test]
    fn instcmd_without_login_is_access_denied() {
        let server = MockServer::start(vec![Some("ERR ACCESS-DENIED")]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        let err = client.run_command("myups", InstantCommand::LoadOff).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::AccessDenied));
        client.disconnect();
        // exactly one attempt, no retry
        assert_eq!(server.finish().lines, vec!["INSTCMD myups load.off"]);
    }

    #[test]
    fn authenticated_load_on() {
        let server = MockServer::start(vec![Some("OK"), Some("OK"), Some("OK")]);
        let config = ClientConfig::new(endpoint(&server, Duration::from_secs(2)))
            .with_credentials(Some(Credentials::new("admin", "secret")));
        Client::session(&config, |client| {
            assert_eq!(client.state(), SessionState::Authenticated);
            client.run_command("myups", InstantCommand::LoadOn)
        })
        .unwrap();
        let log = server.finish();
        assert_eq!(
            log.lines,
            vec!["USERNAME admin", "PASSWORD secret", "INSTCMD myups load.on"]
        );
        assert!(log.closed_by_client);
    }

    #[test]
    fn rejected_password_prevents_instcmd() {
        let server = MockServer::start(vec![Some("OK"), Some("ERR INVALID-PASSWORD")]);
        let config = ClientConfig::new(endpoint(&server, Duration::from_secs(2)))
            .with_credentials(Some(Credentials::new("admin", "wrong")));
        let mut closure_ran = false;
        let err = Client::session(&config, |client| {
            closure_ran = true;
            client.run_command("myups", InstantCommand::LoadOff)
        })
        .unwrap_err();
        assert!(!closure_ran);
        assert!(matches!(
            err,
            ClientError::Authentication {
                stage: "PASSWORD",
                ..
            }
        ));
        assert_eq!(err.code(), Some(&ErrorCode::InvalidPassword));
        let log = server.finish();
        assert_eq!(log.lines, vec!["USERNAME admin", "PASSWORD wrong"]);
        assert!(!log.lines.iter().any(|line| line.starts_with("INSTCMD")));
    }

    #[test]
    fn failed_authentication_blocks_further_commands() {
        let server = MockServer::start(vec![Some("ERR INVALID-USERNAME")]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        let err = client
            .authenticate(&Credentials::new("nobody", "x"))
            .unwrap_err();
        assert!(matches!(err, ClientError::Authentication { stage: "USERNAME", .. }));
        assert_eq!(client.state(), SessionState::Failed);
        assert!(matches!(
            client.run_command("myups", InstantCommand::LoadOff),
            Err(ClientError::NotConnected(SessionState::Failed))
        ));
        assert_eq!(server.finish().lines, vec!["USERNAME nobody"]);
    }

    #[test]
    fn echo_mismatch_is_unexpected_response() {
        let server = MockServer::start(vec![Some("VAR otherups input.voltage \"230.1\"")]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        let err = client.get_var("myups", "input.voltage").unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedResponse { .. }), "{err:?}");
        assert_eq!(client.state(), SessionState::Failed);
        assert!(server.finish().closed_by_client);
    }

    #[test]
    fn wrong_variable_echo_is_unexpected_response() {
        let server = MockServer::start(vec![Some("VAR myups output.current \"1.2\"")]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        assert!(matches!(
            client.get_var("myups", "output.voltage"),
            Err(ClientError::UnexpectedResponse { .. })
        ));
        client.disconnect();
        server.finish();
    }

    #[test]
    fn read_timeout_closes_connection_once() {
        let server = MockServer::start(vec![None]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_millis(200))).unwrap();
        let err = client.get_var("myups", "input.voltage").unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }), "{err:?}");
        assert_eq!(client.state(), SessionState::Failed);
        assert!(client.transport.is_closed());
        // teardown after the forced close must not shut the stream down again
        assert!(!client.transport.close());
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), SessionState::Disconnected);
        let log = server.finish();
        assert_eq!(log.lines, vec!["GET VAR myups input.voltage"]);
        assert!(log.closed_by_client);
    }

    #[test]
    fn send_timeout_fails_the_session() {
        let server = MockServer::start(vec![]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        let err = client.transport_failure(TransportError::SendTimeout);
        assert!(matches!(err, ClientError::Timeout { .. }), "{err:?}");
        assert_eq!(client.state(), SessionState::Failed);
        assert!(client.transport.is_closed());
        assert!(matches!(
            client.get_var("myups", "input.voltage"),
            Err(ClientError::NotConnected(SessionState::Failed))
        ));
        assert!(server.finish().lines.is_empty());
    }

    #[test]
    fn connect_timeout_is_a_timeout() {
        let endpoint = Endpoint::new("192.0.2.1", 3493, Duration::from_secs(1));
        let addr = "192.0.2.1:3493".parse().unwrap();
        let err = connect_failure(
            &endpoint,
            TransportError::Open(StreamOpenError::Timeout { addr }),
        );
        assert!(matches!(
            err,
            ClientError::Timeout { ref endpoint } if endpoint == "192.0.2.1:3493"
        ));
        let refused = connect_failure(
            &endpoint,
            TransportError::Open(StreamOpenError::NoAddress {
                host: "192.0.2.1".to_owned(),
            }),
        );
        assert!(matches!(refused, ClientError::Connection { .. }));
    }

    #[test]
    fn invalid_arguments_are_never_sent() {
        let server = MockServer::start(vec![]);
        let mut client = Client::connect(&endpoint(&server, Duration::from_secs(2))).unwrap();
        assert!(matches!(
            client.get_var("myups", "input.voltage\nINSTCMD myups load.off"),
            Err(ClientError::InvalidArgument(_))
        ));
        assert_eq!(client.state(), SessionState::Connected);
        client.disconnect();
        assert!(server.finish().lines.is_empty());
    }

    #[test]
    fn connection_refused() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = Client::connect(&Endpoint::new("127.0.0.1", port, Duration::from_secs(1)))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connection { .. }), "{err:?}");
    }

    #[test]
    fn session_disconnects_after_error() {
        let server = MockServer::start(vec![Some("ERR UNKNOWN-UPS")]);
        let config = ClientConfig::new(endpoint(&server, Duration::from_secs(2)));
        let err = Client::session(&config, |client| client.get_var("nope", "input.voltage"))
            .unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::UnknownUps));
        assert!(server.finish().closed_by_client);
    }
}
