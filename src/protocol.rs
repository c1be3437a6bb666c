use std::{borrow::Cow, fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstantCommand {
    LoadOn,
    LoadOff,
}

impl InstantCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadOn => "load.on",
            Self::LoadOff => "load.off",
        }
    }
}

impl fmt::Display for InstantCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    InputVoltage,
    OutputVoltage,
    OutputCurrent,
    RealPower,
}

impl Variable {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InputVoltage => "input.voltage",
            Self::OutputVoltage => "output.voltage",
            Self::OutputCurrent => "output.current",
            Self::RealPower => "ups.realpower",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw value of a variable exactly as the server sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(String);

impl Value {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn parse<T: FromStr>(&self) -> Result<T, T::Err> {
        self.0.parse()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {what}: {reason}")]
pub struct ArgumentError {
    pub what: &'static str,
    pub reason: &'static str,
}

fn check_token(what: &'static str, value: &str) -> Result<(), ArgumentError> {
    check_secret(what, value)?;
    if value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        return Err(ArgumentError {
            what,
            reason: "must not contain whitespace, quotes or backslashes",
        });
    }
    Ok(())
}

fn check_secret(what: &'static str, value: &str) -> Result<(), ArgumentError> {
    if value.is_empty() {
        return Err(ArgumentError {
            what,
            reason: "must not be empty",
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ArgumentError {
            what,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

fn quote_arg(arg: &str) -> Cow<'_, str> {
    if !arg.contains([' ', '"', '\\']) {
        return Cow::Borrowed(arg);
    }
    let mut quoted: String = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Username(&'a str),
    Password(&'a str),
    GetVar { ups: &'a str, name: &'a str },
    InstCmd { ups: &'a str, command: InstantCommand },
}

impl Request<'_> {
    pub fn validate(&self) -> Result<(), ArgumentError> {
        match self {
            Self::Username(username) => check_secret("username", username),
            Self::Password(password) => check_secret("password", password),
            Self::GetVar { ups, name } => {
                check_token("UPS name", ups)?;
                check_token("variable name", name)
            }
            Self::InstCmd { ups, .. } => check_token("UPS name", ups),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Username(username) => format!("USERNAME {}", quote_arg(username)),
            Self::Password(password) => format!("PASSWORD {}", quote_arg(password)),
            Self::GetVar { ups, name } => format!("GET VAR {ups} {name}"),
            Self::InstCmd { ups, command } => format!("INSTCMD {ups} {command}"),
        }
    }
}

/// Same as [`Request::encode`] except that passwords are masked.
impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("PASSWORD ****"),
            other => f.write_str(&other.encode()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AccessDenied,
    UnknownUps,
    VarNotSupported,
    CmdNotSupported,
    InvalidArgument,
    InstcmdFailed,
    SetFailed,
    Readonly,
    TooLong,
    FeatureNotSupported,
    FeatureNotConfigured,
    AlreadySslMode,
    DriverNotConnected,
    DataStale,
    AlreadyLoggedIn,
    InvalidPassword,
    AlreadySetPassword,
    InvalidUsername,
    AlreadySetUsername,
    UsernameRequired,
    PasswordRequired,
    UnknownCommand,
    InvalidValue,
    Unknown(String),
}

impl ErrorCode {
    pub fn from_token(token: &str) -> Self {
        match token {
            "ACCESS-DENIED" => Self::AccessDenied,
            "UNKNOWN-UPS" => Self::UnknownUps,
            "VAR-NOT-SUPPORTED" => Self::VarNotSupported,
            "CMD-NOT-SUPPORTED" => Self::CmdNotSupported,
            "INVALID-ARGUMENT" => Self::InvalidArgument,
            "INSTCMD-FAILED" => Self::InstcmdFailed,
            "SET-FAILED" => Self::SetFailed,
            "READONLY" => Self::Readonly,
            "TOO-LONG" => Self::TooLong,
            "FEATURE-NOT-SUPPORTED" => Self::FeatureNotSupported,
            "FEATURE-NOT-CONFIGURED" => Self::FeatureNotConfigured,
            "ALREADY-SSL-MODE" => Self::AlreadySslMode,
            "DRIVER-NOT-CONNECTED" => Self::DriverNotConnected,
            "DATA-STALE" => Self::DataStale,
            "ALREADY-LOGGED-IN" => Self::AlreadyLoggedIn,
            "INVALID-PASSWORD" => Self::InvalidPassword,
            "ALREADY-SET-PASSWORD" => Self::AlreadySetPassword,
            "INVALID-USERNAME" => Self::InvalidUsername,
            "ALREADY-SET-USERNAME" => Self::AlreadySetUsername,
            "USERNAME-REQUIRED" => Self::UsernameRequired,
            "PASSWORD-REQUIRED" => Self::PasswordRequired,
            "UNKNOWN-COMMAND" => Self::UnknownCommand,
            "INVALID-VALUE" => Self::InvalidValue,
            other => Self::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::AccessDenied => "ACCESS-DENIED",
            Self::UnknownUps => "UNKNOWN-UPS",
            Self::VarNotSupported => "VAR-NOT-SUPPORTED",
            Self::CmdNotSupported => "CMD-NOT-SUPPORTED",
            Self::InvalidArgument => "INVALID-ARGUMENT",
            Self::InstcmdFailed => "INSTCMD-FAILED",
            Self::SetFailed => "SET-FAILED",
            Self::Readonly => "READONLY",
            Self::TooLong => "TOO-LONG",
            Self::FeatureNotSupported => "FEATURE-NOT-SUPPORTED",
            Self::FeatureNotConfigured => "FEATURE-NOT-CONFIGURED",
            Self::AlreadySslMode => "ALREADY-SSL-MODE",
            Self::DriverNotConnected => "DRIVER-NOT-CONNECTED",
            Self::DataStale => "DATA-STALE",
            Self::AlreadyLoggedIn => "ALREADY-LOGGED-IN",
            Self::InvalidPassword => "INVALID-PASSWORD",
            Self::AlreadySetPassword => "ALREADY-SET-PASSWORD",
            Self::InvalidUsername => "INVALID-USERNAME",
            Self::AlreadySetUsername => "ALREADY-SET-USERNAME",
            Self::UsernameRequired => "USERNAME-REQUIRED",
            Self::PasswordRequired => "PASSWORD-REQUIRED",
            Self::UnknownCommand => "UNKNOWN-COMMAND",
            Self::InvalidValue => "INVALID-VALUE",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an `ERR <code> [<detail>]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: ErrorCode,
    pub detail: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", self.code, detail),
            None => write!(f, "{}", self.code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Bare(String),
    /// Text between the quotes, escapes left untouched.
    Quoted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedLine {
    #[error("empty line")]
    Empty,
    #[error("unterminated quoted string")]
    UnterminatedQuote,
    #[error("missing separator after quoted string")]
    MissingSeparator,
}

pub fn tokenize(line: &str) -> Result<Vec<Token>, MalformedLine> {
    let mut tokens: Vec<Token> = Vec::new();
    let bytes: &[u8] = line.as_bytes();
    let mut pos: usize = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\t' => pos += 1,
            b'"' => {
                let start: usize = pos + 1;
                let mut end: usize = start;
                loop {
                    match bytes.get(end) {
                        None => return Err(MalformedLine::UnterminatedQuote),
                        Some(b'\\') => end += 2,
                        Some(b'"') => break,
                        Some(_) => end += 1,
                    }
                }
                if !matches!(bytes.get(end + 1), None | Some(b' ' | b'\t')) {
                    return Err(MalformedLine::MissingSeparator);
                }
                tokens.push(Token::Quoted(line[start..end].to_owned()));
                pos = end + 1;
            }
            _ => {
                let start: usize = pos;
                while pos < bytes.len() && !matches!(bytes[pos], b' ' | b'\t') {
                    pos += 1;
                }
                tokens.push(Token::Bare(line[start..pos].to_owned()));
            }
        }
    }
    if tokens.is_empty() {
        return Err(MalformedLine::Empty);
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Vec<Token>),
    Err(ServerError),
}

impl Response {
    pub fn parse(line: &str) -> Result<Self, MalformedLine> {
        if let Some(rest) = line.strip_prefix("ERR") {
            if rest.is_empty() || rest.starts_with(' ') {
                let rest: &str = rest.trim_start();
                let (code, detail) = match rest.split_once(' ') {
                    Some((code, detail)) => (code, detail.trim()),
                    None => (rest, ""),
                };
                return Ok(Self::Err(ServerError {
                    code: ErrorCode::from_token(code),
                    detail: (!detail.is_empty()).then(|| detail.to_owned()),
                }));
            }
        }
        tokenize(line).map(Self::Ok)
    }
}

pub fn join_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|token| match token {
            Token::Bare(text) => text.clone(),
            Token::Quoted(text) => format!("\"{text}\""),
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn is_ok(tokens: &[Token]) -> bool {
    matches!(tokens.first(), Some(Token::Bare(verb)) if verb == "OK")
}

/// Extracts the value from `VAR <ups> <name> "<value>"`, or `None` when the
/// line is shaped differently or echoes another UPS or variable.
pub fn var_value(tokens: &[Token], ups: &str, name: &str) -> Option<Value> {
    match tokens {
        [Token::Bare(verb), Token::Bare(echo_ups), Token::Bare(echo_name), Token::Quoted(value)]
            if verb == "VAR" && echo_ups == ups && echo_name == name =>
        {
            Some(Value::new(value.as_str()))
        }
        _ => None,
    }
}
