use std::process::exit;

use crate::client::ClientError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const CONNECTION: i32 = 2;
    pub const TIMEOUT: i32 = 3;
    pub const AUTH: i32 = 4;
    pub const PROTOCOL: i32 = 5;
}

/// Exit status for a failed run, picked from the innermost client error.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::Connection { .. } | ClientError::Io { .. }) => exit_code::CONNECTION,
        Some(ClientError::Timeout { .. }) => exit_code::TIMEOUT,
        Some(ClientError::Authentication { .. }) => exit_code::AUTH,
        Some(ClientError::Protocol { .. } | ClientError::UnexpectedResponse { .. }) => {
            exit_code::PROTOCOL
        }
        _ => exit_code::GENERAL,
    }
}

pub fn fatal(msg: &str, code: i32) -> ! {
    eprintln!("FATAL: {}", msg);
    exit(code);
}
