// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

use std::fmt;
use std::process::ExitCode;

use yuvsnap::ErrorKind;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Camera device missing, inaccessible or unable to stream
    DeviceUnavailable(String),
    /// Camera refused the requested format
    NegotiationFailed(String),
    /// Buffers could not be allocated or mapped
    ResourceExhausted(String),
    /// No frame arrived in time
    Timeout(String),
    /// Camera rejected a stream or buffer command
    StreamFailed(String),
    /// Anything else, including output file errors
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::DeviceUnavailable(msg) => write!(f, "Camera unavailable: {}", msg),
            CliError::NegotiationFailed(msg) => write!(f, "Format negotiation failed: {}", msg),
            CliError::ResourceExhausted(msg) => write!(f, "Out of buffers: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::StreamFailed(msg) => write!(f, "Streaming failed: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    fn code(&self) -> u8 {
        match self {
            CliError::General(_) => 1,
            CliError::InvalidArgs(_) => 2,
            CliError::DeviceUnavailable(_) => 3,
            CliError::NegotiationFailed(_) => 4,
            CliError::ResourceExhausted(_) => 5,
            CliError::Timeout(_) => 6,
            CliError::StreamFailed(_) => 7,
        }
    }
}

/// Map yuvsnap::Error to CliError by error kind
impl From<yuvsnap::Error> for CliError {
    fn from(err: yuvsnap::Error) -> Self {
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::Unavailable => CliError::DeviceUnavailable(msg),
            ErrorKind::NegotiationFailed => CliError::NegotiationFailed(msg),
            ErrorKind::ResourceExhausted => CliError::ResourceExhausted(msg),
            ErrorKind::Timeout | ErrorKind::Interrupted => CliError::Timeout(msg),
            ErrorKind::ProtocolFailure => CliError::StreamFailed(msg),
            ErrorKind::Usage => match err {
                yuvsnap::Error::InvalidConfig(_) => CliError::InvalidArgs(msg),
                _ => CliError::General(msg),
            },
            ErrorKind::Sink => CliError::General(msg),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::General(format!("I/O error: {}", err))
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
