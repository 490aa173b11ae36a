// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, more bytes are needed before a frame can be parsed
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Errors that mean the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AppError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn disconnect_errors_are_recognized() {
        let reset: AppError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(reset.is_disconnect());
        let other: AppError = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(!other.is_disconnect());
        assert!(!AppError::MalformedProtocol("x".into()).is_disconnect());
    }
}
