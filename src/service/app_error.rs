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

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// replication stream errors
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// column file failures inside a slave writer
    #[error("storage error on master table {table_id}: {source}")]
    StorageError {
        table_id: i32,
        #[source]
        source: std::io::Error,
    },

    /// table writer lease errors
    #[error("slave writer for master table {0} is leased by another connection")]
    WriterBusy(i32),

    #[error("cannot lease slave writer for master table {table_id}: {reason}")]
    LeaseFailure { table_id: i32, reason: String },
}

/// The per-connection fault classes a reactor has to tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    ProtocolViolation,
    ConnectionFault,
    ResourceLeaseFailure,
    Internal,
}

impl AppError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            AppError::MalformedProtocol(_) => FaultKind::ProtocolViolation,
            AppError::ConnectionClosed(_)
            | AppError::DetailedIoError(_)
            | AppError::IoError(_) => FaultKind::ConnectionFault,
            AppError::WriterBusy(_) | AppError::LeaseFailure { .. } => {
                FaultKind::ResourceLeaseFailure
            }
            AppError::IllegalStateError(_)
            | AppError::StorageError { .. }
            | AppError::InvalidValue(_)
            | AppError::ConfigFileError(_) => FaultKind::Internal,
        }
    }
}
