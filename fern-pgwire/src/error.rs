// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use std::io;
use thiserror::Error;

use fern_pgwire_interfaces::{AuthenticationError, DataType, SessionError};
use fern_protocol_postgresql::types::ValueError;

/// Errors raised while serving a client connection.
///
/// Every variant maps to a SQLSTATE code and a severity, which is how it is
/// reported to the client in an `ErrorResponse`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("response writer is closed")]
    WriterClosed,

    #[error("{0}")]
    Protocol(String),

    #[error("Unsupported messageType: {}", *.0 as char)]
    UnsupportedMessage(u8),

    #[error("Unsupported format code '{code}' for param '{index}' of type '{data_type}'")]
    UnsupportedFormatCode {
        code: i16,
        index: usize,
        data_type: DataType,
    },

    #[error("unsupported result format code: {0}")]
    UnsupportedResultFormatCode(i16),

    #[error("invalid value for parameter {index}: {source}")]
    InvalidParameterValue {
        index: usize,
        #[source]
        source: ValueError,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error("No valid auth.host_based entry found for host \"{host}\", user \"{user}\"")]
    NoAuthenticationMethod { host: String, user: String },

    #[error("expected password response, got message type '{}'", *.0 as char)]
    UnexpectedDuringAuthentication(u8),

    #[error("canceling statement due to user request")]
    Canceled,
}

/// Severity of an `ErrorResponse`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl Error {
    pub fn sql_state(&self) -> &str {
        match self {
            Self::Io(_) | Self::WriterClosed => "08006",
            Self::Protocol(_) | Self::UnsupportedMessage(_) => "08P01",
            Self::UnexpectedDuringAuthentication(_) => "08P01",
            Self::UnsupportedFormatCode { .. } | Self::UnsupportedResultFormatCode(_) => "22023",
            Self::InvalidParameterValue { source, .. } => source.sql_state(),
            Self::Session(err) => err.sql_state(),
            Self::Authentication(_) | Self::NoAuthenticationMethod { .. } => "28000",
            Self::Canceled => "57014",
        }
    }

    /// Fatal errors end the connection once reported.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::WriterClosed
                | Self::Authentication(_)
                | Self::NoAuthenticationMethod { .. }
                | Self::UnexpectedDuringAuthentication(_)
        )
    }

    /// Transport errors can't be reported, as the client is gone.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::WriterClosed)
    }

    pub fn severity(&self) -> Severity {
        if self.is_fatal() {
            Severity::Fatal
        } else {
            Severity::Error
        }
    }

    /// Server routine reported along with authentication failures.
    pub fn routine(&self) -> Option<&'static str> {
        match self {
            Self::Authentication(_) | Self::NoAuthenticationMethod { .. } => {
                Some("ClientAuthentication")
            }
            _ => None,
        }
    }
}
