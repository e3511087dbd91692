// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by a [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("prepared statement \"{0}\" does not exist")]
    UnknownStatement(String),

    #[error("portal \"{0}\" does not exist")]
    UnknownPortal(String),

    #[error("syntax error at or near \"{0}\"")]
    Syntax(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("bind message supplies {supplied} parameters, but prepared statement \"{statement}\" requires {required}")]
    ParameterCount {
        statement: String,
        supplied: usize,
        required: usize,
    },

    #[error("prepared statement \"{statement}\" has no parameter at index {index}")]
    ParameterIndex { statement: String, index: usize },

    #[error("{message}")]
    Execution { sql_state: String, message: String },
}

impl SessionError {
    /// SQLSTATE code reported to clients.
    pub fn sql_state(&self) -> &str {
        match self {
            Self::UnknownStatement(_) => "26000",
            Self::UnknownPortal(_) => "34000",
            Self::Syntax(_) => "42601",
            Self::Unsupported(_) => "0A000",
            Self::ParameterCount { .. } | Self::ParameterIndex { .. } => "08P01",
            Self::Execution { sql_state, .. } => sql_state,
        }
    }
}

/// Errors surfaced by an [`AuthenticationMethod`](crate::AuthenticationMethod).
///
/// Clients always see these as `invalid_authorization_specification`.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("password authentication failed for user \"{0}\"")]
    InvalidPassword(String),

    #[error("no password supplied for user \"{0}\"")]
    MissingPassword(String),

    #[error("role \"{0}\" does not exist")]
    UnknownUser(String),
}
