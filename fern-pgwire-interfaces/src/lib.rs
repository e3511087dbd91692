// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Interfaces between the Fern PostgreSQL wire protocol engine and its
//! collaborators: the query execution backend ([`Session`]) and the
//! pluggable authentication mechanisms ([`AuthenticationMethod`]).

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

mod error;
pub mod registry;
mod types;

pub use error::{AuthenticationError, SessionError};
pub use types::{DataType, DescribeResult, Field, FormatCode, Row, RowSource, TargetKind, Value};

/// Settings shared by every component of a running server.
#[derive(Debug)]
pub struct ServerContext {
    pub config: config::Config,
}

impl ServerContext {
    pub fn new(config: config::Config) -> Self {
        Self { config }
    }
}

pub type SharedServerContext = Arc<ServerContext>;

/// Transport used by a client connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Postgres,
}

/// Properties of a client connection, as known before authentication.
#[derive(Clone, Debug)]
pub struct ConnectionProperties {
    /// Remote address, `None` for in-process transports.
    pub address: Option<SocketAddr>,

    pub protocol: Protocol,

    /// Description of the negotiated TLS session, if any.
    pub tls_session: Option<String>,
}

impl ConnectionProperties {
    pub fn new(address: Option<SocketAddr>) -> Self {
        Self {
            address,
            protocol: Protocol::Postgres,
            tls_session: None,
        }
    }

    /// Remote host, as reported in authentication errors.
    pub fn host(&self) -> String {
        self.address
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "[local]".to_string())
    }
}

/// An authenticated user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct User {
    pub name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A mechanism verifying the identity of a connecting user.
#[async_trait]
pub trait AuthenticationMethod: std::fmt::Debug + Send + Sync {
    /// Name of the mechanism, e.g. `trust` or `password`.
    fn name(&self) -> &str;

    /// Whether a clear text password must be requested from the client.
    fn requires_password(&self) -> bool {
        self.name() == "password"
    }

    async fn authenticate(
        &self,
        user: &str,
        password: Option<&[u8]>,
        properties: &ConnectionProperties,
    ) -> Result<User, AuthenticationError>;
}

/// Resolves which [`AuthenticationMethod`] applies to a connection.
pub trait Authentication: Send + Sync {
    /// Returns `None` if the user is not allowed to connect at all.
    fn resolve_authentication_type(
        &self,
        user: &str,
        properties: &ConnectionProperties,
    ) -> Option<Arc<dyn AuthenticationMethod>>;
}

/// Creates a [`Session`] for every authenticated connection.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(
        &self,
        database: Option<&str>,
        user: &User,
    ) -> Result<Box<dyn Session>, SessionError>;
}

/// Query execution backend of a single connection.
///
/// The wire protocol engine drives a session one command at a time,
/// so implementations never need to arbitrate concurrent calls.
#[async_trait]
pub trait Session: Send + Sync {
    /// Registers a prepared statement, replacing any with the same name.
    async fn parse(
        &mut self,
        name: &str,
        query: &str,
        param_types: Vec<DataType>,
    ) -> Result<(), SessionError>;

    /// Binds parameter values to a prepared statement, creating a portal.
    async fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        params: Vec<Value>,
        result_formats: Vec<FormatCode>,
    ) -> Result<(), SessionError>;

    async fn describe(
        &mut self,
        target: TargetKind,
        name: &str,
    ) -> Result<DescribeResult, SessionError>;

    /// Runs a portal; `max_rows` of `0` means no limit.
    async fn execute(&mut self, portal: &str, max_rows: u32) -> Result<RowSource, SessionError>;

    /// Runs a single statement of a simple query.
    async fn execute_simple(&mut self, query: &str) -> Result<RowSource, SessionError>;

    /// Query text behind a portal.
    fn get_query(&self, portal: &str) -> Result<String, SessionError>;

    /// Declared type of the parameter at `index` of a prepared statement.
    fn get_param_type(&self, statement: &str, index: usize) -> Result<DataType, SessionError>;

    fn get_result_format_codes(&self, portal: &str) -> Result<Vec<FormatCode>, SessionError>;

    /// Completes the current command sequence.
    async fn sync(&mut self) -> Result<(), SessionError>;

    /// Drops transient state after an error.
    fn clear_state(&mut self);

    /// Removes a statement or a portal; unknown names are ignored.
    fn close_target(&mut self, target: TargetKind, name: &str);

    /// Releases every resource held by the session.
    fn close(&mut self);
}
