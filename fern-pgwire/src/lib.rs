// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! # Fern PostgreSQL wire protocol engine
//!
//! Serves PostgreSQL clients over any byte stream: connection startup and
//! authentication, the Simple and Extended Query sub-protocols, and
//! cancellation of running commands. Queries themselves are handed over to
//! a [`Session`](fern_pgwire_interfaces::Session).
//!
//! ## Examples
//!
//! ```rust,ignore
//! let engine = Arc::new(Engine::new(authentication, sessions));
//! let properties = ConnectionProperties::new(Some(address));
//! tokio::spawn(Connection::new(socket, properties, engine).run());
//! ```

#![forbid(unsafe_code)]

use std::sync::Arc;

use fern_pgwire_interfaces::{Authentication, SessionFactory};

mod auth;
pub mod cancel;
mod connection;
mod dispatcher;
mod error;
pub mod responses;
pub mod splitter;
pub mod state;
mod writer;

pub use cancel::CancelRegistry;
pub use connection::Connection;
pub use error::{Error, Severity};

/// Version announced to clients in the `server_version` parameter.
pub const DEFAULT_SERVER_VERSION: &str = "10.5";

/// Collaborators shared by every connection of a server.
pub struct Engine {
    pub(crate) authentication: Arc<dyn Authentication>,
    pub(crate) sessions: Arc<dyn SessionFactory>,
    pub(crate) cancel: Arc<CancelRegistry>,
    pub(crate) server_version: String,
}

impl Engine {
    pub fn new(authentication: Arc<dyn Authentication>, sessions: Arc<dyn SessionFactory>) -> Self {
        Self {
            authentication,
            sessions,
            cancel: Arc::new(CancelRegistry::new()),
            server_version: DEFAULT_SERVER_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn with_server_version(mut self, server_version: impl Into<String>) -> Self {
        self.server_version = server_version.into();
        self
    }

    /// Cancel keys of the connections currently established.
    pub fn cancel_registry(&self) -> &Arc<CancelRegistry> {
        &self.cancel
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("server_version", &self.server_version)
            .field("connections", &self.cancel.len())
            .finish()
    }
}
