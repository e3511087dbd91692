// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! # Embedded collaborators for Fern PostgreSQL servers
//!
//! A storage-less [`Session`](fern_pgwire_interfaces::Session) answering a
//! tiny SQL dialect, and `trust`/`password` authentication methods, all
//! configured from the server settings.
//!
//! ```toml
//! [auth]
//! method = "password"
//! trust_addresses = ["127.0.0.1"]
//!
//! [auth.users]
//! alice = "s3cret"
//!
//! [session]
//! databases = ["fern"]
//! ```

#![forbid(unsafe_code)]

mod auth;
mod query;
mod session;

pub use auth::{EmbeddedAuthentication, PasswordMethod, TrustMethod};
pub use query::Statement;
pub use session::{EmbeddedSession, EmbeddedSessionFactory};
