// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! # PostgreSQL wire protocol
//!
//! Structs and functions for implementing the PostgreSQL wire protocol
//! [Message Formats], as needed by Fern PostgreSQL servers.
//!
//!
//! ## Disclaimer
//! By no means does this crate aim to implement Structs for every PostgreSQL
//! message. Structs in this crate cover what a server needs for running
//! queries through the Simple and Extended Query sub-protocols.
//!
//! ## Examples
//!
//! ```rust
//! use fern_protocol_postgresql::codec::frontend::{Codec, Message};
//! ```
//!
//! [Message Formats]: https://www.postgresql.org/docs/current/protocol-message-formats.html

#![forbid(unsafe_code)]

pub mod codec;
pub mod types;
