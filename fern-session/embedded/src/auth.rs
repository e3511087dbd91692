// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use fern_pgwire_interfaces::{
    Authentication, AuthenticationError, AuthenticationMethod, ConnectionProperties,
    ServerContext, User,
};

/// Lets any user in, without credentials.
#[derive(Debug)]
pub struct TrustMethod;

#[async_trait]
impl AuthenticationMethod for TrustMethod {
    fn name(&self) -> &str {
        "trust"
    }

    async fn authenticate(
        &self,
        user: &str,
        _password: Option<&[u8]>,
        _properties: &ConnectionProperties,
    ) -> Result<User, AuthenticationError> {
        Ok(User::new(user))
    }
}

/// Checks clear text passwords against the `auth.users` table.
pub struct PasswordMethod {
    users: HashMap<String, String>,
}

impl PasswordMethod {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl std::fmt::Debug for PasswordMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordMethod")
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl AuthenticationMethod for PasswordMethod {
    fn name(&self) -> &str {
        "password"
    }

    async fn authenticate(
        &self,
        user: &str,
        password: Option<&[u8]>,
        _properties: &ConnectionProperties,
    ) -> Result<User, AuthenticationError> {
        let Some(password) = password else {
            return Err(AuthenticationError::MissingPassword(user.to_string()));
        };

        // Unknown users get the same answer as wrong passwords.
        match self.users.get(user) {
            Some(expected) if constant_time_eq(expected.as_bytes(), password) => Ok(User::new(user)),
            _ => Err(AuthenticationError::InvalidPassword(user.to_string())),
        }
    }
}

/// Picks the authentication method configured in `auth.method`.
///
/// When `auth.trust_addresses` lists addresses, connections from any other
/// address are refused before authentication starts. An `auth.method` this
/// crate does not know refuses every connection.
#[derive(Debug)]
pub struct EmbeddedAuthentication {
    method: Option<Arc<dyn AuthenticationMethod>>,
    /// `None` lets every address in.
    addresses: Option<Vec<IpAddr>>,
}

impl EmbeddedAuthentication {
    pub fn new(context: &ServerContext) -> Self {
        let config = &context.config;

        let mut users = HashMap::new();
        if let Ok(table) = config.get::<HashMap<String, String>>("auth.users") {
            users = table;
        }

        let method: Option<Arc<dyn AuthenticationMethod>> =
            if let Ok(method) = config.get::<String>("auth.method") {
                match method.as_str() {
                    "password" => Some(Arc::new(PasswordMethod::new(users))),
                    "trust" => Some(Arc::new(TrustMethod)),
                    other => {
                        log::error!("unknown auth.method {:?}, refusing every connection", other);
                        None
                    }
                }
            } else {
                // Default method, if nothing is defined in `config`.
                Some(Arc::new(TrustMethod))
            };

        let mut addresses = None;
        if let Ok(entries) = config.get::<Vec<String>>("auth.trust_addresses") {
            // Invalid entries are dropped, the list still restricts addresses.
            if !entries.is_empty() {
                addresses = Some(
                    entries
                        .iter()
                        .filter_map(|entry| match entry.parse::<IpAddr>() {
                            Ok(address) => Some(address),
                            Err(err) => {
                                log::warn!("ignoring auth.trust_addresses entry {:?}: {}", entry, err);
                                None
                            }
                        })
                        .collect(),
                );
            }
        }

        Self { method, addresses }
    }

    pub fn with_method(method: Arc<dyn AuthenticationMethod>) -> Self {
        Self {
            method: Some(method),
            addresses: None,
        }
    }
}

impl Authentication for EmbeddedAuthentication {
    fn resolve_authentication_type(
        &self,
        user: &str,
        properties: &ConnectionProperties,
    ) -> Option<Arc<dyn AuthenticationMethod>> {
        if let Some(addresses) = &self.addresses {
            let allowed = properties
                .address
                .map(|address| addresses.contains(&address.ip()))
                .unwrap_or(false);
            if !allowed {
                log::debug!("no authentication method for {:?} from {}", user, properties.host());
                return None;
            }
        }
        self.method.as_ref().map(Arc::clone)
    }
}
