// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! State of an authentication handshake in progress.

use bytes::BytesMut;
use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::Arc;

use fern_pgwire_interfaces::{AuthenticationMethod, ConnectionProperties, User};

use crate::Error;

/// Clear text password received from a client, wiped from memory on drop.
pub struct SecurePassword(BytesMut);

impl SecurePassword {
    pub fn new(password: BytesMut) -> Self {
        Self(password)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.fill(0);
        compiler_fence(Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecurePassword(***)")
    }
}

/// Everything needed to authenticate a user, from the resolved method to
/// the credentials it asked for.
///
/// The context lives from the end of the startup message processing until
/// authentication resolves, whatever the outcome.
#[derive(Debug)]
pub struct AuthenticationContext {
    method: Arc<dyn AuthenticationMethod>,
    user: String,
    properties: ConnectionProperties,
    password: Option<SecurePassword>,
}

impl AuthenticationContext {
    pub fn new(
        method: Arc<dyn AuthenticationMethod>,
        user: impl Into<String>,
        properties: ConnectionProperties,
    ) -> Self {
        Self {
            method,
            user: user.into(),
            properties,
            password: None,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn requires_password(&self) -> bool {
        self.method.requires_password()
    }

    pub fn set_password(&mut self, password: BytesMut) {
        self.password = Some(SecurePassword::new(password));
    }

    /// Consumes the context, dropping the password whatever the outcome.
    pub async fn authenticate(self) -> Result<User, Error> {
        log::debug!(
            "authenticating user {:?} with method {:?}",
            self.user,
            self.method.name()
        );

        let password = self.password.as_ref().map(SecurePassword::as_bytes);
        let user = self
            .method
            .authenticate(&self.user, password, &self.properties)
            .await?;
        Ok(user)
    }
}
