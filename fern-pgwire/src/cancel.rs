// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Server-wide registry of cancel keys.
//!
//! Each established connection announces a `(process_id, secret_key)` pair
//! with `BackendKeyData`. A client wanting to cancel the running command
//! opens another connection and sends that pair in a `CancelRequest`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Entry {
    secret_key: u32,
    /// Token of the command currently running on the connection.
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct CancelRegistry {
    connections: Mutex<HashMap<u32, Entry>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Entry>> {
        // Entries stay consistent even if a holder panicked.
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a fresh cancel key for a connection.
    ///
    /// The key is released when the returned handle is dropped.
    pub fn register(self: &Arc<Self>) -> CancelHandle {
        let mut connections = self.lock();

        // Process IDs are kept positive, as some clients read them as signed.
        let process_id = loop {
            let candidate = rand::random::<u32>() >> 1;
            if candidate != 0 && !connections.contains_key(&candidate) {
                break candidate;
            }
        };
        let secret_key = rand::random::<u32>();

        connections.insert(
            process_id,
            Entry {
                secret_key,
                token: CancellationToken::new(),
            },
        );
        log::trace!("registered cancel key for process {}", process_id);

        CancelHandle {
            registry: Arc::clone(self),
            process_id,
            secret_key,
        }
    }

    /// Cancels the command running for `process_id`, if `secret_key` matches.
    pub fn cancel(&self, process_id: u32, secret_key: u32) -> bool {
        match self.lock().get(&process_id) {
            Some(entry) if entry.secret_key == secret_key => {
                entry.token.cancel();
                true
            }
            Some(_) => {
                log::warn!("cancel request for process {} with wrong secret key", process_id);
                false
            }
            None => {
                log::debug!("cancel request for unknown process {}", process_id);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Cancel key of a single connection.
#[derive(Debug)]
pub struct CancelHandle {
    registry: Arc<CancelRegistry>,
    process_id: u32,
    secret_key: u32,
}

impl CancelHandle {
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn secret_key(&self) -> u32 {
        self.secret_key
    }

    /// Returns the token of the command about to run.
    ///
    /// A cancel request only affects the command running when it arrives.
    pub fn command_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(entry) = self.registry.lock().get_mut(&self.process_id) {
            entry.token = token.clone();
        }
        token
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.process_id);
        log::trace!("released cancel key for process {}", self.process_id);
    }
}
