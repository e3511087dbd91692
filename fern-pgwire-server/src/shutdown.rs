// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::broadcast;

/// Shutdown signal, as seen by one connection task.
///
/// The server never sends a value: dropping its [`broadcast::Sender`]
/// is the signal, which every subscribed receiver observes as closed.
#[derive(Debug)]
pub(crate) struct Shutdown {
    received: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            received: false,
            notify,
        }
    }

    /// Waits for the shutdown signal, returning at once if already received.
    pub(crate) async fn recv(&mut self) {
        if self.received {
            return;
        }

        // Lagging is impossible, at most one value is ever sent.
        let _ = self.notify.recv().await;
        self.received = true;
    }
}
