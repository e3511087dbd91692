// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Ordered delivery of backend Messages.
//!
//! Every command gets a [`WriteSlot`] when dispatched. Messages written to a
//! slot only reach the client once every slot handed out before it has been
//! released and drained, whatever the order in which commands complete.
//!
//! ```text
//!   dispatcher ── slot() ──> [slot 1][slot 2][slot 3] ── drain ──> Sink
//!                               ▲       ▲
//!                          executing  completed, waiting for slot 1
//! ```

use futures::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TryRecvError};

use fern_protocol_postgresql::codec::backend::Message;

use crate::Error;

/// Messages a slot buffers before its writer waits for the client to read.
pub const SLOT_CAPACITY: usize = 64;

/// Slots handed out and not yet drained before `slot()` waits.
const PENDING_SLOTS: usize = 32;

#[derive(Debug)]
enum Outbound {
    Message(Message),
    Flush,
}

/// Hands out [`WriteSlot`]s in dispatch order.
#[derive(Debug)]
pub struct ResponseWriter {
    slots: mpsc::Sender<mpsc::Receiver<Outbound>>,
}

impl ResponseWriter {
    /// Creates a writer, along with the queue draining its slots.
    pub fn new() -> (ResponseWriter, SlotQueue) {
        let (tx, rx) = mpsc::channel(PENDING_SLOTS);
        (ResponseWriter { slots: tx }, SlotQueue { slots: rx })
    }

    /// Reserves the next position in the output stream, waiting while too
    /// many slots are pending.
    pub async fn slot(&self) -> Result<WriteSlot, Error> {
        let (tx, rx) = mpsc::channel(SLOT_CAPACITY);
        self.slots.send(rx).await.map_err(|_| Error::WriterClosed)?;
        Ok(WriteSlot { messages: tx })
    }
}

/// Output of a single command. Dropping the slot releases it.
///
/// Sending waits once [`SLOT_CAPACITY`] Messages are buffered, so a command
/// only runs as far ahead of the client as the buffers allow.
#[derive(Debug)]
pub struct WriteSlot {
    messages: mpsc::Sender<Outbound>,
}

impl WriteSlot {
    pub async fn send(&self, msg: Message) -> Result<(), Error> {
        self.messages
            .send(Outbound::Message(msg))
            .await
            .map_err(|_| Error::WriterClosed)
    }

    /// Asks for everything written so far to be flushed to the client.
    pub async fn flush(&self) -> Result<(), Error> {
        self.messages
            .send(Outbound::Flush)
            .await
            .map_err(|_| Error::WriterClosed)
    }
}

/// Receiving end of a [`ResponseWriter`].
#[derive(Debug)]
pub struct SlotQueue {
    slots: mpsc::Receiver<mpsc::Receiver<Outbound>>,
}

impl SlotQueue {
    /// Forwards Messages to `sink`, one slot after the other.
    ///
    /// The sink is flushed on explicit request, whenever no output is ready,
    /// and once the writer and all its slots are gone.
    pub async fn drain<S>(mut self, mut sink: S) -> Result<(), S::Error>
    where
        S: Sink<Message> + Unpin,
    {
        loop {
            let mut slot = match self.slots.try_recv() {
                Ok(slot) => slot,
                Err(TryRecvError::Empty) => {
                    sink.flush().await?;
                    match self.slots.recv().await {
                        Some(slot) => slot,
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            loop {
                let outbound = match slot.try_recv() {
                    Ok(outbound) => Some(outbound),
                    Err(TryRecvError::Empty) => {
                        // Command still running, push out what it produced so far.
                        sink.flush().await?;
                        slot.recv().await
                    }
                    Err(TryRecvError::Disconnected) => None,
                };

                match outbound {
                    Some(Outbound::Message(msg)) => sink.feed(msg).await?,
                    Some(Outbound::Flush) => sink.flush().await?,
                    None => break,
                }
            }
        }

        log::trace!("response writer closed, flushing");
        sink.flush().await
    }
}
