// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Per-connection protocol state machine.
//!
//! ```text
//! AwaitingStartup ──SSLRequest──> AwaitingSslDecision ──'N'──> AwaitingStartup
//!        │
//!   StartupMessage
//!        ▼
//! AwaitingStartupParameters ──password needed──> Authenticating
//!        │                                              │
//!        └──────────────> Ready <──────authenticated────┘
//!                         │   ▲
//!                  failure│   │Sync
//!                         ▼   │
//!                       ErrorSkip
//! ```
//!
//! Once `Ready`, Messages are routed through a table holding one handler per
//! [`MessageKind`].

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use fern_pgwire_interfaces::{
    ConnectionProperties, FormatCode, Row, Session, SessionError, TargetKind,
};
use fern_protocol_postgresql::codec::backend;
use fern_protocol_postgresql::codec::frontend::Message;

use crate::auth::AuthenticationContext;
use crate::cancel::CancelHandle;
use crate::error::Severity;
use crate::responses;
use crate::state::{ConnectionState, StartupProperties};
use crate::writer::{ResponseWriter, WriteSlot};
use crate::{Engine, Error};

mod extended;
mod simple;
mod startup;

/// What the connection should do once a Message has been dispatched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    Continue,
    Close,
}

/// Kinds of regular Messages a client sends once connected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Query,
    Parse,
    Bind,
    Describe,
    Execute,
    Sync,
    Flush,
    Close,
    Terminate,
    Password,
    Unsupported,
}

impl MessageKind {
    /// Returns `None` for Messages only valid during connection startup.
    pub fn of(msg: &Message) -> Option<MessageKind> {
        let kind = match msg {
            Message::Query(_) => Self::Query,
            Message::Parse { .. } => Self::Parse,
            Message::Bind { .. } => Self::Bind,
            Message::Describe { .. } => Self::Describe,
            Message::Execute { .. } => Self::Execute,
            Message::Sync() => Self::Sync,
            Message::Flush() => Self::Flush,
            Message::Close { .. } => Self::Close,
            Message::Terminate() => Self::Terminate,
            Message::PasswordMessage(_) => Self::Password,
            Message::NotImplemented(..) | Message::Skipped(_) => Self::Unsupported,
            Message::StartupMessage { .. }
            | Message::SSLRequest()
            | Message::GSSENCRequest()
            | Message::CancelRequest { .. } => return None,
        };
        Some(kind)
    }
}

type Handler = for<'a> fn(&'a mut Dispatcher, Message) -> BoxFuture<'a, Result<Flow, Error>>;

/// Handlers of regular Messages, indexed by [`MessageKind`].
const HANDLERS: [Handler; 11] = [
    simple::query,
    extended::parse,
    extended::bind,
    extended::describe,
    extended::execute,
    extended::sync,
    extended::flush,
    extended::close,
    extended::terminate,
    unexpected_password,
    unsupported,
];

fn handler(kind: MessageKind) -> Handler {
    HANDLERS[kind as usize]
}

fn unexpected_password(_: &mut Dispatcher, _: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async { Err(Error::Protocol("unexpected password message".to_string())) })
}

fn unsupported(_: &mut Dispatcher, msg: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    let msg_id = match msg {
        Message::NotImplemented(msg_id, _) | Message::Skipped(msg_id) => msg_id,
        _ => 0,
    };
    Box::pin(async move { Err(Error::UnsupportedMessage(msg_id)) })
}

/// Error for a Message routed to the handler of another kind.
fn misrouted(msg: &Message) -> Error {
    Error::Protocol(format!("unexpected message: {:?}", MessageKind::of(msg)))
}

/// Closes the session however the connection ends.
pub(crate) struct SessionGuard(Box<dyn Session>);

impl Deref for SessionGuard {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        log::debug!("closing session");
        self.0.close();
    }
}

/// Protocol state and resources of a single client connection.
pub struct Dispatcher {
    engine: Arc<Engine>,
    properties: ConnectionProperties,
    state: ConnectionState,
    writer: ResponseWriter,
    startup: StartupProperties,
    auth: Option<AuthenticationContext>,
    session: Option<SessionGuard>,
    cancel: Option<CancelHandle>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, properties: ConnectionProperties, writer: ResponseWriter) -> Self {
        Self {
            engine,
            properties,
            state: ConnectionState::AwaitingStartup,
            writer,
            startup: StartupProperties::default(),
            auth: None,
            session: None,
            cancel: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    async fn slot(&self) -> Result<WriteSlot, Error> {
        self.writer.slot().await
    }

    fn session_mut(&mut self) -> Result<&mut (dyn Session + 'static), Error> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| Error::Protocol("no session attached to connection".to_string()))
    }

    /// Token observed by the command about to run.
    fn command_token(&self) -> CancellationToken {
        match &self.cancel {
            Some(cancel) => cancel.command_token(),
            None => CancellationToken::new(),
        }
    }

    /// Processes a single Message, according to the connection state.
    pub async fn dispatch(&mut self, msg: Message) -> Flow {
        log::debug!("[{:?}] dispatching {:?}", self.state, MessageKind::of(&msg));

        let result = match self.state {
            ConnectionState::AwaitingStartup => startup::startup_message(self, msg).await,
            ConnectionState::Authenticating => match msg {
                Message::PasswordMessage(password) => startup::password(self, password).await,
                Message::Terminate() => Ok(Flow::Close),
                other => Err(Error::UnexpectedDuringAuthentication(message_id(&other))),
            },
            ConnectionState::Ready => match MessageKind::of(&msg) {
                Some(kind) => handler(kind)(self, msg).await,
                None => Err(Error::Protocol("unexpected startup packet".to_string())),
            },
            ConnectionState::ErrorSkip => match msg {
                Message::Sync() => self.resync().await,
                Message::Terminate() => Ok(Flow::Close),
                skipped => {
                    log::trace!("discarded {:?} until sync", MessageKind::of(&skipped));
                    Ok(Flow::Continue)
                }
            },
            ConnectionState::AwaitingSslDecision
            | ConnectionState::AwaitingStartupParameters
            | ConnectionState::Closed => Ok(Flow::Close),
        };

        let flow = match result {
            Ok(flow) => flow,
            Err(err) => self.fail(err).await,
        };
        if flow == Flow::Close {
            self.state = ConnectionState::Closed;
        }
        flow
    }

    /// Leaves `ErrorSkip` on `Sync`.
    async fn resync(&mut self) -> Result<Flow, Error> {
        log::debug!("resynchronized on sync");
        let slot = self.slot().await?;
        if let Ok(session) = self.session_mut() {
            session.clear_state();
        }
        self.state = ConnectionState::Ready;
        slot.send(responses::ready_for_query()).await?;
        Ok(Flow::Continue)
    }

    /// Sends an `ErrorResponse` on a slot of its own.
    async fn report(&self, err: &Error, severity: Severity) -> Result<(), Error> {
        let slot = self.slot().await?;
        slot.send(responses::error_response(err, severity)).await
    }

    /// Reports `err` to the client, moving to the matching state.
    ///
    /// Failures before the connection is established are always fatal.
    async fn fail(&mut self, err: Error) -> Flow {
        if err.is_transport() {
            log::error!("connection failed: {}", err);
            return Flow::Close;
        }

        let fatal = err.is_fatal() || !self.state.is_established();
        let severity = if fatal { Severity::Fatal } else { Severity::Error };
        if fatal {
            log::warn!("closing connection: {}", err);
        } else {
            log::debug!("command failed: {}", err);
        }

        if let Err(err) = self.report(&err, severity).await {
            log::error!("cannot report error: {}", err);
            return Flow::Close;
        }

        if fatal {
            Flow::Close
        } else {
            self.state = ConnectionState::ErrorSkip;
            Flow::Continue
        }
    }

    /// Reports a framing error, after which the stream can't be trusted.
    pub async fn fail_framing(&mut self, err: &std::io::Error) {
        let err = Error::Protocol(format!("invalid frontend message: {}", err));
        if let Err(err) = self.report(&err, Severity::Fatal).await {
            log::debug!("cannot report framing error: {}", err);
        }
        self.state = ConnectionState::Closed;
    }
}

/// Type byte of a regular Message, for error reporting.
fn message_id(msg: &Message) -> u8 {
    match msg {
        Message::Query(_) => b'Q',
        Message::Parse { .. } => b'P',
        Message::Bind { .. } => b'B',
        Message::Describe { .. } => b'D',
        Message::Execute { .. } => b'E',
        Message::Sync() => b'S',
        Message::Flush() => b'H',
        Message::Close { .. } => b'C',
        Message::Terminate() => b'X',
        Message::PasswordMessage(_) => b'p',
        Message::NotImplemented(msg_id, _) | Message::Skipped(msg_id) => *msg_id,
        _ => 0,
    }
}

/// Parses a Message field sent as text.
fn text(field: &[u8]) -> Result<String, Error> {
    String::from_utf8(field.to_vec())
        .map_err(|_| Error::Session(SessionError::Execution {
            sql_state: "22021".to_string(),
            message: "invalid byte sequence for encoding \"UTF8\"".to_string(),
        }))
}

fn target_kind(target: u8, message: &str) -> Result<TargetKind, Error> {
    TargetKind::try_from(target)
        .map_err(|target| Error::Protocol(format!("invalid {} message subtype {}", message, target)))
}

/// Writes `messages` to `slot`, in order.
async fn send_all(slot: &WriteSlot, messages: impl IntoIterator<Item = backend::Message>) -> Result<(), Error> {
    for msg in messages {
        slot.send(msg).await?;
    }
    Ok(())
}

/// Runs `command` until it completes or `token` is cancelled.
async fn cancelable<T, E>(
    token: &CancellationToken,
    command: impl Future<Output = Result<T, E>>,
) -> Result<T, Error>
where
    Error: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            log::info!("command canceled");
            Err(Error::Canceled)
        }
        result = command => Ok(result?),
    }
}

/// Sends every row as a `DataRow`, returning how many were sent.
///
/// Waiting for the client to make room in `slot` is cancelable too.
async fn send_rows(
    slot: &WriteSlot,
    mut rows: BoxStream<'static, Result<Row, SessionError>>,
    formats: &[FormatCode],
    token: &CancellationToken,
) -> Result<u64, Error> {
    let mut count = 0;
    while let Some(row) = cancelable(token, async { rows.next().await.transpose() }).await? {
        let data_row = responses::data_row(&row, formats)?;
        cancelable(token, slot.send(data_row)).await?;
        count += 1;
    }
    Ok(count)
}
