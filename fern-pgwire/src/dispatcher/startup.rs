// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Connection startup: encryption negotiation, authentication, and the
//! initial parameters sent to a freshly connected client.

use bytes::BytesMut;
use std::sync::Arc;

use fern_protocol_postgresql::codec::backend;
use fern_protocol_postgresql::codec::frontend::Message;

use super::{send_all, Dispatcher, Flow, SessionGuard};
use crate::auth::AuthenticationContext;
use crate::responses::{parameter_status, ready_for_query};
use crate::state::{ConnectionState, StartupProperties};
use crate::Error;

/// Reply to an encryption request: not supported.
const ENCRYPTION_REFUSED: u8 = b'N';

pub(super) async fn startup_message(dispatcher: &mut Dispatcher, msg: Message) -> Result<Flow, Error> {
    match msg {
        Message::SSLRequest() | Message::GSSENCRequest() => {
            dispatcher.state = ConnectionState::AwaitingSslDecision;
            log::debug!("refusing encryption request");
            dispatcher
                .slot()
                .await?
                .send(backend::Message::SSLResponse(ENCRYPTION_REFUSED))
                .await?;
            dispatcher.state = ConnectionState::AwaitingStartup;
            Ok(Flow::Continue)
        }
        Message::CancelRequest {
            process_id,
            secret_key,
        } => {
            // Whatever the outcome, the requesting connection gets no reply.
            let canceled = dispatcher.engine.cancel.cancel(process_id, secret_key);
            log::info!("cancel request for process {}: {}", process_id, canceled);
            Ok(Flow::Close)
        }
        Message::StartupMessage { parameters, .. } => {
            dispatcher.state = ConnectionState::AwaitingStartupParameters;
            dispatcher.startup = StartupProperties::from_parameters(&parameters);
            start_authentication(dispatcher).await
        }
        other => Err(super::misrouted(&other)),
    }
}

async fn start_authentication(dispatcher: &mut Dispatcher) -> Result<Flow, Error> {
    let user = dispatcher.startup.user().unwrap_or_default().to_string();
    let method = if user.is_empty() {
        None
    } else {
        dispatcher
            .engine
            .authentication
            .resolve_authentication_type(&user, &dispatcher.properties)
    };
    let Some(method) = method else {
        return Err(Error::NoAuthenticationMethod {
            host: dispatcher.properties.host(),
            user,
        });
    };
    let method_name = method.name().to_string();
    let context = AuthenticationContext::new(method, user, dispatcher.properties.clone());
    log::debug!("user {:?} authenticates with {:?}", context.user(), method_name);
    if context.requires_password() {
        dispatcher
            .slot()
            .await?
            .send(backend::Message::AuthenticationCleartextPassword())
            .await?;
        dispatcher.auth = Some(context);
        dispatcher.state = ConnectionState::Authenticating;
        return Ok(Flow::Continue);
    }

    finish(dispatcher, context).await
}

pub(super) async fn password(dispatcher: &mut Dispatcher, password: BytesMut) -> Result<Flow, Error> {
    let Some(mut context) = dispatcher.auth.take() else {
        return Err(Error::Protocol("no authentication in progress".to_string()));
    };
    context.set_password(password);
    finish(dispatcher, context).await
}

/// Authenticates the user, then opens its session.
async fn finish(dispatcher: &mut Dispatcher, context: AuthenticationContext) -> Result<Flow, Error> {
    let user = match context.authenticate().await {
        Ok(user) => user,
        Err(err) => {
            log::warn!("authentication failed for {}: {}", dispatcher.properties.host(), err);
            return Err(err);
        }
    };
    log::info!("user {:?} authenticated", user.name);

    let sessions = Arc::clone(&dispatcher.engine.sessions);
    let database = dispatcher.startup.database().map(str::to_string);
    let session = sessions.create_session(database.as_deref(), &user).await?;
    dispatcher.session = Some(SessionGuard(session));

    let cancel = dispatcher.engine.cancel.register();
    let key_data = backend::Message::BackendKeyData {
        process: cancel.process_id(),
        secret_key: cancel.secret_key(),
    };
    dispatcher.cancel = Some(cancel);

    let slot = dispatcher.slot().await?;
    send_all(
        &slot,
        [
            backend::Message::AuthenticationOk(),
            key_data,
            parameter_status("server_version", dispatcher.engine.server_version.clone()),
            parameter_status("server_encoding", "UTF8"),
            parameter_status("client_encoding", "UTF8"),
            parameter_status("DateStyle", "ISO"),
            parameter_status("TimeZone", "UTC"),
            parameter_status("integer_datetimes", "on"),
            ready_for_query(),
        ],
    )
    .await?;

    dispatcher.state = ConnectionState::Ready;
    Ok(Flow::Continue)
}
