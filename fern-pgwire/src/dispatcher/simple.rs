// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use futures::future::BoxFuture;

use fern_pgwire_interfaces::RowSource;
use fern_protocol_postgresql::codec::backend;
use fern_protocol_postgresql::codec::frontend::Message;

use super::{cancelable, misrouted, send_rows, text, Dispatcher, Flow};
use crate::responses;
use crate::splitter::split_query;
use crate::writer::WriteSlot;
use crate::Error;

/// Runs every statement of a Simple Query, stopping at the first failure.
///
/// Unlike Extended Query failures, a failed statement is answered right away
/// and the connection stays ready for the next query.
pub(super) fn query(dispatcher: &mut Dispatcher, msg: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        let query = match msg {
            Message::Query(query) => query,
            other => return Err(misrouted(&other)),
        };

        let statements = match text(&query) {
            Ok(query) => split_query(&query),
            Err(err) => {
                let slot = dispatcher.slot().await?;
                report(&slot, &err).await?;
                slot.send(responses::ready_for_query()).await?;
                return Ok(Flow::Continue);
            }
        };

        for statement in statements {
            let slot = dispatcher.slot().await?;
            if let Err(err) = run_statement(dispatcher, &slot, &statement).await {
                if err.is_transport() {
                    return Err(err);
                }
                dispatcher.session_mut()?.clear_state();
                report(&slot, &err).await?;
                break;
            }
        }

        dispatcher.slot().await?.send(responses::ready_for_query()).await?;
        Ok(Flow::Continue)
    })
}

async fn run_statement(dispatcher: &mut Dispatcher, slot: &WriteSlot, statement: &str) -> Result<(), Error> {
    if statement.is_empty() {
        slot.send(backend::Message::EmptyQueryResponse()).await?;
        return Ok(());
    }
    log::debug!("simple query: {:?}", statement);

    let token = dispatcher.command_token();
    let session = dispatcher.session_mut()?;
    let rows = match cancelable(&token, session.execute_simple(statement)).await? {
        RowSource::RowCount(count) => count,
        RowSource::Rows { fields, rows } => {
            slot.send(responses::row_description(&fields, &[])).await?;
            send_rows(slot, rows, &[], &token).await?
        }
    };
    slot.send(responses::command_complete(statement, rows)).await
}

async fn report(slot: &WriteSlot, err: &Error) -> Result<(), Error> {
    log::debug!("simple query failed: {}", err);
    slot.send(responses::error_response(err, err.severity())).await
}
