// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Handlers of the Extended Query sub-protocol.

use futures::future::BoxFuture;

use fern_pgwire_interfaces::{FormatCode, RowSource, TargetKind, Value};
use fern_protocol_postgresql::codec::backend;
use fern_protocol_postgresql::codec::frontend::Message;
use fern_protocol_postgresql::types::{oid_to_data_type, pg_type};

use super::{cancelable, misrouted, send_rows, target_kind, text, Dispatcher, Flow};
use crate::error::Severity;
use crate::responses;
use crate::Error;

pub(super) fn parse(dispatcher: &mut Dispatcher, msg: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        let (name, query, param_types) = match msg {
            Message::Parse {
                name,
                query,
                param_types,
            } => (name, query, param_types),
            other => return Err(misrouted(&other)),
        };

        let name = text(&name)?;
        let query = text(&query)?;
        let param_types = param_types.into_iter().map(oid_to_data_type).collect();
        log::debug!("parse {:?}: {:?}", name, query);

        let slot = dispatcher.slot().await?;
        dispatcher
            .session_mut()?
            .parse(&name, &query, param_types)
            .await?;
        slot.send(backend::Message::ParseComplete()).await?;
        Ok(Flow::Continue)
    })
}

/// Format code of the parameter at `index`, out of the codes sent in `Bind`.
fn param_format(codes: &[i16], index: usize) -> i16 {
    match codes {
        [] => 0,
        [code] => *code,
        codes => codes.get(index).copied().unwrap_or_default(),
    }
}

pub(super) fn bind(dispatcher: &mut Dispatcher, msg: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        let (portal, statement, param_formats, parameters, results_formats) = match msg {
            Message::Bind {
                portal,
                stmt_name,
                param_formats,
                parameters,
                results_formats,
            } => (portal, stmt_name, param_formats, parameters, results_formats),
            other => return Err(misrouted(&other)),
        };
        let portal = text(&portal)?;
        let statement = text(&statement)?;

        if param_formats.len() > 1 && param_formats.len() != parameters.len() {
            return Err(Error::Protocol(format!(
                "bind message has {} parameter formats but {} parameters",
                param_formats.len(),
                parameters.len()
            )));
        }

        let slot = dispatcher.slot().await?;
        let session = dispatcher.session_mut()?;

        let params = parameters
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let data_type = session.get_param_type(&statement, index)?;
                let code = param_format(&param_formats, index);
                let format = FormatCode::try_from(code).map_err(|code| Error::UnsupportedFormatCode {
                    code,
                    index,
                    data_type,
                })?;
                match raw {
                    None => Ok(Value::Null),
                    Some(raw) => pg_type(data_type, None)
                        .decode(format, raw)
                        .map_err(|source| Error::InvalidParameterValue { index, source }),
                }
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let result_formats = results_formats
            .into_iter()
            .map(|code| FormatCode::try_from(code).map_err(Error::UnsupportedResultFormatCode))
            .collect::<Result<Vec<_>, Error>>()?;

        log::debug!("bind {:?} to {:?}: {:?}", portal, statement, params);
        session.bind(&portal, &statement, params, result_formats).await?;
        slot.send(backend::Message::BindComplete()).await?;
        Ok(Flow::Continue)
    })
}

pub(super) fn describe(dispatcher: &mut Dispatcher, msg: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        let (target, name) = match msg {
            Message::Describe { target, name } => (target, name),
            other => return Err(misrouted(&other)),
        };
        let target = target_kind(target, "DESCRIBE")?;
        let name = text(&name)?;

        let slot = dispatcher.slot().await?;
        let session = dispatcher.session_mut()?;
        let formats = match target {
            TargetKind::Statement => Vec::new(),
            TargetKind::Portal => session.get_result_format_codes(&name)?,
        };
        let described = session.describe(target, &name).await?;

        if target == TargetKind::Statement {
            slot.send(responses::parameter_description(&described.parameters)).await?;
        }
        match described.fields {
            Some(fields) => slot.send(responses::row_description(&fields, &formats)).await?,
            None => slot.send(backend::Message::NoData()).await?,
        }
        Ok(Flow::Continue)
    })
}

pub(super) fn execute(dispatcher: &mut Dispatcher, msg: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        let (portal, max_rows) = match msg {
            Message::Execute { portal, max_rows } => (portal, max_rows),
            other => return Err(misrouted(&other)),
        };
        let portal = text(&portal)?;

        let slot = dispatcher.slot().await?;
        let token = dispatcher.command_token();
        let session = dispatcher.session_mut()?;

        let query = session.get_query(&portal)?;
        if query.trim().is_empty() {
            slot.send(backend::Message::EmptyQueryResponse()).await?;
            return Ok(Flow::Continue);
        }
        let formats = session.get_result_format_codes(&portal)?;

        log::debug!("execute {:?} (max rows: {}): {:?}", portal, max_rows, query);
        let rows = match cancelable(&token, session.execute(&portal, max_rows)).await? {
            RowSource::RowCount(count) => count,
            // Clients learn about columns from `Describe`.
            RowSource::Rows { rows, .. } => send_rows(&slot, rows, &formats, &token).await?,
        };
        slot.send(responses::command_complete(&query, rows)).await?;
        Ok(Flow::Continue)
    })
}

pub(super) fn sync(dispatcher: &mut Dispatcher, _: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        let slot = dispatcher.slot().await?;
        let session = dispatcher.session_mut()?;

        if let Err(err) = session.sync().await {
            let err = Error::from(err);
            log::debug!("sync failed: {}", err);
            slot.send(responses::error_response(&err, Severity::Error)).await?;
        }
        session.close_target(TargetKind::Portal, "");

        slot.send(responses::ready_for_query()).await?;
        Ok(Flow::Continue)
    })
}

pub(super) fn flush(dispatcher: &mut Dispatcher, _: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        dispatcher.slot().await?.flush().await?;
        Ok(Flow::Continue)
    })
}

pub(super) fn close(dispatcher: &mut Dispatcher, msg: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async move {
        let (target, name) = match msg {
            Message::Close { target, name } => (target, name),
            other => return Err(misrouted(&other)),
        };
        let target = target_kind(target, "CLOSE")?;
        let name = text(&name)?;

        let slot = dispatcher.slot().await?;
        log::debug!("close {} {:?}", target, name);
        dispatcher.session_mut()?.close_target(target, &name);
        slot.send(backend::Message::CloseComplete()).await?;
        Ok(Flow::Continue)
    })
}

pub(super) fn terminate(_: &mut Dispatcher, _: Message) -> BoxFuture<'_, Result<Flow, Error>> {
    Box::pin(async {
        log::debug!("client terminated the connection");
        Ok(Flow::Close)
    })
}
