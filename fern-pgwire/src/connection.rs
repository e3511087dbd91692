// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use fern_pgwire_interfaces::ConnectionProperties;
use fern_protocol_postgresql::codec::{backend, frontend};

use crate::dispatcher::{Dispatcher, Flow};
use crate::state::ConnectionState;
use crate::writer::ResponseWriter;
use crate::{Engine, Error};

/// A client connection, served by the engine until either side closes it.
///
/// Messages are read and dispatched one at a time, while responses are
/// written by a dedicated task, in dispatch order.
#[derive(Debug)]
pub struct Connection<IO> {
    io: IO,
    properties: ConnectionProperties,
    engine: Arc<Engine>,
}

impl<IO> Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: IO, properties: ConnectionProperties, engine: Arc<Engine>) -> Self {
        Self {
            io,
            properties,
            engine,
        }
    }

    /// Serves the connection until the client leaves, or a fatal error.
    pub async fn run(self) -> Result<(), Error> {
        let (reader, writer) = tokio::io::split(self.io);
        let mut stream = FramedRead::new(reader, frontend::Codec::new());
        let sink = FramedWrite::new(writer, backend::Codec::new());

        let (responses, queue) = ResponseWriter::new();
        let drain = tokio::spawn(queue.drain(sink));

        let mut dispatcher = Dispatcher::new(self.engine, self.properties, responses);
        let result = serve(&mut stream, &mut dispatcher).await;

        // Releases the session, and lets the writer task finish.
        drop(dispatcher);
        match drain.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!("failed writing responses: {}", err),
            Err(err) => log::error!("response writer task failed: {}", err),
        }

        result
    }
}

async fn serve<R>(
    stream: &mut FramedRead<R, frontend::Codec>,
    dispatcher: &mut Dispatcher,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) if is_framing_error(&err) => {
                log::warn!("closing connection on malformed message: {}", err);
                dispatcher.fail_framing(&err).await;
                return Ok(());
            }
            Err(err) => return Err(Error::Io(err)),
        };

        if dispatcher.dispatch(msg).await == Flow::Close {
            log::debug!("connection closed");
            return Ok(());
        }
        stream
            .decoder_mut()
            .ignore_till_sync(dispatcher.state() == ConnectionState::ErrorSkip);
    }

    log::debug!("client disconnected");
    Ok(())
}

fn is_framing_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof
    )
}
